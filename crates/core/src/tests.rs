#[cfg(test)]
mod tests {
    use crate::clock::ClockError;
    use crate::explore::explore;
    use crate::metrics::{FiringLog, RunMetrics};
    use crate::{
        DeviceContext, InterruptHandler, Machine, SharedWord, SimResult, SimulationError,
        SimulationObserver,
    };
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Instant;
    use tickrace_config::{
        Guard, HalfOrder, LedId, LedOwnership, SharedRole, StopReason, SystemConfig,
    };

    /// Remembers which service produced each handler LED edge.
    #[derive(Debug, Default)]
    struct EdgeRecorder {
        last_service: AtomicU64,
        handler_edges_at: Mutex<Vec<u64>>,
    }

    impl SimulationObserver for EdgeRecorder {
        fn on_interrupt_serviced(&self, service: u64, _latency: u64) {
            self.last_service.store(service, Ordering::SeqCst);
        }

        fn on_led_edge(&self, led: LedId, _level: bool) {
            if led == LedId::Handler {
                let service = self.last_service.load(Ordering::SeqCst);
                self.handler_edges_at.lock().unwrap().push(service);
            }
        }
    }

    fn shared_config(role: SharedRole, guard: Guard) -> SystemConfig {
        let mut config = SystemConfig::default();
        config.shared.role = role;
        config.shared.guard = guard;
        config
    }

    #[test]
    fn test_handler_led_toggles_every_nth_firing() {
        let mut config = SystemConfig::default();
        config.sim.clocks_per_step = 250;

        let recorder = Arc::new(EdgeRecorder::default());
        let mut machine = Machine::from_config(&config).unwrap();
        machine.observers.push(recorder.clone());

        // 4 steps per firing
        let summary = machine.run(12_000, None).unwrap();
        assert_eq!(summary.firings, 3000);
        assert_eq!(summary.services, 3000);
        assert_eq!(summary.handler_led_toggles, 3);

        let edges = recorder.handler_edges_at.lock().unwrap().clone();
        assert_eq!(edges, vec![1000, 2000, 3000]);
    }

    #[test]
    fn test_both_leds_keep_toggling() {
        let mut config = SystemConfig::default();
        config.timer.period_us = 100;
        config.toggle_every = 10;
        config.main_loop.busy_wait_steps = 5;

        let mut machine = Machine::from_config(&config).unwrap();
        let summary = machine.run(20_000, None).unwrap();

        // 80_000 clocks at 100 clocks per firing
        assert_eq!(summary.firings, 800);
        assert_eq!(summary.handler_led_toggles, 80);
        assert!(summary.main_led_toggles >= summary.iterations);
        assert!(summary.iterations > 3000);
        assert_eq!(summary.races, 0);
    }

    #[test]
    fn test_handler_owns_both_leds() {
        let mut config = SystemConfig::default();
        config.timer.period_us = 100;
        config.toggle_every = 5;
        config.leds.ownership = LedOwnership::HandlerOwnsBoth;

        let mut machine = Machine::from_config(&config).unwrap();
        let summary = machine.run(5_000, None).unwrap();
        assert!(summary.handler_led_toggles > 0);
        assert_eq!(summary.main_led_toggles, summary.handler_led_toggles);
        assert_eq!(
            machine.ctx.led_level(LedId::Main).unwrap(),
            machine.ctx.led_level(LedId::Handler).unwrap()
        );
    }

    #[test]
    fn test_firing_period_is_exact() {
        let mut config = SystemConfig::default();
        config.timer.input_divider = 2;
        config.timer.expansion_divider = 3;
        config.sim.clocks_per_step = 900;

        // 1 MHz / 6 -> 166 counts -> 996 SMCLK cycles
        let period = machine_period(&config);
        assert_eq!(period, 996);

        let log = Arc::new(FiringLog::new());
        let mut machine = Machine::from_config(&config).unwrap();
        machine.observers.push(log.clone());
        let summary = machine.run(11_100, None).unwrap();

        assert!(summary.firings >= 10_000);
        assert_eq!(summary.services, summary.firings);
        assert_eq!(machine.handler.services(), summary.firings);

        // first request after CCR0 counts, then every CCR0 + 1
        let stats = log.stats();
        assert_eq!(stats.count, summary.firings);
        assert_eq!(stats.first, Some(period - 6));
        assert!(stats.is_periodic(period));
    }

    #[test]
    fn test_masking_does_not_shift_firings() {
        let mut config = shared_config(SharedRole::ReaderWriter, Guard::Protected);
        config.sim.clocks_per_step = 13;
        config.sim.max_latency_steps = 8;

        let log = Arc::new(FiringLog::new());
        let mut machine = Machine::from_config(&config).unwrap();
        machine.observers.push(log.clone());
        machine.run(20_000, None).unwrap();

        let stats = log.stats();
        assert!(stats.count > 200);
        assert!(stats.is_periodic(1000));
    }

    fn machine_period(config: &SystemConfig) -> u64 {
        let ctx = DeviceContext::new(config).unwrap();
        ctx.clocks.period_clocks(&config.timer).unwrap()
    }

    #[test]
    fn test_unprotected_reader_tears_on_first_publication() {
        let mut config = shared_config(SharedRole::Reader, Guard::Unprotected);
        // firing lands right after load.hi
        config.sim.clocks_per_step = 500;

        let metrics = Arc::new(RunMetrics::new());
        let mut machine = Machine::from_config(&config).unwrap();
        machine.observers.push(metrics.clone());
        let summary = machine.run(100, None).unwrap();

        assert_eq!(summary.races, 1);
        assert_eq!(metrics.report().races, 1);
        assert!(machine.ctx.diagnostic_raised());
        // once published, the word never changes again
        assert_eq!(machine.ctx.shared().unwrap(), SharedWord::PUBLISHED);
    }

    #[test]
    fn test_protected_reader_defers_the_same_firing() {
        let mut config = shared_config(SharedRole::Reader, Guard::Protected);
        config.sim.clocks_per_step = 500;

        let metrics = Arc::new(RunMetrics::new());
        let mut machine = Machine::from_config(&config).unwrap();
        machine.observers.push(metrics.clone());
        let summary = machine.run(100, None).unwrap();

        assert_eq!(summary.races, 0);
        assert!(!machine.ctx.diagnostic_raised());
        // the request raised inside the section waited for cs-exit
        assert!(metrics.report().max_latency_clocks >= 500);
    }

    #[test]
    fn test_unprotected_writer_tears_under_jitter() {
        let mut config = shared_config(SharedRole::ReaderWriter, Guard::Unprotected);
        config.main_loop.busy_wait_steps = 10;
        config.main_loop.diagnostic_stall_steps = 20;
        config.sim.clocks_per_step = 50;
        config.sim.max_latency_steps = 16;
        config.sim.seed = 7;

        let mut machine = Machine::from_config(&config).unwrap();
        let summary = machine.run(50_000, None).unwrap();
        assert!(summary.races > 0, "{:?}", summary);
        assert!(machine.ctx.diagnostic_raised());
    }

    #[test]
    fn test_explorer_agrees_with_guard() {
        for role in [SharedRole::Reader, SharedRole::ReaderWriter] {
            let unprotected = explore(&shared_config(role, Guard::Unprotected), 1).unwrap();
            assert!(!unprotected.is_clean());
            for torn in &unprotected.torn {
                assert_ne!(torn.observed, SharedWord::RESET);
                assert_ne!(torn.observed, SharedWord::PUBLISHED);
            }

            let protected = explore(&shared_config(role, Guard::Protected), 2).unwrap();
            assert!(protected.is_clean());
        }
    }

    #[test]
    fn test_same_seed_same_run() {
        let mut config = shared_config(SharedRole::ReaderWriter, Guard::Unprotected);
        config.main_loop.diagnostic_stall_steps = 10;
        config.sim.clocks_per_step = 40;
        config.sim.max_latency_steps = 12;
        config.sim.seed = 99;

        let a = Machine::from_config(&config).unwrap().run(20_000, None).unwrap();
        let b = Machine::from_config(&config).unwrap().run(20_000, None).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_step_coarser_than_period_rejected() {
        let mut config = SystemConfig::default();
        config.sim.clocks_per_step = 1000;
        match Machine::from_config(&config) {
            Err(SimulationError::Clock(ClockError::StepTooCoarse { period_clocks, .. })) => {
                assert_eq!(period_clocks, 1000)
            }
            other => panic!("unexpected: {:?}", other.err()),
        }
    }

    #[test]
    fn test_jittered_entry_services_every_firing() {
        let mut config = SystemConfig::default();
        config.toggle_every = 10;
        config.sim.clocks_per_step = 100;
        config.sim.max_latency_steps = 8;
        config.sim.seed = 3;

        let mut machine = Machine::from_config(&config).unwrap();
        // eight spare steps let the last request through its latency
        let summary = machine.run(200_008, None).unwrap();
        assert_eq!(summary.firings, 20_000);
        assert_eq!(summary.services, summary.firings);
        assert_eq!(summary.handler_led_toggles, 2_000);
    }

    #[test]
    fn test_latency_longer_than_period_rejected() {
        let mut config = SystemConfig::default();
        config.toggle_every = 10;
        config.sim.clocks_per_step = 100;
        config.sim.max_latency_steps = 31;
        config.sim.seed = 3;
        match Machine::from_config(&config) {
            Err(SimulationError::Clock(ClockError::LatencyTooLong {
                max_latency_steps,
                period_clocks,
                ..
            })) => {
                assert_eq!(max_latency_steps, 31);
                assert_eq!(period_clocks, 1000);
            }
            other => panic!("unexpected: {:?}", other.err()),
        }

        // 10 * 100 clocks can still collide with the next request
        config.sim.max_latency_steps = 9;
        assert!(Machine::from_config(&config).is_err());
        config.sim.max_latency_steps = 8;
        assert!(Machine::from_config(&config).is_ok());
    }

    #[test]
    fn test_expired_deadline_stops_immediately() {
        let mut machine = Machine::from_config(&SystemConfig::default()).unwrap();
        let summary = machine.run(1000, Some(Instant::now())).unwrap();
        assert_eq!(summary.stop_reason, StopReason::WallTime);
        assert_eq!(summary.steps, 0);
    }

    #[derive(Debug, Default)]
    struct CountingHandler {
        calls: u64,
    }

    impl InterruptHandler for CountingHandler {
        fn service(&mut self, ctx: &mut DeviceContext) -> SimResult<()> {
            assert!(!ctx.irq.is_enabled());
            self.calls += 1;
            ctx.rearm()
        }
    }

    #[test]
    fn test_custom_handler_runs_masked() {
        let config = SystemConfig::default();
        let mut machine = Machine::with_handler(&config, CountingHandler::default()).unwrap();
        machine.run(2_500, None).unwrap();
        assert_eq!(machine.handler.calls, 10);
        assert_eq!(machine.ctx.led_edges(LedId::Handler), 0);
    }

    fn order() -> impl Strategy<Value = HalfOrder> {
        prop_oneof![Just(HalfOrder::LowFirst), Just(HalfOrder::HighFirst)]
    }

    fn role() -> impl Strategy<Value = SharedRole> {
        prop_oneof![Just(SharedRole::Reader), Just(SharedRole::ReaderWriter)]
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn prop_protected_never_tears(
            role in role(),
            write_order in order(),
            read_order in order(),
            busy_wait in 0u32..20,
            clocks_per_step in 1u32..100,
            max_latency in 0u32..9,
            seed in any::<u64>(),
        ) {
            let mut config = shared_config(role, Guard::Protected);
            config.shared.write_order = write_order;
            config.shared.read_order = read_order;
            config.main_loop.busy_wait_steps = busy_wait;
            config.sim.clocks_per_step = clocks_per_step;
            config.sim.max_latency_steps = max_latency;
            config.sim.seed = seed;

            let mut machine = Machine::from_config(&config).unwrap();
            let summary = machine.run(5_000, None).unwrap();
            prop_assert_eq!(summary.races, 0);
            prop_assert!(!machine.ctx.diagnostic_raised());
            prop_assert!(machine.ctx.irq.is_enabled() || machine.main.in_critical_section());
        }
    }
}
