use crate::{Op, SharedWord, SimulationObserver};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Instant;
use tickrace_config::LedId;

/// Running counters for one simulation, shared with the machine as an observer.
#[derive(Debug)]
pub struct RunMetrics {
    steps: AtomicU64,
    stalled_steps: AtomicU64,
    firings: AtomicU64,
    services: AtomicU64,
    max_latency: AtomicU64,
    races: AtomicU64,
    handler_edges: AtomicU64,
    main_edges: AtomicU64,
    start_time: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MetricsReport {
    pub steps: u64,
    pub stalled_steps: u64,
    pub firings: u64,
    pub services: u64,
    pub max_latency_clocks: u64,
    pub races: u64,
    pub handler_edges: u64,
    pub main_edges: u64,
}

impl Default for RunMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl RunMetrics {
    pub fn new() -> Self {
        Self {
            steps: AtomicU64::new(0),
            stalled_steps: AtomicU64::new(0),
            firings: AtomicU64::new(0),
            services: AtomicU64::new(0),
            max_latency: AtomicU64::new(0),
            races: AtomicU64::new(0),
            handler_edges: AtomicU64::new(0),
            main_edges: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    pub fn reset(&self) {
        for counter in [
            &self.steps,
            &self.stalled_steps,
            &self.firings,
            &self.services,
            &self.max_latency,
            &self.races,
            &self.handler_edges,
            &self.main_edges,
        ] {
            counter.store(0, Ordering::SeqCst);
        }
    }

    pub fn report(&self) -> MetricsReport {
        MetricsReport {
            steps: self.steps.load(Ordering::SeqCst),
            stalled_steps: self.stalled_steps.load(Ordering::SeqCst),
            firings: self.firings.load(Ordering::SeqCst),
            services: self.services.load(Ordering::SeqCst),
            max_latency_clocks: self.max_latency.load(Ordering::SeqCst),
            races: self.races.load(Ordering::SeqCst),
            handler_edges: self.handler_edges.load(Ordering::SeqCst),
            main_edges: self.main_edges.load(Ordering::SeqCst),
        }
    }

    /// Main-loop steps per wall-clock second.
    pub fn steps_per_second(&self) -> f64 {
        let elapsed = self.start_time.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            self.steps.load(Ordering::SeqCst) as f64 / elapsed
        } else {
            0.0
        }
    }
}

impl SimulationObserver for RunMetrics {
    fn on_step(&self, _step: u64, op: Option<Op>) {
        self.steps.fetch_add(1, Ordering::SeqCst);
        if op.is_none() {
            self.stalled_steps.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn on_timer_fired(&self, _clock: u64) {
        self.firings.fetch_add(1, Ordering::SeqCst);
    }

    fn on_interrupt_serviced(&self, _service: u64, latency: u64) {
        self.services.fetch_add(1, Ordering::SeqCst);
        self.max_latency.fetch_max(latency, Ordering::SeqCst);
    }

    fn on_led_edge(&self, led: LedId, _level: bool) {
        match led {
            LedId::Handler => self.handler_edges.fetch_add(1, Ordering::SeqCst),
            LedId::Main => self.main_edges.fetch_add(1, Ordering::SeqCst),
        };
    }

    fn on_race(&self, _iteration: u64, _observed: SharedWord) {
        self.races.fetch_add(1, Ordering::SeqCst);
    }
}

/// Interval statistics over all timer firings seen so far.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FiringStats {
    pub count: u64,
    pub first: Option<u64>,
    pub last: Option<u64>,
    pub min_interval: Option<u64>,
    pub max_interval: Option<u64>,
}

impl FiringStats {
    fn record(&mut self, clock: u64) {
        if let Some(last) = self.last {
            let interval = clock - last;
            self.min_interval = Some(self.min_interval.map_or(interval, |m| m.min(interval)));
            self.max_interval = Some(self.max_interval.map_or(interval, |m| m.max(interval)));
        } else {
            self.first = Some(clock);
        }
        self.last = Some(clock);
        self.count += 1;
    }

    /// True when every interval so far equals `period`.
    pub fn is_periodic(&self, period: u64) -> bool {
        self.min_interval == Some(period) && self.max_interval == Some(period)
    }
}

/// Source-clock timing of timer firings, kept as running extremes.
#[derive(Debug, Default)]
pub struct FiringLog {
    stats: Mutex<FiringStats>,
}

impl FiringLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> FiringStats {
        match self.stats.lock() {
            Ok(stats) => *stats,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }
}

impl SimulationObserver for FiringLog {
    fn on_timer_fired(&self, clock: u64) {
        let mut stats = match self.stats.lock() {
            Ok(stats) => stats,
            Err(poisoned) => poisoned.into_inner(),
        };
        stats.record(clock);
    }
}
