pub mod bus;
pub mod clock;
pub mod device;
pub mod explore;
pub mod handler;
pub mod interrupt;
pub mod main_loop;
pub mod memory;
pub mod metrics;
pub mod peripherals;
pub mod shared;
pub mod snapshot;

use std::any::Any;
use std::sync::Arc;
use std::time::Instant;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use tickrace_config::{LedId, StopReason, SystemConfig};

pub use device::DeviceContext;
pub use handler::{InterruptHandler, TimerHandler};
pub use main_loop::{MainLoop, Op, StepOutcome};
pub use shared::{Observation, SharedWord};

mod tests;

#[derive(Debug, thiserror::Error)]
pub enum SimulationError {
    #[error("Memory access violation at {0:#x}")]
    MemoryViolation(u64),
    #[error(transparent)]
    Clock(#[from] clock::ClockError),
}

pub type SimResult<T> = Result<T, SimulationError>;

/// Trait for observing simulation events in a modular way.
pub trait SimulationObserver: std::fmt::Debug + Send + Sync {
    fn on_simulation_start(&self) {}
    fn on_simulation_stop(&self) {}
    fn on_step(&self, _step: u64, _op: Option<Op>) {}
    /// The timer reached its threshold at `clock` (source clocks since reset).
    fn on_timer_fired(&self, _clock: u64) {}
    /// The handler ran; `latency` is the number of source clocks since the request.
    fn on_interrupt_serviced(&self, _service: u64, _latency: u64) {}
    fn on_led_edge(&self, _led: LedId, _level: bool) {}
    fn on_race(&self, _iteration: u64, _observed: SharedWord) {}
}

/// Trait representing a memory-mapped peripheral
pub trait Peripheral: std::fmt::Debug + Send {
    fn read(&self, offset: u64) -> SimResult<u8>;
    fn write(&mut self, offset: u64, value: u8) -> SimResult<()>;
    /// Advance by one source clock. Returns true when an interrupt is requested.
    fn tick(&mut self) -> bool {
        false
    }
    fn snapshot(&self) -> serde_json::Value {
        serde_json::Value::Null
    }
    fn as_any(&self) -> Option<&dyn Any> {
        None
    }
    fn as_any_mut(&mut self) -> Option<&mut dyn Any> {
        None
    }
}

/// Trait representing the system bus
pub trait Bus {
    fn read_u8(&self, addr: u64) -> SimResult<u8>;
    fn write_u8(&mut self, addr: u64, value: u8) -> SimResult<()>;
    fn tick_peripherals(&mut self) -> Vec<u32>; // Returns list of requested IRQ numbers

    fn read_u16(&self, addr: u64) -> SimResult<u16> {
        let b0 = self.read_u8(addr)? as u16;
        let b1 = self.read_u8(addr + 1)? as u16;
        // Little Endian
        Ok(b0 | (b1 << 8))
    }

    fn write_u16(&mut self, addr: u64, value: u16) -> SimResult<()> {
        self.write_u8(addr, (value & 0xFF) as u8)?;
        self.write_u8(addr + 1, ((value >> 8) & 0xFF) as u8)?;
        Ok(())
    }

    fn set_bits_u8(&mut self, addr: u64, mask: u8) -> SimResult<()> {
        let v = self.read_u8(addr)?;
        self.write_u8(addr, v | mask)
    }

    fn clear_bits_u8(&mut self, addr: u64, mask: u8) -> SimResult<()> {
        let v = self.read_u8(addr)?;
        self.write_u8(addr, v & !mask)
    }

    fn toggle_bits_u8(&mut self, addr: u64, mask: u8) -> SimResult<()> {
        let v = self.read_u8(addr)?;
        self.write_u8(addr, v ^ mask)
    }
}

#[derive(Debug, Clone, Copy)]
struct PendingIrq {
    irq: u32,
    raised_at: u64,
    due_step: u64,
}

/// Counters describing a finished (or interrupted) run.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct RunSummary {
    pub stop_reason: StopReason,
    pub steps: u64,
    pub clocks: u64,
    pub firings: u64,
    pub services: u64,
    pub iterations: u64,
    pub races: u64,
    pub handler_led_toggles: u64,
    pub main_led_toggles: u64,
}

/// The simulated board: one device context, the main loop that owns the CPU
/// when nothing else does, and the handler bound to the timer interrupt.
pub struct Machine<H: InterruptHandler = TimerHandler> {
    pub ctx: DeviceContext,
    pub main: MainLoop,
    pub handler: H,
    pub observers: Vec<Arc<dyn SimulationObserver>>,
    clocks_per_step: u32,
    max_latency_steps: u32,
    rng: StdRng,
    pending: Option<PendingIrq>,
    steps: u64,
    clocks: u64,
    firings: u64,
    services: u64,
}

impl Machine<TimerHandler> {
    pub fn from_config(config: &SystemConfig) -> SimResult<Self> {
        Self::with_handler(config, TimerHandler::new(config))
    }
}

impl<H: InterruptHandler> Machine<H> {
    /// Bring the device up and bind `handler` to the timer interrupt.
    pub fn with_handler(config: &SystemConfig, handler: H) -> SimResult<Self> {
        let mut ctx = DeviceContext::new(config)?;

        let period_clocks = ctx.clocks.period_clocks(&config.timer)?;
        if u64::from(config.sim.clocks_per_step) >= period_clocks {
            return Err(clock::ClockError::StepTooCoarse {
                clocks_per_step: config.sim.clocks_per_step,
                period_clocks,
            }
            .into());
        }
        // A request must be serviced before the next one is raised
        let worst_entry =
            (u64::from(config.sim.max_latency_steps) + 1) * u64::from(config.sim.clocks_per_step);
        if worst_entry >= period_clocks {
            return Err(clock::ClockError::LatencyTooLong {
                max_latency_steps: config.sim.max_latency_steps,
                clocks_per_step: config.sim.clocks_per_step,
                period_clocks,
            }
            .into());
        }

        ctx.bring_up()?;

        Ok(Self {
            ctx,
            main: MainLoop::new(config),
            handler,
            observers: Vec::new(),
            clocks_per_step: config.sim.clocks_per_step,
            max_latency_steps: config.sim.max_latency_steps,
            rng: StdRng::seed_from_u64(config.sim.seed),
            pending: None,
            steps: 0,
            clocks: 0,
            firings: 0,
            services: 0,
        })
    }

    pub fn steps(&self) -> u64 {
        self.steps
    }

    pub fn clocks(&self) -> u64 {
        self.clocks
    }

    /// Interrupt requests raised by the timer.
    pub fn firings(&self) -> u64 {
        self.firings
    }

    /// Interrupt requests the handler actually ran for.
    pub fn services(&self) -> u64 {
        self.services
    }

    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Execute one main-loop operation, let the timer run for the clocks that
    /// operation takes, then enter the handler if a request is due and GIE is set.
    pub fn step(&mut self) -> SimResult<()> {
        let before = self.edges();
        let outcome = self.main.step(&mut self.ctx)?;

        let op = match outcome {
            StepOutcome::Executed(op) => Some(op),
            StepOutcome::Checked(observation, observed) => {
                if observation == Observation::Torn {
                    for observer in &self.observers {
                        observer.on_race(self.main.iterations(), observed);
                    }
                }
                Some(Op::Check)
            }
            StepOutcome::Stalled => None,
        };
        for observer in &self.observers {
            observer.on_step(self.steps, op);
        }
        self.report_edges(before);

        for _ in 0..self.clocks_per_step {
            self.clocks += 1;
            for irq in self.ctx.bus.tick_peripherals() {
                self.firings += 1;
                for observer in &self.observers {
                    observer.on_timer_fired(self.clocks);
                }
                if self.pending.is_some() {
                    tracing::debug!("IRQ {} raised while already pending", irq);
                    continue;
                }
                let latency = if self.max_latency_steps > 0 {
                    self.rng.gen_range(0..=self.max_latency_steps)
                } else {
                    0
                };
                self.pending = Some(PendingIrq {
                    irq,
                    raised_at: self.clocks,
                    due_step: self.steps + u64::from(latency),
                });
            }
        }

        self.try_service()?;
        self.steps += 1;
        Ok(())
    }

    fn try_service(&mut self) -> SimResult<()> {
        let Some(pending) = self.pending else {
            return Ok(());
        };
        if self.steps < pending.due_step || !self.ctx.irq.is_enabled() {
            return Ok(());
        }
        self.pending = None;

        let before = self.edges();
        handler::service_masked(&mut self.handler, &mut self.ctx)?;
        self.services += 1;
        tracing::debug!(
            "IRQ {} serviced (#{}), {} clocks after request",
            pending.irq,
            self.services,
            self.clocks - pending.raised_at
        );

        for observer in &self.observers {
            observer.on_interrupt_serviced(self.services, self.clocks - pending.raised_at);
        }
        self.report_edges(before);
        Ok(())
    }

    fn edges(&self) -> [u64; 2] {
        [
            self.ctx.led_edges(LedId::Handler),
            self.ctx.led_edges(LedId::Main),
        ]
    }

    fn report_edges(&self, before: [u64; 2]) {
        if self.observers.is_empty() {
            return;
        }
        let after = self.edges();
        for (idx, led) in [LedId::Handler, LedId::Main].into_iter().enumerate() {
            if after[idx] != before[idx] {
                let level = self.ctx.led_level(led).unwrap_or(false);
                for observer in &self.observers {
                    observer.on_led_edge(led, level);
                }
            }
        }
    }

    /// Step until `max_steps` have executed or the optional deadline passes.
    pub fn run(&mut self, max_steps: u64, deadline: Option<Instant>) -> SimResult<RunSummary> {
        for observer in &self.observers {
            observer.on_simulation_start();
        }

        let mut stop_reason = StopReason::MaxSteps;
        let mut result = Ok(());
        for n in 0..max_steps {
            // Checking the clock every step dominates the run time.
            if n % 1024 == 0 {
                if let Some(deadline) = deadline {
                    if Instant::now() >= deadline {
                        stop_reason = StopReason::WallTime;
                        break;
                    }
                }
            }
            if let Err(e) = self.step() {
                result = Err(e);
                break;
            }
        }

        for observer in &self.observers {
            observer.on_simulation_stop();
        }
        result?;

        Ok(self.summary(stop_reason))
    }

    pub fn summary(&self, stop_reason: StopReason) -> RunSummary {
        RunSummary {
            stop_reason,
            steps: self.steps,
            clocks: self.clocks,
            firings: self.firings,
            services: self.services,
            iterations: self.main.iterations(),
            races: self.main.races(),
            handler_led_toggles: self.ctx.led_edges(LedId::Handler),
            main_led_toggles: self.ctx.led_edges(LedId::Main),
        }
    }

    pub fn snapshot(&self) -> snapshot::MachineSnapshot {
        snapshot::MachineSnapshot::capture(self)
    }
}
