//! The main loop as a sequence of indivisible operations.
//!
//! Each call to [`MainLoop::step`] performs exactly one operation. The
//! handler can only run between two steps, which is the granularity at which
//! real code can be interrupted between two 16-bit accesses.

use crate::device::{DeviceContext, LED_DIAGNOSTIC, LED_MAIN};
use crate::interrupt::RestoreToken;
use crate::shared::{self, Half, Observation, SharedWord};
use crate::SimResult;
use serde::Serialize;
use tickrace_config::{Guard, LedOwnership, SharedRole, SystemConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "op", content = "half")]
pub enum Op {
    ToggleLed,
    EnterCritical,
    /// Write the reset pattern's half.
    Store(Half),
    /// Copy a half into local storage.
    Load(Half),
    ExitCritical,
    /// Classify the local copy.
    Check,
    /// One busy-wait iteration.
    Delay,
}

impl std::fmt::Display for Op {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Op::ToggleLed => write!(f, "toggle"),
            Op::EnterCritical => write!(f, "cs-enter"),
            Op::Store(Half::Low) => write!(f, "store.lo"),
            Op::Store(Half::High) => write!(f, "store.hi"),
            Op::Load(Half::Low) => write!(f, "load.lo"),
            Op::Load(Half::High) => write!(f, "load.hi"),
            Op::ExitCritical => write!(f, "cs-exit"),
            Op::Check => write!(f, "check"),
            Op::Delay => write!(f, "delay"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    Executed(Op),
    Checked(Observation, SharedWord),
    /// Sitting out the diagnostic delay after a torn read.
    Stalled,
}

#[derive(Debug)]
pub struct MainLoop {
    program: Vec<Op>,
    pc: usize,
    token: Option<RestoreToken>,
    local: SharedWord,
    stall_steps: u32,
    stall_remaining: u32,
    iterations: u64,
    races: u64,
}

impl MainLoop {
    pub fn new(config: &SystemConfig) -> Self {
        Self {
            program: Self::compile(config),
            pc: 0,
            token: None,
            local: SharedWord::RESET,
            stall_steps: config.main_loop.diagnostic_stall_steps,
            stall_remaining: 0,
            iterations: 0,
            races: 0,
        }
    }

    /// Operations making up one iteration of the loop body.
    pub fn compile(config: &SystemConfig) -> Vec<Op> {
        let mut program = Vec::new();
        if config.leds.ownership == LedOwnership::Split {
            program.push(Op::ToggleLed);
        }

        let section = &config.shared;
        let guarded = |program: &mut Vec<Op>, body: &[Op]| {
            if section.guard == Guard::Protected {
                program.push(Op::EnterCritical);
                program.extend_from_slice(body);
                program.push(Op::ExitCritical);
            } else {
                program.extend_from_slice(body);
            }
        };

        let loads = shared::halves(section.read_order).map(Op::Load);
        match section.role {
            SharedRole::Off => {}
            SharedRole::Reader => {
                guarded(&mut program, &loads);
                program.push(Op::Check);
            }
            SharedRole::ReaderWriter => {
                let stores = shared::halves(section.write_order).map(Op::Store);
                guarded(&mut program, &stores);
                guarded(&mut program, &loads);
                program.push(Op::Check);
            }
        }

        program.extend(std::iter::repeat(Op::Delay).take(config.main_loop.busy_wait_steps as usize));
        if program.is_empty() {
            program.push(Op::Delay);
        }
        program
    }

    pub fn program(&self) -> &[Op] {
        &self.program
    }

    /// Index of the next operation.
    pub fn pc(&self) -> usize {
        self.pc
    }

    pub fn iterations(&self) -> u64 {
        self.iterations
    }

    pub fn races(&self) -> u64 {
        self.races
    }

    pub fn in_critical_section(&self) -> bool {
        self.token.is_some()
    }

    pub fn local_copy(&self) -> SharedWord {
        self.local
    }

    pub fn step(&mut self, ctx: &mut DeviceContext) -> SimResult<StepOutcome> {
        if self.stall_remaining > 0 {
            self.stall_remaining -= 1;
            return Ok(StepOutcome::Stalled);
        }

        let op = self.program[self.pc];
        let outcome = match op {
            Op::ToggleLed => {
                ctx.toggle(LED_MAIN)?;
                StepOutcome::Executed(op)
            }
            Op::EnterCritical => {
                if self.token.is_none() {
                    self.token = Some(ctx.irq.acquire());
                }
                StepOutcome::Executed(op)
            }
            Op::ExitCritical => {
                if let Some(token) = self.token.take() {
                    ctx.irq.release(token);
                }
                StepOutcome::Executed(op)
            }
            Op::Store(half) => {
                shared::store(&mut ctx.bus, half, SharedWord::RESET.half(half))?;
                StepOutcome::Executed(op)
            }
            Op::Load(half) => {
                let value = shared::load(&ctx.bus, half)?;
                self.local.set_half(half, value);
                StepOutcome::Executed(op)
            }
            Op::Check => {
                let observed = self.local;
                let observation = observed.classify();
                if observation == Observation::Torn {
                    self.races += 1;
                    tracing::warn!(
                        "Torn read in iteration {}: observed {} (expected {} or {})",
                        self.iterations,
                        observed,
                        SharedWord::RESET,
                        SharedWord::PUBLISHED
                    );
                    ctx.set(LED_DIAGNOSTIC, true)?;
                    self.stall_remaining = self.stall_steps;
                }
                StepOutcome::Checked(observation, observed)
            }
            Op::Delay => StepOutcome::Executed(op),
        };

        self.pc += 1;
        if self.pc == self.program.len() {
            self.pc = 0;
            self.iterations += 1;
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tickrace_config::HalfOrder;

    fn config(role: SharedRole, guard: Guard) -> SystemConfig {
        let mut config = SystemConfig::default();
        config.shared.role = role;
        config.shared.guard = guard;
        config.main_loop.busy_wait_steps = 2;
        config
    }

    #[test]
    fn test_compile_blink_only() {
        let program = MainLoop::compile(&config(SharedRole::Off, Guard::Unprotected));
        assert_eq!(program, vec![Op::ToggleLed, Op::Delay, Op::Delay]);
    }

    #[test]
    fn test_compile_protected_reader() {
        let program = MainLoop::compile(&config(SharedRole::Reader, Guard::Protected));
        assert_eq!(
            program,
            vec![
                Op::ToggleLed,
                Op::EnterCritical,
                Op::Load(Half::High),
                Op::Load(Half::Low),
                Op::ExitCritical,
                Op::Check,
                Op::Delay,
                Op::Delay,
            ]
        );
    }

    #[test]
    fn test_compile_unprotected_writer_orders() {
        let mut config = config(SharedRole::ReaderWriter, Guard::Unprotected);
        config.shared.write_order = HalfOrder::HighFirst;
        config.shared.read_order = HalfOrder::LowFirst;
        let program = MainLoop::compile(&config);
        assert_eq!(
            &program[1..6],
            &[
                Op::Store(Half::High),
                Op::Store(Half::Low),
                Op::Load(Half::Low),
                Op::Load(Half::High),
                Op::Check,
            ]
        );
    }

    #[test]
    fn test_compile_never_empty() {
        let mut config = config(SharedRole::Off, Guard::Unprotected);
        config.leds.ownership = LedOwnership::HandlerOwnsBoth;
        config.main_loop.busy_wait_steps = 0;
        assert_eq!(MainLoop::compile(&config), vec![Op::Delay]);
    }

    #[test]
    fn test_iteration_wraps() {
        let config = config(SharedRole::Off, Guard::Unprotected);
        let mut ctx = DeviceContext::new(&config).unwrap();
        ctx.bring_up().unwrap();
        let mut main = MainLoop::new(&config);

        for _ in 0..6 {
            main.step(&mut ctx).unwrap();
        }
        assert_eq!(main.iterations(), 2);
        assert_eq!(main.pc(), 0);
        assert_eq!(ctx.led_edges(tickrace_config::LedId::Main), 2);
    }

    #[test]
    fn test_torn_local_copy_raises_diagnostic_and_stalls() {
        let mut config = config(SharedRole::Reader, Guard::Unprotected);
        config.main_loop.diagnostic_stall_steps = 3;
        let mut ctx = DeviceContext::new(&config).unwrap();
        ctx.bring_up().unwrap();
        let mut main = MainLoop::new(&config);

        // toggle, load.hi
        main.step(&mut ctx).unwrap();
        main.step(&mut ctx).unwrap();
        // the handler's stores land between the two loads
        shared::store(&mut ctx.bus, Half::Low, SharedWord::PUBLISHED.low).unwrap();
        shared::store(&mut ctx.bus, Half::High, SharedWord::PUBLISHED.high).unwrap();
        main.step(&mut ctx).unwrap();

        let outcome = main.step(&mut ctx).unwrap();
        assert_eq!(
            outcome,
            StepOutcome::Checked(Observation::Torn, SharedWord::from_combined(0x0000_0000))
        );
        assert!(ctx.diagnostic_raised());
        assert_eq!(main.races(), 1);

        for _ in 0..3 {
            assert_eq!(main.step(&mut ctx).unwrap(), StepOutcome::Stalled);
        }
        assert_eq!(main.step(&mut ctx).unwrap(), StepOutcome::Executed(Op::Delay));
    }

    #[test]
    fn test_critical_section_spans_steps() {
        let config = config(SharedRole::Reader, Guard::Protected);
        let mut ctx = DeviceContext::new(&config).unwrap();
        ctx.bring_up().unwrap();
        let mut main = MainLoop::new(&config);

        main.step(&mut ctx).unwrap(); // toggle
        main.step(&mut ctx).unwrap(); // cs-enter
        assert!(!ctx.irq.is_enabled());
        assert!(main.in_critical_section());
        main.step(&mut ctx).unwrap();
        main.step(&mut ctx).unwrap();
        assert!(!ctx.irq.is_enabled());
        main.step(&mut ctx).unwrap(); // cs-exit
        assert!(ctx.irq.is_enabled());
        assert!(!main.in_critical_section());
    }
}
