//! Exhaustive interleaving search over one main-loop iteration.
//!
//! A firing can land at any boundary between two main-loop operations. For
//! every placement of up to `max_firings` firings the real [`MainLoop`] and
//! [`TimerHandler`] are run on a fresh device, and the value the main loop
//! checks is classified. A firing that lands while interrupts are masked
//! stays pending, exactly as the hardware latches CCIFG, and is taken at the
//! first boundary after the mask is lifted.

use crate::handler::{service_masked, TimerHandler};
use crate::main_loop::{MainLoop, Op, StepOutcome};
use crate::shared::{Observation, SharedWord};
use crate::{DeviceContext, SimResult};
use serde::Serialize;
use tickrace_config::SystemConfig;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Interleaving {
    /// Boundaries at which the timer fired; `k` means "before operation k".
    pub fired_before: Vec<usize>,
    /// Boundaries at which the handler actually ran.
    pub serviced_before: Vec<usize>,
    pub observed: SharedWord,
    pub observation: Observation,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExplorationReport {
    /// Operations up to and including the check.
    pub program: Vec<Op>,
    pub interleavings: usize,
    pub torn: Vec<Interleaving>,
}

impl ExplorationReport {
    pub fn is_clean(&self) -> bool {
        self.torn.is_empty()
    }
}

/// Enumerate placements of 0..=`max_firings` firings before the check.
pub fn explore(config: &SystemConfig, max_firings: usize) -> SimResult<ExplorationReport> {
    let program = MainLoop::compile(config);
    let Some(check) = program.iter().position(|op| *op == Op::Check) else {
        return Ok(ExplorationReport {
            program: Vec::new(),
            interleavings: 0,
            torn: Vec::new(),
        });
    };

    let mut report = ExplorationReport {
        program: program[..=check].to_vec(),
        interleavings: 0,
        torn: Vec::new(),
    };

    let mut placement = Vec::with_capacity(max_firings);
    search(config, check, max_firings, 0, &mut placement, &mut report)?;

    tracing::info!(
        "Explored {} interleavings, {} torn",
        report.interleavings,
        report.torn.len()
    );
    Ok(report)
}

fn search(
    config: &SystemConfig,
    check: usize,
    remaining: usize,
    from: usize,
    placement: &mut Vec<usize>,
    report: &mut ExplorationReport,
) -> SimResult<()> {
    let interleaving = replay(config, check, placement)?;
    report.interleavings += 1;
    if interleaving.observation == Observation::Torn {
        report.torn.push(interleaving);
    }

    if remaining == 0 {
        return Ok(());
    }
    // Non-decreasing placements; two firings at one boundary are allowed.
    for boundary in from..=check {
        placement.push(boundary);
        search(config, check, remaining - 1, boundary, placement, report)?;
        placement.pop();
    }
    Ok(())
}

/// Run one iteration with the timer firing before each listed operation.
pub fn replay(config: &SystemConfig, check: usize, fired_before: &[usize]) -> SimResult<Interleaving> {
    let mut ctx = DeviceContext::new(config)?;
    ctx.bring_up()?;
    let mut main = MainLoop::new(config);
    let mut handler = TimerHandler::new(config);

    let mut pending = false;
    let mut serviced_before = Vec::new();
    for boundary in 0..=check {
        pending |= fired_before.contains(&boundary);
        if pending && ctx.irq.is_enabled() {
            service_masked(&mut handler, &mut ctx)?;
            serviced_before.push(boundary);
            pending = false;
        }

        if let StepOutcome::Checked(observation, observed) = main.step(&mut ctx)? {
            return Ok(Interleaving {
                fired_before: fired_before.to_vec(),
                serviced_before,
                observed,
                observation,
            });
        }
    }

    // The check is always at `check`, so the loop returns before this.
    Ok(Interleaving {
        fired_before: fired_before.to_vec(),
        serviced_before,
        observed: main.local_copy(),
        observation: main.local_copy().classify(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tickrace_config::{Guard, HalfOrder, SharedRole};

    fn config(role: SharedRole, guard: Guard) -> SystemConfig {
        let mut config = SystemConfig::default();
        config.shared.role = role;
        config.shared.guard = guard;
        config
    }

    #[test]
    fn test_blink_only_has_nothing_to_explore() {
        let report = explore(&SystemConfig::default(), 1).unwrap();
        assert_eq!(report.interleavings, 0);
        assert!(report.is_clean());
    }

    #[test]
    fn test_unprotected_reader_tears_between_loads() {
        let config = config(SharedRole::Reader, Guard::Unprotected);
        let report = explore(&config, 1).unwrap();
        // [toggle, load.hi, load.lo, check]: no firing + 4 boundaries
        assert_eq!(report.interleavings, 5);
        assert_eq!(report.torn.len(), 1);

        let torn = &report.torn[0];
        assert_eq!(torn.fired_before, vec![2]);
        assert_eq!(torn.observed, SharedWord::from_combined(0x0000_0000));
    }

    #[test]
    fn test_unprotected_reader_low_first_sees_other_tear() {
        let mut config = config(SharedRole::Reader, Guard::Unprotected);
        config.shared.read_order = HalfOrder::LowFirst;
        let report = explore(&config, 1).unwrap();
        assert_eq!(report.torn.len(), 1);
        assert_eq!(report.torn[0].observed, SharedWord::from_combined(0x0001_FFFF));
    }

    #[test]
    fn test_protected_reader_defers_firing() {
        let config = config(SharedRole::Reader, Guard::Protected);
        let report = explore(&config, 1).unwrap();
        assert!(report.is_clean());

        // [toggle, cs-enter, load.hi, load.lo, cs-exit, check]
        let deferred = replay(&config, 5, &[3]).unwrap();
        assert_eq!(deferred.serviced_before, vec![5]);
        assert_eq!(deferred.observation, Observation::Reset);
    }

    #[test]
    fn test_unprotected_writer_tears_on_both_sides() {
        let config = config(SharedRole::ReaderWriter, Guard::Unprotected);
        let report = explore(&config, 1).unwrap();
        let boundaries: Vec<usize> = report.torn.iter().map(|t| t.fired_before[0]).collect();
        // between the two stores and between the two loads
        assert_eq!(boundaries, vec![2, 4]);
    }

    #[test]
    fn test_every_protected_variant_is_clean_with_two_firings() {
        for role in [SharedRole::Reader, SharedRole::ReaderWriter] {
            for write_order in [HalfOrder::LowFirst, HalfOrder::HighFirst] {
                for read_order in [HalfOrder::LowFirst, HalfOrder::HighFirst] {
                    let mut config = config(role, Guard::Protected);
                    config.shared.write_order = write_order;
                    config.shared.read_order = read_order;
                    let report = explore(&config, 2).unwrap();
                    assert!(report.interleavings > 1);
                    assert!(report.is_clean(), "{:?}: {:?}", config.shared, report.torn);
                }
            }
        }
    }

    #[test]
    fn test_every_unprotected_variant_tears() {
        for role in [SharedRole::Reader, SharedRole::ReaderWriter] {
            for write_order in [HalfOrder::LowFirst, HalfOrder::HighFirst] {
                for read_order in [HalfOrder::LowFirst, HalfOrder::HighFirst] {
                    let mut config = config(role, Guard::Unprotected);
                    config.shared.write_order = write_order;
                    config.shared.read_order = read_order;
                    let report = explore(&config, 1).unwrap();
                    assert!(!report.is_clean(), "{:?}", config.shared);
                }
            }
        }
    }
}
