//! Clock tree and timer threshold arithmetic.
//!
//! The reference part runs its DCO at 16 MHz. MCLK divides it by 1 and SMCLK
//! by 16, so the timer sees a 1 MHz source and a 1 ms period is 1000 counts.
//! Up mode counts 0..=CCR0, so that period is programmed as CCR0 = 999.

use serde::Serialize;
use tickrace_config::{ClockSection, TimerSection, CLOCK_DIVIDERS, TIMER_INPUT_DIVIDERS};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ClockError {
    #[error("Clock divider {0} is not supported")]
    UnsupportedDivider(u32),
    #[error("Timer period of {period_us}us is {counts} counts, outside 2..=65536")]
    ThresholdOutOfRange { period_us: u32, counts: u64 },
    #[error("{clocks_per_step} clocks per step would skip a timer period of {period_clocks} clocks")]
    StepTooCoarse {
        clocks_per_step: u32,
        period_clocks: u64,
    },
    #[error(
        "{max_latency_steps} steps of entry latency at {clocks_per_step} clocks per step can outlast a timer period of {period_clocks} clocks"
    )]
    LatencyTooLong {
        max_latency_steps: u32,
        clocks_per_step: u32,
        period_clocks: u64,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ClockTree {
    pub dco_hz: u32,
    pub mclk_divider: u32,
    pub smclk_divider: u32,
}

impl ClockTree {
    pub fn from_config(section: &ClockSection) -> Result<Self, ClockError> {
        for divider in [section.mclk_divider, section.smclk_divider] {
            if !CLOCK_DIVIDERS.contains(&divider) {
                return Err(ClockError::UnsupportedDivider(divider));
            }
        }
        Ok(Self {
            dco_hz: section.dco_hz,
            mclk_divider: section.mclk_divider,
            smclk_divider: section.smclk_divider,
        })
    }

    pub fn mclk_hz(&self) -> u32 {
        self.dco_hz / self.mclk_divider
    }

    pub fn smclk_hz(&self) -> u32 {
        self.dco_hz / self.smclk_divider
    }

    /// Frequency the timer counter increments at after ID and EX0.
    pub fn timer_hz(&self, timer: &TimerSection) -> Result<u32, ClockError> {
        if !TIMER_INPUT_DIVIDERS.contains(&timer.input_divider) {
            return Err(ClockError::UnsupportedDivider(u32::from(timer.input_divider)));
        }
        if !(1..=8).contains(&timer.expansion_divider) {
            return Err(ClockError::UnsupportedDivider(u32::from(timer.expansion_divider)));
        }
        let prescale = u32::from(timer.input_divider) * u32::from(timer.expansion_divider);
        Ok(self.smclk_hz() / prescale)
    }

    /// Value for TAxCCR0 so the counter wraps once per `period_us`.
    pub fn timer_threshold(&self, timer: &TimerSection) -> Result<u16, ClockError> {
        let counts = u64::from(self.timer_hz(timer)?) * u64::from(timer.period_us) / 1_000_000;
        // CCR0 = 0 halts up mode
        match counts.checked_sub(1).map(u16::try_from) {
            Some(Ok(ccr0)) if ccr0 > 0 => Ok(ccr0),
            _ => Err(ClockError::ThresholdOutOfRange {
                period_us: timer.period_us,
                counts,
            }),
        }
    }

    /// SMCLK cycles between two timer requests.
    pub fn period_clocks(&self, timer: &TimerSection) -> Result<u64, ClockError> {
        let threshold = self.timer_threshold(timer)?;
        let prescale = u64::from(timer.input_divider) * u64::from(timer.expansion_divider);
        Ok((u64::from(threshold) + 1) * prescale)
    }
}
