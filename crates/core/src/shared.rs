//! The shared word: one 32-bit value kept as two 16-bit halves in SRAM.

use crate::bus::{SystemBus, SRAM_BASE};
use crate::{Bus, SimResult};
use serde::Serialize;
use tickrace_config::HalfOrder;

pub const SHARED_LOW_ADDR: u64 = SRAM_BASE;
pub const SHARED_HIGH_ADDR: u64 = SRAM_BASE + 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Half {
    Low,
    High,
}

impl Half {
    pub fn addr(self) -> u64 {
        match self {
            Half::Low => SHARED_LOW_ADDR,
            Half::High => SHARED_HIGH_ADDR,
        }
    }
}

/// The two halves in the order `order` accesses them.
pub fn halves(order: HalfOrder) -> [Half; 2] {
    match order {
        HalfOrder::LowFirst => [Half::Low, Half::High],
        HalfOrder::HighFirst => [Half::High, Half::Low],
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Observation {
    /// Both halves hold the reset pattern.
    Reset,
    /// Both halves hold what the handler publishes.
    Published,
    /// A mix that was never written as a whole.
    Torn,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SharedWord {
    pub high: u16,
    pub low: u16,
}

impl SharedWord {
    /// Initial value, and what the main loop writes back in the
    /// reader-writer variant.
    pub const RESET: Self = Self::from_combined(0x0000_FFFF);
    /// What the handler stores on every firing.
    pub const PUBLISHED: Self = Self::from_combined(0x0001_0000);

    pub const fn combined(self) -> u32 {
        ((self.high as u32) << 16) | self.low as u32
    }

    pub const fn from_combined(value: u32) -> Self {
        Self {
            high: (value >> 16) as u16,
            low: value as u16,
        }
    }

    pub fn half(self, half: Half) -> u16 {
        match half {
            Half::Low => self.low,
            Half::High => self.high,
        }
    }

    pub fn set_half(&mut self, half: Half, value: u16) {
        match half {
            Half::Low => self.low = value,
            Half::High => self.high = value,
        }
    }

    pub fn classify(self) -> Observation {
        const RESET: u32 = SharedWord::RESET.combined();
        const PUBLISHED: u32 = SharedWord::PUBLISHED.combined();
        match self.combined() {
            RESET => Observation::Reset,
            PUBLISHED => Observation::Published,
            _ => Observation::Torn,
        }
    }
}

impl std::fmt::Display for SharedWord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let word = self.combined();
        write!(f, "{:#06x}_{:04x}", word >> 16, word & 0xFFFF)
    }
}

/// One 16-bit store; the only way either context writes a half.
pub fn store(bus: &mut SystemBus, half: Half, value: u16) -> SimResult<()> {
    bus.write_u16(half.addr(), value)
}

/// One 16-bit load.
pub fn load(bus: &SystemBus, half: Half) -> SimResult<u16> {
    bus.read_u16(half.addr())
}

/// Both halves, for inspection from outside the simulated contexts.
pub fn peek(bus: &SystemBus) -> SimResult<SharedWord> {
    Ok(SharedWord {
        high: load(bus, Half::High)?,
        low: load(bus, Half::Low)?,
    })
}
