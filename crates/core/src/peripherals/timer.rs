use crate::{Peripheral, SimResult};
use bitflags::bitflags;
use std::any::Any;

// Register offsets within the TAx block
pub const TAXCTL: u64 = 0x00;
pub const TAXCCTL0: u64 = 0x02;
pub const TAXR: u64 = 0x10;
pub const TAXCCR0: u64 = 0x12;
pub const TAXEX0: u64 = 0x20;

const MC_MASK: u16 = 0x0030;
const ID_MASK: u16 = 0x00C0;
const TASSEL_MASK: u16 = 0x0300;

bitflags! {
    /// TAxCTL control bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TaCtl: u16 {
        const TAIFG = 0x0001;
        const TAIE = 0x0002;
        const TACLR = 0x0004;
        const MC_UP = 0x0010;
        const MC_CONTINUOUS = 0x0020;
        const MC_UPDOWN = 0x0030;
        const ID_2 = 0x0040;
        const ID_4 = 0x0080;
        const ID_8 = 0x00C0;
        const TASSEL_ACLK = 0x0100;
        const TASSEL_SMCLK = 0x0200;
    }
}

bitflags! {
    /// TAxCCTL0 capture/compare control bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TaCctl: u16 {
        const CCIFG = 0x0001;
        const CCIE = 0x0010;
    }
}

impl TaCtl {
    /// Encode an input divider of 1, 2, 4 or 8 into the ID field.
    pub fn input_divider(divider: u16) -> Self {
        match divider {
            2 => Self::ID_2,
            4 => Self::ID_4,
            8 => Self::ID_8,
            _ => Self::empty(),
        }
    }
}

/// 16-bit Timer_A with a single capture/compare channel.
///
/// Only up mode is modelled: the counter increments once per
/// `ID * (EX0 + 1)` SMCLK cycles and counts 0..=TAxCCR0, so one period is
/// CCR0 + 1 counts. Reaching TAxCCR0 sets CCIFG and requests an interrupt
/// when CCIE is set; the next count rolls over to zero.
#[derive(Debug)]
pub struct TimerA {
    ctl: TaCtl,
    cctl0: TaCctl,
    r: u16,
    ccr0: u16,
    ex0: u16,
    prescale: u32,
    wraps: u64,
}

impl TimerA {
    pub fn new() -> Self {
        Self {
            ctl: TaCtl::empty(),
            cctl0: TaCctl::empty(),
            r: 0,
            ccr0: 0,
            ex0: 0,
            prescale: 0,
            wraps: 0,
        }
    }

    fn read_reg(&self, offset: u64) -> u16 {
        match offset {
            TAXCTL => self.ctl.bits(),
            TAXCCTL0 => self.cctl0.bits(),
            TAXR => self.r,
            TAXCCR0 => self.ccr0,
            TAXEX0 => self.ex0,
            _ => 0,
        }
    }

    fn write_reg(&mut self, offset: u64, value: u16) {
        match offset {
            TAXCTL => {
                let mut ctl = TaCtl::from_bits_truncate(value);
                if ctl.contains(TaCtl::TACLR) {
                    // TACLR resets the counter and divider logic, then self-clears
                    self.r = 0;
                    self.prescale = 0;
                    ctl.remove(TaCtl::TACLR);
                }
                self.ctl = ctl;
            }
            TAXCCTL0 => self.cctl0 = TaCctl::from_bits_truncate(value),
            TAXR => self.r = value,
            TAXCCR0 => self.ccr0 = value,
            TAXEX0 => self.ex0 = value & 0x7,
            _ => {}
        }
    }

    pub fn ctl(&self) -> TaCtl {
        self.ctl
    }

    pub fn cctl0(&self) -> TaCctl {
        self.cctl0
    }

    pub fn counter(&self) -> u16 {
        self.r
    }

    pub fn ccr0(&self) -> u16 {
        self.ccr0
    }

    /// Number of times the counter has reached TAxCCR0.
    pub fn wraps(&self) -> u64 {
        self.wraps
    }

    pub fn is_up_mode(&self) -> bool {
        self.ctl.bits() & MC_MASK == TaCtl::MC_UP.bits()
    }

    /// SMCLK cycles per counter increment.
    pub fn prescaler(&self) -> u32 {
        let id = 1u32 << ((self.ctl.bits() & ID_MASK) >> 6);
        let ex = u32::from(self.ex0) + 1;
        id * ex
    }

    fn running(&self) -> bool {
        // Only SMCLK is driven by the machine. CCR0 = 0 halts up mode.
        self.is_up_mode()
            && self.ccr0 != 0
            && self.ctl.bits() & TASSEL_MASK == TaCtl::TASSEL_SMCLK.bits()
    }
}

impl Default for TimerA {
    fn default() -> Self {
        Self::new()
    }
}

impl Peripheral for TimerA {
    fn read(&self, offset: u64) -> SimResult<u8> {
        let reg_val = self.read_reg(offset & !1);
        Ok(if offset & 1 == 0 {
            (reg_val & 0xFF) as u8
        } else {
            (reg_val >> 8) as u8
        })
    }

    fn write(&mut self, offset: u64, value: u8) -> SimResult<()> {
        let reg_offset = offset & !1;
        let mut reg_val = self.read_reg(reg_offset);
        if offset & 1 == 0 {
            reg_val = (reg_val & 0xFF00) | value as u16;
        } else {
            reg_val = (reg_val & 0x00FF) | ((value as u16) << 8);
        }
        self.write_reg(reg_offset, reg_val);
        tracing::trace!("TA3: reg {:#04x} <- {:#06x}", reg_offset, reg_val);
        Ok(())
    }

    /// Advance the timer by one SMCLK cycle
    fn tick(&mut self) -> bool {
        if !self.running() {
            return false;
        }

        self.prescale += 1;
        if self.prescale < self.prescaler() {
            return false;
        }
        self.prescale = 0;

        if self.r == self.ccr0 {
            self.r = 0;
            return false;
        }
        self.r = self.r.wrapping_add(1);
        if self.r != self.ccr0 {
            return false;
        }

        self.wraps += 1;
        self.cctl0.insert(TaCctl::CCIFG);
        self.cctl0.contains(TaCctl::CCIE)
    }

    fn snapshot(&self) -> serde_json::Value {
        serde_json::json!({
            "ctl": self.ctl.bits(),
            "cctl0": self.cctl0.bits(),
            "r": self.r,
            "ccr0": self.ccr0,
            "ex0": self.ex0,
            "wraps": self.wraps,
        })
    }

    fn as_any(&self) -> Option<&dyn Any> {
        Some(self)
    }

    fn as_any_mut(&mut self) -> Option<&mut dyn Any> {
        Some(self)
    }
}
