use crate::bus::{SystemBus, PORT1_BASE, PORT4_BASE, TA3_BASE};
use crate::clock::ClockTree;
use crate::interrupt::{InterruptState, RestoreToken};
use crate::peripherals::gpio::{DigitalPort, BIT0, BIT1, BIT6, PXDIR, PXOUT};
use crate::peripherals::timer::{TaCctl, TaCtl, TimerA, TAXCCR0, TAXCCTL0, TAXCTL, TAXEX0};
use crate::shared::{self, Half, SharedWord};
use crate::{Bus, SimResult};
use std::ops::{Deref, DerefMut};
use tickrace_config::{LedId, SystemConfig, TimerSection};

/// One output line: a port base address and the pin mask within it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pin {
    pub port: u64,
    pub mask: u8,
}

/// Red LED, P4.6. Belongs to the interrupt handler.
pub const LED_HANDLER: Pin = Pin {
    port: PORT4_BASE,
    mask: BIT6,
};
/// Green LED, P1.0. Belongs to the main loop unless the handler owns both.
pub const LED_MAIN: Pin = Pin {
    port: PORT1_BASE,
    mask: BIT0,
};
/// Raised when the main loop observes a torn shared word.
pub const LED_DIAGNOSTIC: Pin = Pin {
    port: PORT1_BASE,
    mask: BIT1,
};

pub fn led_pin(led: LedId) -> Pin {
    match led {
        LedId::Handler => LED_HANDLER,
        LedId::Main => LED_MAIN,
    }
}

fn port_name(port: u64) -> &'static str {
    if port == PORT4_BASE {
        "port4"
    } else {
        "port1"
    }
}

/// Everything both execution contexts can touch: the bus with its
/// peripherals and SRAM, the global interrupt enable, and the frozen clock
/// configuration.
#[derive(Debug)]
pub struct DeviceContext {
    pub bus: SystemBus,
    pub irq: InterruptState,
    pub clocks: ClockTree,
    timer: TimerSection,
    threshold: u16,
}

impl DeviceContext {
    /// Build the context in its reset state. Nothing is configured until
    /// [`DeviceContext::bring_up`] runs.
    pub fn new(config: &SystemConfig) -> SimResult<Self> {
        let clocks = ClockTree::from_config(&config.clock)?;
        let threshold = clocks.timer_threshold(&config.timer)?;
        Ok(Self {
            bus: SystemBus::new(),
            irq: InterruptState::new(),
            clocks,
            timer: config.timer.clone(),
            threshold,
        })
    }

    /// TAxCCR0 value for one period.
    pub fn threshold(&self) -> u16 {
        self.threshold
    }

    /// One-time hardware bring-up, then interrupts on.
    pub fn bring_up(&mut self) -> SimResult<()> {
        tracing::debug!(
            "Clock tree: MCLK {} Hz, SMCLK {} Hz",
            self.clocks.mclk_hz(),
            self.clocks.smclk_hz()
        );

        // Static initialiser of the shared word
        shared::store(&mut self.bus, Half::Low, SharedWord::RESET.low)?;
        shared::store(&mut self.bus, Half::High, SharedWord::RESET.high)?;

        // initialise the leds
        for pin in [LED_HANDLER, LED_MAIN, LED_DIAGNOSTIC] {
            self.bus.clear_bits_u8(pin.port + PXOUT, pin.mask)?;
            self.bus.set_bits_u8(pin.port + PXDIR, pin.mask)?;
        }

        // up mode with SMCLK as source
        let ctl = TaCtl::TASSEL_SMCLK | TaCtl::input_divider(self.timer.input_divider) | TaCtl::MC_UP;
        self.bus.write_u16(TA3_BASE + TAXEX0, self.timer.expansion_divider - 1)?;
        self.bus.write_u16(TA3_BASE + TAXCTL, (ctl | TaCtl::TACLR).bits())?;

        // counter runs 0..=CCR0
        self.bus.write_u16(TA3_BASE + TAXCCR0, self.threshold)?;
        self.bus.write_u16(TA3_BASE + TAXCCTL0, TaCctl::CCIE.bits())?;
        tracing::debug!(
            "TA3 up mode, CCR0 = {} ({} us at {} Hz)",
            self.threshold,
            self.timer.period_us,
            self.clocks.timer_hz(&self.timer)?
        );

        self.irq.enable();
        Ok(())
    }

    /// Reload TAxCCR0 and acknowledge the compare flag.
    pub fn rearm(&mut self) -> SimResult<()> {
        self.bus.write_u16(TA3_BASE + TAXCCR0, self.threshold)?;
        self.bus.write_u16(TA3_BASE + TAXCCTL0, TaCctl::CCIE.bits())
    }

    pub fn toggle(&mut self, pin: Pin) -> SimResult<()> {
        self.bus.toggle_bits_u8(pin.port + PXOUT, pin.mask)
    }

    pub fn set(&mut self, pin: Pin, level: bool) -> SimResult<()> {
        if level {
            self.bus.set_bits_u8(pin.port + PXOUT, pin.mask)
        } else {
            self.bus.clear_bits_u8(pin.port + PXOUT, pin.mask)
        }
    }

    pub fn level(&self, pin: Pin) -> SimResult<bool> {
        Ok(self.bus.read_u8(pin.port + PXOUT)? & pin.mask != 0)
    }

    pub fn led_level(&self, led: LedId) -> SimResult<bool> {
        self.level(led_pin(led))
    }

    pub fn diagnostic_raised(&self) -> bool {
        self.level(LED_DIAGNOSTIC).unwrap_or(false)
    }

    pub fn edges(&self, pin: Pin) -> u64 {
        self.bus
            .peripheral::<DigitalPort>(port_name(pin.port))
            .map(|port| port.edges(pin.mask))
            .unwrap_or(0)
    }

    pub fn led_edges(&self, led: LedId) -> u64 {
        self.edges(led_pin(led))
    }

    pub fn timer(&self) -> Option<&TimerA> {
        self.bus.peripheral::<TimerA>("ta3")
    }

    /// Current content of the shared word.
    pub fn shared(&self) -> SimResult<SharedWord> {
        shared::peek(&self.bus)
    }

    /// Scoped critical section. Interrupts stay masked until the guard drops.
    pub fn critical_section(&mut self) -> CriticalSection<'_> {
        let token = self.irq.acquire();
        CriticalSection {
            ctx: self,
            token: Some(token),
        }
    }

    /// Closure form of [`DeviceContext::critical_section`].
    pub fn free<R>(&mut self, f: impl FnOnce(&mut DeviceContext) -> R) -> R {
        let mut cs = self.critical_section();
        f(&mut cs)
    }
}

/// Guard returned by [`DeviceContext::critical_section`]. Restores the
/// previous interrupt enable state when dropped, on every exit path.
pub struct CriticalSection<'a> {
    ctx: &'a mut DeviceContext,
    token: Option<RestoreToken>,
}

impl Deref for CriticalSection<'_> {
    type Target = DeviceContext;

    fn deref(&self) -> &DeviceContext {
        self.ctx
    }
}

impl DerefMut for CriticalSection<'_> {
    fn deref_mut(&mut self) -> &mut DeviceContext {
        self.ctx
    }
}

impl Drop for CriticalSection<'_> {
    fn drop(&mut self) {
        if let Some(token) = self.token.take() {
            self.ctx.irq.release(token);
        }
    }
}
