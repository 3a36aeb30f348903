//! Periodic-interrupt blinky for an STM32F103 "Blue Pill".
//!
//! SysTick runs from HCLK/8 (1 MHz with the reset-default 8 MHz HSI) and
//! fires once per millisecond. The handler toggles PC13 every
//! `TOGGLE_EVERY` firings while the main loop toggles PA5 as fast as its
//! busy-wait allows. With `shared-race` enabled the handler also publishes a
//! 32-bit word as two 16-bit halves, and the main loop raises PA6 whenever it
//! reads a combination of halves that was never written as a whole.

#![no_main]
#![no_std]

use core::ptr::{read_volatile, write_volatile};
use core::sync::atomic::{AtomicU16, Ordering};
use cortex_m::peripheral::syst::SystClkSource;
use cortex_m_rt::{entry, exception};
use panic_halt as _;

const RCC_APB2ENR: *mut u32 = 0x4002_1018 as *mut u32;
const IOPAEN: u32 = 1 << 2;
const IOPCEN: u32 = 1 << 4;

const GPIOA: usize = 0x4001_0800;
const GPIOC: usize = 0x4001_1000;
const GPIO_CRL: usize = 0x00;
const GPIO_CRH: usize = 0x04;
const GPIO_ODR: usize = 0x0C;
const GPIO_BSRR: usize = 0x10;

/// Push-pull output, 2 MHz.
const OUTPUT_2MHZ: u32 = 0b0010;

/// 1 MHz SysTick clock, 1 ms period.
const SYSTICK_RELOAD: u32 = 1_000 - 1;
const TOGGLE_EVERY: u16 = 1_000;

const BUSY_WAIT_CYCLES: u32 = 600;
const DIAGNOSTIC_STALL_CYCLES: u32 = 4_000_000;

#[derive(Clone, Copy)]
struct Led {
    port: usize,
    pin: u32,
}

const LED_HANDLER: Led = Led {
    port: GPIOC,
    pin: 13,
};
const LED_MAIN: Led = Led { port: GPIOA, pin: 5 };
const LED_DIAGNOSTIC: Led = Led { port: GPIOA, pin: 6 };

impl Led {
    fn configure(self) {
        let (offset, shift) = if self.pin < 8 {
            (GPIO_CRL, self.pin * 4)
        } else {
            (GPIO_CRH, (self.pin - 8) * 4)
        };
        let reg = (self.port + offset) as *mut u32;
        // SAFETY: GPIO configuration registers, clock enabled before use.
        unsafe {
            let value = read_volatile(reg) & !(0xF << shift);
            write_volatile(reg, value | (OUTPUT_2MHZ << shift));
        }
        self.set(false);
    }

    fn set(self, on: bool) {
        let bsrr = (self.port + GPIO_BSRR) as *mut u32;
        let bit = if on { 1 << self.pin } else { 1 << (self.pin + 16) };
        // SAFETY: BSRR writes are atomic set/reset, safe from any context.
        unsafe { write_volatile(bsrr, bit) };
    }

    fn toggle(self) {
        let odr = (self.port + GPIO_ODR) as *const u32;
        // SAFETY: ODR is read-only here; the write goes through BSRR.
        let on = unsafe { read_volatile(odr) } & (1 << self.pin) != 0;
        self.set(!on);
    }
}

// Two halves of the shared word. Reset: 0x0000_FFFF, published: 0x0001_0000.
static SHARED_LOW: AtomicU16 = AtomicU16::new(0xFFFF);
static SHARED_HIGH: AtomicU16 = AtomicU16::new(0x0000);

const RESET_PATTERN: u32 = 0x0000_FFFF;
const PUBLISHED_PATTERN: u32 = 0x0001_0000;

/// Run `f` with interrupts masked when built with `protected`.
#[inline(always)]
fn guarded<R>(f: impl FnOnce() -> R) -> R {
    if cfg!(feature = "protected") {
        cortex_m::interrupt::free(|_| f())
    } else {
        f()
    }
}

#[entry]
fn main() -> ! {
    // SAFETY: single read-modify-write before interrupts are configured.
    unsafe {
        let enabled = read_volatile(RCC_APB2ENR);
        write_volatile(RCC_APB2ENR, enabled | IOPAEN | IOPCEN);
    }
    for led in [LED_HANDLER, LED_MAIN, LED_DIAGNOSTIC] {
        led.configure();
    }

    let Some(mut core) = cortex_m::Peripherals::take() else {
        loop {
            cortex_m::asm::nop();
        }
    };
    core.SYST.set_clock_source(SystClkSource::External);
    core.SYST.set_reload(SYSTICK_RELOAD);
    core.SYST.clear_current();
    core.SYST.enable_interrupt();
    core.SYST.enable_counter();

    loop {
        if !cfg!(feature = "handler-owns-both") {
            LED_MAIN.toggle();
        }

        if cfg!(feature = "shared-race") {
            if cfg!(feature = "reader-writer") {
                guarded(|| {
                    SHARED_LOW.store(0xFFFF, Ordering::Relaxed);
                    SHARED_HIGH.store(0x0000, Ordering::Relaxed);
                });
            }

            let local = guarded(|| {
                let high = SHARED_HIGH.load(Ordering::Relaxed);
                let low = SHARED_LOW.load(Ordering::Relaxed);
                (u32::from(high) << 16) | u32::from(low)
            });

            if local != RESET_PATTERN && local != PUBLISHED_PATTERN {
                LED_DIAGNOSTIC.set(true);
                cortex_m::asm::delay(DIAGNOSTIC_STALL_CYCLES);
            }
        }

        cortex_m::asm::delay(BUSY_WAIT_CYCLES);
    }
}

#[exception]
fn SysTick() {
    // The counter reloads itself; nothing to re-arm.
    static mut TICKS: u16 = 0;

    *TICKS += 1;
    if *TICKS >= TOGGLE_EVERY {
        *TICKS = 0;
        LED_HANDLER.toggle();
        if cfg!(feature = "handler-owns-both") {
            LED_MAIN.toggle();
        }
    }

    if cfg!(feature = "shared-race") {
        SHARED_LOW.store(0x0000, Ordering::Relaxed);
        SHARED_HIGH.store(0x0001, Ordering::Relaxed);
    }
}
