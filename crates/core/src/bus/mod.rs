use crate::memory::Sram;
use crate::peripherals::gpio::DigitalPort;
use crate::peripherals::timer::TimerA;
use crate::{Peripheral, SimResult, SimulationError};
use std::collections::BTreeMap;

// Memory map of the simulated part (FR5969-style layout).
pub const PORT1_BASE: u64 = 0x0200;
pub const PORT4_BASE: u64 = 0x0220;
pub const PORT_SIZE: u64 = 0x20;
pub const TA3_BASE: u64 = 0x0440;
pub const TA3_SIZE: u64 = 0x30;
pub const SRAM_BASE: u64 = 0x1C00;
pub const SRAM_SIZE: u64 = 0x800;

/// Vector number of the TA3 CCR0 interrupt.
pub const TIMER3_A0_IRQ: u32 = 44;

pub struct PeripheralEntry {
    pub name: String,
    pub base: u64,
    pub size: u64,
    pub irq: Option<u32>,
    pub dev: Box<dyn Peripheral>,
}

impl std::fmt::Debug for PeripheralEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeripheralEntry")
            .field("name", &self.name)
            .field("base", &format_args!("{:#x}", self.base))
            .field("size", &self.size)
            .field("irq", &self.irq)
            .finish()
    }
}

#[derive(Debug)]
pub struct SystemBus {
    pub peripherals: Vec<PeripheralEntry>,
}

impl Default for SystemBus {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemBus {
    pub fn new() -> Self {
        Self {
            peripherals: vec![
                PeripheralEntry {
                    name: "sram".to_string(),
                    base: SRAM_BASE,
                    size: SRAM_SIZE,
                    irq: None,
                    dev: Box::new(Sram::new(SRAM_SIZE as usize)),
                },
                PeripheralEntry {
                    name: "port1".to_string(),
                    base: PORT1_BASE,
                    size: PORT_SIZE,
                    irq: None,
                    dev: Box::new(DigitalPort::new()),
                },
                PeripheralEntry {
                    name: "port4".to_string(),
                    base: PORT4_BASE,
                    size: PORT_SIZE,
                    irq: None,
                    dev: Box::new(DigitalPort::new()),
                },
                PeripheralEntry {
                    name: "ta3".to_string(),
                    base: TA3_BASE,
                    size: TA3_SIZE,
                    irq: Some(TIMER3_A0_IRQ),
                    dev: Box::new(TimerA::new()),
                },
            ],
        }
    }

    fn entry_at(&self, addr: u64) -> Option<(usize, u64)> {
        self.peripherals
            .iter()
            .position(|p| addr >= p.base && addr < p.base + p.size)
            .map(|idx| (idx, addr - self.peripherals[idx].base))
    }

    /// Typed access to a peripheral by name.
    pub fn peripheral<T: 'static>(&self, name: &str) -> Option<&T> {
        self.peripherals
            .iter()
            .find(|p| p.name == name)
            .and_then(|p| p.dev.as_any())
            .and_then(|any| any.downcast_ref::<T>())
    }


    pub fn snapshot(&self) -> BTreeMap<String, serde_json::Value> {
        self.peripherals
            .iter()
            .map(|p| (p.name.clone(), p.dev.snapshot()))
            .filter(|(_, v)| !v.is_null())
            .collect()
    }
}

impl crate::Bus for SystemBus {
    fn read_u8(&self, addr: u64) -> SimResult<u8> {
        match self.entry_at(addr) {
            Some((idx, offset)) => self.peripherals[idx].dev.read(offset),
            None => Err(SimulationError::MemoryViolation(addr)),
        }
    }

    fn write_u8(&mut self, addr: u64, value: u8) -> SimResult<()> {
        match self.entry_at(addr) {
            Some((idx, offset)) => self.peripherals[idx].dev.write(offset, value),
            None => Err(SimulationError::MemoryViolation(addr)),
        }
    }

    fn tick_peripherals(&mut self) -> Vec<u32> {
        let mut requests = Vec::new();
        for p in self.peripherals.iter_mut() {
            if p.dev.tick() {
                if let Some(irq) = p.irq {
                    requests.push(irq);
                }
            }
        }
        requests
    }
}
