use crate::{Peripheral, SimResult, SimulationError};
use std::any::Any;

/// Byte-addressed static RAM. Word accesses arrive as separate byte accesses
/// from the bus, exactly like the two halves of the shared word do.
#[derive(Debug)]
pub struct Sram {
    data: Vec<u8>,
}

impl Sram {
    pub fn new(size: usize) -> Self {
        Self {
            data: vec![0; size],
        }
    }
}

impl Peripheral for Sram {
    fn read(&self, offset: u64) -> SimResult<u8> {
        self.data
            .get(offset as usize)
            .copied()
            .ok_or(SimulationError::MemoryViolation(offset))
    }

    fn write(&mut self, offset: u64, value: u8) -> SimResult<()> {
        match self.data.get_mut(offset as usize) {
            Some(byte) => {
                *byte = value;
                Ok(())
            }
            None => Err(SimulationError::MemoryViolation(offset)),
        }
    }

    fn as_any(&self) -> Option<&dyn Any> {
        Some(self)
    }

    fn as_any_mut(&mut self) -> Option<&mut dyn Any> {
        Some(self)
    }
}
