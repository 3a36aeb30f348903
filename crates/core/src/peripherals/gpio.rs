use crate::SimResult;
use std::any::Any;

// Register offsets within a port block
pub const PXIN: u64 = 0x00;
pub const PXOUT: u64 = 0x02;
pub const PXDIR: u64 = 0x04;

pub const BIT0: u8 = 0x01;
pub const BIT1: u8 = 0x02;
pub const BIT6: u8 = 0x40;

/// 8-bit digital I/O port with input, output and direction registers.
/// Counts level changes on every pin configured as an output. Nothing
/// drives the inputs, so they read low.
#[derive(Debug, Default)]
pub struct DigitalPort {
    out: u8,
    dir: u8,
    edges: [u64; 8],
}

impl DigitalPort {
    pub fn new() -> Self {
        Self::default()
    }

    fn read_reg(&self, offset: u64) -> u8 {
        match offset {
            // Output pins read back their driven level
            PXIN => self.out & self.dir,
            PXOUT => self.out,
            PXDIR => self.dir,
            _ => 0,
        }
    }

    fn write_reg(&mut self, offset: u64, value: u8) {
        match offset {
            PXOUT => {
                let changed = (self.out ^ value) & self.dir;
                for (pin, count) in self.edges.iter_mut().enumerate() {
                    if changed & (1 << pin) != 0 {
                        *count += 1;
                    }
                }
                self.out = value;
            }
            PXDIR => self.dir = value,
            _ => {}
        }
    }

    /// Level changes seen on the lowest pin in `mask` while it was an output.
    pub fn edges(&self, mask: u8) -> u64 {
        if mask == 0 {
            return 0;
        }
        self.edges[mask.trailing_zeros() as usize]
    }
}

impl crate::Peripheral for DigitalPort {
    fn read(&self, offset: u64) -> SimResult<u8> {
        Ok(self.read_reg(offset))
    }

    fn write(&mut self, offset: u64, value: u8) -> SimResult<()> {
        self.write_reg(offset, value);
        Ok(())
    }

    fn snapshot(&self) -> serde_json::Value {
        serde_json::json!({
            "out": self.out,
            "dir": self.dir,
            "edges": self.edges,
        })
    }

    fn as_any(&self) -> Option<&dyn Any> {
        Some(self)
    }

    fn as_any_mut(&mut self) -> Option<&mut dyn Any> {
        Some(self)
    }
}
