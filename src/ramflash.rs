//! RAM-backed NOR flash emulator.
//!
//! Used for volatile TFS devices and by the test-suite. The backing store is
//! shared through an `Arc<Mutex<..>>` so a "rebooted" handle can be opened
//! over the exact bytes a previous handle left behind, and a power cut can be
//! injected after a given number of program/erase operations.

use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use spin::Mutex;

use crate::flash::{FlashDevice, FlashError, Sector, ERASED};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FlashStats {
    pub programs: usize,
    pub erases: usize,
    pub bytes_programmed: usize,
}

pub struct RamFlash {
    mem: Arc<Mutex<Vec<u8>>>,
    base: u32,
    sector_size: u32,
    ops_left: Option<usize>,
    dead: bool,
    stats: FlashStats,
}

impl RamFlash {
    /// A fully erased part of `sectors` uniform sectors starting at `base`.
    pub fn new(base: u32, sector_size: u32, sectors: usize) -> Self {
        let mem = vec![ERASED; sector_size as usize * sectors];
        Self {
            mem: Arc::new(Mutex::new(mem)),
            base,
            sector_size,
            ops_left: None,
            dead: false,
            stats: FlashStats::default(),
        }
    }

    /// A fresh handle over the same memory, as seen after a reset.
    pub fn reboot(&self) -> Self {
        Self {
            mem: self.mem.clone(),
            base: self.base,
            sector_size: self.sector_size,
            ops_left: None,
            dead: false,
            stats: FlashStats::default(),
        }
    }

    /// Lose power when the `ops`-th program/erase from now starts. A program
    /// cut short leaves the first half of its bytes written.
    pub fn cut_power_after(&mut self, ops: usize) {
        self.ops_left = Some(ops);
    }

    pub fn powered(&self) -> bool {
        !self.dead
    }

    pub fn stats(&self) -> FlashStats {
        self.stats
    }

    pub fn reset_stats(&mut self) {
        self.stats = FlashStats::default();
    }

    /// Copy of the whole part, for comparing images in tests.
    pub fn snapshot(&self) -> Vec<u8> {
        self.mem.lock().clone()
    }

    /// Flip bits directly, bypassing program rules (fault injection).
    pub fn corrupt(&mut self, addr: u32, xor: u8) {
        let off = (addr - self.base) as usize;
        self.mem.lock()[off] ^= xor;
    }

    fn offset(&self, addr: u32, len: usize) -> Result<usize, FlashError> {
        let size = self.mem.lock().len();
        if addr < self.base {
            return Err(FlashError::OutOfRange(addr));
        }
        let off = (addr - self.base) as usize;
        if off + len > size {
            return Err(FlashError::OutOfRange(addr));
        }
        Ok(off)
    }

    /// Returns false once the injected power cut has happened.
    fn spend_op(&mut self) -> bool {
        if self.dead {
            return false;
        }
        match self.ops_left {
            Some(0) => {
                self.dead = true;
                false
            }
            Some(ref mut n) => {
                *n -= 1;
                true
            }
            None => true,
        }
    }
}

impl FlashDevice for RamFlash {
    fn read(&self, addr: u32, buf: &mut [u8]) -> Result<(), FlashError> {
        let off = self.offset(addr, buf.len())?;
        buf.copy_from_slice(&self.mem.lock()[off..off + buf.len()]);
        Ok(())
    }

    fn program(&mut self, addr: u32, data: &[u8]) -> Result<(), FlashError> {
        let off = self.offset(addr, data.len())?;
        let was_dead = self.dead;
        let powered = self.spend_op();
        let len = if powered {
            data.len()
        } else if was_dead {
            return Err(FlashError::PowerLoss);
        } else {
            data.len() / 2
        };

        let mut mem = self.mem.lock();
        for (i, &byte) in data[..len].iter().enumerate() {
            let old = mem[off + i];
            if old & byte != byte {
                return Err(FlashError::WouldSetBits(addr + i as u32));
            }
            mem[off + i] = old & byte;
        }
        drop(mem);

        if !powered {
            return Err(FlashError::PowerLoss);
        }
        self.stats.programs += 1;
        self.stats.bytes_programmed += len;
        Ok(())
    }

    fn erase(&mut self, sector: usize) -> Result<(), FlashError> {
        let s = self.sector(sector).ok_or(FlashError::NoSuchSector(sector))?;
        if !self.spend_op() {
            return Err(FlashError::PowerLoss);
        }
        let off = (s.base - self.base) as usize;
        self.mem.lock()[off..off + s.size as usize].fill(ERASED);
        self.stats.erases += 1;
        Ok(())
    }

    fn sector_at(&self, addr: u32) -> Option<Sector> {
        if addr < self.base {
            return None;
        }
        self.sector(((addr - self.base) / self.sector_size) as usize)
    }

    fn sector(&self, number: usize) -> Option<Sector> {
        let count = self.mem.lock().len() / self.sector_size as usize;
        if number >= count {
            return None;
        }
        Some(Sector {
            number,
            base: self.base + number as u32 * self.sector_size,
            size: self.sector_size,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn program_only_clears_bits() {
        let mut flash = RamFlash::new(0, 256, 2);
        flash.program(4, &[0xF0]).unwrap();
        flash.program(4, &[0x30]).unwrap();
        let mut b = [0u8; 1];
        flash.read(4, &mut b).unwrap();
        assert_eq!(b[0], 0x30);
        assert_eq!(flash.program(4, &[0x0F]), Err(FlashError::WouldSetBits(4)));
        flash.erase(0).unwrap();
        assert!(flash.is_erased(0, 256).unwrap());
    }

    #[test]
    fn power_cut_leaves_half_a_program() {
        let mut flash = RamFlash::new(0, 256, 1);
        flash.cut_power_after(1);
        flash.program(0, &[0u8; 4]).unwrap();
        assert_eq!(flash.program(16, &[0u8; 8]), Err(FlashError::PowerLoss));
        assert_eq!(flash.erase(0), Err(FlashError::PowerLoss));

        let rebooted = flash.reboot();
        let mut buf = [0xAAu8; 8];
        rebooted.read(16, &mut buf).unwrap();
        assert_eq!(buf, [0, 0, 0, 0, 0xFF, 0xFF, 0xFF, 0xFF]);
    }
}
