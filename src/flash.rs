//! Flash primitive adapter.
//!
//! TFS never touches flash memory directly; every read, program and erase
//! goes through a [`FlashDevice`] supplied by the board. Programming may only
//! clear bits, erasing sets a whole sector back to `0xFF`.

use onlyerror::Error;

use crate::crc::Crc32;

/// Byte value of erased NOR flash.
pub const ERASED: u8 = 0xFF;

const CHUNK: usize = 256;

/// Geometry of one erasable sector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sector {
    pub number: usize,
    pub base: u32,
    pub size: u32,
}

impl Sector {
    /// One past the last byte of the sector.
    pub fn end(&self) -> u32 {
        self.base + self.size
    }

    pub fn contains(&self, addr: u32) -> bool {
        addr >= self.base && addr < self.end()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FlashError {
    #[error("address out of range: {0}")]
    OutOfRange(u32),
    #[error("no such sector: {0}")]
    NoSuchSector(usize),
    #[error("program would set cleared bits at {0}")]
    WouldSetBits(u32),
    #[error("program failed at {0}")]
    Program(u32),
    #[error("erase failed on sector {0}")]
    Erase(usize),
    #[error("sector {0} is protected")]
    Protected(usize),
    #[error("power lost during flash operation")]
    PowerLoss,
}

/// Board-specific flash driver.
pub trait FlashDevice {
    /// Copy `buf.len()` bytes starting at `addr` into `buf`.
    fn read(&self, addr: u32, buf: &mut [u8]) -> Result<(), FlashError>;

    /// Program `data` at `addr`. The destination must read as a superset of
    /// the 1-bits in `data`.
    fn program(&mut self, addr: u32, data: &[u8]) -> Result<(), FlashError>;

    /// Erase one sector. Erasing an already erased sector is harmless.
    fn erase(&mut self, sector: usize) -> Result<(), FlashError>;

    /// Sector containing `addr`.
    fn sector_at(&self, addr: u32) -> Option<Sector>;

    /// Sector by number.
    fn sector(&self, number: usize) -> Option<Sector>;

    /// True when every byte in `[begin, end)` reads erased.
    fn is_erased(&self, begin: u32, end: u32) -> Result<bool, FlashError> {
        let mut buf = [0u8; CHUNK];
        let mut addr = begin;
        while addr < end {
            let len = core::cmp::min(CHUNK as u32, end - addr) as usize;
            self.read(addr, &mut buf[..len])?;
            if buf[..len].iter().any(|&b| b != ERASED) {
                return Ok(false);
            }
            addr += len as u32;
        }
        Ok(true)
    }
}

/// CRC-32 of `[begin, end)` as currently stored in flash.
pub fn crc_range<F: FlashDevice + ?Sized>(flash: &F, begin: u32, end: u32) -> Result<u32, FlashError> {
    let mut crc = Crc32::new();
    let mut buf = [0u8; CHUNK];
    let mut addr = begin;
    while addr < end {
        let len = core::cmp::min(CHUNK as u32, end - addr) as usize;
        flash.read(addr, &mut buf[..len])?;
        crc.update(&buf[..len]);
        addr += len as u32;
    }
    Ok(crc.finish())
}

/// Copy `len` bytes from flash at `src` to flash at `dest` (which must be
/// erased or bit-compatible).
pub fn copy_range<F: FlashDevice + ?Sized>(
    flash: &mut F,
    src: u32,
    dest: u32,
    len: u32,
) -> Result<(), FlashError> {
    let mut buf = [0u8; CHUNK];
    let mut done = 0u32;
    while done < len {
        let n = core::cmp::min(CHUNK as u32, len - done) as usize;
        flash.read(src + done, &mut buf[..n])?;
        flash.program(dest + done, &buf[..n])?;
        done += n as u32;
    }
    Ok(())
}

/// Round `value` up to the next multiple of 16, the record alignment.
pub const fn align16(value: u32) -> u32 {
    (value + 15) & !15
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crc::crc32;
    use crate::ramflash::RamFlash;

    #[test]
    fn crc_range_spans_chunks() {
        let mut flash = RamFlash::new(0, 0x400, 2);
        let data: alloc::vec::Vec<u8> = (0..600u32).map(|i| i as u8).collect();
        flash.program(0x10, &data).unwrap();
        assert_eq!(crc_range(&flash, 0x10, 0x10 + 600).unwrap(), crc32(&data));
    }

    #[test]
    fn copy_range_across_sectors() {
        let mut flash = RamFlash::new(0, 0x400, 2);
        flash.program(0x300, &[0xA5; 0x180]).unwrap();
        copy_range(&mut flash, 0x300, 0x480, 0x180).unwrap();
        let mut back = [0u8; 0x180];
        flash.read(0x480, &mut back).unwrap();
        assert_eq!(back, [0xA5; 0x180]);
        assert!(!flash.is_erased(0x400, 0x800).unwrap());
        assert!(flash.is_erased(0x600, 0x800).unwrap());
    }

    #[test]
    fn alignment() {
        assert_eq!(align16(92 + 11), 112);
        assert_eq!(align16(96), 96);
    }
}
