//! On-flash file record header.
//!
//! Fixed 92-byte little-endian layout; data follows the header immediately
//! and the next record starts at the following 16-byte boundary.
//!
//! ```text
//!  0 hdr_size u16     2 hdr_version u16   4 file_size u32   8 flags u32
//! 12 file_crc u32    16 hdr_crc u32      20 mod_time u32   24 next u32
//! 28 name[24]        52 info[24]         76 reserved[4] u32
//! ```

use alloc::string::String;
use core::fmt;

use bitflags::bitflags;

use crate::crc::crc32;
use crate::error::{TfsError, TfsResult};
use crate::flash::align16;

pub const NAMESIZE: usize = 23;
pub const INFOSIZE: usize = 23;
pub const HDR_SIZE: usize = 92;
pub const HDR_VERSION: u16 = 1;

/// `hdr_size` as read from erased flash: end of the chain.
pub const ERASED_HDR_SIZE: u16 = 0xFFFF;

pub const FLAGS_OFFSET: u32 = 8;
pub const NEXT_OFFSET: u32 = 24;
const HDR_CRC_OFFSET: usize = 16;
const NAME_OFFSET: usize = 28;
const INFO_OFFSET: usize = 52;
const RSVD_OFFSET: usize = 76;

const ERASED_WORD: u32 = 0xFFFF_FFFF;

bitflags! {
    pub struct FileFlags: u32 {
        const EXECUTABLE = 0x0001;
        const AUTO_RUN = 0x0002;
        const QUERY_AUTO_RUN = 0x0004;
        const SYMLINK = 0x0008;
        const BINARY_EXEC = 0x0010;
        const COMPRESSED = 0x0040;
        const IN_PLACE_MODIFIABLE = 0x0080;
        const UNREADABLE = 0x0100;
        const LEVEL_MASK = 0x0600;
        const NOT_STALE = 0x0800;
        const ACTIVE = 0x8000;
    }
}

const FLAG_CHARS: [(char, FileFlags); 8] = [
    ('e', FileFlags::EXECUTABLE),
    ('b', FileFlags::AUTO_RUN),
    ('B', FileFlags::QUERY_AUTO_RUN),
    ('l', FileFlags::SYMLINK),
    ('E', FileFlags::BINARY_EXEC),
    ('c', FileFlags::COMPRESSED),
    ('i', FileFlags::IN_PLACE_MODIFIABLE),
    ('u', FileFlags::UNREADABLE),
];

impl FileFlags {
    /// Flags a caller may request; the state bits are owned by TFS.
    pub fn user_bits() -> Self {
        Self::all() - (Self::ACTIVE | Self::NOT_STALE)
    }

    /// Parse a flag string such as `"eB2"`.
    pub fn parse(s: &str) -> TfsResult<Self> {
        let mut flags = FileFlags::empty();
        let mut level_seen = false;
        for c in s.chars() {
            if let Some(digit) = c.to_digit(10) {
                if digit > 3 || level_seen {
                    return Err(TfsError::InvalidFlagString);
                }
                level_seen = true;
                flags |= FileFlags::from_level(digit as u8);
                continue;
            }
            let flag = FLAG_CHARS
                .iter()
                .find(|(ch, _)| *ch == c)
                .map(|(_, f)| *f)
                .ok_or(TfsError::InvalidFlagString)?;
            flags |= flag;
        }
        Ok(flags)
    }

    pub fn to_flag_string(&self) -> String {
        let mut s = String::new();
        for (c, f) in FLAG_CHARS.iter() {
            if self.contains(*f) {
                s.push(*c);
            }
        }
        let level = self.level();
        if level != 0 {
            s.push((b'0' + level) as char);
        }
        s
    }

    pub fn from_level(level: u8) -> Self {
        FileFlags::from_bits_truncate(((level as u32) << 9) & FileFlags::LEVEL_MASK.bits())
    }

    /// Access level 0..=3 needed to touch the file.
    pub fn level(&self) -> u8 {
        ((self.bits() & FileFlags::LEVEL_MASK.bits()) >> 9) as u8
    }
}

/// Inline, fixed-capacity string as stored in a header field.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct FixedStr<const N: usize> {
    bytes: [u8; N],
    len: u8,
}

impl<const N: usize> FixedStr<N> {
    pub fn new(s: &str) -> TfsResult<Self> {
        if s.len() > N || s.as_bytes().contains(&0) {
            return Err(TfsError::NameTooLong);
        }
        let mut bytes = [0u8; N];
        bytes[..s.len()].copy_from_slice(s.as_bytes());
        Ok(Self {
            bytes,
            len: s.len() as u8,
        })
    }

    pub fn empty() -> Self {
        Self {
            bytes: [0u8; N],
            len: 0,
        }
    }

    pub fn as_str(&self) -> &str {
        // Only ever built from &str or validated UTF-8.
        core::str::from_utf8(&self.bytes[..self.len as usize]).unwrap_or("")
    }

    /// Field bytes: content, NUL padded to N + 1.
    fn write_field(&self, out: &mut [u8]) {
        out[..N + 1].fill(0);
        out[..self.len as usize].copy_from_slice(&self.bytes[..self.len as usize]);
    }

    fn read_field(field: &[u8]) -> Option<Self> {
        let len = field[..N + 1].iter().position(|&b| b == 0)?;
        let s = core::str::from_utf8(&field[..len]).ok()?;
        Self::new(s).ok()
    }
}

impl<const N: usize> fmt::Debug for FixedStr<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.as_str())
    }
}

pub type FileName = FixedStr<NAMESIZE>;
pub type FileInfo = FixedStr<INFOSIZE>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileHeader {
    pub hdr_size: u16,
    pub hdr_version: u16,
    pub file_size: u32,
    /// Raw flags word; see [`FileHeader::flags`].
    pub flags: u32,
    pub file_crc: u32,
    pub hdr_crc: u32,
    pub mod_time: u32,
    pub next: u32,
    pub name: FileName,
    pub info: FileInfo,
    pub reserved: [u32; 4],
}

fn le32(b: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([b[off], b[off + 1], b[off + 2], b[off + 3]])
}

impl FileHeader {
    /// A fresh, active, non-stale header; `next` and `hdr_crc` are filled in
    /// when the record's address is known.
    pub fn new(name: &str, info: &str, flags: FileFlags, file_size: u32, file_crc: u32, mod_time: u32) -> TfsResult<Self> {
        Ok(Self {
            hdr_size: HDR_SIZE as u16,
            hdr_version: HDR_VERSION,
            file_size,
            flags: (flags & FileFlags::user_bits() | FileFlags::ACTIVE | FileFlags::NOT_STALE).bits(),
            file_crc,
            hdr_crc: 0,
            mod_time,
            next: 0,
            name: FileName::new(name)?,
            info: FileInfo::new(info)?,
            reserved: [ERASED_WORD; 4],
        })
    }

    pub fn encode(&self) -> [u8; HDR_SIZE] {
        let mut b = [0u8; HDR_SIZE];
        b[0..2].copy_from_slice(&self.hdr_size.to_le_bytes());
        b[2..4].copy_from_slice(&self.hdr_version.to_le_bytes());
        b[4..8].copy_from_slice(&self.file_size.to_le_bytes());
        b[8..12].copy_from_slice(&self.flags.to_le_bytes());
        b[12..16].copy_from_slice(&self.file_crc.to_le_bytes());
        b[16..20].copy_from_slice(&self.hdr_crc.to_le_bytes());
        b[20..24].copy_from_slice(&self.mod_time.to_le_bytes());
        b[24..28].copy_from_slice(&self.next.to_le_bytes());
        self.name.write_field(&mut b[NAME_OFFSET..INFO_OFFSET]);
        self.info.write_field(&mut b[INFO_OFFSET..RSVD_OFFSET]);
        for (i, word) in self.reserved.iter().enumerate() {
            let off = RSVD_OFFSET + i * 4;
            b[off..off + 4].copy_from_slice(&word.to_le_bytes());
        }
        b
    }

    /// Parse header bytes. Returns `None` when the name or info field is not
    /// a terminated UTF-8 string; CRC is not checked here.
    pub fn decode(b: &[u8; HDR_SIZE]) -> Option<Self> {
        let mut reserved = [0u32; 4];
        for (i, word) in reserved.iter_mut().enumerate() {
            *word = le32(b, RSVD_OFFSET + i * 4);
        }
        Some(Self {
            hdr_size: u16::from_le_bytes([b[0], b[1]]),
            hdr_version: u16::from_le_bytes([b[2], b[3]]),
            file_size: le32(b, 4),
            flags: le32(b, 8),
            file_crc: le32(b, 12),
            hdr_crc: le32(b, HDR_CRC_OFFSET),
            mod_time: le32(b, 20),
            next: le32(b, 24),
            name: FileName::read_field(&b[NAME_OFFSET..INFO_OFFSET])?,
            info: FileInfo::read_field(&b[INFO_OFFSET..RSVD_OFFSET])?,
            reserved,
        })
    }

    /// Header CRC: `next` and `hdr_crc` zeroed, ACTIVE|NOT_STALE forced on,
    /// so deleting or staling a record never invalidates its header.
    pub fn compute_crc(&self) -> u32 {
        let mut h = *self;
        h.next = 0;
        h.hdr_crc = 0;
        h.flags |= (FileFlags::ACTIVE | FileFlags::NOT_STALE).bits();
        crc32(&h.encode())
    }

    pub fn seal(&mut self) {
        self.hdr_crc = self.compute_crc();
    }

    pub fn crc_ok(&self) -> bool {
        self.hdr_size as usize == HDR_SIZE && self.hdr_crc == self.compute_crc()
    }

    pub fn with_next(&self, next: u32) -> Self {
        Self { next, ..*self }
    }

    pub fn flags(&self) -> FileFlags {
        FileFlags::from_bits_truncate(self.flags)
    }

    pub fn user_flags(&self) -> FileFlags {
        self.flags() & FileFlags::user_bits()
    }

    pub fn is_active(&self) -> bool {
        self.flags().contains(FileFlags::ACTIVE)
    }

    /// Active, but superseded by a replacement that may not have landed.
    pub fn is_stale(&self) -> bool {
        self.is_active() && !self.flags().contains(FileFlags::NOT_STALE)
    }

    pub fn name(&self) -> &str {
        self.name.as_str()
    }

    pub fn info(&self) -> &str {
        self.info.as_str()
    }

    /// Bytes the record occupies in the chain, header + data + padding.
    pub fn record_len(&self) -> u32 {
        align16(HDR_SIZE as u32 + self.file_size)
    }

    /// Out-of-band data address of a synthetic header.
    pub fn external_data(&self) -> Option<u32> {
        (self.reserved[0] != ERASED_WORD).then(|| self.reserved[0])
    }

    pub fn data_addr(&self, hdr_addr: u32) -> u32 {
        self.external_data()
            .unwrap_or(hdr_addr + HDR_SIZE as u32)
    }
}
