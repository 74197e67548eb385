//! The 24-byte little-endian packet header shared by the file indexer and
//! the playback engine, and the flag bits it carries.
//!
//! Mirrors `net::packet`'s header/flags split: a plain-data header struct
//! with a binary codec, and a `flags` bitset exposed through `const fn`
//! helpers rather than mutating setters.

use std::io::{self, Read, Write};

use thiserror::Error;

use crate::util::io::{LeReadExt, LeWriteExt};


/// Size in bytes of an encoded [`PacketHeader`], not counting the payload.
pub const HEADER_SIZE: usize = 24;

/// Largest payload a packet may carry.
pub const MAX_PAYLOAD_SIZE: u32 = 65536;

/// Bits of `flags` reserved by the format; a valid header has none of them set.
pub const RESERVED_FLAGS_MASK: u32 = 0xFFFF_0000;

/// Named flag bits. `UserFlag0`..`UserFlag7` and the high 16 reserved bits
/// are exposed via [`PacketFlags`] helpers rather than one constant each.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketFlag {
    Compressed = 0x0001,
    Fragmented = 0x0002,
    Priority   = 0x0004,
    Encrypted  = 0x0008,
    TestData   = 0x0010,
    Simulation = 0x0020,
    Offline    = 0x0040,
    Network    = 0x0080,
}

/// The `flags` field of a [`PacketHeader`], as a bitset newtype.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PacketFlags(pub u32);

impl PacketFlags {

    pub const NONE: PacketFlags = PacketFlags(0);

    #[inline]
    pub const fn has(self, flag: PacketFlag) -> bool {
        self.0 & (flag as u32) != 0
    }

    #[inline]
    pub const fn with(self, flag: PacketFlag) -> PacketFlags {
        PacketFlags(self.0 | flag as u32)
    }

    #[inline]
    pub const fn without(self, flag: PacketFlag) -> PacketFlags {
        PacketFlags(self.0 & !(flag as u32))
    }

    /// One of the 8 caller-defined bits, `0..=7`.
    #[inline]
    pub const fn has_user_flag(self, index: u32) -> bool {
        self.0 & (0x100 << index) != 0
    }

    #[inline]
    pub const fn with_user_flag(self, index: u32) -> PacketFlags {
        PacketFlags(self.0 | (0x100 << index))
    }

    /// True if none of the reserved high 16 bits are set.
    #[inline]
    pub const fn is_valid(self) -> bool {
        self.0 & RESERVED_FLAGS_MASK == 0
    }
}

/// The fixed-size record prefixed to every packet on disk and on the wire.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub id: u32,
    pub sequence: u32,
    pub timestamp: u64,
    pub payload_size: u32,
    pub flags: PacketFlags,
}

impl PacketHeader {

    pub fn new(id: u32, sequence: u32, timestamp: u64, payload_size: u32, flags: PacketFlags) -> Self {
        Self { id, sequence, timestamp, payload_size, flags }
    }

    /// `timestamp > 0 ∧ payload_size ≤ MAX_PAYLOAD_SIZE ∧ reserved flag bits clear`.
    #[inline]
    pub const fn is_valid(&self) -> bool {
        self.timestamp > 0
            && self.payload_size <= MAX_PAYLOAD_SIZE
            && self.flags.is_valid()
    }

    /// Total on-disk length of this packet, header included.
    #[inline]
    pub const fn total_size(&self) -> u64 {
        HEADER_SIZE as u64 + self.payload_size as u64
    }

    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self, PacketHeaderError> {
        let id = reader.read_u32()?;
        let sequence = reader.read_u32()?;
        let timestamp = reader.read_u64()?;
        let payload_size = reader.read_u32()?;
        let flags = PacketFlags(reader.read_u32()?);
        Ok(Self { id, sequence, timestamp, payload_size, flags })
    }

    pub fn write_to<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        writer.write_u32(self.id)?;
        writer.write_u32(self.sequence)?;
        writer.write_u64(self.timestamp)?;
        writer.write_u32(self.payload_size)?;
        writer.write_u32(self.flags.0)?;
        Ok(())
    }

    /// Decode a header from exactly [`HEADER_SIZE`] bytes.
    pub fn from_bytes(bytes: &[u8; HEADER_SIZE]) -> Result<Self, PacketHeaderError> {
        let mut cursor = &bytes[..];
        Self::read_from(&mut cursor)
    }

    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        let mut cursor = &mut buf[..];
        // A Vec-backed Write never fails; a fixed-size slice write can only
        // fail if the buffer is too small, which HEADER_SIZE guarantees it is not.
        self.write_to(&mut cursor).expect("header buffer is exactly HEADER_SIZE bytes");
        buf
    }
}

impl std::fmt::Debug for PacketHeader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketHeader")
            .field("id", &self.id)
            .field("sequence", &self.sequence)
            .field("timestamp", &self.timestamp)
            .field("payload_size", &self.payload_size)
            .field("flags", &format_args!("{:#010x}", self.flags.0))
            .field("valid", &self.is_valid())
            .finish()
    }
}

/// Errors decoding a [`PacketHeader`] from a byte stream.
#[derive(Debug, Error)]
pub enum PacketHeaderError {
    #[error("i/o error reading packet header: {0}")]
    Io(#[from] io::Error),
}


#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> PacketHeader {
        PacketHeader::new(1, 2, 1000, 4, PacketFlags::NONE.with(PacketFlag::Compressed))
    }

    #[test]
    fn round_trips_through_bytes() {
        let header = sample();
        let bytes = header.to_bytes();
        assert_eq!(bytes.len(), HEADER_SIZE);
        let decoded = PacketHeader::from_bytes(&bytes).unwrap();
        assert_eq!(header, decoded);
    }

    #[test]
    fn validity_rejects_zero_timestamp() {
        let header = PacketHeader::new(1, 0, 0, 0, PacketFlags::NONE);
        assert!(!header.is_valid());
    }

    #[test]
    fn validity_rejects_oversized_payload() {
        let header = PacketHeader::new(1, 0, 1, MAX_PAYLOAD_SIZE + 1, PacketFlags::NONE);
        assert!(!header.is_valid());
    }

    #[test]
    fn validity_rejects_reserved_flag_bits() {
        let header = PacketHeader::new(1, 0, 1, 0, PacketFlags(0x0001_0000));
        assert!(!header.is_valid());
    }

    #[test]
    fn flag_helpers_set_and_clear() {
        let flags = PacketFlags::NONE.with(PacketFlag::Priority).with_user_flag(3);
        assert!(flags.has(PacketFlag::Priority));
        assert!(flags.has_user_flag(3));
        assert!(!flags.has_user_flag(4));
        let cleared = flags.without(PacketFlag::Priority);
        assert!(!cleared.has(PacketFlag::Priority));
    }

    #[test]
    fn total_size_includes_header() {
        let header = sample();
        assert_eq!(header.total_size(), HEADER_SIZE as u64 + 4);
    }
}
