#![allow(clippy::unusual_byte_groupings)]
//! Low-level parsing of AEDAT 3.1 packet headers and polarity elements.
//!
//! This module provides functions to extract fields from the 28-byte packet
//! header and from the two 32-bit words of a polarity element using bitwise
//! operations.

use crate::types::PacketHeader;
use byteorder::{ByteOrder, LittleEndian};

/// Size in bytes of one polarity element (data word + timestamp word).
pub const POLARITY_ELEMENT_SIZE: usize = 8;

/// Parses a packet header from exactly [`PacketHeader::SIZE`] bytes.
///
/// Returns `None` when fewer bytes are available.
pub fn parse_packet_header(bytes: &[u8]) -> Option<PacketHeader> {
    if bytes.len() < PacketHeader::SIZE {
        return None;
    }
    Some(PacketHeader {
        event_type: LittleEndian::read_u16(&bytes[0..2]),
        source: LittleEndian::read_u16(&bytes[2..4]),
        size: LittleEndian::read_u32(&bytes[4..8]),
        offset: LittleEndian::read_u32(&bytes[8..12]),
        ts_overflow: LittleEndian::read_u32(&bytes[12..16]),
        capacity: LittleEndian::read_u32(&bytes[16..20]),
        number: LittleEndian::read_u32(&bytes[20..24]),
        valid: LittleEndian::read_u32(&bytes[24..28]),
    })
}

// ============================================================================
// Polarity data word
// Bits: [31:17] x | [16:2] y | [1] polarity | [0] valid
// ============================================================================

/// Extracts the X coordinate from a polarity data word.
#[inline]
pub fn polarity_get_x(word: u32) -> u16 {
    ((word >> 17) & 0x7FFF) as u16 // bits 31:17
}

/// Extracts the Y coordinate from a polarity data word.
#[inline]
pub fn polarity_get_y(word: u32) -> u16 {
    ((word >> 2) & 0x7FFF) as u16 // bits 16:2
}

/// Extracts the polarity bit from a polarity data word.
#[inline]
pub fn polarity_get_polarity(word: u32) -> u8 {
    ((word >> 1) & 0x1) as u8
}

/// Extracts the validity mark from a polarity data word.
#[inline]
pub fn polarity_is_valid(word: u32) -> bool {
    word & 0x1 != 0
}

/// Packs coordinates and polarity into a data word with the valid bit set.
#[inline]
pub fn polarity_pack(x: u16, y: u16, p: u8) -> u32 {
    ((x as u32 & 0x7FFF) << 17) | ((y as u32 & 0x7FFF) << 2) | ((p as u32 & 0x1) << 1) | 0x1
}

// ============================================================================
// Timestamp word
// Bits: [31:0] timestamp, OR-ed with the packet overflow counter shifted by 31
// ============================================================================

/// Reconstructs a full timestamp as `raw | (ts_overflow << 31)`.
///
/// The raw word is kept whole, so a set bit 31 overlaps bit 0 of the
/// overflow counter.
#[inline]
pub fn reconstruct_timestamp(raw: u32, ts_overflow: u32) -> u64 {
    raw as u64 | ((ts_overflow as u64) << 31)
}
