//! Core types for AEDAT 3.1 event data.
//!
//! This module defines the decoded event record, the packet header and event
//! type identifiers of the AEDAT 3.1 container, and the result of decoding a
//! whole recording.

/// A decoded polarity event.
///
/// Polarity events represent brightness changes detected at one pixel of the
/// DVS sensor. Coordinates are 15-bit values as stored in the container; they
/// are not checked against any frame geometry at decode time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct Event {
    /// Timestamp in microseconds, with the packet overflow counter applied
    pub t: u64,
    /// X coordinate of the pixel (0-32767)
    pub x: u16,
    /// Y coordinate of the pixel (0-32767)
    pub y: u16,
    /// Event polarity: 0 = OFF (decrease), 1 = ON (increase in brightness)
    pub p: u8,
}

impl Event {
    /// Creates a new polarity event.
    #[inline]
    pub fn new(t: u64, x: u16, y: u16, p: u8) -> Self {
        Self { t, x, y, p }
    }
}

/// AEDAT 3.1 event packet types.
///
/// The first 16 bits of each packet header carry the type of every element
/// stored in the packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EventType {
    Special,
    Polarity,
    Frame,
    Imu6,
    Imu9,
    Sample,
    Ear,
    Config,
    Point1D,
    Point2D,
    Point3D,
    Point4D,
    Spike,
    /// Type id outside the known range
    Unknown(u16),
}

impl EventType {
    /// Maps a raw packet type id onto an event type.
    #[inline]
    pub fn from_u16(value: u16) -> Self {
        match value {
            0 => Self::Special,
            1 => Self::Polarity,
            2 => Self::Frame,
            3 => Self::Imu6,
            4 => Self::Imu9,
            5 => Self::Sample,
            6 => Self::Ear,
            7 => Self::Config,
            8 => Self::Point1D,
            9 => Self::Point2D,
            10 => Self::Point3D,
            11 => Self::Point4D,
            12 => Self::Spike,
            other => Self::Unknown(other),
        }
    }
}

/// A 28-byte AEDAT 3.1 packet header.
///
/// All fields are little-endian on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PacketHeader {
    /// Raw event type id of the packet's elements
    pub event_type: u16,
    /// Id of the source device
    pub source: u16,
    /// Size of one element in bytes
    pub size: u32,
    /// Offset of the timestamp inside an element
    pub offset: u32,
    /// Timestamp overflow counter, supplies bits 31.. of every timestamp
    pub ts_overflow: u32,
    /// Number of elements stored in the data region
    pub capacity: u32,
    /// Number of elements in use
    pub number: u32,
    /// Number of elements marked valid
    pub valid: u32,
}

impl PacketHeader {
    /// Size of a packet header on disk.
    pub const SIZE: usize = 28;

    /// Returns the decoded event type of this packet.
    #[inline]
    pub fn kind(&self) -> EventType {
        EventType::from_u16(self.event_type)
    }

    /// Length in bytes of the data region following this header.
    #[inline]
    pub fn data_len(&self) -> u64 {
        self.capacity as u64 * self.size as u64
    }
}

/// Information collected from the textual file header.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderInfo {
    /// Format version from the `#!AER-DAT` line, e.g. "3.1"
    pub version: Option<String>,
    /// Source descriptions from `#Source <id>: <name>` lines
    pub sources: Vec<String>,
    /// All header lines with the line terminator stripped
    pub lines: Vec<String>,
    /// Number of bytes consumed by the header
    pub len: u64,
}

/// Per-type packet counters gathered while decoding.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PacketStats {
    /// Total number of packet headers read
    pub packets: usize,
    /// Number of polarity packets decoded
    pub polarity_packets: usize,
    /// Skipped packets keyed by event type
    pub skipped: Vec<(EventType, usize)>,
    /// Polarity elements dropped because their validity bit was clear
    pub invalid_events: usize,
}

impl PacketStats {
    /// Records a skipped packet of the given type.
    pub(crate) fn record_skip(&mut self, kind: EventType) {
        match self.skipped.iter_mut().find(|(k, _)| *k == kind) {
            Some((_, count)) => *count += 1,
            None => self.skipped.push((kind, 1)),
        }
    }

    /// Total number of skipped packets over all types.
    pub fn skipped_packets(&self) -> usize {
        self.skipped.iter().map(|(_, n)| n).sum()
    }
}

/// Result of decoding an AEDAT 3.1 file.
#[derive(Debug, Default)]
pub struct DecodeResult {
    /// Decoded polarity events in container order
    pub events: Vec<Event>,
    /// Header information
    pub header: HeaderInfo,
    /// Packet counters
    pub stats: PacketStats,
}
