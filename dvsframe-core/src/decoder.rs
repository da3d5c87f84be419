//! AEDAT 3.1 container decoder.
//!
//! This module skips the textual header of a recording and walks the packet
//! sequence behind it, emitting polarity events and skipping every other
//! packet type while keeping the stream aligned.

use crate::parser;
use crate::types::{DecodeResult, Event, EventType, HeaderInfo, PacketHeader, PacketStats};
use byteorder::{ByteOrder, LittleEndian};
use std::fs::File;
use std::io::{self, BufRead, BufReader, Read};
use std::path::Path;
use thiserror::Error;
use tracing::debug;

/// Errors that can occur during AEDAT 3.1 decoding.
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Truncated packet data at byte {offset}: expected {expected} bytes, got {actual}")]
    Truncated {
        offset: u64,
        expected: u64,
        actual: u64,
    },

    #[error("Invalid packet at byte {offset}: {message}")]
    InvalidPacket { offset: u64, message: String },
}

/// Sentinel line closing the textual header.
const END_HEADER: &[u8] = b"#!END-HEADER";

/// Decoding options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DecodeOptions {
    /// Drop polarity elements whose validity bit is clear.
    pub skip_invalid: bool,
}

/// AEDAT 3.1 decoder.
///
/// Tracks the byte offset into the stream so that format errors can be
/// reported with their position.
#[derive(Debug, Default)]
pub struct AedatDecoder {
    options: DecodeOptions,
    offset: u64,
    packet_offset: u64,
    header: HeaderInfo,
    stats: PacketStats,
    buffer: Vec<u8>,
}

impl AedatDecoder {
    /// Creates a new decoder with default options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a new decoder with the given options.
    pub fn with_options(options: DecodeOptions) -> Self {
        Self {
            options,
            ..Self::default()
        }
    }

    /// Resets the decoder state.
    pub fn reset(&mut self) {
        self.offset = 0;
        self.packet_offset = 0;
        self.header = HeaderInfo::default();
        self.stats = PacketStats::default();
    }

    /// Decodes an AEDAT 3.1 file from disk.
    pub fn decode_file<P: AsRef<Path>>(&mut self, path: P) -> Result<DecodeResult, DecodeError> {
        let file = File::open(path.as_ref())?;
        self.decode_reader(file)
    }

    /// Decodes an in-memory AEDAT 3.1 recording.
    pub fn decode_bytes(&mut self, data: &[u8]) -> Result<DecodeResult, DecodeError> {
        self.decode_reader(data)
    }

    /// Decodes an AEDAT 3.1 stream from any reader.
    ///
    /// A trailing packet header shorter than 28 bytes ends the stream
    /// normally. A packet whose data region is cut short is an error.
    pub fn decode_reader<R: Read>(&mut self, reader: R) -> Result<DecodeResult, DecodeError> {
        self.reset();
        let mut reader = BufReader::new(reader);

        self.parse_header(&mut reader)?;

        let mut events = Vec::new();
        let mut header_bytes = [0u8; PacketHeader::SIZE];

        loop {
            let n = read_full(&mut reader, &mut header_bytes)?;
            let header = match parser::parse_packet_header(&header_bytes[..n]) {
                Some(header) => header,
                None => {
                    if n > 0 {
                        debug!(
                            offset = self.offset,
                            bytes = n,
                            "ignoring truncated trailing packet header"
                        );
                    }
                    break;
                }
            };
            self.packet_offset = self.offset;
            self.offset += PacketHeader::SIZE as u64;
            self.stats.packets += 1;

            match header.kind() {
                EventType::Polarity => {
                    self.read_data(&mut reader, &header)?;
                    let data = std::mem::take(&mut self.buffer);
                    let decoded = self.decode_packet(&header, &data, &mut events);
                    self.buffer = data;
                    decoded?;
                    self.stats.polarity_packets += 1;
                }
                kind => {
                    self.skip_data(&mut reader, &header)?;
                    debug!(
                        offset = self.packet_offset,
                        ?kind,
                        capacity = header.capacity,
                        "skipping non-polarity packet"
                    );
                    self.stats.record_skip(kind);
                }
            }
        }

        debug!(
            events = events.len(),
            packets = self.stats.packets,
            skipped = self.stats.skipped_packets(),
            "decoded stream"
        );

        Ok(DecodeResult {
            events,
            header: std::mem::take(&mut self.header),
            stats: std::mem::take(&mut self.stats),
        })
    }

    /// Decodes the data region of one polarity packet.
    ///
    /// Every `size`-byte element of `data` holds a data word followed by a
    /// timestamp word. Bytes past the last whole element are ignored.
    /// Returns the number of events appended.
    pub fn decode_packet(
        &mut self,
        header: &PacketHeader,
        data: &[u8],
        events: &mut Vec<Event>,
    ) -> Result<usize, DecodeError> {
        let size = header.size as usize;
        if size < parser::POLARITY_ELEMENT_SIZE {
            return Err(DecodeError::InvalidPacket {
                offset: self.packet_offset,
                message: format!(
                    "polarity element size {} is below {} bytes",
                    size,
                    parser::POLARITY_ELEMENT_SIZE
                ),
            });
        }

        let before = events.len();
        events.reserve(data.len() / size);
        for element in data.chunks_exact(size) {
            let word = LittleEndian::read_u32(&element[0..4]);
            let raw_ts = LittleEndian::read_u32(&element[4..8]);

            if self.options.skip_invalid && !parser::polarity_is_valid(word) {
                self.stats.invalid_events += 1;
                continue;
            }

            events.push(Event::new(
                parser::reconstruct_timestamp(raw_ts, header.ts_overflow),
                parser::polarity_get_x(word),
                parser::polarity_get_y(word),
                parser::polarity_get_polarity(word),
            ));
        }
        Ok(events.len() - before)
    }

    /// Reads the data region of a packet into the internal buffer.
    fn read_data<R: Read>(
        &mut self,
        reader: &mut R,
        header: &PacketHeader,
    ) -> Result<(), DecodeError> {
        let expected = header.data_len();
        self.buffer.clear();
        let actual = reader
            .by_ref()
            .take(expected)
            .read_to_end(&mut self.buffer)? as u64;
        self.check_data_len(expected, actual)
    }

    /// Consumes the data region of a packet without decoding it.
    fn skip_data<R: Read>(
        &mut self,
        reader: &mut R,
        header: &PacketHeader,
    ) -> Result<(), DecodeError> {
        let expected = header.data_len();
        let actual = io::copy(&mut reader.by_ref().take(expected), &mut io::sink())?;
        self.check_data_len(expected, actual)
    }

    fn check_data_len(&mut self, expected: u64, actual: u64) -> Result<(), DecodeError> {
        self.offset += actual;
        if actual < expected {
            return Err(DecodeError::Truncated {
                offset: self.packet_offset,
                expected,
                actual,
            });
        }
        Ok(())
    }

    /// Consumes the textual header.
    ///
    /// Header lines start with `#`. The header ends after the
    /// `#!END-HEADER` line, or before the first line without the comment
    /// prefix, which is left unread.
    fn parse_header<R: BufRead>(&mut self, reader: &mut R) -> Result<(), DecodeError> {
        let mut line = Vec::new();

        loop {
            let bytes_peeked = reader.fill_buf()?;

            if bytes_peeked.is_empty() || bytes_peeked[0] != b'#' {
                break;
            }

            line.clear();
            let n = reader.read_until(b'\n', &mut line)?;
            self.offset += n as u64;

            let trimmed = trim_line_end(&line);
            if trimmed == END_HEADER {
                break;
            }
            self.parse_header_line(&String::from_utf8_lossy(trimmed));
        }

        self.header.len = self.offset;
        Ok(())
    }

    /// Parses a single header line.
    fn parse_header_line(&mut self, line: &str) {
        if let Some(version) = line.strip_prefix("#!AER-DAT") {
            self.header.version = Some(version.trim().to_string());
        } else if let Some(source) = line.strip_prefix("#Source ") {
            // Format: "#Source 1: DVS128"
            if let Some(idx) = source.find(':') {
                self.header.sources.push(source[idx + 1..].trim().to_string());
            }
        }
        self.header.lines.push(line.to_string());
    }
}

/// Strips a trailing `\n` or `\r\n`.
fn trim_line_end(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

/// Reads until `buf` is full or the reader is exhausted.
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packet(event_type: u16, size: u32, ts_overflow: u32, elements: &[[u32; 2]]) -> Vec<u8> {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&event_type.to_le_bytes());
        bytes.extend_from_slice(&1u16.to_le_bytes());
        let count = elements.len() as u32;
        for v in [size, 4, ts_overflow, count, count, count] {
            bytes.extend_from_slice(&v.to_le_bytes());
        }
        for [word, ts] in elements {
            bytes.extend_from_slice(&word.to_le_bytes());
            bytes.extend_from_slice(&ts.to_le_bytes());
            bytes.resize(bytes.len() + size as usize - 8, 0);
        }
        bytes
    }

    fn header_text() -> Vec<u8> {
        b"#!AER-DAT3.1\r\n#Source 1: DVS128\r\n#!END-HEADER\r\n".to_vec()
    }

    #[test]
    fn test_decoder_initial_state() {
        let decoder = AedatDecoder::new();
        assert_eq!(decoder.offset, 0);
        assert!(!decoder.options.skip_invalid);
    }

    #[test]
    fn test_decode_simple_packet() {
        let mut data = header_text();
        data.extend(packet(
            1,
            8,
            0,
            &[
                [parser::polarity_pack(10, 20, 1), 100],
                [parser::polarity_pack(11, 21, 0), 150],
            ],
        ));

        let result = AedatDecoder::new().decode_bytes(&data).unwrap();

        assert_eq!(result.events.len(), 2);
        assert_eq!(result.events[0], Event::new(100, 10, 20, 1));
        assert_eq!(result.events[1], Event::new(150, 11, 21, 0));
        assert_eq!(result.header.version.as_deref(), Some("3.1"));
        assert_eq!(result.header.sources, vec!["DVS128".to_string()]);
        assert_eq!(result.stats.polarity_packets, 1);
    }

    #[test]
    fn test_timestamp_overflow_applied() {
        let mut data = header_text();
        data.extend(packet(1, 8, 2, &[[parser::polarity_pack(0, 0, 0), 7]]));

        let result = AedatDecoder::new().decode_bytes(&data).unwrap();
        assert_eq!(result.events[0].t, 7 | (2u64 << 31));
    }

    #[test]
    fn test_non_polarity_packets_skipped() {
        let mut data = header_text();
        data.extend(packet(3, 8, 0, &[[0xDEAD_BEEF, 1], [0xFFFF_FFFF, 2]]));
        data.extend(packet(1, 8, 0, &[[parser::polarity_pack(5, 6, 1), 42]]));
        data.extend(packet(0, 8, 0, &[[0, 3]]));

        let result = AedatDecoder::new().decode_bytes(&data).unwrap();
        assert_eq!(result.events, vec![Event::new(42, 5, 6, 1)]);
        assert_eq!(result.stats.packets, 3);
        assert_eq!(result.stats.skipped_packets(), 2);
    }

    #[test]
    fn test_raw_timestamp_bit_31_kept() {
        let mut data = header_text();
        data.extend(packet(1, 8, 0, &[[parser::polarity_pack(1, 2, 1), 0x8000_0005]]));

        let result = AedatDecoder::new().decode_bytes(&data).unwrap();
        assert_eq!(result.events[0].t, 0x8000_0005);
    }

    #[test]
    fn test_header_only_stream() {
        let result = AedatDecoder::new().decode_bytes(&header_text()).unwrap();

        assert!(result.events.is_empty());
        assert_eq!(result.stats.packets, 0);
        assert_eq!(result.stats.polarity_packets, 0);
        assert_eq!(result.header.version.as_deref(), Some("3.1"));
    }

    #[test]
    fn test_only_non_polarity_packets() {
        let mut data = header_text();
        data.extend(packet(3, 8, 0, &[[0xDEAD_BEEF, 1]]));
        data.extend(packet(0, 8, 0, &[[0, 3], [1, 4]]));

        let result = AedatDecoder::new().decode_bytes(&data).unwrap();
        assert!(result.events.is_empty());
        assert_eq!(result.stats.packets, 2);
        assert_eq!(result.stats.polarity_packets, 0);
        assert_eq!(result.stats.skipped_packets(), 2);
    }

    #[test]
    fn test_wider_element_stride() {
        let mut data = header_text();
        data.extend(packet(
            1,
            12,
            0,
            &[
                [parser::polarity_pack(1, 2, 1), 10],
                [parser::polarity_pack(3, 4, 0), 20],
            ],
        ));

        let result = AedatDecoder::new().decode_bytes(&data).unwrap();
        assert_eq!(
            result.events,
            vec![Event::new(10, 1, 2, 1), Event::new(20, 3, 4, 0)]
        );
    }

    #[test]
    fn test_element_size_too_small() {
        let mut data = header_text();
        let mut bad = packet(1, 8, 0, &[[0, 0]]);
        bad[4..8].copy_from_slice(&4u32.to_le_bytes());
        data.extend(bad);

        let err = AedatDecoder::new().decode_bytes(&data).unwrap_err();
        assert!(matches!(err, DecodeError::InvalidPacket { .. }));
    }

    #[test]
    fn test_truncated_trailing_header_is_end_of_stream() {
        let mut data = header_text();
        data.extend(packet(1, 8, 0, &[[parser::polarity_pack(1, 1, 1), 5]]));
        data.extend_from_slice(&[1, 0, 1, 0, 8, 0]);

        let result = AedatDecoder::new().decode_bytes(&data).unwrap();
        assert_eq!(result.events.len(), 1);
    }

    #[test]
    fn test_truncated_data_region_is_error() {
        let mut data = header_text();
        let header_len = data.len() as u64;
        let mut p = packet(1, 8, 0, &[[0, 1], [0, 2]]);
        p.truncate(p.len() - 3);
        data.extend(p);

        let err = AedatDecoder::new().decode_bytes(&data).unwrap_err();
        match err {
            DecodeError::Truncated {
                offset,
                expected,
                actual,
            } => {
                assert_eq!(offset, header_len);
                assert_eq!(expected, 16);
                assert_eq!(actual, 13);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_header_ends_at_first_non_comment_line() {
        let mut data = b"#!AER-DAT3.1\n".to_vec();
        data.extend(packet(1, 8, 0, &[[parser::polarity_pack(2, 3, 1), 9]]));

        let result = AedatDecoder::new().decode_bytes(&data).unwrap();
        assert_eq!(result.header.len, 13);
        assert_eq!(result.events, vec![Event::new(9, 2, 3, 1)]);
    }

    #[test]
    fn test_skip_invalid_elements() {
        let mut data = header_text();
        let valid = parser::polarity_pack(1, 1, 1);
        data.extend(packet(1, 8, 0, &[[valid, 1], [valid & !1, 2], [valid, 3]]));

        let all = AedatDecoder::new().decode_bytes(&data).unwrap();
        assert_eq!(all.events.len(), 3);

        let mut decoder = AedatDecoder::with_options(DecodeOptions { skip_invalid: true });
        let filtered = decoder.decode_bytes(&data).unwrap();
        assert_eq!(filtered.events.len(), 2);
        assert_eq!(filtered.stats.invalid_events, 1);
    }

    #[test]
    fn test_parse_header_line_source() {
        let mut decoder = AedatDecoder::new();
        decoder.parse_header_line("#Source 2: DAVIS346B");
        decoder.parse_header_line("#Start-Time: 2017-01-01");
        assert_eq!(decoder.header.sources, vec!["DAVIS346B".to_string()]);
        assert_eq!(decoder.header.lines.len(), 2);
    }
}
