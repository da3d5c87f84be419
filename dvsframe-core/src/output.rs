//! Writers for decoded events and integrated frames.
//!
//! Frame tensors are stored as `.npy` files, event segments as CSV, and
//! synthetic recordings can be written back as AEDAT 3.1 polarity packets.

use crate::frame::FrameStack;
use crate::parser;
use crate::types::{Event, PacketHeader};
use npyz::WriterBuilder;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;
use thiserror::Error;

/// Errors that can occur during output writing.
#[derive(Error, Debug)]
pub enum OutputError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Invalid format: {0}")]
    InvalidFormat(String),
}

/// CSV writer for event segments, columns `t,x,y,p`.
pub struct EventCsvWriter<W: Write> {
    writer: csv::Writer<W>,
}

impl<W: Write> EventCsvWriter<W> {
    /// Creates a new CSV writer.
    pub fn new(writer: W) -> Self {
        Self {
            writer: csv::Writer::from_writer(writer),
        }
    }

    /// Writes the column header.
    pub fn write_header(&mut self) -> Result<(), OutputError> {
        self.writer.write_record(["t", "x", "y", "p"])?;
        Ok(())
    }

    /// Writes a batch of events.
    pub fn write_events(&mut self, events: &[Event]) -> Result<(), OutputError> {
        for event in events {
            self.writer.write_record([
                event.t.to_string(),
                event.x.to_string(),
                event.y.to_string(),
                event.p.to_string(),
            ])?;
        }
        Ok(())
    }

    /// Flushes the writer.
    pub fn flush(&mut self) -> Result<(), OutputError> {
        self.writer.flush()?;
        Ok(())
    }
}

/// Writes events to a CSV file with a header row.
pub fn write_events_csv<P: AsRef<Path>>(path: P, events: &[Event]) -> Result<(), OutputError> {
    let file = File::create(path)?;
    let mut writer = EventCsvWriter::new(file);
    writer.write_header()?;
    writer.write_events(events)?;
    writer.flush()?;
    Ok(())
}

/// Writes a frame stack as a `[T, 2, H, W]` `u32` `.npy` file.
pub fn write_frame_stack<P: AsRef<Path>>(path: P, stack: &FrameStack) -> Result<(), OutputError> {
    write_frame_stack_padded(path, stack, stack.len())
}

/// Writes a frame stack padded with all-zero frames to `len` frames.
pub fn write_frame_stack_padded<P: AsRef<Path>>(
    path: P,
    stack: &FrameStack,
    len: usize,
) -> Result<(), OutputError> {
    if len < stack.len() {
        return Err(OutputError::InvalidFormat(format!(
            "cannot pad {} frames down to {}",
            stack.len(),
            len
        )));
    }
    let shape = [len as u64, 2, stack.height() as u64, stack.width() as u64];
    let file = File::create(path)?;
    let mut writer = npyz::WriteOptions::<u32>::new()
        .default_dtype()
        .shape(&shape)
        .writer(BufWriter::new(file))
        .begin_nd()?;
    writer.extend(stack.frames().iter().copied())?;
    let padding = (len - stack.len()) * 2 * stack.height() * stack.width();
    writer.extend(std::iter::repeat(0u32).take(padding))?;
    writer.finish()?;
    Ok(())
}

/// Writes a 1-D `u32` `.npy` file.
pub fn write_u32_array<P: AsRef<Path>>(path: P, values: &[u32]) -> Result<(), OutputError> {
    let file = File::create(path)?;
    let mut writer = npyz::WriteOptions::<u32>::new()
        .default_dtype()
        .shape(&[values.len() as u64])
        .writer(BufWriter::new(file))
        .begin_nd()?;
    writer.extend(values.iter().copied())?;
    writer.finish()?;
    Ok(())
}

/// Reads a `u32` `.npy` file as its shape and flat data.
pub fn read_u32_array<P: AsRef<Path>>(path: P) -> Result<(Vec<u64>, Vec<u32>), OutputError> {
    let file = File::open(path)?;
    let npy = npyz::NpyFile::new(BufReader::new(file))?;
    let shape = npy.shape().to_vec();
    let data = npy.into_vec::<u32>()?;
    Ok((shape, data))
}

/// Reads a frame stack written by [`write_frame_stack`].
pub fn read_frame_stack<P: AsRef<Path>>(path: P) -> Result<FrameStack, OutputError> {
    let (shape, data) = read_u32_array(path)?;
    let dims = match shape.as_slice() {
        &[t, c, h, w] => (t as usize, c as usize, h as usize, w as usize),
        other => {
            return Err(OutputError::InvalidFormat(format!(
                "expected a 4-D frame tensor, found shape {:?}",
                other
            )))
        }
    };
    let frames = ndarray::Array4::from_shape_vec(dims, data)
        .map_err(|e| OutputError::InvalidFormat(e.to_string()))?;
    FrameStack::new(frames).map_err(|e| OutputError::InvalidFormat(e.to_string()))
}

/// Streams samples into one `[S, T, 2, H, W]` `f32` `.npy` file.
///
/// Shorter stacks are padded with zero frames up to `T`.
pub struct CollectionWriter<W: Write> {
    writer: npyz::NpyWriter<f32, BufWriter<W>>,
    frames: usize,
    frame_len: usize,
    remaining: usize,
}

impl CollectionWriter<File> {
    /// Creates the collection file at `path`.
    pub fn create<P: AsRef<Path>>(
        path: P,
        samples: usize,
        frames: usize,
        height: usize,
        width: usize,
    ) -> Result<Self, OutputError> {
        let file = File::create(path)?;
        Self::new(file, samples, frames, height, width)
    }
}

impl<W: Write> CollectionWriter<W> {
    /// Starts a collection of `samples` stacks of `frames` frames each.
    pub fn new(
        writer: W,
        samples: usize,
        frames: usize,
        height: usize,
        width: usize,
    ) -> Result<Self, OutputError> {
        let shape = [
            samples as u64,
            frames as u64,
            2,
            height as u64,
            width as u64,
        ];
        let writer = npyz::WriteOptions::<f32>::new()
            .default_dtype()
            .shape(&shape)
            .writer(BufWriter::new(writer))
            .begin_nd()?;
        Ok(Self {
            writer,
            frames,
            frame_len: 2 * height * width,
            remaining: samples,
        })
    }

    /// Appends one sample.
    pub fn push(&mut self, stack: &FrameStack) -> Result<(), OutputError> {
        if self.remaining == 0 {
            return Err(OutputError::InvalidFormat(
                "collection already holds every declared sample".to_string(),
            ));
        }
        if stack.len() > self.frames || 2 * stack.height() * stack.width() != self.frame_len {
            return Err(OutputError::InvalidFormat(format!(
                "sample of {} frames of {}x{} does not fit the collection",
                stack.len(),
                stack.height(),
                stack.width()
            )));
        }
        self.writer.extend(stack.frames().iter().map(|&v| v as f32))?;
        let padding = (self.frames - stack.len()) * self.frame_len;
        self.writer.extend(std::iter::repeat(0f32).take(padding))?;
        self.remaining -= 1;
        Ok(())
    }

    /// Finishes the file. Every declared sample must have been pushed.
    pub fn finish(self) -> Result<(), OutputError> {
        if self.remaining != 0 {
            return Err(OutputError::InvalidFormat(format!(
                "{} declared samples were never written",
                self.remaining
            )));
        }
        self.writer.finish()?;
        Ok(())
    }
}

/// Writer for AEDAT 3.1 recordings holding polarity packets.
pub struct AedatWriter<W: Write> {
    writer: BufWriter<W>,
}

impl<W: Write> AedatWriter<W> {
    /// Creates a new AEDAT writer.
    pub fn new(writer: W) -> Self {
        Self {
            writer: BufWriter::new(writer),
        }
    }

    /// Writes the textual header: the version line, `lines` prefixed with
    /// `#`, and the end-of-header sentinel.
    pub fn write_header(&mut self, lines: &[&str]) -> Result<(), OutputError> {
        self.writer.write_all(b"#!AER-DAT3.1\r\n")?;
        for line in lines {
            write!(self.writer, "#{}\r\n", line)?;
        }
        self.writer.write_all(b"#!END-HEADER\r\n")?;
        Ok(())
    }

    /// Writes a raw packet.
    pub fn write_packet(&mut self, header: &PacketHeader, data: &[u8]) -> Result<(), OutputError> {
        if data.len() as u64 != header.data_len() {
            return Err(OutputError::InvalidFormat(format!(
                "packet declares {} data bytes but {} were given",
                header.data_len(),
                data.len()
            )));
        }
        self.writer.write_all(&header.event_type.to_le_bytes())?;
        self.writer.write_all(&header.source.to_le_bytes())?;
        for field in [
            header.size,
            header.offset,
            header.ts_overflow,
            header.capacity,
            header.number,
            header.valid,
        ] {
            self.writer.write_all(&field.to_le_bytes())?;
        }
        self.writer.write_all(data)?;
        Ok(())
    }

    /// Writes events as polarity packets.
    ///
    /// A new packet starts whenever the timestamp overflow counter changes.
    /// Coordinates wider than 15 bits are truncated.
    pub fn write_events(&mut self, events: &[Event]) -> Result<(), OutputError> {
        let mut rest = events;
        while let Some(first) = rest.first() {
            let len = rest
                .iter()
                .position(|e| e.t >> 31 != first.t >> 31)
                .unwrap_or(rest.len());
            let (chunk, tail) = rest.split_at(len);
            rest = tail;

            let ts_overflow = u32::try_from(chunk[0].t >> 31).map_err(|_| {
                OutputError::InvalidFormat(format!("timestamp {} is out of range", chunk[0].t))
            })?;
            let mut data = Vec::with_capacity(chunk.len() * parser::POLARITY_ELEMENT_SIZE);
            for e in chunk {
                data.extend_from_slice(&parser::polarity_pack(e.x, e.y, e.p).to_le_bytes());
                data.extend_from_slice(&((e.t & 0x7FFF_FFFF) as u32).to_le_bytes());
            }
            let count = chunk.len() as u32;
            let header = PacketHeader {
                event_type: 1,
                source: 1,
                size: parser::POLARITY_ELEMENT_SIZE as u32,
                offset: 4,
                ts_overflow,
                capacity: count,
                number: count,
                valid: count,
            };
            self.write_packet(&header, &data)?;
        }
        Ok(())
    }

    /// Flushes the writer.
    pub fn flush(&mut self) -> Result<(), OutputError> {
        self.writer.flush()?;
        Ok(())
    }
}

/// Writes events to an AEDAT 3.1 file.
pub fn write_aedat<P: AsRef<Path>>(path: P, events: &[Event]) -> Result<(), OutputError> {
    let file = File::create(path)?;
    let mut writer = AedatWriter::new(file);
    writer.write_header(&["Source 1: DVS128"])?;
    writer.write_events(events)?;
    writer.flush()?;
    Ok(())
}
