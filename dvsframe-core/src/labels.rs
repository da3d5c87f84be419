//! Label tables and per-label slicing of decoded event streams.
//!
//! A label table is a CSV file with one row per labeled segment of a
//! recording: `label,t_start,t_end`. Labels are stored 1-based on disk and
//! converted to 0-based on ingestion. `t_end` is exclusive.

use crate::types::Event;
use std::collections::HashMap;
use std::io::Read;
use std::path::Path;
use thiserror::Error;

/// Errors that can occur while reading a label table.
#[derive(Error, Debug)]
pub enum LabelError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Invalid label row {row}: {message}")]
    InvalidRow { row: usize, message: String },
}

/// One labeled time interval `[t_start, t_end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LabelInterval {
    /// 0-based class label
    pub label: u32,
    /// Inclusive start timestamp in microseconds
    pub t_start: u64,
    /// Exclusive end timestamp in microseconds
    pub t_end: u64,
}

impl LabelInterval {
    /// Creates a new interval.
    pub fn new(label: u32, t_start: u64, t_end: u64) -> Self {
        Self {
            label,
            t_start,
            t_end,
        }
    }

    /// Returns true if `t` lies inside the interval.
    #[inline]
    pub fn contains(&self, t: u64) -> bool {
        self.t_start <= t && t < self.t_end
    }
}

/// The events of one label interval.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabeledStream {
    /// 0-based class label
    pub label: u32,
    /// Position of this interval among the earlier intervals with the same label
    pub ordinal: usize,
    /// Events with `t_start <= t < t_end`, in stream order
    pub events: Vec<Event>,
}

/// Reads a label table from a CSV file.
pub fn read_label_table<P: AsRef<Path>>(path: P) -> Result<Vec<LabelInterval>, LabelError> {
    let file = std::fs::File::open(path.as_ref())?;
    parse_label_table(file)
}

/// Parses a label table from any reader.
///
/// The first row is a header and is skipped. Empty lines are ignored.
pub fn parse_label_table<R: Read>(reader: R) -> Result<Vec<LabelInterval>, LabelError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::All)
        .flexible(true)
        .from_reader(reader);

    let mut intervals = Vec::new();
    for (i, record) in reader.records().enumerate() {
        let record = record?;
        // data rows start at line 2 of the file
        let row = record
            .position()
            .map_or(i + 2, |pos| pos.line() as usize);
        if record.iter().all(|field| field.is_empty()) {
            continue;
        }
        if record.len() < 3 {
            return Err(LabelError::InvalidRow {
                row,
                message: format!("expected 3 columns, found {}", record.len()),
            });
        }

        let field = |idx: usize, name: &str| -> Result<u64, LabelError> {
            record[idx]
                .parse::<u64>()
                .map_err(|e| LabelError::InvalidRow {
                    row,
                    message: format!("bad {} {:?}: {}", name, &record[idx], e),
                })
        };

        let label = field(0, "label")?;
        if label == 0 || label > u32::MAX as u64 {
            return Err(LabelError::InvalidRow {
                row,
                message: format!("label {} is outside 1..={}", label, u32::MAX),
            });
        }
        let t_start = field(1, "t_start")?;
        let t_end = field(2, "t_end")?;

        intervals.push(LabelInterval::new((label - 1) as u32, t_start, t_end));
    }

    Ok(intervals)
}

/// Slices an event stream into one sub-stream per label interval.
///
/// Each output keeps the events whose timestamp falls inside its interval,
/// in stream order. An interval without matching events yields an empty
/// sub-stream. Outputs follow the order of `intervals`, and `ordinal`
/// counts earlier intervals carrying the same label.
pub fn split_by_labels(events: &[Event], intervals: &[LabelInterval]) -> Vec<LabeledStream> {
    let mut seen: HashMap<u32, usize> = HashMap::new();

    intervals
        .iter()
        .map(|interval| {
            let count = seen.entry(interval.label).or_insert(0);
            let ordinal = *count;
            *count += 1;

            LabeledStream {
                label: interval.label,
                ordinal,
                events: events
                    .iter()
                    .filter(|e| interval.contains(e.t))
                    .copied()
                    .collect(),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stream() -> Vec<Event> {
        (0..10).map(|i| Event::new(i * 10, i as u16, i as u16, (i % 2) as u8)).collect()
    }

    #[test]
    fn test_parse_label_table() {
        let csv = "class,startTime_usec,endTime_usec\n1,100,200\n11, 300 ,400\n\n";
        let intervals = parse_label_table(csv.as_bytes()).unwrap();
        assert_eq!(
            intervals,
            vec![LabelInterval::new(0, 100, 200), LabelInterval::new(10, 300, 400)]
        );
    }

    #[test]
    fn test_parse_label_table_rejects_zero_label() {
        let csv = "class,start,end\n0,1,2\n";
        let err = parse_label_table(csv.as_bytes()).unwrap_err();
        assert!(matches!(err, LabelError::InvalidRow { row: 2, .. }));
    }

    #[test]
    fn test_parse_label_table_rejects_garbage() {
        let csv = "class,start,end\n1,abc,2\n";
        assert!(matches!(
            parse_label_table(csv.as_bytes()),
            Err(LabelError::InvalidRow { .. })
        ));

        let csv = "class,start,end\n1,2\n";
        assert!(matches!(
            parse_label_table(csv.as_bytes()),
            Err(LabelError::InvalidRow { .. })
        ));
    }

    #[test]
    fn test_split_end_is_exclusive() {
        let events = stream();
        let parts = split_by_labels(&events, &[LabelInterval::new(2, 20, 50)]);
        assert_eq!(parts.len(), 1);
        let ts: Vec<u64> = parts[0].events.iter().map(|e| e.t).collect();
        assert_eq!(ts, vec![20, 30, 40]);
    }

    #[test]
    fn test_split_empty_interval() {
        let events = stream();
        let parts = split_by_labels(&events, &[LabelInterval::new(0, 100, 200)]);
        assert_eq!(parts.len(), 1);
        assert!(parts[0].events.is_empty());
    }

    #[test]
    fn test_split_largest_label() {
        let csv = "class,start,end\n4294967295,0,25\n4294967295,25,50\n";
        let intervals = parse_label_table(csv.as_bytes()).unwrap();
        assert_eq!(intervals[0].label, u32::MAX - 1);

        let parts = split_by_labels(&stream(), &intervals);
        let tags: Vec<(u32, usize, usize)> = parts
            .iter()
            .map(|p| (p.label, p.ordinal, p.events.len()))
            .collect();
        assert_eq!(tags, vec![(u32::MAX - 1, 0, 3), (u32::MAX - 1, 1, 2)]);
    }

    #[test]
    fn test_split_ordinals_per_label() {
        let events = stream();
        let intervals = [
            LabelInterval::new(3, 0, 30),
            LabelInterval::new(1, 30, 60),
            LabelInterval::new(3, 60, 100),
        ];
        let parts = split_by_labels(&events, &intervals);
        let tags: Vec<(u32, usize, usize)> = parts
            .iter()
            .map(|p| (p.label, p.ordinal, p.events.len()))
            .collect();
        assert_eq!(tags, vec![(3, 0, 3), (1, 0, 3), (3, 1, 4)]);
    }
}
