//! AEDAT 3.1 decoding and event-to-frame integration for DVS recordings.
//!
//! This crate decodes polarity events from AEDAT 3.1 files written by
//! dynamic vision sensors, slices the decoded stream by a label table, and
//! integrates every labeled segment into a stack of two-channel count
//! frames. A dataset assembler runs the whole pipeline over a directory of
//! recordings in parallel.
//!
//! # Example
//!
//! ```no_run
//! use dvsframe_core::{AedatDecoder, FrameIntegrator, WindowPolicy};
//!
//! let mut decoder = AedatDecoder::new();
//! let result = decoder.decode_file("user01_fluorescent.aedat").unwrap();
//! println!("Decoded {} polarity events", result.events.len());
//!
//! let integrator = FrameIntegrator::new(128, 128).unwrap();
//! let frames = integrator
//!     .integrate(&result.events, &WindowPolicy::Count { frames_num: 20 })
//!     .unwrap();
//! println!("Integrated {} frames", frames.len());
//! ```
//!
//! # Features
//!
//! - AEDAT 3.1 container parsing with timestamp overflow reconstruction
//! - Label-table slicing with per-label ordinals
//! - Count, time and fixed-duration windowing
//! - Zero-padding of variable-length stacks with valid lengths
//! - `.npy` frame output and CSV event export

pub mod dataset;
pub mod decoder;
pub mod frame;
pub mod labels;
pub mod output;
pub mod padding;
pub mod parser;
pub mod types;

// Re-export commonly used types
pub use dataset::{AssembleError, DatasetAssembler, DatasetConfig, DatasetSummary, Split};
pub use decoder::{AedatDecoder, DecodeError, DecodeOptions};
pub use frame::{FrameError, FrameIntegrator, FrameStack, WindowPolicy};
pub use labels::{LabelError, LabelInterval, LabeledStream};
pub use output::OutputError;
pub use padding::{pad_frame_stacks, PaddedBatch};
pub use types::{DecodeResult, Event};
