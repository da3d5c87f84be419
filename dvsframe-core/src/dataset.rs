//! Dataset assembly: turns a directory of labeled recordings into a frame
//! dataset on disk.
//!
//! The dataset root holds two trial lists (`trials_to_train.txt` and
//! `trials_to_test.txt`) naming one recording per line, and next to every
//! recording a label table `<stem>_labels.csv`. Each recording is decoded,
//! sliced by its label table and integrated into frame stacks. Stacks are
//! written to `<output>/<policy dir>/<split>/<label>/<stem>_<ordinal>.npy`.
//!
//! Recordings are processed in parallel on a bounded worker pool. A
//! recording that fails is logged and skipped; the others still complete.
//! For the fixed-duration policy every stack is padded to the longest stack
//! across both splits, and the true lengths are written next to the data.

use crate::decoder::{AedatDecoder, DecodeError, DecodeOptions};
use crate::frame::{FrameError, FrameIntegrator, FrameStack, WindowPolicy};
use crate::labels::{self, LabelError};
use crate::output::{self, CollectionWriter, OutputError};
use crate::types::Event;
use indicatif::{ProgressBar, ProgressStyle};
use rayon::prelude::*;
use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::io::{self, BufRead, BufReader};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Upper bound on the default worker count.
pub const MAX_DEFAULT_WORKERS: usize = 16;

/// Errors that can occur while assembling a dataset.
#[derive(Error, Debug)]
pub enum AssembleError {
    #[error("Failed to decode {}: {source}", .path.display())]
    Decode {
        path: PathBuf,
        #[source]
        source: DecodeError,
    },

    #[error("Failed to read label table {}: {source}", .path.display())]
    Labels {
        path: PathBuf,
        #[source]
        source: LabelError,
    },

    #[error("Label {label} in {} is outside 0..{num_labels}", .path.display())]
    LabelOutOfRange {
        path: PathBuf,
        label: u32,
        num_labels: u32,
    },

    #[error("Failed to integrate {}: {source}", .path.display())]
    Frame {
        path: PathBuf,
        #[source]
        source: FrameError,
    },

    #[error("Failed to read trial list {}: {source}", .path.display())]
    TrialList {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Cannot prepare output directory {}: {source}", .path.display())]
    Layout {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to write {}: {source}", .path.display())]
    Output {
        path: PathBuf,
        #[source]
        source: OutputError,
    },

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Failed to start worker pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

/// Train or test partition of the dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Split {
    Train,
    Test,
}

impl Split {
    pub const ALL: [Split; 2] = [Split::Train, Split::Test];

    /// Directory and file prefix used for this split.
    pub fn name(&self) -> &'static str {
        match self {
            Split::Train => "train",
            Split::Test => "test",
        }
    }
}

impl fmt::Display for Split {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Configuration of a dataset build.
#[derive(Debug, Clone)]
pub struct DatasetConfig {
    /// Directory holding the recordings, label tables and trial lists
    pub dataset_root: PathBuf,
    /// Directory the frame dataset is written to
    pub output_root: PathBuf,
    pub policy: WindowPolicy,
    /// Sensor height in pixels
    pub height: usize,
    /// Sensor width in pixels
    pub width: usize,
    /// Number of classes; labels must lie in `0..num_labels` after conversion
    pub num_labels: u32,
    /// Train trial list, relative to `dataset_root`
    pub train_list: String,
    /// Test trial list, relative to `dataset_root`
    pub test_list: String,
    /// Suffix appended to a recording's stem to find its label table
    pub labels_suffix: String,
    /// Worker count; `None` picks `min(cpus, 16)`
    pub max_workers: Option<usize>,
    pub decode: DecodeOptions,
    /// Also write `<split>_data.npy` and `<split>_labels.npy` per split
    pub write_collections: bool,
    /// Also write every labeled event segment as CSV
    pub export_events: bool,
    /// Draw a progress bar on stderr
    pub show_progress: bool,
}

impl Default for DatasetConfig {
    fn default() -> Self {
        Self {
            dataset_root: PathBuf::from("."),
            output_root: PathBuf::from("frames"),
            policy: WindowPolicy::Count { frames_num: 20 },
            height: 128,
            width: 128,
            num_labels: 11,
            train_list: "trials_to_train.txt".to_string(),
            test_list: "trials_to_test.txt".to_string(),
            labels_suffix: "_labels.csv".to_string(),
            max_workers: None,
            decode: DecodeOptions::default(),
            write_collections: false,
            export_events: false,
            show_progress: false,
        }
    }
}

impl DatasetConfig {
    /// Effective worker count.
    pub fn workers(&self) -> usize {
        self.max_workers
            .unwrap_or_else(|| num_cpus::get().min(MAX_DEFAULT_WORKERS))
            .max(1)
    }

    /// Directory all frame files of this policy go to.
    pub fn frames_dir(&self) -> PathBuf {
        self.output_root.join(self.policy.dir_name())
    }

    /// Directory of one split and label.
    pub fn label_dir(&self, split: Split, label: u32) -> PathBuf {
        self.frames_dir().join(split.name()).join(label.to_string())
    }

    /// Directory of exported event segments of one split and label.
    pub fn events_dir(&self, split: Split, label: u32) -> PathBuf {
        self.output_root
            .join("events")
            .join(split.name())
            .join(label.to_string())
    }

    fn trial_list_path(&self, split: Split) -> PathBuf {
        match split {
            Split::Train => self.dataset_root.join(&self.train_list),
            Split::Test => self.dataset_root.join(&self.test_list),
        }
    }
}

/// One recording of the dataset and its label table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recording {
    pub split: Split,
    pub path: PathBuf,
    pub labels_path: PathBuf,
    /// File name without extension, used to name the samples
    pub stem: String,
}

impl Recording {
    /// Locates the label table of `path` by appending `labels_suffix` to
    /// its stem.
    pub fn new(split: Split, path: PathBuf, labels_suffix: &str) -> Self {
        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let labels_path = path.with_file_name(format!("{}{}", stem, labels_suffix));
        Self {
            split,
            path,
            labels_path,
            stem,
        }
    }
}

/// Identity and length of one labeled sample.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SampleInfo {
    pub split: Split,
    /// 0-based class label
    pub label: u32,
    pub stem: String,
    /// Position among the recording's intervals with the same label
    pub ordinal: usize,
    /// Number of frames before padding
    pub valid_length: usize,
    /// Number of events in the labeled segment
    pub event_count: usize,
}

impl SampleInfo {
    /// File name of the sample with the given extension.
    pub fn file_name(&self, extension: &str) -> String {
        format!("{}_{}.{}", self.stem, self.ordinal, extension)
    }

    fn sort_key(&self) -> (Split, u32, &str, usize) {
        (self.split, self.label, &self.stem, self.ordinal)
    }
}

/// An integrated sample, still in memory.
#[derive(Debug, Clone)]
pub struct Sample {
    pub info: SampleInfo,
    pub frames: FrameStack,
    /// The labeled events, kept only when they are exported
    pub events: Vec<Event>,
}

/// A recording that could not be processed.
#[derive(Debug, Clone)]
pub struct FileFailure {
    pub path: PathBuf,
    pub error: String,
}

/// Outcome of a dataset build. Counts cover successful recordings only.
#[derive(Debug, Clone, Default)]
pub struct DatasetSummary {
    pub recordings: usize,
    pub failures: Vec<FileFailure>,
    pub train_samples: usize,
    pub test_samples: usize,
    /// Samples per 0-based label, both splits together
    pub samples_per_label: Vec<usize>,
    /// Frames per stored sample after padding
    pub frames_per_sample: usize,
    pub output_dir: PathBuf,
}

impl DatasetSummary {
    pub fn total_samples(&self) -> usize {
        self.train_samples + self.test_samples
    }
}

/// Reads a trial list: one recording path per line, blank lines skipped.
pub fn read_trial_list<P: AsRef<Path>>(path: P) -> io::Result<Vec<String>> {
    let file = fs::File::open(path)?;
    let mut trials = Vec::new();
    for line in BufReader::new(file).lines() {
        let line = line?;
        let line = line.trim();
        if !line.is_empty() {
            trials.push(line.to_string());
        }
    }
    Ok(trials)
}

/// Lists the recordings of both splits, train first.
pub fn discover_recordings(config: &DatasetConfig) -> Result<Vec<Recording>, AssembleError> {
    let mut recordings = Vec::new();
    for split in Split::ALL {
        let list = config.trial_list_path(split);
        let trials = read_trial_list(&list).map_err(|source| AssembleError::TrialList {
            path: list.clone(),
            source,
        })?;
        debug!(split = %split, count = trials.len(), "Read trial list");
        recordings.extend(trials.into_iter().map(|trial| {
            Recording::new(split, config.dataset_root.join(trial), &config.labels_suffix)
        }));
    }
    check_unique_stems(&recordings)?;
    Ok(recordings)
}

/// Samples are named after the recording stem, so two recordings of one
/// split must not share a stem.
pub fn check_unique_stems(recordings: &[Recording]) -> Result<(), AssembleError> {
    let mut seen = HashSet::new();
    for recording in recordings {
        if !seen.insert((recording.split, recording.stem.as_str())) {
            return Err(AssembleError::Config(format!(
                "duplicate recording stem '{}' in {} split: {}",
                recording.stem,
                recording.split,
                recording.path.display()
            )));
        }
    }
    Ok(())
}

/// Creates every output directory up front.
pub fn prepare_layout(config: &DatasetConfig) -> Result<(), AssembleError> {
    let create = |path: PathBuf| {
        fs::create_dir_all(&path).map_err(|source| AssembleError::Layout { path, source })
    };
    for split in Split::ALL {
        for label in 0..config.num_labels {
            create(config.label_dir(split, label))?;
            if config.export_events {
                create(config.events_dir(split, label))?;
            }
        }
    }
    Ok(())
}

/// Builds a frame dataset from labeled recordings.
pub struct DatasetAssembler {
    config: DatasetConfig,
    integrator: FrameIntegrator,
}

impl DatasetAssembler {
    /// Creates an assembler, validating the configuration.
    pub fn new(config: DatasetConfig) -> Result<Self, AssembleError> {
        config
            .policy
            .validate()
            .map_err(|e| AssembleError::Config(e.to_string()))?;
        if config.num_labels == 0 {
            return Err(AssembleError::Config(
                "num_labels must be positive".to_string(),
            ));
        }
        let integrator = FrameIntegrator::new(config.height, config.width)
            .map_err(|e| AssembleError::Config(e.to_string()))?;
        Ok(Self { config, integrator })
    }

    pub fn config(&self) -> &DatasetConfig {
        &self.config
    }

    /// Decodes, slices and integrates one recording without touching the
    /// output tree.
    pub fn process_recording(&self, recording: &Recording) -> Result<Vec<Sample>, AssembleError> {
        let mut decoder = AedatDecoder::with_options(self.config.decode);
        let decoded =
            decoder
                .decode_file(&recording.path)
                .map_err(|source| AssembleError::Decode {
                    path: recording.path.clone(),
                    source,
                })?;
        let intervals = labels::read_label_table(&recording.labels_path).map_err(|source| {
            AssembleError::Labels {
                path: recording.labels_path.clone(),
                source,
            }
        })?;
        if let Some(bad) = intervals
            .iter()
            .find(|interval| interval.label >= self.config.num_labels)
        {
            return Err(AssembleError::LabelOutOfRange {
                path: recording.labels_path.clone(),
                label: bad.label,
                num_labels: self.config.num_labels,
            });
        }

        debug!(
            path = %recording.path.display(),
            events = decoded.events.len(),
            intervals = intervals.len(),
            "Decoded recording"
        );

        labels::split_by_labels(&decoded.events, &intervals)
            .into_iter()
            .map(|stream| {
                let frames = self
                    .integrator
                    .integrate(&stream.events, &self.config.policy)
                    .map_err(|source| AssembleError::Frame {
                        path: recording.path.clone(),
                        source,
                    })?;
                let info = SampleInfo {
                    split: recording.split,
                    label: stream.label,
                    stem: recording.stem.clone(),
                    ordinal: stream.ordinal,
                    valid_length: frames.len(),
                    event_count: stream.events.len(),
                };
                let events = if self.config.export_events {
                    stream.events
                } else {
                    Vec::new()
                };
                Ok(Sample {
                    info,
                    frames,
                    events,
                })
            })
            .collect()
    }

    /// Path of a sample's frame file.
    pub fn sample_path(&self, info: &SampleInfo) -> PathBuf {
        self.config
            .label_dir(info.split, info.label)
            .join(info.file_name("npy"))
    }

    /// Runs the whole build.
    pub fn run(&self) -> Result<DatasetSummary, AssembleError> {
        let recordings = discover_recordings(&self.config)?;
        prepare_layout(&self.config)?;
        info!(
            recordings = recordings.len(),
            policy = %self.config.policy,
            workers = self.config.workers(),
            "Building frame dataset"
        );
        self.assemble(&recordings)
    }

    /// Processes `recordings` into the prepared output tree.
    pub fn assemble(&self, recordings: &[Recording]) -> Result<DatasetSummary, AssembleError> {
        check_unique_stems(recordings)?;
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.config.workers())
            .build()?;
        let progress = self.progress_bar(recordings.len() as u64, "recordings");

        // Fixed-length stacks are written by the workers as soon as they
        // exist. Variable-length stacks wait for the global maximum length.
        let results: Vec<(&Recording, Result<Vec<Pending>, AssembleError>)> = pool.install(|| {
            recordings
                .par_iter()
                .map(|recording| {
                    let result = self
                        .process_recording(recording)
                        .and_then(|samples| self.store_early(samples));
                    progress.inc(1);
                    (recording, result)
                })
                .collect()
        });
        progress.finish_and_clear();

        let mut summary = DatasetSummary {
            recordings: recordings.len(),
            samples_per_label: vec![0; self.config.num_labels as usize],
            output_dir: self.config.frames_dir(),
            ..Default::default()
        };
        let mut pending = Vec::new();
        for (recording, result) in results {
            match result {
                Ok(samples) => pending.extend(samples),
                Err(e) => {
                    warn!(path = %recording.path.display(), error = %e, "Skipping recording");
                    summary.failures.push(FileFailure {
                        path: recording.path.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }
        pending.sort_by(|a, b| a.info.sort_key().cmp(&b.info.sort_key()));

        let target_len = match self.config.policy.fixed_len() {
            Some(len) => len,
            None => pending
                .iter()
                .map(|p| p.info.valid_length)
                .max()
                .unwrap_or(0),
        };
        summary.frames_per_sample = target_len;

        if self.config.policy.is_variable_length() {
            self.store_padded(&pending, target_len)?;
        }

        for split in Split::ALL {
            let samples: Vec<&Pending> = pending.iter().filter(|p| p.info.split == split).collect();
            self.write_manifest(split, &samples)?;
            if self.config.policy.is_variable_length() {
                let path = self
                    .config
                    .frames_dir()
                    .join(format!("{}_valid_length.npy", split.name()));
                let lengths: Vec<u32> = samples.iter().map(|p| p.info.valid_length as u32).collect();
                output::write_u32_array(&path, &lengths)
                    .map_err(|source| AssembleError::Output { path, source })?;
            }
            if self.config.write_collections {
                self.write_collection(split, &samples, target_len)?;
            }
            match split {
                Split::Train => summary.train_samples = samples.len(),
                Split::Test => summary.test_samples = samples.len(),
            }
        }
        for p in &pending {
            summary.samples_per_label[p.info.label as usize] += 1;
        }

        info!(
            train = summary.train_samples,
            test = summary.test_samples,
            failed = summary.failures.len(),
            frames = target_len,
            "Frame dataset complete"
        );
        Ok(summary)
    }

    /// Writes whatever of `samples` does not need the global maximum length.
    ///
    /// On error the files already written for this recording are removed,
    /// so a failed recording leaves nothing behind.
    fn store_early(&self, samples: Vec<Sample>) -> Result<Vec<Pending>, AssembleError> {
        let mut written = Vec::new();
        let result = self.store_samples(samples, &mut written);
        if result.is_err() {
            for path in &written {
                if let Err(e) = fs::remove_file(path) {
                    warn!(path = %path.display(), error = %e, "Failed to remove partial output");
                }
            }
        }
        result
    }

    fn store_samples(
        &self,
        samples: Vec<Sample>,
        written: &mut Vec<PathBuf>,
    ) -> Result<Vec<Pending>, AssembleError> {
        let mut pending = Vec::with_capacity(samples.len());
        for sample in samples {
            if self.config.export_events {
                let path = self
                    .config
                    .events_dir(sample.info.split, sample.info.label)
                    .join(sample.info.file_name("csv"));
                output::write_events_csv(&path, &sample.events)
                    .map_err(|source| AssembleError::Output { path: path.clone(), source })?;
                written.push(path);
            }
            match self.config.policy.fixed_len() {
                Some(len) => {
                    let path = self.sample_path(&sample.info);
                    output::write_frame_stack_padded(&path, &sample.frames, len)
                        .map_err(|source| AssembleError::Output { path: path.clone(), source })?;
                    written.push(path);
                    pending.push(Pending {
                        info: sample.info,
                        frames: None,
                    });
                }
                None => pending.push(Pending {
                    info: sample.info,
                    frames: Some(sample.frames),
                }),
            }
        }
        Ok(pending)
    }

    fn store_padded(&self, pending: &[Pending], len: usize) -> Result<(), AssembleError> {
        let progress = self.progress_bar(pending.len() as u64, "samples");
        for p in pending {
            if let Some(frames) = &p.frames {
                let path = self.sample_path(&p.info);
                output::write_frame_stack_padded(&path, frames, len)
                    .map_err(|source| AssembleError::Output { path, source })?;
            }
            progress.inc(1);
        }
        progress.finish_and_clear();
        Ok(())
    }

    /// Writes `<split>_samples.csv`: one row per sample in storage order.
    fn write_manifest(&self, split: Split, samples: &[&Pending]) -> Result<(), AssembleError> {
        let path = self
            .config
            .frames_dir()
            .join(format!("{}_samples.csv", split.name()));
        let write = || -> Result<(), OutputError> {
            let mut writer = csv::Writer::from_path(&path)?;
            writer.write_record(["file", "label", "ordinal", "valid_length", "events"])?;
            for p in samples {
                let info = &p.info;
                let file = Path::new(&info.label.to_string()).join(info.file_name("npy"));
                writer
                    .write_record([
                        file.to_string_lossy().into_owned(),
                        info.label.to_string(),
                        info.ordinal.to_string(),
                        info.valid_length.to_string(),
                        info.event_count.to_string(),
                    ])?;
            }
            writer.flush()?;
            Ok(())
        };
        write().map_err(|source| AssembleError::Output { path, source })
    }

    /// Writes `<split>_data.npy` and `<split>_labels.npy`.
    fn write_collection(
        &self,
        split: Split,
        samples: &[&Pending],
        len: usize,
    ) -> Result<(), AssembleError> {
        let dir = self.config.frames_dir();
        let data_path = dir.join(format!("{}_data.npy", split.name()));
        let mut writer = CollectionWriter::create(
            &data_path,
            samples.len(),
            len,
            self.config.height,
            self.config.width,
        )
        .map_err(|source| AssembleError::Output {
            path: data_path.clone(),
            source,
        })?;

        for p in samples {
            let result = match &p.frames {
                Some(frames) => writer.push(frames),
                None => output::read_frame_stack(self.sample_path(&p.info))
                    .and_then(|frames| writer.push(&frames)),
            };
            result.map_err(|source| AssembleError::Output {
                path: data_path.clone(),
                source,
            })?;
        }
        writer.finish().map_err(|source| AssembleError::Output {
            path: data_path.clone(),
            source,
        })?;

        let labels_path = dir.join(format!("{}_labels.npy", split.name()));
        let labels: Vec<u32> = samples.iter().map(|p| p.info.label).collect();
        output::write_u32_array(&labels_path, &labels).map_err(|source| AssembleError::Output {
            path: labels_path,
            source,
        })?;
        debug!(split = %split, samples = samples.len(), "Wrote collection");
        Ok(())
    }

    fn progress_bar(&self, len: u64, unit: &str) -> ProgressBar {
        if !self.config.show_progress {
            return ProgressBar::hidden();
        }
        let pb = ProgressBar::new(len);
        let template = format!(
            "{{spinner:.green}} [{{elapsed_precise}}] [{{bar:40.cyan/blue}}] {{pos}}/{{len}} {} ({{eta}})",
            unit
        );
        pb.set_style(
            ProgressStyle::with_template(&template)
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("#>-"),
        );
        pb
    }
}

/// Sample whose frames are either on disk already or still in memory.
struct Pending {
    info: SampleInfo,
    frames: Option<FrameStack>,
}
