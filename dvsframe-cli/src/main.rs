//! DVS frame dataset CLI application.
//!
//! Decodes AEDAT 3.1 recordings, slices them by label tables and integrates
//! the labeled segments into frame stacks.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use dvsframe_core::output;
use dvsframe_core::{
    labels, AedatDecoder, DatasetAssembler, DatasetConfig, DecodeOptions, FrameIntegrator,
    WindowPolicy,
};
use indicatif::{ProgressBar, ProgressStyle};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, info};
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

/// AEDAT 3.1 decoder and event-to-frame integrator for DVS recordings.
#[derive(Parser, Debug)]
#[command(name = "dvsframe")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Only log warnings and errors, and hide progress output
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Decode an AEDAT 3.1 file to CSV (t,x,y,p)
    Decode {
        /// Input .aedat file path
        #[arg(value_name = "INPUT")]
        input: PathBuf,

        /// Output .csv file path
        #[arg(value_name = "OUTPUT")]
        output: PathBuf,

        #[command(flatten)]
        decode: DecodeArgs,
    },

    /// Slice one recording by its label table and integrate every segment
    Split {
        /// Input .aedat file path
        #[arg(value_name = "INPUT")]
        input: PathBuf,

        /// Label table (label,t_start,t_end with 1-based labels)
        #[arg(value_name = "LABELS")]
        labels: PathBuf,

        /// Directory receiving <label>/<stem>_<ordinal>.npy
        #[arg(value_name = "OUT_DIR")]
        out_dir: PathBuf,

        #[command(flatten)]
        frames: FrameArgs,

        #[command(flatten)]
        decode: DecodeArgs,
    },

    /// Build a frame dataset from a directory of labeled recordings
    Build {
        /// Directory holding recordings, label tables and trial lists
        #[arg(long, value_name = "DIR")]
        dataset_root: PathBuf,

        /// Directory the dataset is written to
        #[arg(long, value_name = "DIR")]
        output_root: PathBuf,

        #[command(flatten)]
        frames: FrameArgs,

        /// Number of classes
        #[arg(long, default_value_t = 11)]
        num_labels: u32,

        /// Worker threads (default: number of CPUs, at most 16)
        #[arg(short, long)]
        workers: Option<usize>,

        /// Also write <split>_data.npy and <split>_labels.npy per split
        #[arg(long)]
        collections: bool,

        /// Also write every labeled event segment as CSV
        #[arg(long)]
        export_events: bool,

        #[command(flatten)]
        decode: DecodeArgs,
    },
}

#[derive(Args, Debug)]
struct FrameArgs {
    /// Windowing policy.
    ///
    /// Examples:
    /// - "number:20" (20 frames with equal event counts)
    /// - "time:20" (20 frames with equal time spans)
    /// - "duration:10000" (frames of at most 10000 microseconds)
    #[arg(short, long, default_value = "number:20")]
    policy: WindowPolicy,

    /// Sensor height in pixels
    #[arg(long, default_value_t = 128)]
    height: usize,

    /// Sensor width in pixels
    #[arg(long, default_value_t = 128)]
    width: usize,
}

#[derive(Args, Debug)]
struct DecodeArgs {
    /// Drop events whose validity bit is cleared
    #[arg(long)]
    skip_invalid: bool,
}

impl DecodeArgs {
    fn options(&self) -> DecodeOptions {
        DecodeOptions {
            skip_invalid: self.skip_invalid,
        }
    }
}

fn init_logging(quiet: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if quiet {
            EnvFilter::new("warn")
        } else {
            EnvFilter::new("warn,dvsframe=info,dvsframe_core=info")
        }
    });

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .compact()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .with(filter)
        .init();
}

fn spinner(quiet: bool) -> ProgressBar {
    if quiet {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.green} [{elapsed_precise}] {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    pb
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.quiet);

    match cli.command {
        Command::Decode {
            input,
            output,
            decode,
        } => run_decode(&input, &output, &decode, cli.quiet),
        Command::Split {
            input,
            labels,
            out_dir,
            frames,
            decode,
        } => run_split(&input, &labels, &out_dir, &frames, &decode, cli.quiet),
        Command::Build {
            dataset_root,
            output_root,
            frames,
            num_labels,
            workers,
            collections,
            export_events,
            decode,
        } => {
            let config = DatasetConfig {
                dataset_root,
                output_root,
                policy: frames.policy,
                height: frames.height,
                width: frames.width,
                num_labels,
                max_workers: workers,
                decode: decode.options(),
                write_collections: collections,
                export_events,
                show_progress: !cli.quiet,
                ..Default::default()
            };
            run_build(config, cli.quiet)
        }
    }
}

fn run_decode(input: &Path, output: &Path, decode: &DecodeArgs, quiet: bool) -> Result<()> {
    let progress = spinner(quiet);
    let start_time = Instant::now();

    progress.set_message(format!("Decoding {}...", file_name(input)));
    let mut decoder = AedatDecoder::with_options(decode.options());
    let result = decoder
        .decode_file(input)
        .with_context(|| format!("Failed to decode {}", input.display()))?;

    progress.set_message(format!("Writing to {}...", file_name(output)));
    output::write_events_csv(output, &result.events).context("Failed to write CSV output")?;

    let total_duration = start_time.elapsed();
    progress.finish_and_clear();

    if !quiet {
        let events_per_sec = result.events.len() as f64 / total_duration.as_secs_f64();
        eprintln!("Summary:");
        eprintln!("  Input:        {}", input.display());
        eprintln!("  Output:       {}", output.display());
        if let Some(version) = &result.header.version {
            eprintln!("  Format:       AER-DAT{}", version);
        }
        eprintln!("  Events:       {}", result.events.len());
        eprintln!("  Packets:      {}", result.stats.packets);
        eprintln!("  Skipped:      {}", result.stats.skipped_packets());
        eprintln!("  Duration:     {:.3}s", total_duration.as_secs_f64());
        eprintln!("  Throughput:   {:.0} events/s", events_per_sec);
    }

    Ok(())
}

fn run_split(
    input: &Path,
    labels_path: &Path,
    out_dir: &Path,
    frames: &FrameArgs,
    decode: &DecodeArgs,
    quiet: bool,
) -> Result<()> {
    let progress = spinner(quiet);
    let integrator = FrameIntegrator::new(frames.height, frames.width)
        .context("Invalid frame size")?;

    progress.set_message(format!("Decoding {}...", file_name(input)));
    let mut decoder = AedatDecoder::with_options(decode.options());
    let result = decoder
        .decode_file(input)
        .with_context(|| format!("Failed to decode {}", input.display()))?;
    let intervals = labels::read_label_table(labels_path)
        .with_context(|| format!("Failed to read label table {}", labels_path.display()))?;
    debug!(intervals = intervals.len(), "Read label table");

    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();

    let streams = labels::split_by_labels(&result.events, &intervals);
    for stream in &streams {
        progress.set_message(format!("Integrating label {} #{}", stream.label, stream.ordinal));
        let stack = integrator
            .integrate(&stream.events, &frames.policy)
            .context("Failed to integrate frames")?;

        let dir = out_dir.join(stream.label.to_string());
        fs::create_dir_all(&dir)
            .with_context(|| format!("Cannot create {}", dir.display()))?;
        let path = dir.join(format!("{}_{}.npy", stem, stream.ordinal));
        output::write_frame_stack(&path, &stack)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        info!(
            label = stream.label,
            ordinal = stream.ordinal,
            events = stream.events.len(),
            frames = stack.len(),
            "Wrote sample"
        );
    }

    progress.finish_and_clear();
    if !quiet {
        eprintln!(
            "Wrote {} samples from {} events to {}",
            streams.len(),
            result.events.len(),
            out_dir.display()
        );
    }
    Ok(())
}

fn run_build(config: DatasetConfig, quiet: bool) -> Result<()> {
    let start_time = Instant::now();
    let assembler = DatasetAssembler::new(config).context("Invalid dataset configuration")?;
    let summary = assembler.run().context("Failed to build dataset")?;

    if !quiet {
        eprintln!();
        eprintln!("Summary:");
        eprintln!("  Output:       {}", summary.output_dir.display());
        eprintln!("  Policy:       {}", assembler.config().policy);
        eprintln!("  Recordings:   {}", summary.recordings);
        eprintln!("  Failed:       {}", summary.failures.len());
        eprintln!("  Train:        {}", summary.train_samples);
        eprintln!("  Test:         {}", summary.test_samples);
        eprintln!("  Frames:       {}", summary.frames_per_sample);
        for (label, count) in summary.samples_per_label.iter().enumerate() {
            eprintln!("  Label {:>2}:     {}", label, count);
        }
        eprintln!("  Duration:     {:.3}s", start_time.elapsed().as_secs_f64());
    }
    for failure in &summary.failures {
        eprintln!("failed: {}: {}", failure.path.display(), failure.error);
    }

    Ok(())
}
