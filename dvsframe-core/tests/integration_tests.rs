//! Integration tests for the decoder, the frame integrator and the dataset
//! assembler.
//!
//! Most tests build synthetic recordings in a temporary directory. Tests
//! against a real capture skip themselves when test_data is missing.
//! Run with: cargo test --test integration_tests

use dvsframe_core::output::{self, AedatWriter};
use dvsframe_core::types::PacketHeader;
use dvsframe_core::{
    labels, pad_frame_stacks, AedatDecoder, DatasetAssembler, DatasetConfig, DecodeError, Event,
    FrameIntegrator, WindowPolicy,
};
use std::fs;
use std::path::Path;

const TEST_FILE: &str = "test_data/user01_fluorescent.aedat";
const TEST_LABELS: &str = "test_data/user01_fluorescent_labels.csv";

/// Events spread over `[0, n * step)` with coordinates inside a 16x16 sensor.
fn events(n: u64, step: u64) -> Vec<Event> {
    (0..n)
        .map(|i| Event::new(i * step, (i % 16) as u16, ((i / 16) % 16) as u16, (i % 2) as u8))
        .collect()
}

fn write_recording(data_dir: &Path, stem: &str, events: &[Event], table: &str) {
    fs::create_dir_all(data_dir).unwrap();
    output::write_aedat(data_dir.join(format!("{}.aedat", stem)), events).unwrap();
    fs::write(data_dir.join(format!("{}_labels.csv", stem)), table).unwrap();
}

fn write_lists(data_dir: &Path, train: &[&str], test: &[&str]) {
    fs::write(data_dir.join("trials_to_train.txt"), train.join("\n")).unwrap();
    fs::write(data_dir.join("trials_to_test.txt"), test.join("\n")).unwrap();
}

fn config(root: &Path, policy: WindowPolicy) -> DatasetConfig {
    DatasetConfig {
        dataset_root: root.join("data"),
        output_root: root.join("out"),
        policy,
        height: 16,
        width: 16,
        num_labels: 4,
        max_workers: Some(3),
        ..Default::default()
    }
}

/// Test that a real DVS128 recording decodes into in-bounds, ordered events.
#[test]
fn test_decode_real_file() {
    let test_path = Path::new(TEST_FILE);
    if !test_path.exists() {
        eprintln!("Skipping test: test file not found at {}", TEST_FILE);
        return;
    }

    let mut decoder = AedatDecoder::new();
    let result = decoder
        .decode_file(test_path)
        .expect("Failed to decode file");

    assert_eq!(result.header.version.as_deref(), Some("3.1"));
    assert!(!result.events.is_empty());
    for event in &result.events {
        assert!(event.x < 128);
        assert!(event.y < 128);
        assert!(event.p <= 1);
    }
    assert!(result.events.windows(2).all(|w| w[0].t <= w[1].t));
}

/// Test that the labeled segments of a real recording are non-empty.
#[test]
fn test_split_real_file() {
    if !Path::new(TEST_FILE).exists() || !Path::new(TEST_LABELS).exists() {
        eprintln!("Skipping test: test data not found");
        return;
    }

    let result = AedatDecoder::new().decode_file(TEST_FILE).unwrap();
    let intervals = labels::read_label_table(TEST_LABELS).unwrap();
    let streams = labels::split_by_labels(&result.events, &intervals);

    assert_eq!(streams.len(), intervals.len());
    for stream in &streams {
        assert!(stream.label < 11);
        assert!(!stream.events.is_empty());
    }
}

/// Test decoding a stream mixing polarity packets with other packet types
/// and crossing a timestamp overflow.
#[test]
fn test_decode_mixed_packets() {
    let first = vec![Event::new(10, 1, 2, 1), Event::new(20, 3, 4, 0)];
    let second = vec![Event::new((1 << 31) + 5, 5, 6, 1)];

    let mut bytes = Vec::new();
    {
        let mut writer = AedatWriter::new(&mut bytes);
        writer.write_header(&["Source 1: DVS128"]).unwrap();
        writer.write_events(&first).unwrap();
        // an IMU6 packet with one 36-byte element
        let imu = PacketHeader {
            event_type: 3,
            source: 1,
            size: 36,
            offset: 4,
            ts_overflow: 0,
            capacity: 1,
            number: 1,
            valid: 1,
        };
        writer.write_packet(&imu, &[0u8; 36]).unwrap();
        writer.write_events(&second).unwrap();
        writer.flush().unwrap();
    }

    let result = AedatDecoder::new().decode_bytes(&bytes).unwrap();
    let expected: Vec<Event> = first.into_iter().chain(second).collect();
    assert_eq!(result.events, expected);
    assert_eq!(result.stats.packets, 3);
    assert_eq!(result.stats.polarity_packets, 2);
    assert_eq!(result.stats.skipped_packets(), 1);
    assert_eq!(result.header.sources, vec!["DVS128".to_string()]);
}

/// Test that a recording cut in the middle of a packet is reported, not
/// silently shortened.
#[test]
fn test_truncated_recording_is_an_error() {
    let mut bytes = Vec::new();
    {
        let mut writer = AedatWriter::new(&mut bytes);
        writer.write_header(&[]).unwrap();
        writer.write_events(&events(4, 1)).unwrap();
        writer.flush().unwrap();
    }
    bytes.truncate(bytes.len() - 3);

    let err = AedatDecoder::new().decode_bytes(&bytes).unwrap_err();
    assert!(matches!(err, DecodeError::Truncated { .. }));
}

/// 10 events at x=y=0..9, alternating polarity, two count windows.
#[test]
fn test_count_policy_scenario() {
    let events: Vec<Event> = (0..10)
        .map(|i| Event::new(i as u64, i, i, (i % 2) as u8))
        .collect();
    let stack = FrameIntegrator::new(10, 10)
        .unwrap()
        .integrate(&events, &WindowPolicy::Count { frames_num: 2 })
        .unwrap();

    assert_eq!(stack.len(), 2);
    for i in 0..2 {
        assert_eq!(stack.frame(i).sum(), 5);
    }
    assert_eq!(stack.frame(0)[[0, 0, 0]], 1);
    assert_eq!(stack.frame(0)[[1, 1, 1]], 1);
    assert_eq!(stack.frame(1)[[1, 9, 9]], 1);
}

/// An interval with no events yields an empty stream and all-zero frames
/// under every policy.
#[test]
fn test_empty_interval_integrates_to_zero() {
    let events = events(10, 1);
    let streams = labels::split_by_labels(&events, &[labels::LabelInterval::new(0, 100, 200)]);
    assert!(streams[0].events.is_empty());

    let integrator = FrameIntegrator::new(16, 16).unwrap();
    for policy in [
        WindowPolicy::Count { frames_num: 4 },
        WindowPolicy::Time { frames_num: 4 },
        WindowPolicy::Duration { duration: 10 },
    ] {
        let stack = integrator.integrate(&streams[0].events, &policy).unwrap();
        assert!(!stack.is_empty());
        assert_eq!(stack.event_count(), 0);
    }
}

/// Padding keeps every original stack as a prefix and adds only zeros.
#[test]
fn test_padding_preserves_prefix() {
    let integrator = FrameIntegrator::new(16, 16).unwrap();
    let policy = WindowPolicy::Duration { duration: 25 };
    let stacks: Vec<_> = [3u64, 40, 17, 1]
        .iter()
        .map(|&n| integrator.integrate(&events(n, 4), &policy).unwrap())
        .collect();

    let batch = pad_frame_stacks(&stacks).unwrap();
    let max_len = stacks.iter().map(|s| s.len()).max().unwrap();
    assert_eq!(batch.max_len(), max_len);
    for (i, stack) in stacks.iter().enumerate() {
        assert_eq!(batch.valid_lengths()[i], stack.len());
        assert_eq!(batch.unpadded(i), stack.frames().view());
        assert_eq!(batch.sample(i).sum(), stack.event_count() as u32);
    }
}

/// Test the whole pipeline with a broken recording among good ones.
#[test]
fn test_build_dataset_skips_broken_recording() {
    let dir = tempfile::tempdir().unwrap();
    let data = dir.path().join("data");
    write_recording(
        &data,
        "user01_led",
        &events(100, 10),
        "class,startTime_usec,endTime_usec\n1,0,300\n2,300,600\n1,600,1000\n",
    );
    write_recording(
        &data,
        "user02_led",
        &events(60, 10),
        "class,startTime_usec,endTime_usec\n4,0,600\n",
    );
    // label table without a recording
    fs::write(data.join("user03_led_labels.csv"), "class,start,end\n1,0,10\n").unwrap();
    write_lists(&data, &["user01_led.aedat", "user03_led.aedat"], &["user02_led.aedat"]);

    let config = config(dir.path(), WindowPolicy::Count { frames_num: 5 });
    let frames_dir = config.frames_dir();
    let summary = DatasetAssembler::new(config).unwrap().run().unwrap();

    assert_eq!(summary.recordings, 3);
    assert_eq!(summary.failures.len(), 1);
    assert!(summary.failures[0].path.ends_with("user03_led.aedat"));
    assert_eq!(summary.train_samples, 3);
    assert_eq!(summary.test_samples, 1);
    assert_eq!(summary.samples_per_label, vec![2, 1, 0, 1]);

    let first = output::read_frame_stack(frames_dir.join("train/0/user01_led_0.npy")).unwrap();
    let second = output::read_frame_stack(frames_dir.join("train/0/user01_led_1.npy")).unwrap();
    let other = output::read_frame_stack(frames_dir.join("train/1/user01_led_0.npy")).unwrap();
    let test = output::read_frame_stack(frames_dir.join("test/3/user02_led_0.npy")).unwrap();
    assert_eq!(first.len(), 5);
    assert_eq!(first.event_count(), 30);
    assert_eq!(second.event_count(), 40);
    assert_eq!(other.event_count(), 30);
    assert_eq!(test.event_count(), 60);
}

/// Fixed-duration stacks are padded to the longest stack across both
/// splits and their true lengths are recorded.
#[test]
fn test_build_dataset_duration_padding() {
    let dir = tempfile::tempdir().unwrap();
    let data = dir.path().join("data");
    write_recording(&data, "a", &events(50, 10), "class,start,end\n1,0,100\n2,100,500\n");
    write_recording(&data, "b", &events(50, 10), "class,start,end\n3,0,50\n");
    write_lists(&data, &["a.aedat"], &["b.aedat"]);

    let mut config = config(dir.path(), WindowPolicy::Duration { duration: 95 });
    config.write_collections = true;
    let frames_dir = config.frames_dir();
    let summary = DatasetAssembler::new(config).unwrap().run().unwrap();

    // [0, 100) -> 1 window, [100, 500) -> 4 windows, [0, 50) -> 1 window
    assert_eq!(summary.frames_per_sample, 4);

    let (shape, lengths) =
        output::read_u32_array(frames_dir.join("train_valid_length.npy")).unwrap();
    assert_eq!(shape, vec![2u64]);
    assert_eq!(lengths, vec![1, 4]);
    let (_, lengths) = output::read_u32_array(frames_dir.join("test_valid_length.npy")).unwrap();
    assert_eq!(lengths, vec![1]);

    let short = output::read_frame_stack(frames_dir.join("train/0/a_0.npy")).unwrap();
    assert_eq!(short.len(), 4);
    assert_eq!(short.frame(0).sum(), 10);
    for i in 1..4 {
        assert_eq!(short.frame(i).sum(), 0);
    }
    let long = output::read_frame_stack(frames_dir.join("train/1/a_0.npy")).unwrap();
    assert_eq!(long.event_count(), 40);

    let (shape, labels) = output::read_u32_array(frames_dir.join("train_labels.npy")).unwrap();
    assert_eq!(shape, vec![2u64]);
    assert_eq!(labels, vec![0, 1]);

    let file = fs::File::open(frames_dir.join("train_data.npy")).unwrap();
    let npy = npyz::NpyFile::new(std::io::BufReader::new(file)).unwrap();
    assert_eq!(npy.shape().to_vec(), vec![2u64, 4, 2, 16, 16]);
    let data: Vec<f32> = npy.into_vec().unwrap();
    assert_eq!(data.iter().sum::<f32>(), 50.0);
}

/// Exported event segments hold exactly the events of their interval.
#[test]
fn test_build_dataset_exports_events() {
    let dir = tempfile::tempdir().unwrap();
    let data = dir.path().join("data");
    write_recording(&data, "rec", &events(20, 10), "class,start,end\n2,50,120\n");
    write_lists(&data, &["rec.aedat"], &[]);

    let mut config = config(dir.path(), WindowPolicy::Time { frames_num: 3 });
    config.export_events = true;
    let events_csv = config.events_dir(dvsframe_core::Split::Train, 1).join("rec_0.csv");
    let summary = DatasetAssembler::new(config).unwrap().run().unwrap();
    assert_eq!(summary.train_samples, 1);
    assert_eq!(summary.test_samples, 0);

    let csv = fs::read_to_string(events_csv).unwrap();
    let lines: Vec<&str> = csv.lines().collect();
    assert_eq!(lines[0], "t,x,y,p");
    assert_eq!(lines.len(), 1 + 7);
    assert_eq!(lines[1], "50,5,0,1");
}
