//! Event-to-frame integration.
//!
//! A frame is a `[2, H, W]` histogram of the events in one window of a
//! stream: channel 0 counts polarity-0 events, channel 1 polarity-1 events.
//! Windows are half-open index ranges `[l, r)` over the stream, chosen by one
//! of three policies:
//!
//! - [`WindowPolicy::Count`]: `frames_num` windows of `N / frames_num`
//!   events, the last one absorbing the remainder.
//! - [`WindowPolicy::Time`]: `frames_num` windows of equal time span, the
//!   last one absorbing everything after its start.
//! - [`WindowPolicy::Duration`]: as many windows as needed so that no window
//!   spans more than `duration` microseconds.
//!
//! Streams are expected in non-decreasing timestamp order, as decoded.

use crate::types::Event;
use ndarray::{Array3, Array4, ArrayView3, Axis};
use std::fmt;
use std::ops::Range;
use std::str::FromStr;
use thiserror::Error;

/// Errors that can occur during frame integration.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum FrameError {
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Frame shape mismatch: expected {expected:?}, found {found:?}")]
    ShapeMismatch {
        expected: (usize, usize),
        found: (usize, usize),
    },
}

/// A single `[2, H, W]` frame of event counts.
pub type Frame = Array3<u32>;

/// Windowing policy for integrating a stream into frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowPolicy {
    /// Fixed number of frames with equal event counts
    Count { frames_num: usize },
    /// Fixed number of frames with equal time spans
    Time { frames_num: usize },
    /// Variable number of frames, each at most `duration` microseconds long
    Duration { duration: u64 },
}

impl WindowPolicy {
    /// Name of the output directory for frames produced by this policy.
    pub fn dir_name(&self) -> &'static str {
        match self {
            Self::Count { .. } => "split_by_number",
            Self::Time { .. } => "split_by_time",
            Self::Duration { .. } => "split_by_fixed_duration",
        }
    }

    /// Returns true if stacks produced by this policy vary in length.
    pub fn is_variable_length(&self) -> bool {
        matches!(self, Self::Duration { .. })
    }

    /// Number of frames every stack gets, if fixed.
    pub fn fixed_len(&self) -> Option<usize> {
        match *self {
            Self::Count { frames_num } | Self::Time { frames_num } => Some(frames_num),
            Self::Duration { .. } => None,
        }
    }

    /// Checks the policy parameter.
    pub fn validate(&self) -> Result<(), FrameError> {
        match *self {
            Self::Count { frames_num: 0 } | Self::Time { frames_num: 0 } => Err(
                FrameError::InvalidParameter("frames_num must be positive".to_string()),
            ),
            Self::Duration { duration: 0 } => Err(FrameError::InvalidParameter(
                "duration must be positive".to_string(),
            )),
            _ => Ok(()),
        }
    }

    /// Computes the window index ranges of `events` under this policy.
    pub fn segments(&self, events: &[Event]) -> Result<Vec<Range<usize>>, FrameError> {
        self.validate()?;
        Ok(match *self {
            Self::Count { frames_num } => segments_by_count(events.len(), frames_num),
            Self::Time { frames_num } => segments_by_time(events, frames_num),
            Self::Duration { duration } => segments_by_duration(events, duration),
        })
    }
}

impl FromStr for WindowPolicy {
    type Err = FrameError;

    /// Parses a policy from `number:<frames>`, `time:<frames>` or
    /// `duration:<microseconds>`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (name, value) = s.split_once(':').ok_or_else(|| {
            FrameError::InvalidParameter(format!(
                "Policy must look like number:N, time:N or duration:US, got {:?}",
                s
            ))
        })?;
        let value: u64 = value.trim().parse().map_err(|_| {
            FrameError::InvalidParameter(format!("Invalid policy value: {:?}", value))
        })?;

        let policy = match name.trim().to_lowercase().as_str() {
            "number" | "count" => Self::Count {
                frames_num: value as usize,
            },
            "time" => Self::Time {
                frames_num: value as usize,
            },
            "duration" | "fixed_duration" => Self::Duration { duration: value },
            other => {
                return Err(FrameError::InvalidParameter(format!(
                    "Unknown policy: {}. Use number, time or duration",
                    other
                )))
            }
        };
        policy.validate()?;
        Ok(policy)
    }
}

impl fmt::Display for WindowPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Count { frames_num } => write!(f, "number:{}", frames_num),
            Self::Time { frames_num } => write!(f, "time:{}", frames_num),
            Self::Duration { duration } => write!(f, "duration:{}", duration),
        }
    }
}

/// Splits `n` events into `frames_num` windows of `n / frames_num` events.
///
/// The last window always ends at `n`. With `n == 0` every window is empty.
pub fn segments_by_count(n: usize, frames_num: usize) -> Vec<Range<usize>> {
    if frames_num == 0 {
        return Vec::new();
    }
    let di = n / frames_num;
    let mut segments: Vec<Range<usize>> = (0..frames_num).map(|i| i * di..(i + 1) * di).collect();
    if let Some(last) = segments.last_mut() {
        last.end = n;
    }
    segments
}

/// Splits a stream into `frames_num` windows of equal time span.
///
/// With `t0` the first and `t1` the last timestamp, window `i` covers
/// `[t0 + i * dt, t0 + (i + 1) * dt)` where `dt = (t1 - t0) / frames_num`.
/// A window with no events in its span is the empty range at the previous
/// window's right edge. The last window always ends at the stream length.
pub fn segments_by_time(events: &[Event], frames_num: usize) -> Vec<Range<usize>> {
    let n = events.len();
    if n == 0 {
        return vec![0..0; frames_num];
    }

    let t0 = events[0].t;
    let dt = events[n - 1].t.saturating_sub(t0) / frames_num.max(1) as u64;

    let mut segments = Vec::with_capacity(frames_num);
    let mut left = 0;
    for i in 0..frames_num {
        let right = if i + 1 == frames_num {
            n
        } else {
            let t_r = t0 + dt * (i as u64 + 1);
            events[left..]
                .iter()
                .position(|e| e.t >= t_r)
                .map_or(n, |k| left + k)
        };
        segments.push(left..right);
        left = right;
    }
    segments
}

/// Splits a stream into consecutive windows no longer than `duration`.
///
/// Starting at the first event, a window grows while the next event lies
/// within `duration` of the window's first event. The next window starts
/// where the previous one ended. An empty stream yields one empty window.
pub fn segments_by_duration(events: &[Event], duration: u64) -> Vec<Range<usize>> {
    let n = events.len();
    if n == 0 {
        return vec![0..0];
    }

    let mut segments = Vec::new();
    let mut left = 0;
    while left < n {
        let t_l = events[left].t;
        let right = events[left..]
            .iter()
            .position(|e| e.t.saturating_sub(t_l) > duration)
            .map_or(n, |k| left + k);
        segments.push(left..right);
        left = right;
    }
    segments
}

/// An ordered stack of frames, shape `[T, 2, H, W]`.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameStack {
    frames: Array4<u32>,
}

impl FrameStack {
    /// Wraps a `[T, 2, H, W]` array.
    ///
    /// Fails if the channel axis is not 2.
    pub fn new(frames: Array4<u32>) -> Result<Self, FrameError> {
        if frames.len_of(Axis(1)) != 2 {
            return Err(FrameError::InvalidParameter(format!(
                "expected 2 polarity channels, found {}",
                frames.len_of(Axis(1))
            )));
        }
        Ok(Self { frames })
    }

    /// Creates a stack of `len` all-zero frames.
    pub fn zeros(len: usize, height: usize, width: usize) -> Self {
        Self {
            frames: Array4::zeros((len, 2, height, width)),
        }
    }

    /// Number of frames.
    pub fn len(&self) -> usize {
        self.frames.len_of(Axis(0))
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn height(&self) -> usize {
        self.frames.len_of(Axis(2))
    }

    pub fn width(&self) -> usize {
        self.frames.len_of(Axis(3))
    }

    /// Returns frame `i`.
    pub fn frame(&self, i: usize) -> ArrayView3<'_, u32> {
        self.frames.index_axis(Axis(0), i)
    }

    pub fn frames(&self) -> &Array4<u32> {
        &self.frames
    }

    pub fn into_array(self) -> Array4<u32> {
        self.frames
    }

    /// Total number of events counted over all frames.
    pub fn event_count(&self) -> u64 {
        self.frames.iter().map(|&v| v as u64).sum()
    }

    /// Returns a copy extended with all-zero frames up to `len` frames.
    ///
    /// Fails if the stack is already longer than `len`.
    pub fn padded_to(&self, len: usize) -> Result<FrameStack, FrameError> {
        if len < self.len() {
            return Err(FrameError::InvalidParameter(format!(
                "cannot pad {} frames down to {}",
                self.len(),
                len
            )));
        }
        let mut padded = FrameStack::zeros(len, self.height(), self.width());
        padded
            .frames
            .slice_mut(ndarray::s![..self.len(), .., .., ..])
            .assign(&self.frames);
        Ok(padded)
    }
}

/// Integrates event windows into fixed-size frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameIntegrator {
    height: usize,
    width: usize,
}

impl FrameIntegrator {
    /// Creates an integrator for `height` x `width` frames.
    pub fn new(height: usize, width: usize) -> Result<Self, FrameError> {
        if height == 0 || width == 0 {
            return Err(FrameError::InvalidParameter(format!(
                "frame size {}x{} must be positive",
                height, width
            )));
        }
        Ok(Self { height, width })
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn width(&self) -> usize {
        self.width
    }

    /// Counts the events of `events[range]` into one frame.
    ///
    /// Events outside the frame are dropped.
    pub fn integrate_segment(&self, events: &[Event], range: Range<usize>) -> Frame {
        let counts = self.histogram(&events[range]);
        let mut frame = Frame::zeros((2, self.height, self.width));
        for (dst, &src) in frame.iter_mut().zip(counts.iter()) {
            *dst = src;
        }
        frame
    }

    /// Integrates each window of `segments` into one frame of a stack.
    pub fn integrate_segments(&self, events: &[Event], segments: &[Range<usize>]) -> FrameStack {
        let mut stack = FrameStack::zeros(segments.len(), self.height, self.width);
        for (mut frame, range) in stack.frames.outer_iter_mut().zip(segments) {
            let counts = self.histogram(&events[range.clone()]);
            for (dst, &src) in frame.iter_mut().zip(counts.iter()) {
                *dst = src;
            }
        }
        stack
    }

    /// Integrates a stream into `frames_num` frames of equal event counts.
    pub fn integrate_by_count(
        &self,
        events: &[Event],
        frames_num: usize,
    ) -> Result<FrameStack, FrameError> {
        self.integrate(events, &WindowPolicy::Count { frames_num })
    }

    /// Integrates a stream into `frames_num` frames of equal time spans.
    pub fn integrate_by_time(
        &self,
        events: &[Event],
        frames_num: usize,
    ) -> Result<FrameStack, FrameError> {
        self.integrate(events, &WindowPolicy::Time { frames_num })
    }

    /// Integrates a stream into frames spanning at most `duration` each.
    pub fn integrate_by_duration(
        &self,
        events: &[Event],
        duration: u64,
    ) -> Result<FrameStack, FrameError> {
        self.integrate(events, &WindowPolicy::Duration { duration })
    }

    /// Integrates a stream under the given policy.
    pub fn integrate(
        &self,
        events: &[Event],
        policy: &WindowPolicy,
    ) -> Result<FrameStack, FrameError> {
        let segments = policy.segments(events)?;
        Ok(self.integrate_segments(events, &segments))
    }

    /// Builds the flat `[2 * H * W]` event histogram of a window.
    fn histogram(&self, events: &[Event]) -> Vec<u32> {
        let plane = self.height * self.width;
        let mut counts = vec![0u32; 2 * plane];
        for e in events {
            let (x, y) = (e.x as usize, e.y as usize);
            if x >= self.width || y >= self.height {
                continue;
            }
            let channel = (e.p != 0) as usize;
            counts[channel * plane + y * self.width + x] += 1;
        }
        counts
    }
}
