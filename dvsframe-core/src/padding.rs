//! Zero-padding of variable-length frame stacks.
//!
//! Stacks produced by the fixed-duration policy differ in length. Batching
//! them pads every stack at its end with all-zero frames up to the longest
//! stack and keeps each stack's true length next to the padded tensor.

use crate::frame::{FrameError, FrameStack};
use ndarray::{s, Array5, ArrayView4, Axis};

/// A padded batch of frame stacks, shape `[S, T, 2, H, W]`, together with
/// the unpadded length of every sample.
#[derive(Debug, Clone, PartialEq)]
pub struct PaddedBatch {
    frames: Array5<u32>,
    valid_lengths: Vec<usize>,
}

impl PaddedBatch {
    /// Number of samples.
    pub fn len(&self) -> usize {
        self.valid_lengths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.valid_lengths.is_empty()
    }

    /// Padded length shared by all samples.
    pub fn max_len(&self) -> usize {
        self.frames.len_of(Axis(1))
    }

    /// Unpadded length of every sample.
    pub fn valid_lengths(&self) -> &[usize] {
        &self.valid_lengths
    }

    /// The whole padded tensor.
    pub fn frames(&self) -> &Array5<u32> {
        &self.frames
    }

    /// Padded tensor of sample `i`.
    pub fn sample(&self, i: usize) -> ArrayView4<'_, u32> {
        self.frames.index_axis(Axis(0), i)
    }

    /// Sample `i` truncated to its valid length.
    pub fn unpadded(&self, i: usize) -> ArrayView4<'_, u32> {
        self.frames.slice(s![i, ..self.valid_lengths[i], .., .., ..])
    }

    pub fn into_parts(self) -> (Array5<u32>, Vec<usize>) {
        (self.frames, self.valid_lengths)
    }
}

/// Length every stack of a batch is padded to.
pub fn max_stack_len<'a, I>(stacks: I) -> usize
where
    I: IntoIterator<Item = &'a FrameStack>,
{
    stacks.into_iter().map(FrameStack::len).max().unwrap_or(0)
}

/// Pads `stacks` with trailing all-zero frames to the longest stack.
///
/// All stacks must share the same frame size.
pub fn pad_frame_stacks(stacks: &[FrameStack]) -> Result<PaddedBatch, FrameError> {
    let (height, width) = stacks
        .first()
        .map_or((0, 0), |first| (first.height(), first.width()));

    for stack in stacks {
        if (stack.height(), stack.width()) != (height, width) {
            return Err(FrameError::ShapeMismatch {
                expected: (height, width),
                found: (stack.height(), stack.width()),
            });
        }
    }

    let max_len = max_stack_len(stacks);
    let mut frames = Array5::<u32>::zeros((stacks.len(), max_len, 2, height, width));
    for (mut sample, stack) in frames.outer_iter_mut().zip(stacks) {
        sample
            .slice_mut(s![..stack.len(), .., .., ..])
            .assign(stack.frames());
    }

    Ok(PaddedBatch {
        frames,
        valid_lengths: stacks.iter().map(FrameStack::len).collect(),
    })
}
