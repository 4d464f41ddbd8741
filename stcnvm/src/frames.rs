//! # Frame Layout Adapter
//!
//! Every module in this crate computes on single frames `[batch, channels,
//! height, width]`. Sequences `[batch, time, channels, height, width]` are
//! handled by folding time into the batch axis, running the single-frame
//! computation once, and restoring the `(batch, time)` split.
//!
//! Rank is part of the tensor type, so the two calling conventions are two
//! entry points (`forward_single_frame` / `forward_time_series`). [`Frames`] is
//! the tagged union for callers that only learn the rank at runtime.

use burn::prelude::*;

use crate::error::{StcnvmError, StcnvmResult};

/// Folds `[batch, time, ...]` into `[batch * time, ...]`.
///
/// Returns the folded tensor and the `[batch, time]` pair needed to undo it.
pub fn fold_time<B: Backend>(x: Tensor<B, 5>) -> (Tensor<B, 4>, [usize; 2]) {
    let [batch, time, channels, height, width] = x.dims();
    (x.reshape([batch * time, channels, height, width]), [batch, time])
}

/// Restores the `[batch, time]` split produced by [`fold_time`].
pub fn unfold_time<B: Backend>(x: Tensor<B, 4>, batch_time: [usize; 2]) -> Tensor<B, 5> {
    let [batch, time] = batch_time;
    let [_, channels, height, width] = x.dims();
    x.reshape([batch, time, channels, height, width])
}

/// Applies a single-frame operation to every frame of a sequence at once.
pub fn time_distributed<B, F>(x: Tensor<B, 5>, f: F) -> Tensor<B, 5>
where
    B: Backend,
    F: FnOnce(Tensor<B, 4>) -> Tensor<B, 4>,
{
    let (frames, batch_time) = fold_time(x);
    unfold_time(f(frames), batch_time)
}

/// Fallible counterpart of [`time_distributed`].
pub fn try_time_distributed<B, F>(x: Tensor<B, 5>, f: F) -> StcnvmResult<Tensor<B, 5>>
where
    B: Backend,
    F: FnOnce(Tensor<B, 4>) -> StcnvmResult<Tensor<B, 4>>,
{
    let (frames, batch_time) = fold_time(x);
    Ok(unfold_time(f(frames)?, batch_time))
}

/// A feature tensor that is either one frame or a sequence of frames.
#[derive(Debug, Clone)]
pub enum Frames<B: Backend> {
    /// `[batch, channels, height, width]`
    Single(Tensor<B, 4>),
    /// `[batch, time, channels, height, width]`
    Sequence(Tensor<B, 5>),
}

impl<B: Backend> Frames<B> {
    /// Builds frames from raw tensor data, dispatching on its rank.
    ///
    /// # Errors
    ///
    /// Returns `StcnvmError::InvalidTensorShape` if the rank is neither 4 nor 5.
    pub fn from_data(data: TensorData, device: &Device<B>) -> StcnvmResult<Self> {
        match data.shape.len() {
            4 => Ok(Self::Single(Tensor::from_data(data, device))),
            5 => Ok(Self::Sequence(Tensor::from_data(data, device))),
            _ => Err(StcnvmError::shape(
                "rank 4 [batch, channels, height, width] or rank 5 [batch, time, channels, height, width]",
                &data.shape,
            )),
        }
    }

    /// The full shape, including the time axis for sequences.
    pub fn dims(&self) -> Vec<usize> {
        match self {
            Self::Single(x) => x.dims().to_vec(),
            Self::Sequence(x) => x.dims().to_vec(),
        }
    }

    /// Number of time steps; `None` for a single frame.
    pub fn time_steps(&self) -> Option<usize> {
        match self {
            Self::Single(_) => None,
            Self::Sequence(x) => Some(x.dims()[1]),
        }
    }

    /// Channel count of each frame.
    pub fn channels(&self) -> usize {
        match self {
            Self::Single(x) => x.dims()[1],
            Self::Sequence(x) => x.dims()[2],
        }
    }

    /// Applies a single-frame operation, preserving the layout.
    pub fn map_frames<F>(self, f: F) -> Self
    where
        F: FnOnce(Tensor<B, 4>) -> Tensor<B, 4>,
    {
        match self {
            Self::Single(x) => Self::Single(f(x)),
            Self::Sequence(x) => Self::Sequence(time_distributed(x, f)),
        }
    }

    /// Fallible counterpart of [`Frames::map_frames`].
    ///
    /// # Errors
    ///
    /// Propagates the error returned by `f`.
    pub fn try_map_frames<F>(self, f: F) -> StcnvmResult<Self>
    where
        F: FnOnce(Tensor<B, 4>) -> StcnvmResult<Tensor<B, 4>>,
    {
        match self {
            Self::Single(x) => f(x).map(Self::Single),
            Self::Sequence(x) => try_time_distributed(x, f).map(Self::Sequence),
        }
    }

    /// Views the frames as a sequence; a single frame becomes a sequence of
    /// length one.
    pub fn into_sequence(self) -> Tensor<B, 5> {
        match self {
            Self::Single(x) => x.unsqueeze_dim(1),
            Self::Sequence(x) => x,
        }
    }

    /// Views the frames as one frame batch.
    ///
    /// # Errors
    ///
    /// Returns `StcnvmError::InvalidTensorShape` for a sequence longer than
    /// one frame.
    pub fn into_single(self) -> StcnvmResult<Tensor<B, 4>> {
        match self {
            Self::Single(x) => Ok(x),
            Self::Sequence(x) => match x.dims() {
                [_, 1, _, _, _] => Ok(x.squeeze(1)),
                dims => Err(StcnvmError::shape("a sequence of one frame", dims)),
            },
        }
    }
}

/// A module that transforms each frame independently.
///
/// Implementors provide the single-frame computation; the sequence entry point
/// is derived from it and never duplicated.
pub trait FrameModule<B: Backend> {
    /// `[batch, channels, height, width]` in, single-frame result out.
    ///
    /// # Errors
    ///
    /// Returns `StcnvmError::InvalidConfiguration` when the channel count of
    /// `x` differs from the one the module was built for.
    fn forward_single_frame(&self, x: Tensor<B, 4>) -> StcnvmResult<Tensor<B, 4>>;

    /// `[batch, time, channels, height, width]` in, one result per frame out.
    ///
    /// # Errors
    ///
    /// Same as [`FrameModule::forward_single_frame`].
    fn forward_time_series(&self, x: Tensor<B, 5>) -> StcnvmResult<Tensor<B, 5>> {
        try_time_distributed(x, |frames| self.forward_single_frame(frames))
    }

    /// Dispatches on the layout of `x`.
    ///
    /// # Errors
    ///
    /// Same as [`FrameModule::forward_single_frame`].
    fn forward_frames(&self, x: Frames<B>) -> StcnvmResult<Frames<B>> {
        x.try_map_frames(|frames| self.forward_single_frame(frames))
    }
}

/// Fails with a configuration error when a tensor's channel count differs from
/// the channel count a module was built for.
pub(crate) fn ensure_channels(what: &str, expected: usize, actual: usize) -> StcnvmResult<()> {
    if expected == actual {
        Ok(())
    } else {
        Err(StcnvmError::configuration(format!(
            "{what} expects {expected} channels, got {actual}"
        )))
    }
}

/// Fails with a shape error when two paired inputs disagree in shape.
pub(crate) fn ensure_same_dims<const D: usize>(
    what: &str,
    reference: [usize; D],
    other: [usize; D],
) -> StcnvmResult<()> {
    if reference == other {
        Ok(())
    } else {
        Err(StcnvmError::shape(format!("{what} {reference:?}"), other))
    }
}

/// Fails with a shape error when two paired frames disagree in batch or
/// spatial size. Channel counts may differ.
pub(crate) fn ensure_paired_frames(
    what: &str,
    reference: [usize; 4],
    other: [usize; 4],
) -> StcnvmResult<()> {
    let [batch, _, height, width] = reference;
    let [other_batch, _, other_height, other_width] = other;
    if [batch, height, width] == [other_batch, other_height, other_width] {
        Ok(())
    } else {
        Err(StcnvmError::shape(
            format!("{what} with batch {batch} and spatial size [{height}, {width}]"),
            other,
        ))
    }
}
