//! # Deformable Frame Alignment
//!
//! Each frame is paired with its predecessor deformably aligned to it, and the
//! pair is fused back to the frame's channel count. The last frame is handed
//! back so the next chunk of a stream can continue the chain.

use burn::prelude::*;

use super::{AlignDeformConv2d, AlignDeformConv2dConfig, FeatureFusion, FeatureFusionConfig};
use crate::config::FusionStyle;
use crate::error::{StcnvmError, StcnvmResult};
use crate::frames::{ensure_channels, ensure_same_dims, FrameModule};

/// Configuration for [`DeformableFrameAlign`].
#[derive(Config, Debug)]
pub struct DeformableFrameAlignConfig {
    channels: usize,
}

impl DeformableFrameAlignConfig {
    /// Initializes a new [`DeformableFrameAlign`].
    ///
    /// # Errors
    ///
    /// Returns `StcnvmError::InvalidConfiguration` if `channels` is zero.
    pub fn init<B: Backend>(&self, device: &Device<B>) -> StcnvmResult<DeformableFrameAlign<B>> {
        let c = self.channels;
        ensure_positive(c)?;

        tracing::debug!(channels = c, "built deformable frame alignment");

        Ok(DeformableFrameAlign {
            channels: c,
            dfconv: AlignDeformConv2dConfig::new(c, c, c).init(device)?,
            fuse: FeatureFusionConfig::new(c * 2, c)
                .with_style(FusionStyle::AttnRes)
                .init(device),
        })
    }
}

fn ensure_positive(channels: usize) -> StcnvmResult<()> {
    if channels == 0 {
        Err(StcnvmError::configuration(
            "frame alignment needs at least one channel",
        ))
    } else {
        Ok(())
    }
}

/// Aligns every frame's predecessor to it and fuses `[frame, aligned]`.
#[derive(Module, Debug)]
pub struct DeformableFrameAlign<B: Backend> {
    channels: usize,
    dfconv: AlignDeformConv2d<B>,
    fuse: FeatureFusion<B>,
}

impl<B: Backend> DeformableFrameAlign<B> {
    /// Aligns `[batch, time, channels, h, w]`; the first frame's predecessor is
    /// `prev` (`[batch, channels, h, w]`) or the first frame itself.
    ///
    /// Returns the fused sequence and the last input frame.
    ///
    /// # Errors
    ///
    /// Returns `StcnvmError::InvalidConfiguration` on a channel mismatch and
    /// `StcnvmError::InvalidTensorShape` when `prev` does not have the shape of
    /// one frame.
    pub fn forward_time_series(
        &self,
        x: Tensor<B, 5>,
        prev: Option<Tensor<B, 4>>,
    ) -> StcnvmResult<(Tensor<B, 5>, Tensor<B, 4>)> {
        let [b, t, c, h, w] = x.dims();
        ensure_channels("frame alignment", self.channels, c)?;
        if t == 0 {
            return Err(StcnvmError::shape("a sequence of at least one frame", x.dims()));
        }
        let frame = [b, c, h, w];
        let prev = match prev {
            Some(prev) => {
                ensure_same_dims("previous frame", frame, prev.dims())?;
                prev.unsqueeze_dim(1)
            }
            None => x.clone().narrow(1, 0, 1),
        };

        let predecessors = if t == 1 {
            prev
        } else {
            Tensor::cat(vec![prev, x.clone().narrow(1, 0, t - 1)], 1)
        };
        let aligned = self.dfconv.forward_time_series(predecessors, x.clone())?;
        let fused = self
            .fuse
            .forward_time_series(Tensor::cat(vec![x.clone(), aligned], 2))?;

        Ok((fused, x.narrow(1, t - 1, 1).reshape(frame)))
    }

    /// Single-frame counterpart: `prev` (or the frame itself) is aligned to
    /// `x`. Returns the fused frame and `x`.
    ///
    /// # Errors
    ///
    /// Same as [`DeformableFrameAlign::forward_time_series`].
    pub fn forward_single_frame(
        &self,
        x: Tensor<B, 4>,
        prev: Option<Tensor<B, 4>>,
    ) -> StcnvmResult<(Tensor<B, 4>, Tensor<B, 4>)> {
        ensure_channels("frame alignment", self.channels, x.dims()[1])?;
        let prev = match prev {
            Some(prev) => {
                ensure_same_dims("previous frame", x.dims(), prev.dims())?;
                prev
            }
            None => x.clone(),
        };

        let aligned = self.dfconv.forward_single_frame(prev, x.clone())?;
        let fused = self
            .fuse
            .forward_single_frame(Tensor::cat(vec![x.clone(), aligned], 1))?;
        Ok((fused, x))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::{backend::NdArray, tensor::Distribution};

    type TestBackend = NdArray;

    fn random<const D: usize>(shape: [usize; D]) -> Tensor<TestBackend, D> {
        Tensor::random(shape, Distribution::Normal(0.0, 1.0), &Default::default())
    }

    #[test]
    fn sequence_returns_fused_frames_and_last_frame() {
        let device = Default::default();
        let align = DeformableFrameAlignConfig::new(4)
            .init::<TestBackend>(&device)
            .unwrap();
        let x = random([2, 3, 4, 6, 6]);

        let (out, last) = align.forward_time_series(x.clone(), None).unwrap();

        assert_eq!(out.dims(), [2, 3, 4, 6, 6]);
        let expected = x.narrow(1, 2, 1).reshape([2, 4, 6, 6]);
        last.into_data().assert_eq(&expected.into_data(), true);
    }

    #[test]
    fn carried_frame_continues_the_chain() {
        let device = Default::default();
        let align = DeformableFrameAlignConfig::new(4)
            .init::<TestBackend>(&device)
            .unwrap();
        let x = random([1, 4, 4, 5, 5]);

        // Splitting a stream in two chunks and carrying the last frame gives
        // the same result as processing it at once.
        let (whole, _) = align.forward_time_series(x.clone(), None).unwrap();
        let (head, carried) = align
            .forward_time_series(x.clone().narrow(1, 0, 2), None)
            .unwrap();
        let (tail, _) = align
            .forward_time_series(x.narrow(1, 2, 2), Some(carried))
            .unwrap();

        let chunked = Tensor::cat(vec![head, tail], 1);
        let diff = (whole - chunked).abs().max().into_scalar();
        assert!(diff < 1e-5, "chunked stream diverged by {diff}");
    }

    #[test]
    fn single_frame_aligns_to_itself_by_default() {
        let device = Default::default();
        let align = DeformableFrameAlignConfig::new(3)
            .init::<TestBackend>(&device)
            .unwrap();
        let x = random([1, 3, 4, 4]);

        let (own, _) = align.forward_single_frame(x.clone(), None).unwrap();
        let (explicit, _) = align.forward_single_frame(x.clone(), Some(x)).unwrap();

        own.into_data().assert_eq(&explicit.into_data(), true);
    }

    #[test]
    fn previous_frame_shape_is_checked() {
        let device = Default::default();
        let align = DeformableFrameAlignConfig::new(3)
            .init::<TestBackend>(&device)
            .unwrap();

        let result = align.forward_time_series(random([1, 2, 3, 4, 4]), Some(random([2, 3, 4, 4])));
        assert!(matches!(
            result,
            Err(StcnvmError::InvalidTensorShape { .. })
        ));
    }
}
