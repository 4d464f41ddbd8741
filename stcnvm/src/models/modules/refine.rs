//! # Trimap Refinement
//!
//! Pastes a fine prediction into an upsampled coarse one wherever the coarse
//! prediction is undecided, i.e. strictly between `eps` and `1 - eps`. The
//! undecided band can be widened by a square binary dilation.

use burn::{
    module::Param,
    prelude::*,
    tensor::{
        activation::sigmoid,
        module::interpolate,
        ops::{InterpolateMode, InterpolateOptions},
    },
};
use burn_extra_ops::{structuring_element, TensorExtraOps};

use crate::error::{StcnvmError, StcnvmResult};
use crate::frames::{ensure_same_dims, fold_time, unfold_time};

/// Configuration for [`TrimapRefiner`].
#[derive(Config, Debug)]
pub struct TrimapRefinerConfig {
    /// Values within `eps` of 0 or 1 count as decided.
    #[config(default = "1e-5")]
    eps: f64,
    /// Largest dilation width accepted by the forward pass.
    #[config(default = "15")]
    max_dilate: usize,
}

impl TrimapRefinerConfig {
    /// Initializes a new [`TrimapRefiner`], building every structuring element
    /// up front.
    pub fn init<B: Backend>(&self, device: &Device<B>) -> TrimapRefiner<B> {
        let kernels = (1..=self.max_dilate)
            .map(|width| {
                Param::from_tensor(structuring_element(width, device)).set_require_grad(false)
            })
            .collect();

        tracing::debug!(
            eps = self.eps,
            max_dilate = self.max_dilate,
            "built trimap refiner"
        );

        TrimapRefiner {
            eps: self.eps,
            kernels,
        }
    }
}

/// Boundary-aware blending of a coarse and a fine prediction.
#[derive(Module, Debug)]
pub struct TrimapRefiner<B: Backend> {
    eps: f64,
    /// `kernels[w - 1]` is the `w × w` structuring element.
    kernels: Vec<Param<Tensor<B, 4>>>,
}

impl<B: Backend> TrimapRefiner<B> {
    /// Refines `small` (`[batch, channels, h, w]`) with `large`
    /// (`[batch, channels, H, W]`).
    ///
    /// `dilate_width == 0` disables dilation. With `sigmoid_input`, `small` holds
    /// logits and the band is computed on their sigmoid.
    ///
    /// # Errors
    ///
    /// Returns `StcnvmError::InvalidConfiguration` if `dilate_width` exceeds
    /// the configured maximum and `StcnvmError::InvalidTensorShape` when the
    /// two inputs differ in batch or channel count.
    pub fn forward_single_frame(
        &self,
        small: Tensor<B, 4>,
        large: Tensor<B, 4>,
        dilate_width: usize,
        sigmoid_input: bool,
    ) -> StcnvmResult<Tensor<B, 4>> {
        if dilate_width > self.kernels.len() {
            return Err(StcnvmError::configuration(format!(
                "dilation width {dilate_width} exceeds the maximum of {}",
                self.kernels.len()
            )));
        }
        let [b, c, _, _] = small.dims();
        let [lb, lc, height, width] = large.dims();
        ensure_same_dims("fine prediction [batch, channels]", [b, c], [lb, lc])?;

        let up = interpolate(
            small,
            [height, width],
            InterpolateOptions::new(InterpolateMode::Nearest),
        );
        let trans = if sigmoid_input {
            sigmoid(up.clone())
        } else {
            up.clone()
        };
        let mask = trans.clone().greater_elem(self.eps).float()
            * trans.lower_elem(1.0 - self.eps).float();
        let mask = match dilate_width {
            0 => mask,
            w => mask.binary_dilation(self.kernels[w - 1].val()),
        };

        Ok(mask.clone() * large + mask.neg().add_scalar(1.0) * up)
    }

    /// Sequence counterpart of [`TrimapRefiner::forward_single_frame`].
    ///
    /// # Errors
    ///
    /// Returns `StcnvmError::InvalidTensorShape` if the two sequences differ in
    /// batch size or length, plus the single-frame errors.
    pub fn forward_time_series(
        &self,
        small: Tensor<B, 5>,
        large: Tensor<B, 5>,
        dilate_width: usize,
        sigmoid_input: bool,
    ) -> StcnvmResult<Tensor<B, 5>> {
        let [b, t, ..] = small.dims();
        let [lb, lt, ..] = large.dims();
        ensure_same_dims("fine sequence [batch, time]", [b, t], [lb, lt])?;

        let (small, batch_time) = fold_time(small);
        let (large, _) = fold_time(large);
        let out = self.forward_single_frame(small, large, dilate_width, sigmoid_input)?;
        Ok(unfold_time(out, batch_time))
    }

    /// Largest accepted dilation width.
    pub fn max_dilate(&self) -> usize {
        self.kernels.len()
    }
}
