//! # Recurrent Temporal Fusion
//!
//! A convolutional GRU whose hidden state is first adjusted by a context
//! strategy before the gates run:
//!
//! ```text
//! h' = context(x, h)
//! r, z = split(sigmoid(conv_ih([x, h'])))
//! c = tanh(conv_hh([x, r * h']))
//! h_next = (1 - z) * h' + z * c
//! ```
//!
//! The strategies are the [`TemporalContext`] variants, selected by
//! [`TemporalFusion`]. The cell keeps no state of its own: the hidden state is
//! passed in and handed back, and `None` starts a fresh sequence from zeros.

use burn::{
    nn::{
        conv::{Conv2d, Conv2dConfig},
        PaddingConfig2d,
    },
    prelude::*,
    tensor::activation::{sigmoid, tanh},
};

use super::{
    AlignDeformConv2d, AlignDeformConv2dConfig, FocalModulation, FocalModulationConfig,
    SoftCrossAttention, SoftCrossAttentionConfig,
};
use crate::config::TemporalFusion;
use crate::error::{StcnvmError, StcnvmResult};
use crate::frames::{ensure_channels, ensure_same_dims, Frames};

/// Derives the context-adjusted hidden state from the current input and the
/// previous hidden state, both `[batch, channels, height, width]`.
pub trait ContextFn<B: Backend> {
    /// Returns `h'` with the shape of `h`.
    ///
    /// # Errors
    ///
    /// Propagates the shape and channel checks of the underlying module.
    fn context(&self, x: Tensor<B, 4>, h: Tensor<B, 4>) -> StcnvmResult<Tensor<B, 4>>;
}

/// The hidden state deformably resampled under the guidance of the input.
impl<B: Backend> ContextFn<B> for AlignDeformConv2d<B> {
    fn context(&self, x: Tensor<B, 4>, h: Tensor<B, 4>) -> StcnvmResult<Tensor<B, 4>> {
        self.forward_single_frame(h, x)
    }
}

/// The hidden state modulated by context aggregated from the input.
impl<B: Backend> ContextFn<B> for FocalModulation<B> {
    fn context(&self, x: Tensor<B, 4>, h: Tensor<B, 4>) -> StcnvmResult<Tensor<B, 4>> {
        self.forward(h, Some(x))
    }
}

/// The input's patches attending to the hidden state's patches.
impl<B: Backend> ContextFn<B> for SoftCrossAttention<B> {
    fn context(&self, x: Tensor<B, 4>, h: Tensor<B, 4>) -> StcnvmResult<Tensor<B, 4>> {
        self.forward_single_frame(x, h, None)
    }
}

/// `(h + tanh(ctx)) / 2`
fn blend<B: Backend>(h: Tensor<B, 4>, ctx: Tensor<B, 4>) -> Tensor<B, 4> {
    (h + tanh(ctx)).mul_scalar(0.5)
}

/// Context strategies of [`ConvGru`].
#[derive(Module, Debug)]
pub enum TemporalContext<B: Backend> {
    /// The hidden state as is.
    Plain(burn_extra_ops::Identity<B>),
    /// The hidden state aligned to the input.
    Deformable(AlignDeformConv2d<B>),
    /// The hidden state replaced by its focal modulation.
    Focal(FocalModulation<B>),
    /// The hidden state blended with its focal modulation.
    FocalResidual(FocalModulation<B>),
    /// The hidden state blended with soft cross-attention from the input.
    Attention(SoftCrossAttention<B>),
}

impl<B: Backend> ContextFn<B> for TemporalContext<B> {
    fn context(&self, x: Tensor<B, 4>, h: Tensor<B, 4>) -> StcnvmResult<Tensor<B, 4>> {
        match self {
            Self::Plain(identity) => Ok(identity.forward(h)),
            Self::Deformable(align) => align.context(x, h),
            Self::Focal(focal) => focal.context(x, h),
            Self::FocalResidual(focal) => Ok(blend(h.clone(), focal.context(x, h)?)),
            Self::Attention(attention) => Ok(blend(h.clone(), attention.context(x, h)?)),
        }
    }
}

/// Configuration for [`ConvGru`].
#[derive(Config, Debug)]
pub struct ConvGruConfig {
    channels: usize,
    #[config(default = "3")]
    kernel_size: usize,
    /// Defaults to `kernel_size / 2`.
    #[config(default = "None")]
    padding: Option<usize>,
    #[config(default = "TemporalFusion::ConvGru")]
    fusion: TemporalFusion,
    /// First focal kernel of the focal variants.
    #[config(default = "5")]
    focal_window: usize,
    /// Focal levels of the focal variants.
    #[config(default = "4")]
    focal_level: usize,
    /// Token width of the attention variant.
    #[config(default = "16")]
    attn_hidden: usize,
    /// Patch size of the attention variant.
    #[config(default = "9")]
    attn_patch_size: usize,
    /// Heads of the attention variant.
    #[config(default = "1")]
    attn_heads: usize,
}

impl ConvGruConfig {
    /// Initializes a new [`ConvGru`].
    ///
    /// # Errors
    ///
    /// Returns `StcnvmError::InvalidConfiguration` if the channels or kernel
    /// size is zero, if the gate convolutions would change the spatial size,
    /// or if the context module rejects its configuration.
    pub fn init<B: Backend>(&self, device: &Device<B>) -> StcnvmResult<ConvGru<B>> {
        if self.channels == 0 || self.kernel_size == 0 {
            return Err(StcnvmError::configuration(format!(
                "recurrent cell needs positive channels and kernel size, got {} and {}",
                self.channels, self.kernel_size
            )));
        }
        let c = self.channels;
        let padding = self.padding.unwrap_or(self.kernel_size / 2);
        if 2 * padding + 1 != self.kernel_size {
            return Err(StcnvmError::configuration(format!(
                "gate kernel {} with padding {padding} does not keep the spatial size",
                self.kernel_size
            )));
        }
        let gate_conv = |out_channels: usize| {
            Conv2dConfig::new([c * 2, out_channels], [self.kernel_size, self.kernel_size])
                .with_padding(PaddingConfig2d::Explicit(padding, padding))
                .init(device)
        };

        let focal = || {
            FocalModulationConfig::new(c)
                .with_focal_window(self.focal_window)
                .with_focal_level(self.focal_level)
                .init(device)
        };
        let context = match self.fusion {
            TemporalFusion::ConvGru => TemporalContext::Plain(burn_extra_ops::Identity::new()),
            TemporalFusion::DeformableGru => {
                TemporalContext::Deformable(AlignDeformConv2dConfig::new(c, c, c).init(device)?)
            }
            TemporalFusion::FocalGru => TemporalContext::Focal(focal()?),
            TemporalFusion::FocalGruResidual => TemporalContext::FocalResidual(focal()?),
            TemporalFusion::AttnGru => TemporalContext::Attention(
                SoftCrossAttentionConfig::new()
                    .with_dim(c)
                    .with_hidden(self.attn_hidden)
                    .with_heads(self.attn_heads)
                    .with_patch_size(self.attn_patch_size)
                    .with_project_value(true)
                    .init(device)?,
            ),
        };

        tracing::debug!(
            channels = c,
            kernel_size = self.kernel_size,
            fusion = ?self.fusion,
            "built recurrent cell"
        );

        Ok(ConvGru {
            channels: c,
            ih: gate_conv(c * 2),
            hh: gate_conv(c),
            context,
        })
    }
}

/// Convolutional GRU with a pluggable hidden-state context.
#[derive(Module, Debug)]
pub struct ConvGru<B: Backend> {
    channels: usize,
    ih: Conv2d<B>,
    hh: Conv2d<B>,
    context: TemporalContext<B>,
}

impl<B: Backend> ConvGru<B> {
    fn zeros_state(&self, x_dims: [usize; 4], device: &Device<B>) -> Tensor<B, 4> {
        let [b, _, h, w] = x_dims;
        Tensor::zeros([b, self.channels, h, w], device)
    }

    fn step(&self, x: Tensor<B, 4>, h: Tensor<B, 4>) -> StcnvmResult<Tensor<B, 4>> {
        let c = self.channels;
        let h = self.context.context(x.clone(), h)?;

        let rz = sigmoid(self.ih.forward(Tensor::cat(vec![x.clone(), h.clone()], 1)));
        let r = rz.clone().narrow(1, 0, c);
        let z = rz.narrow(1, c, c);
        let candidate = tanh(self.hh.forward(Tensor::cat(vec![x, r * h.clone()], 1)));

        Ok(z.clone().neg().add_scalar(1.0) * h + z * candidate)
    }

    /// One recurrent step on `[batch, channels, height, width]`.
    ///
    /// Returns the step output and the new hidden state, which are equal.
    ///
    /// # Errors
    ///
    /// Returns `StcnvmError::InvalidConfiguration` on a channel mismatch and
    /// `StcnvmError::InvalidTensorShape` when `h` does not have the shape of
    /// `x`.
    pub fn forward_single_frame(
        &self,
        x: Tensor<B, 4>,
        h: Option<Tensor<B, 4>>,
    ) -> StcnvmResult<(Tensor<B, 4>, Tensor<B, 4>)> {
        let dims = x.dims();
        ensure_channels("recurrent cell", self.channels, dims[1])?;
        let h = match h {
            Some(h) => {
                ensure_same_dims("hidden state", dims, h.dims())?;
                h
            }
            None => self.zeros_state(dims, &x.device()),
        };

        let h = self.step(x, h)?;
        Ok((h.clone(), h))
    }

    /// Steps through `[batch, time, channels, height, width]` in time order.
    ///
    /// Returns the stacked step outputs and the final hidden state.
    ///
    /// # Errors
    ///
    /// Same as [`ConvGru::forward_single_frame`].
    pub fn forward_time_series(
        &self,
        x: Tensor<B, 5>,
        h: Option<Tensor<B, 4>>,
    ) -> StcnvmResult<(Tensor<B, 5>, Tensor<B, 4>)> {
        let [b, t, c, height, width] = x.dims();
        ensure_channels("recurrent cell", self.channels, c)?;
        let frame = [b, c, height, width];
        let mut h = match h {
            Some(h) => {
                ensure_same_dims("hidden state", frame, h.dims())?;
                h
            }
            None => self.zeros_state(frame, &x.device()),
        };

        let mut outputs = Vec::with_capacity(t);
        for i in 0..t {
            let xt = x.clone().narrow(1, i, 1).reshape(frame);
            h = self.step(xt, h)?;
            outputs.push(h.clone());
        }

        Ok((Tensor::stack(outputs, 1), h))
    }

    /// Dispatches on the layout of `x`.
    ///
    /// # Errors
    ///
    /// Same as the entry point used.
    pub fn forward(
        &self,
        x: Frames<B>,
        h: Option<Tensor<B, 4>>,
    ) -> StcnvmResult<(Frames<B>, Tensor<B, 4>)> {
        match x {
            Frames::Single(x) => self
                .forward_single_frame(x, h)
                .map(|(out, h)| (Frames::Single(out), h)),
            Frames::Sequence(x) => self
                .forward_time_series(x, h)
                .map(|(out, h)| (Frames::Sequence(out), h)),
        }
    }

    /// The context strategy in use.
    pub const fn context(&self) -> &TemporalContext<B> {
        &self.context
    }
}
