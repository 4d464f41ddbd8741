//! # Soft-Split Cross-Attention
//!
//! Token attention over (possibly overlapping) patches. [`SoftSplit`] cuts a
//! map into sliding patches and embeds each one as a token, [`SoftComp`] maps
//! tokens back to patch pixels and folds them into a map of a requested size,
//! with overlapping contributions summed.

use burn::{
    nn::{Dropout, DropoutConfig, Linear, LinearConfig},
    prelude::*,
    tensor::activation::softmax,
};
use burn_extra_ops::{fold4d, unfold_patches, FoldOptions, Identity};

use crate::error::{StcnvmError, StcnvmResult};
use crate::frames::{
    ensure_channels, ensure_paired_frames, ensure_same_dims, fold_time, unfold_time,
};

/// A linear layer, or nothing when the embedding width is configured as zero.
#[derive(Module, Debug)]
enum TokenProjection<B: Backend> {
    Linear(Linear<B>),
    Identity(Identity<B>),
}

impl<B: Backend> TokenProjection<B> {
    fn new(d_input: usize, d_output: Option<usize>, device: &Device<B>) -> Self {
        match d_output {
            Some(d_output) => Self::Linear(LinearConfig::new(d_input, d_output).init(device)),
            None => Self::Identity(Identity::new()),
        }
    }

    fn forward(&self, x: Tensor<B, 3>) -> Tensor<B, 3> {
        match self {
            Self::Linear(linear) => linear.forward(x),
            Self::Identity(identity) => identity.forward(x),
        }
    }
}

/// Configuration for [`SoftSplit`] and [`SoftComp`].
#[derive(Config, Debug)]
pub struct SoftSplitConfig {
    channels: usize,
    /// Token width; `0` keeps the raw flattened patch.
    hidden: usize,
    kernel_size: usize,
    stride: usize,
    padding: usize,
    #[config(default = "0.0")]
    dropout: f64,
}

impl SoftSplitConfig {
    fn validate(&self) -> StcnvmResult<()> {
        if self.channels == 0 || self.kernel_size == 0 || self.stride == 0 {
            return Err(StcnvmError::configuration(format!(
                "soft split needs positive channels, kernel size and stride, got {}, {}, {}",
                self.channels, self.kernel_size, self.stride
            )));
        }
        Ok(())
    }

    const fn patch_width(&self) -> usize {
        self.channels * self.kernel_size * self.kernel_size
    }

    /// Width of the tokens exchanged between split and compose.
    pub const fn token_width(&self) -> usize {
        if self.hidden > 0 {
            self.hidden
        } else {
            self.patch_width()
        }
    }

    fn embedding_width(&self) -> Option<usize> {
        (self.hidden > 0).then_some(self.hidden)
    }

    /// Initializes a new [`SoftSplit`].
    ///
    /// # Errors
    ///
    /// Returns `StcnvmError::InvalidConfiguration` if the channels, kernel
    /// size or stride is zero.
    pub fn init_split<B: Backend>(&self, device: &Device<B>) -> StcnvmResult<SoftSplit<B>> {
        self.validate()?;
        Ok(SoftSplit {
            kernel_size: self.kernel_size,
            options: FoldSettings::new(self.stride, self.padding),
            embedding: TokenProjection::new(self.patch_width(), self.embedding_width(), device),
            dropout: DropoutConfig::new(self.dropout).init(),
        })
    }

    /// Initializes a new [`SoftComp`].
    ///
    /// # Errors
    ///
    /// Same as [`SoftSplitConfig::init_split`].
    pub fn init_comp<B: Backend>(&self, device: &Device<B>) -> StcnvmResult<SoftComp<B>> {
        self.validate()?;
        let embedding = match self.embedding_width() {
            Some(hidden) => {
                TokenProjection::Linear(LinearConfig::new(hidden, self.patch_width()).init(device))
            }
            None => TokenProjection::Identity(Identity::new()),
        };
        Ok(SoftComp {
            kernel_size: self.kernel_size,
            options: FoldSettings::new(self.stride, self.padding),
            embedding,
        })
    }
}

/// Square stride/padding pair, stored on the modules.
#[derive(Module, Clone, Copy, Debug)]
pub struct FoldSettings {
    stride: usize,
    padding: usize,
}

impl FoldSettings {
    const fn new(stride: usize, padding: usize) -> Self {
        Self { stride, padding }
    }

    const fn options(&self) -> FoldOptions {
        FoldOptions::new([self.stride; 2], [self.padding; 2])
    }
}

/// Sliding patches to tokens.
#[derive(Module, Debug)]
pub struct SoftSplit<B: Backend> {
    kernel_size: usize,
    options: FoldSettings,
    embedding: TokenProjection<B>,
    dropout: Dropout,
}

impl<B: Backend> SoftSplit<B> {
    /// `[batch, channels, h, w]` to `[batch, patches, token]`.
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 3> {
        let k = self.kernel_size;
        let patches = unfold_patches(x, [k, k], self.options.options()).swap_dims(1, 2);
        self.dropout.forward(self.embedding.forward(patches))
    }
}

/// Tokens back to a spatial map.
#[derive(Module, Debug)]
pub struct SoftComp<B: Backend> {
    kernel_size: usize,
    options: FoldSettings,
    embedding: TokenProjection<B>,
}

impl<B: Backend> SoftComp<B> {
    /// `[batch, patches, token]` to `[batch, channels, output_size]`.
    ///
    /// # Panics
    ///
    /// Panics if the patch count does not match the block grid of
    /// `output_size`.
    pub fn forward(&self, x: Tensor<B, 3>, output_size: [usize; 2]) -> Tensor<B, 4> {
        let k = self.kernel_size;
        let columns = self.embedding.forward(x).swap_dims(1, 2);
        fold4d(columns, output_size, [k, k], self.options.options())
    }
}

/// Configuration for [`SoftCrossAttention`].
#[derive(Config, Debug)]
pub struct SoftCrossAttentionConfig {
    /// Channels of query, key and value.
    #[config(default = "32")]
    dim: usize,
    /// Token width; `0` keeps raw flattened patches.
    #[config(default = "32")]
    hidden: usize,
    #[config(default = "2")]
    heads: usize,
    #[config(default = "9")]
    patch_size: usize,
    /// Defaults to `patch_size / 2`.
    #[config(default = "None")]
    stride: Option<usize>,
    /// Defaults to `patch_size / 2`.
    #[config(default = "None")]
    padding: Option<usize>,
    /// Embed and project the value path even with a single head.
    #[config(default = "false")]
    project_value: bool,
    #[config(default = "0.0")]
    dropout: f64,
}

impl SoftCrossAttentionConfig {
    /// Initializes a new [`SoftCrossAttention`].
    ///
    /// # Errors
    ///
    /// Returns `StcnvmError::InvalidConfiguration` if the resolved stride is
    /// zero, or if the channels, patch size or head count is zero.
    pub fn init<B: Backend>(&self, device: &Device<B>) -> StcnvmResult<SoftCrossAttention<B>> {
        if self.heads == 0 {
            return Err(StcnvmError::configuration("soft attention needs at least one head"));
        }
        let stride = self.stride.unwrap_or(self.patch_size / 2);
        let padding = self.padding.unwrap_or(self.patch_size / 2);
        let project_value = self.heads > 1 || self.project_value;

        let key_split = SoftSplitConfig::new(self.dim, self.hidden, self.patch_size, stride, padding)
            .with_dropout(self.dropout);
        let value_split = SoftSplitConfig::new(
            self.dim,
            if project_value { self.hidden } else { 0 },
            self.patch_size,
            stride,
            padding,
        )
        .with_dropout(self.dropout);

        let key_width = key_split.token_width();
        let value_width = value_split.token_width();
        let proj_k = LinearConfig::new(key_width, key_width * self.heads).init(device);
        let (proj_v, proj_out) = if project_value {
            (
                TokenProjection::new(value_width, Some(value_width * self.heads), device),
                TokenProjection::new(value_width * self.heads, Some(value_width), device),
            )
        } else {
            (
                TokenProjection::Identity(Identity::new()),
                TokenProjection::Identity(Identity::new()),
            )
        };

        tracing::debug!(
            dim = self.dim,
            hidden = self.hidden,
            heads = self.heads,
            patch_size = self.patch_size,
            stride,
            padding,
            project_value,
            "built soft cross-attention"
        );

        Ok(SoftCrossAttention {
            dim: self.dim,
            heads: self.heads,
            scale: (key_width as f64).powf(-0.5),
            ss_k: key_split.init_split(device)?,
            ss_v: value_split.init_split(device)?,
            sc: value_split.init_comp(device)?,
            proj_k,
            proj_v,
            proj_out,
        })
    }
}

/// Cross-attention between patch tokens of a query map and a key map.
///
/// The query is embedded and projected by the key's layers.
#[derive(Module, Debug)]
pub struct SoftCrossAttention<B: Backend> {
    dim: usize,
    heads: usize,
    scale: f64,
    ss_k: SoftSplit<B>,
    ss_v: SoftSplit<B>,
    sc: SoftComp<B>,
    proj_k: Linear<B>,
    proj_v: TokenProjection<B>,
    proj_out: TokenProjection<B>,
}

impl<B: Backend> SoftCrossAttention<B> {
    /// Attends from `query` to `key`, gathering `value` (defaults to `key`).
    /// The output has the query's shape.
    ///
    /// # Errors
    ///
    /// Returns `StcnvmError::InvalidTensorShape` when key or value disagree
    /// with the query in batch or spatial size and
    /// `StcnvmError::InvalidConfiguration` on a channel mismatch.
    pub fn forward_single_frame(
        &self,
        query: Tensor<B, 4>,
        key: Tensor<B, 4>,
        value: Option<Tensor<B, 4>>,
    ) -> StcnvmResult<Tensor<B, 4>> {
        let value = value.unwrap_or_else(|| key.clone());
        let [_, channels, height, width] = query.dims();
        ensure_channels("soft attention query", self.dim, channels)?;
        ensure_paired_frames("soft attention query", query.dims(), key.dims())?;
        ensure_channels("soft attention key", self.dim, key.dims()[1])?;
        ensure_paired_frames("soft attention query", query.dims(), value.dims())?;
        ensure_channels("soft attention value", self.dim, value.dims()[1])?;

        let m = self.heads;
        // b p (m c) -> b m p c
        let split_heads = |x: Tensor<B, 3>| {
            let [b, p, mc] = x.dims();
            x.reshape([b, p, m, mc / m]).swap_dims(1, 2)
        };
        let q = split_heads(self.proj_k.forward(self.ss_k.forward(query)));
        let k = split_heads(self.proj_k.forward(self.ss_k.forward(key)));
        let v = split_heads(self.proj_v.forward(self.ss_v.forward(value)));

        let attn = softmax(q.matmul(k.swap_dims(2, 3)).mul_scalar(self.scale), 3);

        // b m p c -> b p (m c)
        let out = attn.matmul(v).swap_dims(1, 2);
        let [b, p, _, c] = out.dims();
        let out = self.proj_out.forward(out.reshape([b, p, m * c]));

        Ok(self.sc.forward(out, [height, width]))
    }

    /// Sequence counterpart of [`SoftCrossAttention::forward_single_frame`];
    /// frames attend independently.
    ///
    /// # Errors
    ///
    /// Returns `StcnvmError::InvalidTensorShape` if the sequences differ in
    /// batch size or length, plus the single-frame errors.
    pub fn forward_time_series(
        &self,
        query: Tensor<B, 5>,
        key: Tensor<B, 5>,
        value: Option<Tensor<B, 5>>,
    ) -> StcnvmResult<Tensor<B, 5>> {
        let [b, t, ..] = query.dims();
        for other in core::iter::once(&key).chain(value.as_ref()) {
            let [ob, ot, ..] = other.dims();
            ensure_same_dims("sequence [batch, time]", [b, t], [ob, ot])?;
        }

        let (query, batch_time) = fold_time(query);
        let out = self.forward_single_frame(
            query,
            fold_time(key).0,
            value.map(|value| fold_time(value).0),
        )?;
        Ok(unfold_time(out, batch_time))
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
    fn output_matches_query_size_for_odd_patches() {
        let device = Default::default();

        for (patch_size, [height, width]) in [(9, [8, 8]), (5, [7, 10]), (3, [6, 5])] {
            let attention = SoftCrossAttentionConfig::new()
                .with_dim(4)
                .with_hidden(8)
                .with_patch_size(patch_size)
                .init::<TestBackend>(&device)
                .unwrap();

            let out = attention
                .forward_single_frame(random([2, 4, height, width]), random([2, 4, height, width]), None)
                .unwrap();
            assert_eq!(out.dims(), [2, 4, height, width], "patch size {patch_size}");
        }
    }

    #[test]
    fn single_head_raw_values_and_sequences() {
        let device = Default::default();
        let attention = SoftCrossAttentionConfig::new()
            .with_dim(3)
            .with_hidden(6)
            .with_heads(1)
            .with_patch_size(4)
            .with_stride(Some(4))
            .with_padding(Some(0))
            .init::<TestBackend>(&device)
            .unwrap();

        let out = attention
            .forward_time_series(random([1, 3, 3, 8, 8]), random([1, 3, 3, 8, 8]), None)
            .unwrap();
        assert_eq!(out.dims(), [1, 3, 3, 8, 8]);
    }

    #[test]
    fn constant_values_are_recomposed_per_patch() {
        let device = Default::default();
        // Non-overlapping patches with raw values: every output pixel is a
        // convex combination of value pixels.
        let attention = SoftCrossAttentionConfig::new()
            .with_dim(2)
            .with_hidden(4)
            .with_heads(1)
            .with_patch_size(2)
            .with_stride(Some(2))
            .with_padding(Some(0))
            .init::<TestBackend>(&device)
            .unwrap();
        let value = Tensor::<TestBackend, 4>::full([1, 2, 4, 4], 3.0, &device);

        let out = attention
            .forward_single_frame(random([1, 2, 4, 4]), random([1, 2, 4, 4]), Some(value))
            .unwrap();

        for pixel in out.into_data().to_vec::<f32>().unwrap() {
            assert!((pixel - 3.0).abs() < 1e-4, "pixel {pixel}");
        }
    }

    #[test]
    fn zero_stride_is_rejected() {
        let device = Default::default();

        let explicit = SoftCrossAttentionConfig::new()
            .with_stride(Some(0))
            .init::<TestBackend>(&device);
        assert!(matches!(
            explicit,
            Err(StcnvmError::InvalidConfiguration { .. })
        ));

        // A unit patch halves to a zero stride.
        let derived = SoftCrossAttentionConfig::new()
            .with_patch_size(1)
            .init::<TestBackend>(&device);
        assert!(matches!(
            derived,
            Err(StcnvmError::InvalidConfiguration { .. })
        ));
    }

    #[test]
    fn mismatched_key_is_a_shape_error() {
        let device = Default::default();
        let attention = SoftCrossAttentionConfig::new()
            .with_dim(2)
            .with_hidden(4)
            .init::<TestBackend>(&device)
            .unwrap();

        let result = attention.forward_single_frame(random([1, 2, 8, 8]), random([1, 2, 8, 4]), None);
        assert!(matches!(
            result,
            Err(StcnvmError::InvalidTensorShape { .. })
        ));
    }
}
