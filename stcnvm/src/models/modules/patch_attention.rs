//! # Patch Attention
//!
//! Multi-head attention between non-overlapping square patches. Queries and
//! keys are one token per patch, produced by a convolutional stem that halves
//! the patch down to a single pixel. Values are the raw patch contents, so the
//! attention output can be folded straight back into the spatial layout.
//!
//! For sequences, time is flattened into the token axis: every patch of every
//! query frame attends to every patch of every key frame.

use burn::{
    nn::{
        conv::{Conv2d, Conv2dConfig},
        pool::{MaxPool2d, MaxPool2dConfig},
        PaddingConfig2d, Relu,
    },
    prelude::*,
    tensor::activation::softmax,
};
use burn_extra_ops::{fold4d, unfold_patches, FoldOptions, Identity};

use crate::error::{StcnvmError, StcnvmResult};
use crate::frames::{ensure_channels, ensure_same_dims, fold_time, unfold_time};

/// Configuration for [`PatchAttention`].
#[derive(Config, Debug)]
pub struct PatchAttentionConfig {
    /// Channels of the query and key maps.
    #[config(default = "32")]
    dim: usize,
    /// Query/key channels per head.
    #[config(default = "32")]
    attn_dim: usize,
    #[config(default = "2")]
    heads: usize,
    /// Bias on the value projection.
    #[config(default = "false")]
    qkv_bias: bool,
    /// Side of the square patches; must be a power of two.
    #[config(default = "16")]
    patch_size: usize,
    /// Channels of the optional extra value concatenated to the key map.
    #[config(default = "0")]
    extra_value_channels: usize,
}

impl PatchAttentionConfig {
    /// Initializes a new [`PatchAttention`].
    ///
    /// # Errors
    ///
    /// Returns `StcnvmError::InvalidConfiguration` if the patch size is not a
    /// power of two or if a channel count or the head count is zero.
    pub fn init<B: Backend>(&self, device: &Device<B>) -> StcnvmResult<PatchAttention<B>> {
        if !self.patch_size.is_power_of_two() {
            return Err(StcnvmError::configuration(format!(
                "patch size must be a power of two, got {}",
                self.patch_size
            )));
        }
        if self.dim == 0 || self.attn_dim == 0 || self.heads == 0 {
            return Err(StcnvmError::configuration(format!(
                "dim, attn_dim and heads must be positive, got {}, {}, {}",
                self.dim, self.attn_dim, self.heads
            )));
        }

        let depth = self.patch_size.trailing_zeros() as usize;
        let qk_channels = self.attn_dim * self.heads;
        let conv_q = ConvStemConfig::new(self.dim, qk_channels, depth).init(device);
        let conv_k = ConvStemConfig::new(self.dim, qk_channels, depth).init(device);

        let value_channels = self.dim + self.extra_value_channels;
        let (conv_v, merge_v) = if self.heads > 1 {
            (
                PointwiseProjection::Conv(
                    Conv2dConfig::new([value_channels, self.dim * self.heads], [1, 1])
                        .with_bias(self.qkv_bias)
                        .init(device),
                ),
                PointwiseProjection::Conv(
                    Conv2dConfig::new([self.dim * self.heads, self.dim], [1, 1]).init(device),
                ),
            )
        } else {
            (
                PointwiseProjection::Identity(Identity::new()),
                PointwiseProjection::Identity(Identity::new()),
            )
        };

        tracing::debug!(
            dim = self.dim,
            heads = self.heads,
            patch_size = self.patch_size,
            stem_depth = depth,
            "built patch attention"
        );

        Ok(PatchAttention {
            dim: self.dim,
            attn_dim: self.attn_dim,
            heads: self.heads,
            patch_size: self.patch_size,
            extra_value_channels: self.extra_value_channels,
            scale: (self.dim as f64).powf(-0.5),
            conv_q,
            conv_k,
            conv_v,
            merge_v,
        })
    }
}

/// A 1×1 convolution, or nothing when a single head makes it redundant.
#[derive(Module, Debug)]
enum PointwiseProjection<B: Backend> {
    Conv(Conv2d<B>),
    Identity(Identity<B>),
}

impl<B: Backend> PointwiseProjection<B> {
    fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        match self {
            Self::Conv(conv) => conv.forward(x),
            Self::Identity(identity) => identity.forward(x),
        }
    }
}

#[derive(Config, Debug)]
struct ConvStemConfig {
    in_channels: usize,
    out_channels: usize,
    /// Number of halvings, `log2(patch_size)`.
    depth: usize,
}

impl ConvStemConfig {
    fn init<B: Backend>(&self, device: &Device<B>) -> ConvStem<B> {
        let blocks = (0..self.depth)
            .map(|i| {
                let in_channels = if i == 0 {
                    self.in_channels
                } else {
                    self.out_channels
                };
                Conv2dConfig::new([in_channels, self.out_channels], [3, 3])
                    .with_padding(PaddingConfig2d::Explicit(1, 1))
                    .init(device)
            })
            .collect::<Vec<_>>();
        let stem_out = if self.depth == 0 {
            self.in_channels
        } else {
            self.out_channels
        };

        ConvStem {
            blocks,
            pool: MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init(),
            relu: Relu::new(),
            proj: Conv2dConfig::new([stem_out, self.out_channels], [1, 1]).init(device),
        }
    }
}

/// `depth` × (conv3×3 → maxpool 2 → ReLU), then a 1×1 conv.
///
/// Reduces every `2^depth` patch to one pixel.
#[derive(Module, Debug)]
struct ConvStem<B: Backend> {
    blocks: Vec<Conv2d<B>>,
    pool: MaxPool2d,
    relu: Relu,
    proj: Conv2d<B>,
}

impl<B: Backend> ConvStem<B> {
    fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.blocks.iter().fold(x, |x, conv| {
            self.relu.forward(self.pool.forward(conv.forward(x)))
        });
        self.proj.forward(x)
    }
}

/// Attention across non-overlapping patches, jointly over all frames.
#[derive(Module, Debug)]
pub struct PatchAttention<B: Backend> {
    dim: usize,
    attn_dim: usize,
    heads: usize,
    patch_size: usize,
    extra_value_channels: usize,
    scale: f64,
    conv_q: ConvStem<B>,
    conv_k: ConvStem<B>,
    conv_v: PointwiseProjection<B>,
    merge_v: PointwiseProjection<B>,
}

impl<B: Backend> PatchAttention<B> {
    /// Attends from `query` to `key` (or to `query` itself).
    ///
    /// # Shapes
    /// - query: `[batch, time, dim, height, width]`
    /// - key: `[batch, key_time, dim, height, width]`
    /// - extra_value: `[batch, key_time, extra_value_channels, height, width]`
    /// - output: `[batch, time, out, height, width]` where `out` is `dim`, or
    ///   `dim + extra_value_channels` for a single head
    /// - attention: `[batch, heads, time * patches, key_time * patches]`
    ///
    /// # Errors
    ///
    /// Returns `StcnvmError::InvalidTensorShape` if the spatial size is not a
    /// multiple of the patch size, if the key disagrees with the query in
    /// batch or spatial size, or if the extra value does not match the key, and `StcnvmError::InvalidConfiguration` on a channel mismatch.
    pub fn forward_time_series(
        &self,
        query: Tensor<B, 5>,
        key: Option<Tensor<B, 5>>,
        extra_value: Option<Tensor<B, 5>>,
    ) -> StcnvmResult<(Tensor<B, 5>, Tensor<B, 4>)> {
        let [b, t, c, h, w] = query.dims();
        ensure_channels("patch attention query", self.dim, c)?;
        let p = self.patch_size;
        if h % p != 0 || w % p != 0 {
            return Err(StcnvmError::shape(
                format!("spatial size divisible by patch size {p}"),
                [h, w],
            ));
        }

        let key = match key {
            Some(key) => {
                let [kb, _, kc, kh, kw] = key.dims();
                ensure_same_dims(
                    "key [batch, channels, h, w] matching query",
                    [b, c, h, w],
                    [kb, kc, kh, kw],
                )?;
                key
            }
            None => query.clone(),
        };
        let [_, tk, _, _, _] = key.dims();
        let (query, batch_time) = fold_time(query);
        let (key, _) = fold_time(key);

        let value = match extra_value {
            Some(extra) => {
                let [eb, et, ec, eh, ew] = extra.dims();
                ensure_same_dims(
                    "extra value [batch, key_time, h, w]",
                    [b, tk, h, w],
                    [eb, et, eh, ew],
                )?;
                ensure_channels("patch attention extra value", self.extra_value_channels, ec)?;
                Tensor::cat(vec![key.clone(), fold_time(extra).0], 1)
            }
            None => {
                ensure_channels("patch attention extra value", self.extra_value_channels, 0)?;
                key.clone()
            }
        };

        let m = self.heads;
        let blocks = (h / p) * (w / p);
        let options = FoldOptions::new([p, p], [0, 0]);

        // (b tk) (m c) l -> b m (tk l) c
        let v = unfold_patches(self.conv_v.forward(value), [p, p], options);
        let [_, v_columns, _] = v.dims();
        let head_columns = v_columns / m;
        let v = v
            .reshape([b, tk, m, head_columns, blocks])
            .permute([0, 2, 1, 4, 3])
            .reshape([b, m, tk * blocks, head_columns]);

        // (b t) (m c) h w -> b m c (t h w)
        let tokens = |x: Tensor<B, 4>, frames: usize| {
            x.reshape([b, frames, m, self.attn_dim, blocks])
                .permute([0, 2, 3, 1, 4])
                .reshape([b, m, self.attn_dim, frames * blocks])
        };
        let q = tokens(self.conv_q.forward(query), t);
        let k = tokens(self.conv_k.forward(key), tk);

        let attn = softmax(q.swap_dims(2, 3).matmul(k).mul_scalar(self.scale), 3);

        // b m (t l) c -> (b t m) c l
        let out = attn
            .clone()
            .matmul(v)
            .reshape([b, m, t, blocks, head_columns])
            .permute([0, 2, 1, 4, 3])
            .reshape([b * t * m, head_columns, blocks]);
        let out = fold4d(out, [h, w], [p, p], options);

        // (b t m) c h w -> (b t) (c m) h w
        let [_, head_channels, _, _] = out.dims();
        let out = out
            .reshape([b * t, m, head_channels, h, w])
            .swap_dims(1, 2)
            .reshape([b * t, head_channels * m, h, w]);
        let out = self.merge_v.forward(out);

        Ok((unfold_time(out, batch_time), attn))
    }

    /// Single-frame entry point, treated as a sequence of length one.
    ///
    /// # Errors
    ///
    /// Same as [`PatchAttention::forward_time_series`].
    pub fn forward_single_frame(
        &self,
        query: Tensor<B, 4>,
        key: Option<Tensor<B, 4>>,
        extra_value: Option<Tensor<B, 4>>,
    ) -> StcnvmResult<(Tensor<B, 4>, Tensor<B, 4>)> {
        let (out, attn) = self.forward_time_series(
            query.unsqueeze_dim(1),
            key.map(|key| key.unsqueeze_dim(1)),
            extra_value.map(|extra| extra.unsqueeze_dim(1)),
        )?;
        Ok((out.squeeze(1), attn))
    }

    /// Number of attention heads.
    pub const fn heads(&self) -> usize {
        self.heads
    }
}
