//! # Building Blocks
//!
//! Small convolutional blocks shared by the fusion and alignment modules.

use burn::{
    nn::{
        conv::{Conv2d, Conv2dConfig},
        BatchNorm, BatchNormConfig, Linear, LinearConfig, PaddingConfig2d, Relu,
    },
    prelude::*,
    tensor::activation::{leaky_relu, sigmoid},
};

use crate::error::{StcnvmError, StcnvmResult};
use crate::frames::{ensure_channels, fold_time, unfold_time, FrameModule};

/// Configuration for [`ResBlock`].
#[derive(Config, Debug)]
pub struct ResBlockConfig {
    in_channels: usize,
    /// Defaults to `in_channels`.
    #[config(default = "None")]
    out_channels: Option<usize>,
}

impl ResBlockConfig {
    /// Initializes a new [`ResBlock`].
    pub fn init<B: Backend>(&self, device: &Device<B>) -> ResBlock<B> {
        let out_channels = self.out_channels.unwrap_or(self.in_channels);
        let conv3x3 = |in_channels: usize| {
            Conv2dConfig::new([in_channels, out_channels], [3, 3])
                .with_padding(PaddingConfig2d::Explicit(1, 1))
                .init(device)
        };

        ResBlock {
            conv1: conv3x3(self.in_channels),
            conv2: conv3x3(out_channels),
            downsample: (self.in_channels != out_channels).then(|| conv3x3(self.in_channels)),
            relu: Relu::new(),
        }
    }
}

/// Pre-activation residual block: `x + conv2(relu(conv1(relu(x))))`, with a
/// 3×3 convolution on the shortcut when the channel count changes.
#[derive(Module, Debug)]
pub struct ResBlock<B: Backend> {
    conv1: Conv2d<B>,
    conv2: Conv2d<B>,
    downsample: Option<Conv2d<B>>,
    relu: Relu,
}

impl<B: Backend> ResBlock<B> {
    /// Forward pass.
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let r = self.conv1.forward(self.relu.forward(x.clone()));
        let r = self.conv2.forward(self.relu.forward(r));
        let x = match &self.downsample {
            Some(downsample) => downsample.forward(x),
            None => x,
        };
        x + r
    }
}

/// Configuration for [`Cbam`].
#[derive(Config, Debug)]
pub struct CbamConfig {
    channels: usize,
    /// Channel gate bottleneck is `channels / reduction_ratio`, at least one.
    #[config(default = "16")]
    reduction_ratio: usize,
}

impl CbamConfig {
    /// Initializes a new [`Cbam`].
    pub fn init<B: Backend>(&self, device: &Device<B>) -> Cbam<B> {
        let hidden = (self.channels / self.reduction_ratio.max(1)).max(1);

        Cbam {
            mlp_in: LinearConfig::new(self.channels, hidden).init(device),
            mlp_out: LinearConfig::new(hidden, self.channels).init(device),
            relu: Relu::new(),
            spatial_conv: Conv2dConfig::new([2, 1], [7, 7])
                .with_padding(PaddingConfig2d::Explicit(3, 3))
                .with_bias(false)
                .init(device),
            spatial_bn: BatchNormConfig::new(1).init(device),
        }
    }
}

/// Convolutional block attention: a channel gate from average and max pooled
/// descriptors, then a spatial gate from channel-wise max and mean maps.
#[derive(Module, Debug)]
pub struct Cbam<B: Backend> {
    mlp_in: Linear<B>,
    mlp_out: Linear<B>,
    relu: Relu,
    spatial_conv: Conv2d<B>,
    spatial_bn: BatchNorm<B, 2>,
}

impl<B: Backend> Cbam<B> {
    /// Forward pass.
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.channel_gate(x);
        self.spatial_gate(x)
    }

    fn channel_gate(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let [b, c, h, w] = x.dims();
        let flat = x.clone().reshape([b, c, h * w]);
        let avg = flat.clone().mean_dim(2).reshape([b, c]);
        let max = flat.max_dim(2).reshape([b, c]);

        let mlp = |pooled: Tensor<B, 2>| {
            self.mlp_out
                .forward(self.relu.forward(self.mlp_in.forward(pooled)))
        };
        let scale = sigmoid(mlp(avg) + mlp(max)).reshape([b, c, 1, 1]);
        x * scale
    }

    fn spatial_gate(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let pooled = Tensor::cat(vec![x.clone().max_dim(1), x.clone().mean_dim(1)], 1);
        let scale = sigmoid(self.spatial_bn.forward(self.spatial_conv.forward(pooled)));
        x * scale
    }
}

/// Configuration for [`ChannelAttention`].
#[derive(Config, Debug)]
pub struct ChannelAttentionConfig {
    in_channels: usize,
    out_channels: usize,
}

impl ChannelAttentionConfig {
    /// Initializes a new [`ChannelAttention`].
    pub fn init<B: Backend>(&self, device: &Device<B>) -> ChannelAttention<B> {
        ChannelAttention {
            in_channels: self.in_channels,
            fc: LinearConfig::new(self.in_channels, self.out_channels)
                .with_bias(false)
                .init(device),
        }
    }
}

/// Per-channel weights in `(0, 1)`: a bias-free linear layer and a sigmoid.
#[derive(Module, Debug)]
pub struct ChannelAttention<B: Backend> {
    in_channels: usize,
    fc: Linear<B>,
}

impl<B: Backend> ChannelAttention<B> {
    /// Weights from descriptors whose last axis holds the channels.
    pub fn forward<const D: usize>(&self, x: Tensor<B, D>) -> Tensor<B, D> {
        sigmoid(self.fc.forward(x))
    }

    /// Weights from the spatial mean of a feature map.
    ///
    /// # Shapes
    /// - input: `[batch, in_channels, height, width]`
    /// - output: `[batch, out_channels, 1, 1]`
    ///
    /// # Errors
    ///
    /// Returns `StcnvmError::InvalidConfiguration` on a channel mismatch.
    pub fn forward_pooled(&self, x: Tensor<B, 4>) -> StcnvmResult<Tensor<B, 4>> {
        let [b, c, h, w] = x.dims();
        ensure_channels("channel attention", self.in_channels, c)?;

        let descriptor = x.reshape([b, c, h * w]).mean_dim(2).reshape([b, c]);
        let weights = self.forward(descriptor);
        let [_, out_channels] = weights.dims();
        Ok(weights.reshape([b, out_channels, 1, 1]))
    }

    /// Sequence counterpart of [`ChannelAttention::forward_pooled`].
    ///
    /// # Errors
    ///
    /// Same as [`ChannelAttention::forward_pooled`].
    pub fn forward_pooled_time_series(&self, x: Tensor<B, 5>) -> StcnvmResult<Tensor<B, 5>> {
        let (x, batch_time) = fold_time(x);
        Ok(unfold_time(self.forward_pooled(x)?, batch_time))
    }
}

/// Configuration for [`GatedConv2d`].
#[derive(Config, Debug)]
pub struct GatedConv2dConfig {
    in_channels: usize,
    out_channels: usize,
    #[config(default = "1")]
    kernel_size: usize,
    #[config(default = "1")]
    stride: usize,
    #[config(default = "0")]
    padding: usize,
    /// Negative slope of the leaky ReLU on the feature half.
    #[config(default = "0.1")]
    negative_slope: f64,
}

impl GatedConv2dConfig {
    /// Initializes a new [`GatedConv2d`].
    ///
    /// # Errors
    ///
    /// Returns `StcnvmError::InvalidConfiguration` if the kernel size or the
    /// stride is zero.
    pub fn init<B: Backend>(&self, device: &Device<B>) -> StcnvmResult<GatedConv2d<B>> {
        if self.kernel_size == 0 || self.stride == 0 {
            return Err(StcnvmError::configuration(format!(
                "gated convolution needs a positive kernel size and stride, got {} and {}",
                self.kernel_size, self.stride
            )));
        }

        Ok(GatedConv2d {
            in_channels: self.in_channels,
            out_channels: self.out_channels,
            negative_slope: self.negative_slope,
            conv: Conv2dConfig::new(
                [self.in_channels, self.out_channels * 2],
                [self.kernel_size, self.kernel_size],
            )
            .with_stride([self.stride, self.stride])
            .with_padding(PaddingConfig2d::Explicit(self.padding, self.padding))
            .init(device),
        })
    }
}

/// A convolution whose second half of output channels gates the first half.
#[derive(Module, Debug)]
pub struct GatedConv2d<B: Backend> {
    in_channels: usize,
    out_channels: usize,
    negative_slope: f64,
    conv: Conv2d<B>,
}

impl<B: Backend> FrameModule<B> for GatedConv2d<B> {
    fn forward_single_frame(&self, x: Tensor<B, 4>) -> StcnvmResult<Tensor<B, 4>> {
        ensure_channels("gated convolution", self.in_channels, x.dims()[1])?;

        let y = self.conv.forward(x);
        let features = y.clone().narrow(1, 0, self.out_channels);
        let gate = y.narrow(1, self.out_channels, self.out_channels);
        Ok(leaky_relu(features, self.negative_slope) * sigmoid(gate))
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
    fn res_block_projects_shortcut_only_when_needed() {
        let device = Default::default();

        let same = ResBlockConfig::new(4).init::<TestBackend>(&device);
        assert!(same.downsample.is_none());
        assert_eq!(same.forward(random([2, 4, 5, 5])).dims(), [2, 4, 5, 5]);

        let wider = ResBlockConfig::new(4)
            .with_out_channels(Some(6))
            .init::<TestBackend>(&device);
        assert!(wider.downsample.is_some());
        assert_eq!(wider.forward(random([2, 4, 5, 5])).dims(), [2, 6, 5, 5]);
    }

    #[test]
    fn cbam_keeps_shape_and_attenuates() {
        let device = Default::default();
        let cbam = CbamConfig::new(8).init::<TestBackend>(&device);
        let x = Tensor::<TestBackend, 4>::ones([1, 8, 6, 6], &device);

        let out = cbam.forward(x);

        assert_eq!(out.dims(), [1, 8, 6, 6]);
        // Both gates are sigmoids, so positive inputs can only shrink.
        let max = out.clone().max().into_scalar();
        let min = out.min().into_scalar();
        assert!(max < 1.0 && min > 0.0, "gated values in [{min}, {max}]");
    }

    #[test]
    fn channel_attention_pools_spatially() {
        let device = Default::default();
        let attention = ChannelAttentionConfig::new(4, 3).init::<TestBackend>(&device);

        let weights = attention.forward_pooled(random([2, 4, 5, 7])).unwrap();
        assert_eq!(weights.dims(), [2, 3, 1, 1]);
        for weight in weights.into_data().to_vec::<f32>().unwrap() {
            assert!(weight > 0.0 && weight < 1.0);
        }

        let sequence = attention
            .forward_pooled_time_series(random([2, 3, 4, 5, 7]))
            .unwrap();
        assert_eq!(sequence.dims(), [2, 3, 3, 1, 1]);
    }

    #[test]
    fn gated_conv_halves_the_conv_output() {
        let device = Default::default();
        let gated = GatedConv2dConfig::new(3, 5)
            .with_kernel_size(3)
            .with_padding(1)
            .init::<TestBackend>(&device)
            .unwrap();

        assert_eq!(
            gated.forward_single_frame(random([2, 3, 6, 6])).unwrap().dims(),
            [2, 5, 6, 6]
        );
        assert_eq!(
            gated.forward_time_series(random([1, 2, 3, 6, 6])).unwrap().dims(),
            [1, 2, 5, 6, 6]
        );
        assert!(matches!(
            gated.forward_single_frame(random([2, 4, 6, 6])),
            Err(StcnvmError::InvalidConfiguration { .. })
        ));
    }
}
