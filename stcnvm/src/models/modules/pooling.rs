//! # Pooling Context Blocks
//!
//! Global-context heads that summarise a feature map by pooling it and feed the
//! summary back into every pixel: the LR-ASPP gate and a pyramid pooling
//! module.

use burn::{
    nn::{
        conv::{Conv2d, Conv2dConfig},
        pool::{AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig},
        BatchNorm, BatchNormConfig, Relu,
    },
    prelude::*,
    tensor::{
        activation::sigmoid,
        module::interpolate,
        ops::{InterpolateMode, InterpolateOptions},
    },
};

use crate::error::{StcnvmError, StcnvmResult};
use crate::frames::{ensure_channels, FrameModule};

/// Configuration for [`Lraspp`].
#[derive(Config, Debug)]
pub struct LrasppConfig {
    in_channels: usize,
    out_channels: usize,
}

impl LrasppConfig {
    /// Initializes a new [`Lraspp`].
    pub fn init<B: Backend>(&self, device: &Device<B>) -> Lraspp<B> {
        let pointwise = || {
            Conv2dConfig::new([self.in_channels, self.out_channels], [1, 1])
                .with_bias(false)
                .init(device)
        };

        tracing::debug!(
            in_channels = self.in_channels,
            out_channels = self.out_channels,
            "built LR-ASPP"
        );

        Lraspp {
            in_channels: self.in_channels,
            aspp1_conv: pointwise(),
            aspp1_bn: BatchNormConfig::new(self.out_channels).init(device),
            aspp1_relu: Relu::new(),
            aspp2_pool: AdaptiveAvgPool2dConfig::new([1, 1]).init(),
            aspp2_conv: pointwise(),
        }
    }
}

/// Lite reduced ASPP: a 1×1 conv + BN + ReLU branch scaled by a sigmoid gate
/// computed from the globally pooled input.
#[derive(Module, Debug)]
pub struct Lraspp<B: Backend> {
    in_channels: usize,
    aspp1_conv: Conv2d<B>,
    aspp1_bn: BatchNorm<B, 2>,
    aspp1_relu: Relu,
    aspp2_pool: AdaptiveAvgPool2d,
    aspp2_conv: Conv2d<B>,
}

impl<B: Backend> FrameModule<B> for Lraspp<B> {
    fn forward_single_frame(&self, x: Tensor<B, 4>) -> StcnvmResult<Tensor<B, 4>> {
        ensure_channels("LR-ASPP", self.in_channels, x.dims()[1])?;

        let features = self
            .aspp1_relu
            .forward(self.aspp1_bn.forward(self.aspp1_conv.forward(x.clone())));
        let gate = sigmoid(self.aspp2_conv.forward(self.aspp2_pool.forward(x)));
        Ok(features * gate)
    }
}

/// Configuration for [`PyramidPooling`].
#[derive(Config, Debug)]
pub struct PyramidPoolingConfig {
    /// Input channels.
    features: usize,
    /// Channels produced by each pooling stage.
    per_features: usize,
    out_features: usize,
    /// Pooled grid sides, one stage each.
    #[config(default = "vec![1, 2, 4, 8]")]
    sizes: Vec<usize>,
}

impl PyramidPoolingConfig {
    /// Initializes a new [`PyramidPooling`].
    ///
    /// # Errors
    ///
    /// Returns `StcnvmError::InvalidConfiguration` if a pooled size is zero.
    pub fn init<B: Backend>(&self, device: &Device<B>) -> StcnvmResult<PyramidPooling<B>> {
        if self.sizes.contains(&0) {
            return Err(StcnvmError::configuration(format!(
                "pyramid pooling sizes must be positive, got {:?}",
                self.sizes
            )));
        }

        let stages = self
            .sizes
            .iter()
            .map(|&size| PoolingStage {
                pool: AdaptiveAvgPool2dConfig::new([size, size]).init(),
                conv: Conv2dConfig::new([self.features, self.per_features], [1, 1])
                    .with_bias(false)
                    .init(device),
            })
            .collect::<Vec<_>>();
        let bottleneck = Conv2dConfig::new(
            [
                self.per_features * self.sizes.len() + self.features,
                self.out_features,
            ],
            [1, 1],
        )
        .init(device);

        tracing::debug!(
            features = self.features,
            out_features = self.out_features,
            sizes = ?self.sizes,
            "built pyramid pooling"
        );

        Ok(PyramidPooling {
            features: self.features,
            stages,
            bottleneck,
            relu: Relu::new(),
        })
    }
}

#[derive(Module, Debug)]
struct PoolingStage<B: Backend> {
    pool: AdaptiveAvgPool2d,
    conv: Conv2d<B>,
}

/// Pyramid scene pooling: each stage pools to a fixed grid, projects, and is
/// upsampled back; the stages and the input are merged by a 1×1 bottleneck.
#[derive(Module, Debug)]
pub struct PyramidPooling<B: Backend> {
    features: usize,
    stages: Vec<PoolingStage<B>>,
    bottleneck: Conv2d<B>,
    relu: Relu,
}

impl<B: Backend> FrameModule<B> for PyramidPooling<B> {
    fn forward_single_frame(&self, x: Tensor<B, 4>) -> StcnvmResult<Tensor<B, 4>> {
        let [_, channels, height, width] = x.dims();
        ensure_channels("pyramid pooling", self.features, channels)?;

        let mut priors = self
            .stages
            .iter()
            .map(|stage| {
                interpolate(
                    stage.conv.forward(stage.pool.forward(x.clone())),
                    [height, width],
                    InterpolateOptions::new(InterpolateMode::Bilinear),
                )
            })
            .collect::<Vec<_>>();
        priors.push(x);

        Ok(self
            .relu
            .forward(self.bottleneck.forward(Tensor::cat(priors, 1))))
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
    fn lraspp_output_is_nonnegative() {
        let device = Default::default();
        let lraspp = LrasppConfig::new(6, 4).init::<TestBackend>(&device);

        let out = lraspp.forward_time_series(random([2, 3, 6, 5, 7])).unwrap();

        assert_eq!(out.dims(), [2, 3, 4, 5, 7]);
        assert!(out.min().into_scalar() >= 0.0);
    }

    #[test]
    fn pyramid_pooling_concatenates_every_stage() {
        let device = Default::default();
        let psp = PyramidPoolingConfig::new(4, 2, 5)
            .init::<TestBackend>(&device)
            .unwrap();
        assert_eq!(psp.stages.len(), 4);

        let out = psp.forward_single_frame(random([2, 4, 16, 12])).unwrap();
        assert_eq!(out.dims(), [2, 5, 16, 12]);
        assert!(out.min().into_scalar() >= 0.0);
    }

    #[test]
    fn zero_pool_size_is_rejected() {
        let device = Default::default();

        let result = PyramidPoolingConfig::new(4, 2, 5)
            .with_sizes(vec![1, 0])
            .init::<TestBackend>(&device);
        assert!(matches!(
            result,
            Err(StcnvmError::InvalidConfiguration { .. })
        ));
    }
}
