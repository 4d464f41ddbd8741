//! # Feature Fusion
//!
//! Residual blocks combined with CBAM attention. The three layouts are picked
//! with [`FusionStyle`] and differ only in where the attention branch sits.

use burn::prelude::*;

use super::blocks::{Cbam, CbamConfig, ResBlock, ResBlockConfig};
use crate::config::FusionStyle;
use crate::error::StcnvmResult;
use crate::frames::{ensure_channels, FrameModule};

/// Configuration for [`FeatureFusion`].
#[derive(Config, Debug)]
pub struct FeatureFusionConfig {
    in_channels: usize,
    out_channels: usize,
    #[config(default = "FusionStyle::ResAttnRes")]
    style: FusionStyle,
}

impl FeatureFusionConfig {
    /// Initializes a new [`FeatureFusion`].
    pub fn init<B: Backend>(&self, device: &Device<B>) -> FeatureFusion<B> {
        let (i, o) = (self.in_channels, self.out_channels);
        let res = |in_channels: usize| {
            ResBlockConfig::new(in_channels)
                .with_out_channels(Some(o))
                .init(device)
        };

        let layout = match self.style {
            FusionStyle::ResAttnRes => FusionLayout::ResAttnRes(ResAttnRes {
                block1: res(i),
                attention: CbamConfig::new(o).init(device),
                block2: res(o),
            }),
            FusionStyle::AttnRes => FusionLayout::AttnRes(AttnRes {
                attention: CbamConfig::new(i).init(device),
                block: res(i),
            }),
            FusionStyle::ResAttnSum => FusionLayout::ResAttnSum(ResAttnSum {
                block: res(i),
                attention: CbamConfig::new(o).init(device),
            }),
        };

        tracing::debug!(
            in_channels = i,
            out_channels = o,
            style = ?self.style,
            "built feature fusion"
        );

        FeatureFusion {
            in_channels: i,
            layout,
        }
    }
}

/// `x = res1(x); res2(x + cbam(x))`
#[derive(Module, Debug)]
struct ResAttnRes<B: Backend> {
    block1: ResBlock<B>,
    attention: Cbam<B>,
    block2: ResBlock<B>,
}

/// `res(cbam(x))`
#[derive(Module, Debug)]
struct AttnRes<B: Backend> {
    attention: Cbam<B>,
    block: ResBlock<B>,
}

/// `x = res(x); x + cbam(x)`
#[derive(Module, Debug)]
struct ResAttnSum<B: Backend> {
    block: ResBlock<B>,
    attention: Cbam<B>,
}

#[derive(Module, Debug)]
enum FusionLayout<B: Backend> {
    ResAttnRes(ResAttnRes<B>),
    AttnRes(AttnRes<B>),
    ResAttnSum(ResAttnSum<B>),
}

/// Residual fusion block with CBAM attention.
#[derive(Module, Debug)]
pub struct FeatureFusion<B: Backend> {
    in_channels: usize,
    layout: FusionLayout<B>,
}

impl<B: Backend> FeatureFusion<B> {
    /// The layout this block was built with.
    pub const fn style(&self) -> FusionStyle {
        match self.layout {
            FusionLayout::ResAttnRes(_) => FusionStyle::ResAttnRes,
            FusionLayout::AttnRes(_) => FusionStyle::AttnRes,
            FusionLayout::ResAttnSum(_) => FusionStyle::ResAttnSum,
        }
    }
}

impl<B: Backend> FrameModule<B> for FeatureFusion<B> {
    fn forward_single_frame(&self, x: Tensor<B, 4>) -> StcnvmResult<Tensor<B, 4>> {
        ensure_channels("feature fusion", self.in_channels, x.dims()[1])?;

        Ok(match &self.layout {
            FusionLayout::ResAttnRes(m) => {
                let x = m.block1.forward(x);
                let r = m.attention.forward(x.clone());
                m.block2.forward(x + r)
            }
            FusionLayout::AttnRes(m) => m.block.forward(m.attention.forward(x)),
            FusionLayout::ResAttnSum(m) => {
                let x = m.block.forward(x);
                x.clone() + m.attention.forward(x)
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StcnvmError;
    use burn::{backend::NdArray, tensor::Distribution};

    type TestBackend = NdArray;

    #[test]
    fn every_style_maps_in_to_out_channels() {
        let device = Default::default();
        let x = Tensor::<TestBackend, 5>::random(
            [2, 3, 8, 6, 6],
            Distribution::Normal(0.0, 1.0),
            &device,
        );

        for style in [
            FusionStyle::ResAttnRes,
            FusionStyle::AttnRes,
            FusionStyle::ResAttnSum,
        ] {
            let fusion = FeatureFusionConfig::new(8, 4)
                .with_style(style.clone())
                .init::<TestBackend>(&device);
            assert_eq!(fusion.style(), style);

            let out = fusion.forward_time_series(x.clone()).unwrap();
            assert_eq!(out.dims(), [2, 3, 4, 6, 6], "{style:?}");
        }
    }

    #[test]
    fn fusion_rejects_wrong_channel_count() {
        let device = Default::default();
        let fusion = FeatureFusionConfig::new(8, 4).init::<TestBackend>(&device);

        let result = fusion.forward_single_frame(Tensor::zeros([1, 4, 6, 6], &device));
        assert!(matches!(
            result,
            Err(StcnvmError::InvalidConfiguration { .. })
        ));
    }
}
