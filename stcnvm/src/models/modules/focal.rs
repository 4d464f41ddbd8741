//! # Focal Modulation
//!
//! Context is aggregated hierarchically by a stack of depthwise convolutions
//! with growing kernels, each level weighted by a learned gate, plus a gated
//! global-average term. The aggregate modulates a linear projection of the
//! input element-wise. The context may come from a second map.

use burn::{
    nn::{
        conv::{Conv2d, Conv2dConfig},
        Dropout, DropoutConfig, Gelu, LayerNorm, LayerNormConfig, Linear, LinearConfig,
        PaddingConfig2d,
    },
    prelude::*,
};

use crate::error::{StcnvmError, StcnvmResult};
use crate::frames::{
    ensure_channels, ensure_paired_frames, ensure_same_dims, fold_time, unfold_time,
};

/// Configuration for [`FocalModulation`].
#[derive(Config, Debug)]
pub struct FocalModulationConfig {
    dim: usize,
    /// Kernel size of the first focal level.
    #[config(default = "5")]
    focal_window: usize,
    #[config(default = "4")]
    focal_level: usize,
    /// Kernel growth per level.
    #[config(default = "2")]
    focal_factor: usize,
    #[config(default = "true")]
    bias: bool,
    #[config(default = "0.0")]
    proj_drop: f64,
    /// Layer norm before the output projection.
    #[config(default = "false")]
    use_postln: bool,
}

impl FocalModulationConfig {
    /// Initializes a new [`FocalModulation`].
    ///
    /// # Errors
    ///
    /// Returns `StcnvmError::InvalidConfiguration` if `dim` or `focal_window`
    /// is zero, or if any level's kernel size is even.
    pub fn init<B: Backend>(&self, device: &Device<B>) -> StcnvmResult<FocalModulation<B>> {
        if self.dim == 0 || self.focal_window == 0 {
            return Err(StcnvmError::configuration(format!(
                "focal modulation needs a positive dim and window, got {} and {}",
                self.dim, self.focal_window
            )));
        }

        let kernel_sizes = (0..self.focal_level)
            .map(|level| self.focal_factor * level + self.focal_window)
            .collect::<Vec<_>>();
        if let Some(even) = kernel_sizes.iter().find(|&&k| k % 2 == 0) {
            return Err(StcnvmError::configuration(format!(
                "focal kernel sizes must be odd to keep the map size, got {even} in {kernel_sizes:?}"
            )));
        }
        let focal_layers = kernel_sizes
            .iter()
            .map(|&kernel_size| {
                Conv2dConfig::new([self.dim, self.dim], [kernel_size, kernel_size])
                    .with_groups(self.dim)
                    .with_padding(PaddingConfig2d::Explicit(kernel_size / 2, kernel_size / 2))
                    .with_bias(false)
                    .init(device)
            })
            .collect();

        tracing::debug!(
            dim = self.dim,
            focal_level = self.focal_level,
            kernel_sizes = ?kernel_sizes,
            "built focal modulation"
        );

        Ok(FocalModulation {
            dim: self.dim,
            focal_level: self.focal_level,
            q: LinearConfig::new(self.dim, self.dim)
                .with_bias(self.bias)
                .init(device),
            f: LinearConfig::new(self.dim, self.dim + self.focal_level + 1)
                .with_bias(self.bias)
                .init(device),
            h: Conv2dConfig::new([self.dim, self.dim], [1, 1])
                .with_bias(self.bias)
                .init(device),
            act: Gelu::new(),
            proj: LinearConfig::new(self.dim, self.dim).init(device),
            proj_drop: DropoutConfig::new(self.proj_drop).init(),
            focal_layers,
            ln: self
                .use_postln
                .then(|| LayerNormConfig::new(self.dim).init(device)),
        })
    }
}

/// Focal modulation over `[batch, dim, height, width]` maps.
#[derive(Module, Debug)]
pub struct FocalModulation<B: Backend> {
    dim: usize,
    focal_level: usize,
    q: Linear<B>,
    f: Linear<B>,
    h: Conv2d<B>,
    act: Gelu,
    proj: Linear<B>,
    proj_drop: Dropout,
    focal_layers: Vec<Conv2d<B>>,
    ln: Option<LayerNorm<B>>,
}

impl<B: Backend> FocalModulation<B> {
    /// Modulates `x` with context aggregated from `context` (or `x` itself).
    ///
    /// # Errors
    ///
    /// Returns `StcnvmError::InvalidConfiguration` on a channel mismatch and
    /// `StcnvmError::InvalidTensorShape` when the context map disagrees with
    /// `x` in batch or spatial size.
    pub fn forward(
        &self,
        x: Tensor<B, 4>,
        context: Option<Tensor<B, 4>>,
    ) -> StcnvmResult<Tensor<B, 4>> {
        ensure_channels("focal modulation", self.dim, x.dims()[1])?;
        let context = match context {
            Some(context) => {
                ensure_paired_frames("focal context", x.dims(), context.dims())?;
                ensure_channels("focal context", self.dim, context.dims()[1])?;
                context
            }
            None => x.clone(),
        };

        let c = self.dim;
        let l = self.focal_level;
        let channels_last = |t: Tensor<B, 4>| t.permute([0, 2, 3, 1]);
        let channels_first = |t: Tensor<B, 4>| t.permute([0, 3, 1, 2]);

        let q = channels_first(self.q.forward(channels_last(x)));
        let projected = channels_first(self.f.forward(channels_last(context)));
        let gates = projected.clone().narrow(1, c, l + 1);
        let mut ctx = projected.narrow(1, 0, c);

        let mut ctx_all = ctx.zeros_like();
        for (level, layer) in self.focal_layers.iter().enumerate() {
            ctx = self.act.forward(layer.forward(ctx));
            ctx_all = ctx_all + ctx.clone() * gates.clone().narrow(1, level, 1);
        }
        let [b, _, height, width] = ctx.dims();
        let ctx_global = self
            .act
            .forward(ctx.mean_dim(2).mean_dim(3))
            .expand([b, c, height, width]);
        let ctx_all = ctx_all + ctx_global * gates.narrow(1, l, 1);

        let out = channels_last(q * self.h.forward(ctx_all));
        let out = match &self.ln {
            Some(ln) => ln.forward(out),
            None => out,
        };
        let out = self.proj_drop.forward(self.proj.forward(out));

        Ok(channels_first(out))
    }

    /// Sequence counterpart of [`FocalModulation::forward`]; frames are
    /// independent.
    ///
    /// # Errors
    ///
    /// Returns `StcnvmError::InvalidTensorShape` if the two sequences differ in
    /// batch size or length, plus the single-frame errors.
    pub fn forward_time_series(
        &self,
        x: Tensor<B, 5>,
        context: Option<Tensor<B, 5>>,
    ) -> StcnvmResult<Tensor<B, 5>> {
        if let Some(context) = &context {
            let [b, t, ..] = x.dims();
            let [cb, ct, ..] = context.dims();
            ensure_same_dims("focal context [batch, time]", [b, t], [cb, ct])?;
        }

        let (x, batch_time) = fold_time(x);
        let out = self.forward(x, context.map(|context| fold_time(context).0))?;
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
    fn kernels_grow_by_focal_factor() {
        let device = Default::default();
        let focal = FocalModulationConfig::new(4)
            .with_focal_window(3)
            .with_focal_level(3)
            .init::<TestBackend>(&device)
            .unwrap();

        let kernels = focal
            .focal_layers
            .iter()
            .map(|layer| layer.weight.dims())
            .collect::<Vec<_>>();
        assert_eq!(kernels, vec![[4, 1, 3, 3], [4, 1, 5, 5], [4, 1, 7, 7]]);
    }

    #[test]
    fn modulation_keeps_shape_with_and_without_context() {
        let device = Default::default();
        let focal = FocalModulationConfig::new(6)
            .with_use_postln(true)
            .init::<TestBackend>(&device)
            .unwrap();

        assert_eq!(
            focal.forward(random([2, 6, 9, 7]), None).unwrap().dims(),
            [2, 6, 9, 7]
        );
        assert_eq!(
            focal
                .forward_time_series(random([1, 3, 6, 8, 8]), Some(random([1, 3, 6, 8, 8])))
                .unwrap()
                .dims(),
            [1, 3, 6, 8, 8]
        );
    }

    #[test]
    fn zero_query_gives_bias_only_output() {
        let device = Default::default();
        let focal = FocalModulationConfig::new(4)
            .with_bias(false)
            .init::<TestBackend>(&device)
            .unwrap();
        let x = Tensor::<TestBackend, 4>::zeros([1, 4, 5, 5], &device);

        // Without bias the query projection of zeros is zero, so only the
        // output projection's bias survives.
        let out = focal.forward(x, Some(random([1, 4, 5, 5]))).unwrap();
        let bias = focal
            .proj
            .bias
            .as_ref()
            .map(|bias| bias.val().reshape([1, 4, 1, 1]))
            .unwrap();
        let diff = (out - bias).abs().max().into_scalar();
        assert!(diff < 1e-6, "diverged by {diff}");
    }

    #[test]
    fn even_focal_kernels_are_rejected() {
        let device = Default::default();

        let even_window = FocalModulationConfig::new(4)
            .with_focal_window(4)
            .with_focal_level(2)
            .init::<TestBackend>(&device);
        assert!(matches!(
            even_window,
            Err(StcnvmError::InvalidConfiguration { .. })
        ));

        // 3, then 3 + 1 = 4 on the second level.
        let odd_factor = FocalModulationConfig::new(4)
            .with_focal_window(3)
            .with_focal_factor(1)
            .with_focal_level(2)
            .init::<TestBackend>(&device);
        assert!(matches!(
            odd_factor,
            Err(StcnvmError::InvalidConfiguration { .. })
        ));
    }

    #[test]
    fn mismatched_context_is_rejected() {
        let device = Default::default();
        let focal = FocalModulationConfig::new(4)
            .init::<TestBackend>(&device)
            .unwrap();

        assert!(matches!(
            focal.forward(random([1, 4, 8, 8]), Some(random([1, 4, 4, 4]))),
            Err(StcnvmError::InvalidTensorShape { .. })
        ));
        assert!(matches!(
            focal.forward(random([1, 3, 8, 8]), None),
            Err(StcnvmError::InvalidConfiguration { .. })
        ));
    }
}
