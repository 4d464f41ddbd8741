//! # Global Patch Matching
//!
//! Scores how well each patch of a query map is matched anywhere in a
//! candidate map. Both maps are sampled on a strided patch grid, each query
//! patch keeps its smallest L2 distance to any candidate patch, and the
//! distance `d` is mapped to `2 * sigmoid(-d)` in `(0, 1]`.

use burn::{
    prelude::*,
    tensor::{
        activation::sigmoid,
        module::interpolate,
        ops::{InterpolateMode, InterpolateOptions},
    },
};
use burn_extra_ops::{FoldOptions, TensorExtraOps};

use crate::error::{StcnvmError, StcnvmResult};
use crate::frames::{ensure_same_dims, fold_time, unfold_time};

/// Added to every coordinate difference before taking the norm.
const DISTANCE_EPS: f64 = 1e-6;

/// Configuration for [`GlobalMatch`].
#[derive(Config, Debug)]
pub struct GlobalMatchConfig {
    /// Step of the patch grid.
    #[config(default = "4")]
    stride: usize,
}

impl GlobalMatchConfig {
    /// Initializes a new [`GlobalMatch`].
    ///
    /// # Errors
    ///
    /// Returns `StcnvmError::InvalidConfiguration` if `stride` is zero.
    pub fn init(&self) -> StcnvmResult<GlobalMatch> {
        if self.stride == 0 {
            return Err(StcnvmError::configuration(
                "global match stride must be positive",
            ));
        }
        tracing::debug!(stride = self.stride, "built global match");

        Ok(GlobalMatch {
            stride: self.stride,
        })
    }
}

/// Nearest-patch similarity between two feature maps.
#[derive(Module, Clone, Debug)]
pub struct GlobalMatch {
    stride: usize,
}

impl GlobalMatch {
    /// Scores every query token against its nearest candidate token.
    ///
    /// # Shapes
    /// - query: `[batch, n, channels]`
    /// - candidates: `[batch, m, channels]`
    /// - output: `[batch, n]`
    ///
    /// # Errors
    ///
    /// Returns `StcnvmError::InvalidTensorShape` when the two token sets differ
    /// in batch size or channel count, or when there are no candidates.
    pub fn compute_scores<B: Backend>(
        &self,
        query: Tensor<B, 3>,
        candidates: Tensor<B, 3>,
    ) -> StcnvmResult<Tensor<B, 2>> {
        let [b, n, c] = query.dims();
        let [cb, m, cc] = candidates.dims();
        ensure_same_dims("candidate tokens [batch, channels]", [b, c], [cb, cc])?;
        if m == 0 {
            return Err(StcnvmError::shape(
                "at least one candidate token",
                candidates.dims(),
            ));
        }

        let query = query.unsqueeze_dim::<4>(2).expand([b, n, m, c]);
        let candidates = candidates.unsqueeze_dim::<4>(1).expand([b, n, m, c]);
        let distance = (query - candidates)
            .add_scalar(DISTANCE_EPS)
            .powf_scalar(2.0)
            .sum_dim(3)
            .sqrt()
            .min_dim(2)
            .reshape([b, n]);

        Ok(sigmoid(distance.neg()).mul_scalar(2.0))
    }

    /// Scores each patch of `query` against all patches of `candidates` and
    /// upsamples the score grid back to the map size.
    ///
    /// # Shapes
    /// - query, candidates: `[batch, channels, height, width]`
    /// - output: `[batch, 1, height, width]`
    ///
    /// # Errors
    ///
    /// Returns `StcnvmError::InvalidTensorShape` if the maps differ in shape or
    /// their spatial size is not a multiple of the stride.
    pub fn forward_single_frame<B: Backend>(
        &self,
        query: Tensor<B, 4>,
        candidates: Tensor<B, 4>,
    ) -> StcnvmResult<Tensor<B, 4>> {
        let [b, c, height, width] = query.dims();
        ensure_same_dims("candidate map", query.dims(), candidates.dims())?;
        let s = self.stride;
        if height % s != 0 || width % s != 0 {
            return Err(StcnvmError::shape(
                format!("spatial size divisible by stride {s}"),
                [b, c, height, width],
            ));
        }

        let scores = self.compute_scores(self.pool(query), self.pool(candidates))?;
        let grid = scores.reshape([b, 1, height / s, width / s]);

        Ok(interpolate(
            grid,
            [height, width],
            InterpolateOptions::new(InterpolateMode::Nearest),
        ))
    }

    /// Frame-by-frame matching of two sequences.
    ///
    /// # Shapes
    /// - query, candidates: `[batch, time, channels, height, width]`
    /// - output: `[batch, time, 1, height, width]`
    ///
    /// # Errors
    ///
    /// Same as [`GlobalMatch::forward_single_frame`].
    pub fn forward_time_series<B: Backend>(
        &self,
        query: Tensor<B, 5>,
        candidates: Tensor<B, 5>,
    ) -> StcnvmResult<Tensor<B, 5>> {
        ensure_same_dims("candidate sequence", query.dims(), candidates.dims())?;

        let (query, batch_time) = fold_time(query);
        let (candidates, _) = fold_time(candidates);
        let scores = self.forward_single_frame(query, candidates)?;
        Ok(unfold_time(scores, batch_time))
    }

    /// Samples one token per grid cell: `[batch, cells, channels]`.
    fn pool<B: Backend>(&self, x: Tensor<B, 4>) -> Tensor<B, 3> {
        let s = self.stride;
        x.unfold_patches([1, 1], FoldOptions::new([s, s], [0, 0]))
            .swap_dims(1, 2)
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

    fn matcher(stride: usize) -> GlobalMatch {
        GlobalMatchConfig::new().with_stride(stride).init().unwrap()
    }

    #[test]
    fn identical_maps_score_one() {
        let x = random([2, 8, 16, 12]);

        let scores = matcher(4).forward_single_frame(x.clone(), x).unwrap();

        assert_eq!(scores.dims(), [2, 1, 16, 12]);
        let gap = scores.neg().add_scalar(1.0).abs().max().into_scalar();
        assert!(gap < 1e-4, "identical maps scored {gap} below 1");
    }

    #[test]
    fn distant_tokens_score_lower() {
        let device = Default::default();
        let query = Tensor::<TestBackend, 1>::from_floats([0.0, 0.0, 3.0, 0.0], &device)
            .reshape([1, 2, 2]);
        let candidates = Tensor::<TestBackend, 1>::from_floats([0.0, 0.0, 0.0, 1.0], &device)
            .reshape([1, 2, 2]);

        let scores = matcher(1)
            .compute_scores(query, candidates)
            .unwrap()
            .into_data()
            .to_vec::<f32>()
            .unwrap();

        // The second query token is sqrt(9 + 1) or 3 away; 3 is the minimum.
        assert!((scores[0] - 1.0).abs() < 1e-4);
        let expected = 2.0 / (1.0 + 3.0f32.exp());
        assert!((scores[1] - expected).abs() < 1e-4);
    }

    #[test]
    fn sequences_keep_time_axis() {
        let scores = matcher(2)
            .forward_time_series(random([1, 3, 4, 8, 8]), random([1, 3, 4, 8, 8]))
            .unwrap();

        assert_eq!(scores.dims(), [1, 3, 1, 8, 8]);
        assert!(scores.clone().max().into_scalar() <= 1.0);
        assert!(scores.min().into_scalar() > 0.0);
    }

    #[test]
    fn grid_must_divide_the_map() {
        let result =
            matcher(4).forward_single_frame(random([1, 2, 10, 8]), random([1, 2, 10, 8]));
        assert!(matches!(
            result,
            Err(StcnvmError::InvalidTensorShape { .. })
        ));

        assert!(matches!(
            GlobalMatchConfig::new().with_stride(0).init(),
            Err(StcnvmError::InvalidConfiguration { .. })
        ));
    }
}
