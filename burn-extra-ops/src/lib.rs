//! Additional operations for the Burn deep learning framework
//!
//! This crate provides tensor operations that STCNVM-Burn relies on but that
//! are not available in the core Burn framework: `fold4d` (the inverse of
//! `unfold4d`), binary morphological dilation, and an `Identity` module.

use burn::prelude::*;

mod fold;
mod identity;
mod morphology;

pub use fold::{fold4d, unfold_patches, FoldOptions};
pub use identity::Identity;
pub use morphology::{binary_dilation, structuring_element};

/// Additional operations for 4D Burn tensors
pub trait TensorExtraOps<B: Backend> {
    /// Extract sliding blocks, see [`unfold_patches`].
    fn unfold_patches(self, kernel_size: [usize; 2], options: FoldOptions) -> Tensor<B, 3>;

    /// Dilate a `{0, 1}` mask, see [`binary_dilation`].
    fn binary_dilation(self, kernel: Tensor<B, 4>) -> Tensor<B, 4>;
}

impl<B: Backend> TensorExtraOps<B> for Tensor<B, 4> {
    fn unfold_patches(self, kernel_size: [usize; 2], options: FoldOptions) -> Tensor<B, 3> {
        unfold_patches(self, kernel_size, options)
    }

    fn binary_dilation(self, kernel: Tensor<B, 4>) -> Tensor<B, 4> {
        binary_dilation(self, kernel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::{
        backend::{ndarray::NdArray, Autodiff},
        tensor::Distribution,
    };

    type TestBackend = Autodiff<NdArray<f32>>;

    #[test]
    fn test_tensor_extra_ops() {
        let device = Default::default();
        let tensor =
            Tensor::<TestBackend, 4>::random([2, 3, 8, 8], Distribution::Normal(0.0, 1.0), &device);

        let columns = tensor.clone().unfold_patches([2, 2], FoldOptions::new([2, 2], [0, 0]));
        assert_eq!(columns.dims(), [2, 12, 16]);

        let mask = tensor.greater_elem(0.0).float();
        let dilated = mask.clone().binary_dilation(structuring_element(3, &device));
        let grown = (dilated - mask).min().into_scalar();
        assert!(grown >= 0.0, "dilation must never clear a set pixel");
    }
}
