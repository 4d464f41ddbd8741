//! Pass-through module used where a projection is configured away.

use burn::prelude::*;

/// Returns its input unchanged.
///
/// Stands in for a linear or convolutional projection that a configuration
/// disables, so the surrounding module keeps a single forward path.
#[derive(Module, Debug)]
pub struct Identity<B: Backend> {
    _phantom: core::marker::PhantomData<B>,
}

impl<B: Backend> Identity<B> {
    /// Creates a new `Identity`.
    pub const fn new() -> Self {
        Self {
            _phantom: core::marker::PhantomData,
        }
    }

    /// Forward pass for a tensor of any rank.
    pub const fn forward<const D: usize>(&self, input: Tensor<B, D>) -> Tensor<B, D> {
        input
    }
}

impl<B: Backend> Default for Identity<B> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::{backend::NdArray, tensor::Distribution};

    type TestBackend = NdArray;

    #[test]
    fn identity_keeps_values() {
        let device = Default::default();
        let input =
            Tensor::<TestBackend, 5>::random([1, 2, 3, 4, 4], Distribution::Normal(0.0, 1.0), &device);

        let output = Identity::<TestBackend>::new().forward(input.clone());

        output.into_data().assert_eq(&input.into_data(), true);
    }
}
