//! # Binary Morphology
//!
//! Dilation of `{0, 1}` masks with a flat structuring element, evaluated as a
//! convolution: a pixel is set when any element of its neighbourhood is set.

use burn::{
    prelude::*,
    tensor::{module::conv2d, ops::ConvOptions},
};

/// Builds a flat square structuring element of the given width.
///
/// # Shapes
/// - output: `[1, 1, width, width]`
pub fn structuring_element<B: Backend>(width: usize, device: &Device<B>) -> Tensor<B, 4> {
    Tensor::ones([1, 1, width, width], device)
}

/// Dilates a binary mask with `kernel`, channel by channel.
///
/// The anchor sits at `kernel_size / 2`, so even-sized elements reach one pixel
/// further towards the top-left than towards the bottom-right.
///
/// # Shapes
/// - mask: `[batch, channels, height, width]`
/// - kernel: `[1, 1, kh, kw]`
/// - output: `[batch, channels, height, width]`, values in `{0, 1}`
pub fn binary_dilation<B: Backend>(mask: Tensor<B, 4>, kernel: Tensor<B, 4>) -> Tensor<B, 4> {
    let [batch, channels, height, width] = mask.dims();
    let [_, _, kh, kw] = kernel.dims();

    let planes = mask.reshape([batch * channels, 1, height, width]);
    let hits = conv2d(
        planes,
        kernel,
        None,
        ConvOptions::new([1, 1], [kh / 2, kw / 2], [1, 1], 1),
    );

    hits.slice([0..batch * channels, 0..1, 0..height, 0..width])
        .greater_elem(0.0)
        .float()
        .reshape([batch, channels, height, width])
}
