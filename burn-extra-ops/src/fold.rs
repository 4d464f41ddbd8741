//! # Fold
//!
//! The inverse of Burn's `unfold4d`: sliding-window columns are summed back
//! into a spatial tensor, with overlapping positions accumulating.
//!
//! Burn does not ship a fold kernel. A fold is the adjoint of unfold, and unfold
//! is a convolution with a one-hot weight, so fold is the transposed convolution
//! with that same weight applied per channel group.

use burn::{
    prelude::*,
    tensor::{
        module::{conv_transpose2d, unfold4d},
        ops::{ConvTransposeOptions, UnfoldOptions},
    },
};

/// Stride and padding shared by a matching unfold/fold pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FoldOptions {
    /// Step between consecutive blocks.
    pub stride: [usize; 2],
    /// Implicit zero padding on both sides of each spatial axis.
    pub padding: [usize; 2],
}

impl FoldOptions {
    /// Creates new fold options.
    pub const fn new(stride: [usize; 2], padding: [usize; 2]) -> Self {
        Self { stride, padding }
    }

    /// Number of sliding blocks along each spatial axis of a map of `size`.
    ///
    /// Returns `None` when the kernel does not fit in the padded map or the
    /// stride is zero.
    pub fn block_grid(&self, size: [usize; 2], kernel_size: [usize; 2]) -> Option<[usize; 2]> {
        let mut grid = [0; 2];
        for axis in 0..2 {
            let padded = size[axis] + 2 * self.padding[axis];
            if self.stride[axis] == 0 || kernel_size[axis] == 0 || kernel_size[axis] > padded {
                return None;
            }
            grid[axis] = (padded - kernel_size[axis]) / self.stride[axis] + 1;
        }
        Some(grid)
    }
}

/// Extracts sliding blocks from `x`.
///
/// # Shapes
/// - input: `[batch, channels, height, width]`
/// - output: `[batch, channels * kh * kw, blocks]`
pub fn unfold_patches<B: Backend>(
    x: Tensor<B, 4>,
    kernel_size: [usize; 2],
    options: FoldOptions,
) -> Tensor<B, 3> {
    unfold4d(
        x,
        kernel_size,
        UnfoldOptions::new(options.stride, options.padding, [1, 1]),
    )
}

/// Combines sliding blocks into a spatial tensor of `output_size`.
///
/// # Shapes
/// - input: `[batch, channels * kh * kw, blocks]`
/// - output: `[batch, channels, output_size[0], output_size[1]]`
///
/// # Panics
///
/// Panics if the column count is not a multiple of the kernel area or if the
/// number of blocks does not match the block grid of `output_size`.
pub fn fold4d<B: Backend>(
    columns: Tensor<B, 3>,
    output_size: [usize; 2],
    kernel_size: [usize; 2],
    options: FoldOptions,
) -> Tensor<B, 4> {
    let [batch, column_channels, blocks] = columns.dims();
    let [kh, kw] = kernel_size;
    let kernel_area = kh * kw;
    assert!(
        kernel_area > 0 && column_channels % kernel_area == 0,
        "fold4d: {column_channels} columns are not divisible by kernel area {kernel_area}"
    );
    let channels = column_channels / kernel_area;

    let [grid_h, grid_w] = options
        .block_grid(output_size, kernel_size)
        .unwrap_or_else(|| panic!("fold4d: kernel {kernel_size:?} does not fit {output_size:?}"));
    assert_eq!(
        blocks,
        grid_h * grid_w,
        "fold4d: expected {grid_h}x{grid_w} blocks for output {output_size:?}, got {blocks}"
    );

    // The transposed convolution reaches (grid - 1) * stride + kernel - 2 * padding
    // pixels; the remainder of output_size is recovered with output padding.
    let covered = [
        (grid_h - 1) * options.stride[0] + kh - 2 * options.padding[0],
        (grid_w - 1) * options.stride[1] + kw - 2 * options.padding[1],
    ];
    let padding_out = [output_size[0] - covered[0], output_size[1] - covered[1]];

    let device = columns.device();
    let columns = columns.reshape([batch, column_channels, grid_h, grid_w]);

    conv_transpose2d(
        columns,
        scatter_weight::<B>(channels, kernel_size, &device),
        None,
        ConvTransposeOptions::new(
            options.stride,
            options.padding,
            padding_out,
            [1, 1],
            channels,
        ),
    )
}

/// One-hot weight `[channels * kh * kw, 1, kh, kw]` routing column `i` of each
/// channel group to kernel position `i`.
fn scatter_weight<B: Backend>(
    channels: usize,
    kernel_size: [usize; 2],
    device: &Device<B>,
) -> Tensor<B, 4> {
    let [kh, kw] = kernel_size;
    let area = kh * kw;
    let mut values = vec![0.0f32; area * area];
    for position in 0..area {
        values[position * area + position] = 1.0;
    }

    Tensor::<B, 4>::from_data(TensorData::new(values, [area, 1, kh, kw]), device)
        .repeat_dim(0, channels)
}
