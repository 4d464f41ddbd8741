//! # Deformable Convolutions
//!
//! Two flavours of modulated sampling built on Burn's `deform_conv2d`:
//!
//! - [`AlignDeformConv2d`] resamples a memory map with offsets and modulation
//!   predicted from the memory and a query map together. It is how one frame
//!   (or a hidden state) gets aligned to another.
//! - [`SingleDeformConv2d`] predicts plain offsets from its own input.
//!
//! Both offset predictors start at zero, so a freshly built module samples the
//! regular grid and behaves like an ordinary convolution.

use burn::{
    module::Param,
    nn::{
        conv::{Conv2d, Conv2dConfig},
        PaddingConfig2d,
    },
    prelude::*,
    tensor::{activation::sigmoid, module::deform_conv2d, ops::DeformConvOptions},
};

use crate::error::{StcnvmError, StcnvmResult};
use crate::frames::{
    ensure_channels, ensure_paired_frames, ensure_same_dims, fold_time, unfold_time, FrameModule,
    Frames,
};

/// Sampling geometry shared by the offset predictor and the deformable kernel.
#[derive(Module, Clone, Copy, Debug)]
pub struct SamplingGrid {
    kernel_size: usize,
    stride: usize,
    padding: usize,
    dilation: usize,
    groups: usize,
    offset_groups: usize,
}

impl SamplingGrid {
    #[allow(clippy::too_many_arguments)]
    fn new(
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
        stride: usize,
        padding: Option<usize>,
        dilation: usize,
        groups: usize,
        offset_groups: usize,
    ) -> StcnvmResult<Self> {
        if kernel_size == 0 || stride == 0 || dilation == 0 {
            return Err(StcnvmError::configuration(format!(
                "kernel size, stride and dilation must be positive, got {kernel_size}, {stride}, {dilation}"
            )));
        }
        if groups == 0 || in_channels % groups != 0 || out_channels % groups != 0 {
            return Err(StcnvmError::configuration(format!(
                "{groups} groups do not divide {in_channels} input and {out_channels} output channels"
            )));
        }
        if offset_groups == 0 || in_channels % offset_groups != 0 {
            return Err(StcnvmError::configuration(format!(
                "{offset_groups} offset groups do not divide {in_channels} input channels"
            )));
        }

        Ok(Self {
            kernel_size,
            stride,
            padding: padding.unwrap_or(kernel_size / 2),
            dilation,
            groups,
            offset_groups,
        })
    }

    /// Kernel sample points across all offset groups.
    const fn sample_points(&self) -> usize {
        self.kernel_size * self.kernel_size * self.offset_groups
    }

    /// A regular convolution with the same footprint, used to predict offsets.
    fn predictor<B: Backend>(
        &self,
        in_channels: usize,
        out_channels: usize,
        device: &Device<B>,
    ) -> Conv2d<B> {
        let mut conv = Conv2dConfig::new(
            [in_channels, out_channels],
            [self.kernel_size, self.kernel_size],
        )
        .with_stride([self.stride, self.stride])
        .with_padding(PaddingConfig2d::Explicit(self.padding, self.padding))
        .with_dilation([self.dilation, self.dilation])
        .init(device);

        conv.weight = Param::from_tensor(conv.weight.val().zeros_like());
        conv.bias = conv
            .bias
            .map(|bias| Param::from_tensor(bias.val().zeros_like()));
        conv
    }

    /// Holds the deformable kernel weight `[out, in / groups, k, k]`.
    fn kernel<B: Backend>(
        &self,
        in_channels: usize,
        out_channels: usize,
        device: &Device<B>,
    ) -> Conv2d<B> {
        Conv2dConfig::new(
            [in_channels, out_channels],
            [self.kernel_size, self.kernel_size],
        )
        .with_groups(self.groups)
        .with_bias(false)
        .init(device)
    }

    fn options(&self) -> DeformConvOptions<2> {
        DeformConvOptions {
            stride: [self.stride, self.stride],
            padding: [self.padding, self.padding],
            dilation: [self.dilation, self.dilation],
            weight_groups: self.groups,
            offset_groups: self.offset_groups,
        }
    }
}

/// Configuration for [`AlignDeformConv2d`].
#[derive(Config, Debug)]
pub struct AlignDeformConv2dConfig {
    /// Channels of the memory map, the map that gets resampled.
    mem_channels: usize,
    /// Channels of the query map, which only steers the offsets.
    que_channels: usize,
    /// Output channels.
    out_channels: usize,
    #[config(default = "3")]
    kernel_size: usize,
    #[config(default = "1")]
    stride: usize,
    /// Defaults to `kernel_size / 2`.
    #[config(default = "None")]
    padding: Option<usize>,
    #[config(default = "1")]
    dilation: usize,
    #[config(default = "1")]
    groups: usize,
    #[config(default = "1")]
    offset_groups: usize,
}

impl AlignDeformConv2dConfig {
    /// Initializes a new [`AlignDeformConv2d`].
    ///
    /// # Errors
    ///
    /// Returns `StcnvmError::InvalidConfiguration` if the kernel size, stride
    /// or dilation is zero, or if a group count does not divide the channels.
    pub fn init<B: Backend>(&self, device: &Device<B>) -> StcnvmResult<AlignDeformConv2d<B>> {
        let grid = SamplingGrid::new(
            self.mem_channels,
            self.out_channels,
            self.kernel_size,
            self.stride,
            self.padding,
            self.dilation,
            self.groups,
            self.offset_groups,
        )?;

        // Per sample point: an (x, y) offset and one modulation scalar.
        let conv_offset = grid.predictor(
            self.mem_channels + self.que_channels,
            3 * grid.sample_points(),
            device,
        );
        let dfconv = grid.kernel(self.mem_channels, self.out_channels, device);

        tracing::debug!(
            mem_channels = self.mem_channels,
            que_channels = self.que_channels,
            out_channels = self.out_channels,
            kernel_size = self.kernel_size,
            "built deformable alignment"
        );

        Ok(AlignDeformConv2d {
            mem_channels: self.mem_channels,
            que_channels: self.que_channels,
            grid,
            conv_offset,
            dfconv,
        })
    }
}

/// Resamples a memory map at offsets predicted from `[memory, query]`.
#[derive(Module, Debug)]
pub struct AlignDeformConv2d<B: Backend> {
    mem_channels: usize,
    que_channels: usize,
    grid: SamplingGrid,
    conv_offset: Conv2d<B>,
    dfconv: Conv2d<B>,
}

impl<B: Backend> AlignDeformConv2d<B> {
    /// Aligns `mem` (`[batch, mem_channels, h, w]`) under the guidance of `que`
    /// (`[batch, que_channels, h, w]`).
    ///
    /// # Errors
    ///
    /// Returns `StcnvmError::InvalidTensorShape` when the two maps disagree in
    /// batch or spatial size and `StcnvmError::InvalidConfiguration` when a
    /// channel count differs from the configured one.
    pub fn forward_single_frame(
        &self,
        mem: Tensor<B, 4>,
        que: Tensor<B, 4>,
    ) -> StcnvmResult<Tensor<B, 4>> {
        ensure_paired_frames("memory map", mem.dims(), que.dims())?;
        ensure_channels("deformable memory", self.mem_channels, mem.dims()[1])?;
        ensure_channels("deformable query", self.que_channels, que.dims()[1])?;

        let n = self.grid.sample_points();
        let predicted = self
            .conv_offset
            .forward(Tensor::cat(vec![mem.clone(), que], 1));
        let offset = predicted.clone().narrow(1, 0, 2 * n);
        let mask = sigmoid(predicted.narrow(1, 2 * n, n));

        Ok(deform_conv2d(
            mem,
            offset,
            self.dfconv.weight.val(),
            Some(mask),
            None,
            self.grid.options(),
        ))
    }

    /// Sequence counterpart of [`AlignDeformConv2d::forward_single_frame`];
    /// every frame is aligned independently.
    ///
    /// # Errors
    ///
    /// Returns `StcnvmError::InvalidTensorShape` if the two sequences differ in
    /// batch size or length, plus the single-frame errors.
    pub fn forward_time_series(
        &self,
        mem: Tensor<B, 5>,
        que: Tensor<B, 5>,
    ) -> StcnvmResult<Tensor<B, 5>> {
        let [b, t, ..] = mem.dims();
        let [qb, qt, ..] = que.dims();
        ensure_same_dims("memory sequence [batch, time]", [b, t], [qb, qt])?;

        let (mem, batch_time) = fold_time(mem);
        let (que, _) = fold_time(que);
        Ok(unfold_time(
            self.forward_single_frame(mem, que)?,
            batch_time,
        ))
    }

    /// Dispatches on the layout of the inputs, which must agree.
    ///
    /// # Errors
    ///
    /// Returns `StcnvmError::InvalidTensorShape` when one input is a single
    /// frame and the other a sequence, plus the errors of the entry point used.
    pub fn forward(&self, mem: Frames<B>, que: Frames<B>) -> StcnvmResult<Frames<B>> {
        match (mem, que) {
            (Frames::Single(mem), Frames::Single(que)) => {
                self.forward_single_frame(mem, que).map(Frames::Single)
            }
            (Frames::Sequence(mem), Frames::Sequence(que)) => {
                self.forward_time_series(mem, que).map(Frames::Sequence)
            }
            (mem, que) => Err(StcnvmError::shape(
                format!("query with the memory layout {:?}", mem.dims()),
                que.dims(),
            )),
        }
    }
}

/// Configuration for [`SingleDeformConv2d`].
#[derive(Config, Debug)]
pub struct SingleDeformConv2dConfig {
    in_channels: usize,
    out_channels: usize,
    #[config(default = "3")]
    kernel_size: usize,
    #[config(default = "1")]
    stride: usize,
    /// Defaults to `kernel_size / 2`.
    #[config(default = "None")]
    padding: Option<usize>,
    #[config(default = "1")]
    dilation: usize,
    #[config(default = "1")]
    groups: usize,
    #[config(default = "1")]
    offset_groups: usize,
}

impl SingleDeformConv2dConfig {
    /// Initializes a new [`SingleDeformConv2d`].
    ///
    /// # Errors
    ///
    /// Same conditions as [`AlignDeformConv2dConfig::init`].
    pub fn init<B: Backend>(&self, device: &Device<B>) -> StcnvmResult<SingleDeformConv2d<B>> {
        let grid = SamplingGrid::new(
            self.in_channels,
            self.out_channels,
            self.kernel_size,
            self.stride,
            self.padding,
            self.dilation,
            self.groups,
            self.offset_groups,
        )?;
        let conv_offset = grid.predictor(self.in_channels, 2 * grid.sample_points(), device);
        let dfconv = grid.kernel(self.in_channels, self.out_channels, device);

        tracing::debug!(
            in_channels = self.in_channels,
            out_channels = self.out_channels,
            kernel_size = self.kernel_size,
            "built deformable convolution"
        );

        Ok(SingleDeformConv2d {
            in_channels: self.in_channels,
            grid,
            conv_offset,
            dfconv,
        })
    }
}

/// Deformable convolution without modulation, offsets predicted from the input.
#[derive(Module, Debug)]
pub struct SingleDeformConv2d<B: Backend> {
    in_channels: usize,
    grid: SamplingGrid,
    conv_offset: Conv2d<B>,
    dfconv: Conv2d<B>,
}

impl<B: Backend> FrameModule<B> for SingleDeformConv2d<B> {
    fn forward_single_frame(&self, x: Tensor<B, 4>) -> StcnvmResult<Tensor<B, 4>> {
        ensure_channels("deformable convolution", self.in_channels, x.dims()[1])?;

        let offset = self.conv_offset.forward(x.clone());
        Ok(deform_conv2d(
            x,
            offset,
            self.dfconv.weight.val(),
            None,
            None,
            self.grid.options(),
        ))
    }
}
