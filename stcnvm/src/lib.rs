//! # STCNVM-Burn
//!
//! Spatio-temporal feature transformation modules for video matting, built on
//! [Burn](https://burn.dev).
//!
//! Every module computes on single frames `[batch, channels, height, width]`
//! and exposes a sequence entry point for `[batch, time, channels, height,
//! width]`; see [`frames`] for the layout adapter. Construction goes through
//! `#[derive(Config)]` structs whose `init` validates the configuration, and
//! forward passes report shape and channel mismatches as [`StcnvmError`]s.
//!
//! ```no_run
//! use burn::backend::NdArray;
//! use burn::prelude::*;
//! use stcnvm_burn::{ConvGruConfig, TemporalFusion};
//!
//! # fn main() -> stcnvm_burn::StcnvmResult<()> {
//! let device = Default::default();
//! let gru = ConvGruConfig::new(16)
//!     .with_fusion(TemporalFusion::FocalGru)
//!     .init::<NdArray>(&device)?;
//!
//! let frames = Tensor::<NdArray, 5>::zeros([1, 4, 16, 32, 32], &device);
//! let (out, hidden) = gru.forward_time_series(frames, None)?;
//! assert_eq!(out.dims(), [1, 4, 16, 32, 32]);
//! assert_eq!(hidden.dims(), [1, 16, 32, 32]);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod frames;
pub mod models;

pub use config::{FusionStyle, HyperParameters, StageDefaults, TemporalFusion};
pub use error::{StcnvmError, StcnvmResult};
pub use frames::{fold_time, unfold_time, FrameModule, Frames};
pub use models::*;

#[cfg(test)]
mod tests;
