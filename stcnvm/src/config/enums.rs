//! Enumeration types for STCNVM configuration.
//!
//! This module contains the selection enums that pick one of several
//! interchangeable module strategies at construction time.

use core::str::FromStr;

use burn::prelude::*;

use crate::error::StcnvmError;

/// Where the CBAM attention branch sits relative to the residual blocks of a
/// feature fusion block.
#[derive(Config, Debug, PartialEq, Eq)]
pub enum FusionStyle {
    /// `res2(x + cbam(x))` after `x = res1(x)`.
    ResAttnRes,
    /// `res(cbam(x))`, attention applied on the input channels.
    AttnRes,
    /// `x + cbam(x)` after `x = res(x)`.
    ResAttnSum,
}

impl FromStr for FusionStyle {
    type Err = StcnvmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "res_attn_res" => Ok(Self::ResAttnRes),
            "attn_res" => Ok(Self::AttnRes),
            "res_attn_sum" => Ok(Self::ResAttnSum),
            _ => Err(StcnvmError::configuration(format!(
                "unknown fusion style `{s}` (expected res_attn_res, attn_res or res_attn_sum)"
            ))),
        }
    }
}

/// How a recurrent cell derives its context from `(input, hidden)` before the
/// gates run.
#[derive(Config, Debug, PartialEq, Eq)]
pub enum TemporalFusion {
    /// Plain ConvGRU, the hidden state is used as is.
    ConvGru,
    /// Hidden state deformably aligned to the current input.
    DeformableGru,
    /// Hidden state replaced by its focal modulation.
    FocalGru,
    /// Hidden state averaged with `tanh` of its focal modulation.
    FocalGruResidual,
    /// Hidden state averaged with `tanh` of soft cross-attention from the input.
    AttnGru,
}

impl TemporalFusion {
    /// The model selection names accepted by [`TemporalFusion::from_str`].
    pub const NAMES: [&'static str; 5] = [
        "conv_gru",
        "deform_gru",
        "focal_gru",
        "focal_gru_fix",
        "attn_gru",
    ];
}

impl FromStr for TemporalFusion {
    type Err = StcnvmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "conv_gru" => Ok(Self::ConvGru),
            "deform_gru" => Ok(Self::DeformableGru),
            "focal_gru" => Ok(Self::FocalGru),
            "focal_gru_fix" => Ok(Self::FocalGruResidual),
            "attn_gru" => Ok(Self::AttnGru),
            _ => Err(StcnvmError::configuration(format!(
                "unknown model `{s}` (expected one of {})",
                Self::NAMES.join(", ")
            ))),
        }
    }
}
