//! # Temporal Feature Modules
//!
//! Building blocks that mix information across the frames of a video and
//! across positions within a frame:
//!
//! - deformable alignment of one feature map onto another
//! - patch-wise and token-wise cross-attention between frames
//! - a convolutional GRU with pluggable hidden-state context
//! - auxiliary refinement and fusion heads (trimap refinement, global patch
//!   matching, pooling context, CBAM fusion)
//!
//! Everything is re-exported from this module.

pub mod modules;

pub use modules::*;
