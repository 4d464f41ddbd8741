//! Configuration module for STCNVM.
//!
//! - `enums`: strategy selection enums consumed by module configs
//! - `hyper`: the flat hyperparameter mapping supplied by the driver, with
//!   stage-dependent defaults

pub mod enums;
pub mod hyper;

pub use enums::{FusionStyle, TemporalFusion};
pub use hyper::{HyperParameters, StageDefaults};
