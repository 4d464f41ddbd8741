//! Hyperparameters supplied by the training/inference driver.
//!
//! The modules in this crate only consume plain numbers at construction time.
//! `HyperParameters` is the flat, command-line facing mapping those numbers
//! come from: it parses arguments, fills stage-dependent defaults, and offers
//! key lookup, key assignment, and a string representation.

use core::fmt;

use clap::Parser;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::enums::TemporalFusion;
use crate::error::{StcnvmError, StcnvmResult};

/// Batch size, iteration count and LR decay steps used when a stage leaves
/// them unset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageDefaults {
    /// Default batch size.
    pub batch_size: usize,
    /// Default number of iterations.
    pub iterations: usize,
    /// Default LR decay step.
    pub step: usize,
}

impl StageDefaults {
    /// Defaults for a training stage (0: static images, 1: Blender, 2:
    /// DAVIS + YouTubeVOS, anything else: fine-tuning).
    pub const fn for_stage(stage: usize) -> Self {
        match stage {
            0 => Self {
                batch_size: 7,
                iterations: 300_000,
                step: 250_000,
            },
            1 => Self {
                batch_size: 4,
                iterations: 500_000,
                step: 450_000,
            },
            2 => Self {
                batch_size: 4,
                iterations: 150_000,
                step: 125_000,
            },
            _ => Self {
                batch_size: 8,
                iterations: 40_000,
                step: 20_000,
            },
        }
    }
}

/// Flat hyperparameter mapping.
#[derive(Parser, Serialize, Deserialize, Debug, Clone, PartialEq)]
#[command(name = "stcnvm", rename_all = "snake_case")]
pub struct HyperParameters {
    /// Use which model
    #[arg(long, default_value = "NULL")]
    pub which_model: String,

    /// Enable backend autotuning; faster in some cases
    #[arg(long)]
    pub benchmark: bool,
    /// num_workers of dataloader
    #[arg(long, default_value_t = 16)]
    pub num_worker: usize,
    /// neighbor frames only
    #[arg(long)]
    pub nb_frame_only: bool,
    /// compute trimap in dataset
    #[arg(long)]
    pub dataset_trimap: bool,
    /// compute perturbed mask in dataset
    #[arg(long)]
    pub perturb_mask: bool,
    /// get pha of bgr by last frame affine
    #[arg(long)]
    pub get_bgr_pha: bool,
    /// dataset img size
    #[arg(long, default_value_t = 256)]
    pub size: usize,

    /// Static training data root
    #[arg(long, default_value = "../static")]
    pub static_root: String,
    /// Blender training data root
    #[arg(long, default_value = "../BL30K")]
    pub bl_root: String,
    /// YouTubeVOS data root
    #[arg(long, default_value = "../YouTube")]
    pub yv_root: String,
    /// DAVIS data root
    #[arg(long, default_value = "../DAVIS")]
    pub davis_root: String,

    /// Training stage (0-static images, 1-Blender dataset, 2-DAVIS+YouTubeVOS)
    #[arg(long, default_value_t = 0)]
    pub stage: usize,
    /// switch to vid dataset at which epoch
    #[arg(long, default_value_t = 5)]
    pub iter_switch_dataset: usize,

    /// Adjust seq length and batch size
    #[arg(long)]
    pub long_seq: bool,
    /// Default is dependent on the training stage
    #[arg(short = 'b', long)]
    pub batch_size: Option<usize>,
    /// sequence size
    #[arg(long, default_value_t = 4)]
    pub seq_length: usize,
    /// Default is dependent on the training stage
    #[arg(short = 'i', long)]
    pub iterations: Option<usize>,
    /// Default is dependent on the training stage
    #[arg(long, num_args = 0..)]
    pub steps: Option<Vec<usize>>,
    /// Start iter of segmentation training
    #[arg(long, default_value_t = 0)]
    pub seg_start: usize,
    /// Cooldown of segmentation training
    #[arg(long, default_value_t = 20_000)]
    pub seg_cd: usize,
    /// Iter of segmentation training
    #[arg(long, default_value_t = 10_000)]
    pub seg_iter: usize,
    /// At which iter to stop segmentation training
    #[arg(long, default_value_t = 80_000)]
    pub seg_stop: usize,

    /// Initial learning rate
    #[arg(long, default_value_t = 1e-4)]
    pub lr: f64,
    /// LR := LR*gamma at every decay step
    #[arg(long, default_value_t = 0.1)]
    pub gamma: f64,

    /// Path to pretrained network weight only
    #[arg(long)]
    pub load_network: Option<String>,
    /// Path to the model file, including network, optimizer and such
    #[arg(long)]
    pub load_model: Option<String>,

    /// Experiment unique id, NULL disables experiment logging
    #[arg(long, default_value = "NULL")]
    pub id: String,
    /// Debug mode which logs information more often
    #[arg(long)]
    pub debug: bool,

    /// Local rank of this process, not set by users
    #[arg(long, default_value_t = 0)]
    pub local_rank: usize,
}

impl Default for HyperParameters {
    fn default() -> Self {
        Self::parse_from(["stcnvm"])
    }
}

impl HyperParameters {
    /// Parses hyperparameters from command-line style arguments, the first
    /// item being the program name, and fills stage defaults.
    ///
    /// # Errors
    ///
    /// Returns clap's error when an argument is unknown or malformed.
    pub fn from_args<I, T>(args: I) -> Result<Self, clap::Error>
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        Self::try_parse_from(args).map(Self::resolve_stage_defaults)
    }

    /// Assigns the stage-dependent batch size, iteration count and decay
    /// steps wherever they were left unset.
    #[must_use]
    pub fn resolve_stage_defaults(mut self) -> Self {
        let defaults = StageDefaults::for_stage(self.stage);
        self.batch_size.get_or_insert(defaults.batch_size);
        self.iterations.get_or_insert(defaults.iterations);
        self.steps.get_or_insert_with(|| vec![defaults.step]);

        tracing::info!(
            stage = self.stage,
            batch_size = ?self.batch_size,
            iterations = ?self.iterations,
            steps = ?self.steps,
            "resolved stage-dependent hyperparameters"
        );
        self
    }

    /// The recurrent fusion variant named by `which_model`.
    ///
    /// # Errors
    ///
    /// Returns `StcnvmError::InvalidConfiguration` for an unknown model name.
    pub fn temporal_fusion(&self) -> StcnvmResult<TemporalFusion> {
        self.which_model.parse()
    }

    /// Looks up a hyperparameter by key.
    ///
    /// # Errors
    ///
    /// Returns `StcnvmError::UnknownHyperParameter` if the key does not exist.
    pub fn get(&self, key: &str) -> StcnvmResult<Value> {
        self.to_map()
            .remove(key)
            .ok_or_else(|| StcnvmError::UnknownHyperParameter {
                key: key.to_owned(),
            })
    }

    /// Assigns a hyperparameter by key.
    ///
    /// # Errors
    ///
    /// Returns `StcnvmError::UnknownHyperParameter` if the key does not exist
    /// and `StcnvmError::InvalidHyperParameter` if the value has the wrong type.
    /// `self` is left untouched on error.
    pub fn set(&mut self, key: &str, value: impl Into<Value>) -> StcnvmResult<()> {
        let mut map = self.to_map();
        match map.get_mut(key) {
            Some(slot) => *slot = value.into(),
            None => {
                return Err(StcnvmError::UnknownHyperParameter {
                    key: key.to_owned(),
                })
            }
        }

        *self = serde_json::from_value(Value::Object(map)).map_err(|e| {
            StcnvmError::InvalidHyperParameter {
                key: key.to_owned(),
                reason: e.to_string(),
            }
        })?;
        Ok(())
    }

    fn to_map(&self) -> Map<String, Value> {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map,
            // A struct of plain fields always serializes to an object.
            _ => Map::new(),
        }
    }
}

impl fmt::Display for HyperParameters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", Value::Object(self.to_map()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_zero_defaults() {
        let hyper = HyperParameters::from_args(["stcnvm"]).unwrap();

        assert_eq!(hyper.batch_size, Some(7));
        assert_eq!(hyper.iterations, Some(300_000));
        assert_eq!(hyper.steps, Some(vec![250_000]));
        assert_eq!(hyper.seq_length, 4);
        assert_eq!(hyper.which_model, "NULL");
    }

    #[test]
    fn later_stages_use_their_own_defaults() {
        let stage2 = HyperParameters::from_args(["stcnvm", "--stage", "2"]).unwrap();
        assert_eq!(stage2.batch_size, Some(4));
        assert_eq!(stage2.iterations, Some(150_000));
        assert_eq!(stage2.steps, Some(vec![125_000]));

        let stage7 = HyperParameters::from_args(["stcnvm", "--stage", "7"]).unwrap();
        assert_eq!(stage7.batch_size, Some(8));
        assert_eq!(stage7.steps, Some(vec![20_000]));
    }

    #[test]
    fn explicit_values_win_over_stage_defaults() {
        let hyper = HyperParameters::from_args([
            "stcnvm", "--stage", "1", "-b", "2", "--steps", "10", "20",
        ])
        .unwrap();

        assert_eq!(hyper.batch_size, Some(2));
        assert_eq!(hyper.iterations, Some(500_000));
        assert_eq!(hyper.steps, Some(vec![10, 20]));
    }

    #[test]
    fn get_and_set_round_through_the_flat_mapping() {
        let mut hyper = HyperParameters::default();
        assert_eq!(hyper.get("size").unwrap(), Value::from(256));

        hyper.set("which_model", "attn_gru").unwrap();
        assert_eq!(hyper.temporal_fusion(), Ok(TemporalFusion::AttnGru));

        hyper.set("seq_length", 8).unwrap();
        assert_eq!(hyper.seq_length, 8);
    }

    #[test]
    fn unknown_key_is_rejected() {
        let mut hyper = HyperParameters::default();

        assert!(matches!(
            hyper.get("learning_rate"),
            Err(StcnvmError::UnknownHyperParameter { .. })
        ));
        assert!(matches!(
            hyper.set("learning_rate", 0.1),
            Err(StcnvmError::UnknownHyperParameter { .. })
        ));
    }

    #[test]
    fn mistyped_value_leaves_parameters_untouched() {
        let mut hyper = HyperParameters::default();

        match hyper.set("seq_length", "long") {
            Err(StcnvmError::InvalidHyperParameter { key, .. }) => assert_eq!(key, "seq_length"),
            other => panic!("Expected InvalidHyperParameter error, got {other:?}"),
        }
        assert_eq!(hyper.seq_length, 4);
    }

    #[test]
    fn display_is_the_flat_mapping() {
        let text = HyperParameters::default().to_string();

        assert!(text.starts_with('{'));
        assert!(text.contains("\"which_model\":\"NULL\""));
        assert!(text.contains("\"seq_length\":4"));
    }
}
