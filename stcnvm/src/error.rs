use thiserror::Error;

/// The error type for `STCNVM-Burn` operations.
///
/// Every variant describes a caller or programmer error detected before any
/// tensor work is done. None of them is retried or recovered internally.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StcnvmError {
    /// A module was configured inconsistently, or a tensor's channel count does
    /// not match the channel count the module was built for.
    #[error("Invalid module configuration: {reason}")]
    InvalidConfiguration {
        /// Why the configuration is invalid.
        reason: String,
    },

    /// An input tensor has the wrong rank, or paired inputs disagree in shape.
    #[error("Invalid input tensor shape: expected {expected}, got {actual}")]
    InvalidTensorShape {
        /// The expected tensor shape.
        expected: String,
        /// The actual tensor shape.
        actual: String,
    },

    /// A hyperparameter key that the parser does not define.
    #[error("Unknown hyperparameter: {key}")]
    UnknownHyperParameter {
        /// The requested key.
        key: String,
    },

    /// A hyperparameter value that could not be assigned to its key.
    #[error("Invalid value for hyperparameter {key}: {reason}")]
    InvalidHyperParameter {
        /// The key being assigned.
        key: String,
        /// Why the value was rejected.
        reason: String,
    },
}

impl StcnvmError {
    pub(crate) fn configuration(reason: impl Into<String>) -> Self {
        Self::InvalidConfiguration {
            reason: reason.into(),
        }
    }

    pub(crate) fn shape(expected: impl Into<String>, actual: impl core::fmt::Debug) -> Self {
        Self::InvalidTensorShape {
            expected: expected.into(),
            actual: format!("{actual:?}"),
        }
    }
}

/// A specialized `Result` type for `STCNVM-Burn` operations.
pub type StcnvmResult<T> = Result<T, StcnvmError>;
