use std::{
    error::Error,
    fmt::{self, Display},
};

/// The result type used in the entire machine learning module.
pub type Result<T> = std::result::Result<T, MlErr>;

/// The machine learning module's error type.
#[derive(Debug, Clone, PartialEq)]
pub enum MlErr {
    SizeMismatch {
        what: &'static str,
        got: usize,
        expected: usize,
    },
    EmptyDataset,
    InvalidDistribution(String),
    NonFiniteLoss {
        epoch: usize,
    },
}

impl Display for MlErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MlErr::SizeMismatch {
                what,
                got,
                expected,
            } => write!(
                f,
                "There's a size mismatch in {what}, got {got} and expected {expected}"
            ),
            MlErr::EmptyDataset => write!(f, "The dataset has no samples to train with"),
            MlErr::InvalidDistribution(detail) => {
                write!(f, "Failed to build the sampling distribution: {detail}")
            }
            MlErr::NonFiniteLoss { epoch } => {
                write!(f, "The loss diverged to a non finite value at epoch {epoch}")
            }
        }
    }
}

impl Error for MlErr {}
