use std::{error::Error, fmt, io, time::Duration};

use machine_learning::MlErr;

/// The personalizer's result type.
pub type Result<T> = std::result::Result<T, PersonalizeErr>;

/// Everything that can go wrong while classifying, encoding or updating.
#[derive(Debug)]
pub enum PersonalizeErr {
    Io(io::Error),
    Image(image::ImageError),
    Json(serde_json::Error),
    Ml(MlErr),
    CorruptArtifact(String),
    ConstraintMismatch {
        expected: String,
        got: String,
    },
    InvalidLabel,
    UnknownLabel(String),
    InvalidConfig(String),
    EmptyBatch,
    Busy,
    UpdateProcedure(MlErr),
    Persistence(io::Error),
    Timeout(Duration),
    TaskFailed(String),
}

impl fmt::Display for PersonalizeErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PersonalizeErr::Io(e) => write!(f, "io error: {e}"),
            PersonalizeErr::Image(e) => write!(f, "image error: {e}"),
            PersonalizeErr::Json(e) => write!(f, "json error: {e}"),
            PersonalizeErr::Ml(e) => write!(f, "model error: {e}"),
            PersonalizeErr::CorruptArtifact(detail) => write!(f, "corrupt model artifact: {detail}"),
            PersonalizeErr::ConstraintMismatch { expected, got } => {
                write!(f, "image doesn't fit the model input: got {got}, expected {expected}")
            }
            PersonalizeErr::InvalidLabel => write!(f, "the label is blank or reserved"),
            PersonalizeErr::UnknownLabel(label) => {
                write!(f, "the label {label:?} is not part of the model's vocabulary")
            }
            PersonalizeErr::InvalidConfig(detail) => write!(f, "invalid configuration: {detail}"),
            PersonalizeErr::EmptyBatch => write!(f, "no sample could be turned into a training record"),
            PersonalizeErr::Busy => write!(f, "an update is already in progress"),
            PersonalizeErr::UpdateProcedure(e) => write!(f, "the update procedure failed: {e}"),
            PersonalizeErr::Persistence(e) => write!(f, "failed to persist the updated model: {e}"),
            PersonalizeErr::Timeout(d) => write!(f, "the update didn't finish within {d:?}"),
            PersonalizeErr::TaskFailed(detail) => write!(f, "the update task failed: {detail}"),
        }
    }
}

impl Error for PersonalizeErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            PersonalizeErr::Io(e) | PersonalizeErr::Persistence(e) => Some(e),
            PersonalizeErr::Image(e) => Some(e),
            PersonalizeErr::Json(e) => Some(e),
            PersonalizeErr::Ml(e) | PersonalizeErr::UpdateProcedure(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for PersonalizeErr {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<image::ImageError> for PersonalizeErr {
    fn from(value: image::ImageError) -> Self {
        Self::Image(value)
    }
}

impl From<serde_json::Error> for PersonalizeErr {
    fn from(value: serde_json::Error) -> Self {
        Self::Json(value)
    }
}

impl From<MlErr> for PersonalizeErr {
    fn from(value: MlErr) -> Self {
        Self::Ml(value)
    }
}
