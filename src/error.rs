use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CrnnError {
    /// A transcription contains a character outside the trained alphabet.
    #[error("unknown symbol {symbol:?} in transcription {text:?}")]
    UnknownSymbol { symbol: char, text: String },

    /// A transcription contains the blank symbol, which CTC reserves.
    #[error("blank symbol {symbol:?} is reserved and cannot appear in transcription {text:?}")]
    ReservedSymbol { symbol: char, text: String },

    /// A class index does not address any symbol of the alphabet.
    #[error("class index {index} is outside the alphabet of {size} symbols")]
    IndexOutOfRange { index: usize, size: usize },

    #[error("invalid alphabet: {0}")]
    InvalidAlphabet(String),

    /// A tensor dimension contract between two components was violated.
    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    #[error("device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("checkpoint {}: {message}", path.display())]
    CheckpointIo { path: PathBuf, message: String },

    #[error("sample {index} could not be loaded from the dataset")]
    MissingSample { index: usize },

    #[error("data loader worker failed: {0}")]
    Worker(String),

    #[error("configuration: {0}")]
    Config(String),

    #[error("io")]
    Io(#[from] std::io::Error),

    #[error("yaml")]
    Yaml(#[from] serde_yaml::Error),
}

impl CrnnError {
    pub fn shape_mismatch(message: impl Into<String>) -> Self {
        Self::ShapeMismatch(message.into())
    }

    pub fn checkpoint(path: impl Into<PathBuf>, message: impl ToString) -> Self {
        Self::CheckpointIo {
            path: path.into(),
            message: message.to_string(),
        }
    }
}

pub type Result<T, E = CrnnError> = std::result::Result<T, E>;
