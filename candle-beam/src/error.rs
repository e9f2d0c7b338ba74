use std::path::PathBuf;

/// The external model call that failed during a search.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelStage {
    Encode,
    Decode,
    Project,
}

impl std::fmt::Display for ModelStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Encode => "encoder",
            Self::Decode => "decoder",
            Self::Project => "output projection",
        };
        f.write_str(name)
    }
}

/// Main library error type.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid beam search config: {0}")]
    Config(String),

    #[error("{stage} call failed: {source}")]
    ModelInvocation {
        stage: ModelStage,
        #[source]
        source: candle::Error,
    },

    /// The physical batch no longer lines up with the active instances.
    #[error("index integrity violated in {op}: expected {expected} rows, got {got}")]
    IndexIntegrity {
        op: &'static str,
        expected: usize,
        got: usize,
    },

    #[error("instance {logical} is not active or out of order in the index map")]
    InvalidActiveSet { logical: usize },

    #[error("unexpected shape in {op}: expected {expected}, got {got:?}")]
    UnexpectedShape {
        op: &'static str,
        expected: String,
        got: Vec<usize>,
    },

    #[error("advance called on a finished beam after {steps} steps")]
    BeamFinished { steps: usize },

    #[error("cannot load checkpoint {path:?}: {reason}")]
    Load { path: PathBuf, reason: String },

    #[error(transparent)]
    Candle(#[from] candle::Error),

    /// I/O error.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub(crate) fn model(stage: ModelStage) -> impl FnOnce(candle::Error) -> Self {
        move |source| Self::ModelInvocation { stage, source }
    }

    pub(crate) fn load(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        Self::Load {
            path: path.into(),
            reason: reason.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
