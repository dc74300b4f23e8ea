use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum ExamSaveError {
    #[error("IO error: {0}")]
    Io(String),

    #[error("JSON error: {0}")]
    Json(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("No active exam session")]
    NoActiveSession,

    #[error("Exam time expired: {0}")]
    TimeExpired(String),

    #[error("Recovery failed: {0}")]
    Recovery(String),
}

pub type Result<T> = std::result::Result<T, ExamSaveError>;

impl From<std::io::Error> for ExamSaveError {
    fn from(e: std::io::Error) -> Self {
        ExamSaveError::Io(e.to_string())
    }
}

impl From<serde_json::Error> for ExamSaveError {
    fn from(e: serde_json::Error) -> Self {
        ExamSaveError::Json(e.to_string())
    }
}

impl From<tempfile::PersistError> for ExamSaveError {
    fn from(e: tempfile::PersistError) -> Self {
        ExamSaveError::Io(e.error.to_string())
    }
}

/// Outcome of a single failed submission attempt.
///
/// Only `TimeExpired` is terminal; everything else is retried up to the cap.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SaveError {
    #[error("network error: {0}")]
    Network(String),

    #[error("server error: {status}")]
    Server { status: u16 },

    #[error("exam time expired: {0}")]
    TimeExpired(String),
}

impl SaveError {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, SaveError::TimeExpired(_))
    }

    /// Short classification safe to show in reports (no transport detail).
    pub fn kind(&self) -> &'static str {
        match self {
            SaveError::Network(_) => "network_error",
            SaveError::Server { .. } => "server_error",
            SaveError::TimeExpired(_) => "time_expired",
        }
    }
}
