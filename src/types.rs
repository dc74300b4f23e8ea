use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Question identifier. Opaque to the pipeline; only used as a map key.
pub type QuestionId = String;
/// Submission (exam attempt) identifier on the server.
pub type SessionId = String;
/// Serialized answer payload (plain text, JSON, or a file reference).
/// The pipeline never inspects its structure.
pub type AnswerValue = String;

/// The exam attempt answers are saved into.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExamSession {
    pub submission_id: SessionId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exam_title: Option<String>,
}

impl ExamSession {
    pub fn new(submission_id: impl Into<SessionId>) -> Self {
        Self {
            submission_id: submission_id.into(),
            exam_title: None,
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.exam_title = Some(title.into());
        self
    }
}

/// Save state as rendered by the UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SaveStatus {
    Ready,
    Saving,
    Success,
    Failure,
    PartialFailure,
}

impl SaveStatus {
    pub fn display_text(&self) -> &'static str {
        match self {
            SaveStatus::Ready => "Ready",
            SaveStatus::Saving => "Saving...",
            SaveStatus::Success => "Saved",
            SaveStatus::Failure => "Save failed",
            SaveStatus::PartialFailure => "Partially saved",
        }
    }
}

impl std::fmt::Display for SaveStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SaveStatus::Ready => write!(f, "ready"),
            SaveStatus::Saving => write!(f, "saving"),
            SaveStatus::Success => write!(f, "success"),
            SaveStatus::Failure => write!(f, "failure"),
            SaveStatus::PartialFailure => write!(f, "partial_failure"),
        }
    }
}

/// Process-wide connection state owned by the recovery coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionStatus {
    Connected,
    Disconnected,
    Reconnecting,
    PartialRecovery,
    RecoveryFailed,
}

impl ConnectionStatus {
    pub fn display_text(&self) -> &'static str {
        match self {
            ConnectionStatus::Connected => "Connected",
            ConnectionStatus::Disconnected => "Connection lost",
            ConnectionStatus::Reconnecting => "Reconnecting...",
            ConnectionStatus::PartialRecovery => "Partially reconnected",
            ConnectionStatus::RecoveryFailed => "Reconnect failed",
        }
    }

    pub fn color_hint(&self) -> &'static str {
        match self {
            ConnectionStatus::Connected => "green",
            ConnectionStatus::Disconnected | ConnectionStatus::RecoveryFailed => "red",
            ConnectionStatus::Reconnecting | ConnectionStatus::PartialRecovery => "orange",
        }
    }

    pub(crate) fn as_u8(self) -> u8 {
        match self {
            ConnectionStatus::Connected => 0,
            ConnectionStatus::Disconnected => 1,
            ConnectionStatus::Reconnecting => 2,
            ConnectionStatus::PartialRecovery => 3,
            ConnectionStatus::RecoveryFailed => 4,
        }
    }

    pub(crate) fn from_u8(v: u8) -> Self {
        match v {
            1 => ConnectionStatus::Disconnected,
            2 => ConnectionStatus::Reconnecting,
            3 => ConnectionStatus::PartialRecovery,
            4 => ConnectionStatus::RecoveryFailed,
            _ => ConnectionStatus::Connected,
        }
    }
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionStatus::Connected => write!(f, "connected"),
            ConnectionStatus::Disconnected => write!(f, "disconnected"),
            ConnectionStatus::Reconnecting => write!(f, "reconnecting"),
            ConnectionStatus::PartialRecovery => write!(f, "partial_recovery"),
            ConnectionStatus::RecoveryFailed => write!(f, "recovery_failed"),
        }
    }
}

/// Report for an answer that exhausted its retries. Carries the raw value so
/// it can be recovered by hand.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DroppedAnswer {
    pub report_id: String,
    pub session_id: SessionId,
    pub question_id: QuestionId,
    pub answer_value: AnswerValue,
    pub attempts: u32,
    pub last_error: String,
    pub client_id: String,
    pub dropped_at: DateTime<Utc>,
}

/// Counts from one `save_all_pending` batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlushReport {
    pub attempted: usize,
    pub succeeded: usize,
    pub requeued: usize,
    pub dropped: usize,
    pub time_expired: bool,
}

impl FlushReport {
    pub fn failed(&self) -> usize {
        self.requeued + self.dropped
    }

    /// Status to surface for this batch, `None` when nothing was attempted.
    pub fn status(&self) -> Option<SaveStatus> {
        if self.attempted == 0 {
            None
        } else if self.failed() == 0 && !self.time_expired {
            Some(SaveStatus::Success)
        } else if self.succeeded == 0 {
            Some(SaveStatus::Failure)
        } else {
            Some(SaveStatus::PartialFailure)
        }
    }
}

/// Outcome of one reconnect recovery run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryReport {
    pub status: ConnectionStatus,
    pub pending_before: usize,
    pub succeeded: usize,
    pub failed: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flush_report_status() {
        assert_eq!(FlushReport::default().status(), None);

        let all_ok = FlushReport {
            attempted: 2,
            succeeded: 2,
            ..Default::default()
        };
        assert_eq!(all_ok.status(), Some(SaveStatus::Success));

        let mixed = FlushReport {
            attempted: 3,
            succeeded: 1,
            requeued: 1,
            dropped: 1,
            time_expired: false,
        };
        assert_eq!(mixed.status(), Some(SaveStatus::PartialFailure));
        assert_eq!(mixed.failed(), 2);

        let none_ok = FlushReport {
            attempted: 2,
            requeued: 2,
            ..Default::default()
        };
        assert_eq!(none_ok.status(), Some(SaveStatus::Failure));
    }

    #[test]
    fn test_connection_status_roundtrip_u8() {
        for status in [
            ConnectionStatus::Connected,
            ConnectionStatus::Disconnected,
            ConnectionStatus::Reconnecting,
            ConnectionStatus::PartialRecovery,
            ConnectionStatus::RecoveryFailed,
        ] {
            assert_eq!(ConnectionStatus::from_u8(status.as_u8()), status);
        }
    }

    #[test]
    fn test_status_serializes_screaming_case() {
        let json = serde_json::to_string(&ConnectionStatus::PartialRecovery).unwrap();
        assert_eq!(json, "\"PARTIAL_RECOVERY\"");
        let json = serde_json::to_string(&SaveStatus::PartialFailure).unwrap();
        assert_eq!(json, "\"PARTIAL_FAILURE\"");
    }
}
