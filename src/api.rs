//! Seams to the collaborators outside the pipeline: the submission endpoint,
//! the reachability probe and the sink for unrecoverable answers.

use async_trait::async_trait;

use crate::error::SaveError;
use crate::types::DroppedAnswer;

/// Durable server-side storage of one answer.
#[async_trait]
pub trait SubmissionApi: Send + Sync {
    async fn save_answer(
        &self,
        session_id: &str,
        question_id: &str,
        answer_value: &str,
        is_auto_save: bool,
    ) -> Result<(), SaveError>;
}

/// Lightweight reachability check. Implementations should not retry; the
/// monitor bounds each call with its own timeout.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn probe(&self) -> bool;
}

/// Receives answers that exhausted their retries.
#[async_trait]
pub trait ErrorReporter: Send + Sync {
    async fn report_dropped(&self, report: &DroppedAnswer);
}

/// Reporter that only writes the full report to the log.
pub struct TracingReporter;

#[async_trait]
impl ErrorReporter for TracingReporter {
    async fn report_dropped(&self, report: &DroppedAnswer) {
        tracing::error!(
            report_id = %report.report_id,
            session_id = %report.session_id,
            question_id = %report.question_id,
            attempts = report.attempts,
            last_error = %report.last_error,
            answer_value = %report.answer_value,
            "[AUTOSAVE] answer dropped after exhausting retries"
        );
    }
}
