use async_trait::async_trait;
use examsave::{SaveError, SubmissionApi};
use serde::Serialize;
use std::time::Duration;

use crate::{build_http_client, trim_base_url};

/// Fragments the server uses when it refuses a save because the exam window
/// has closed.
const TIME_EXPIRED_MARKERS: &[&str] = &["expired", "hết thời gian", "time is up"];

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SaveAnswerRequest<'a> {
    question_id: &'a str,
    answer_text: &'a str,
    is_auto_save: bool,
}

/// Saves answers through `POST {base}/api/exam-taking/save-answer/{submission_id}`.
pub struct HttpSubmissionClient {
    base_url: String,
    token: String,
    http_client: reqwest::Client,
}

impl HttpSubmissionClient {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>, timeout: Duration) -> Self {
        Self {
            base_url: trim_base_url(base_url.into()),
            token: token.into(),
            http_client: build_http_client(timeout),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[async_trait]
impl SubmissionApi for HttpSubmissionClient {
    async fn save_answer(
        &self,
        session_id: &str,
        question_id: &str,
        answer_value: &str,
        is_auto_save: bool,
    ) -> Result<(), SaveError> {
        let url = format!("{}/api/exam-taking/save-answer/{}", self.base_url, session_id);
        let body = SaveAnswerRequest {
            question_id,
            answer_text: answer_value,
            is_auto_save,
        };

        let response = self
            .http_client
            .post(&url)
            .bearer_auth(&self.token)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    SaveError::Network(format!("save of question {} timed out", question_id))
                } else {
                    SaveError::Network(format!("failed to send save of question {}: {}", question_id, e))
                }
            })?;

        let status = response.status();
        if status.is_success() {
            tracing::debug!(
                "[API] saved question {} (auto_save: {})",
                question_id,
                is_auto_save
            );
            return Ok(());
        }

        let text = response.text().await.unwrap_or_default();
        tracing::warn!(
            "[API] save of question {} failed with {}: {}",
            question_id,
            status,
            text
        );
        Err(classify_rejection(status.as_u16(), &text))
    }
}

/// Map a non-2xx response onto the failure class the pipeline acts on.
pub(crate) fn classify_rejection(status: u16, body: &str) -> SaveError {
    let expired = match status {
        410 => true,
        400 | 403 => mentions_time_expired(body),
        _ => false,
    };
    if expired {
        let message = extract_message(body).unwrap_or_else(|| "exam time has expired".to_string());
        SaveError::TimeExpired(message)
    } else {
        SaveError::Server { status }
    }
}

fn mentions_time_expired(body: &str) -> bool {
    let lower = body.to_lowercase();
    TIME_EXPIRED_MARKERS.iter().any(|m| lower.contains(m))
}

/// Pull `message` out of a JSON error body, or use the trimmed body as-is.
fn extract_message(body: &str) -> Option<String> {
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(body) {
        if let Some(msg) = value.get("message").and_then(|m| m.as_str()) {
            return Some(msg.to_string());
        }
    }
    let trimmed = body.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}
