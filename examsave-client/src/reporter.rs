use async_trait::async_trait;
use examsave::{DroppedAnswer, ErrorReporter};
use serde::Serialize;
use std::time::Duration;

use crate::{build_http_client, trim_base_url};

const REPORT_SOURCE: &str = "autosave";

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SystemLogRequest<'a> {
    level: &'static str,
    source: &'static str,
    message: String,
    submission_id: serde_json::Value,
    additional_data: String,
    client_id: &'a str,
}

/// Sends dropped-answer reports to `POST {base}/api/system-logs`.
pub struct HttpErrorReporter {
    url: String,
    token: String,
    http_client: reqwest::Client,
}

impl HttpErrorReporter {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>, timeout: Duration) -> Self {
        Self {
            url: format!("{}/api/system-logs", trim_base_url(base_url.into())),
            token: token.into(),
            http_client: build_http_client(timeout),
        }
    }

    fn build_request<'a>(&self, report: &'a DroppedAnswer) -> SystemLogRequest<'a> {
        // Numeric ids go out as numbers so the server can link the log row.
        let submission_id = report
            .session_id
            .parse::<i64>()
            .map(serde_json::Value::from)
            .unwrap_or_else(|_| serde_json::Value::from(report.session_id.clone()));

        let additional_data = serde_json::json!({
            "reportId": report.report_id,
            "questionId": report.question_id,
            "answerValue": report.answer_value,
            "attempts": report.attempts,
            "lastError": report.last_error,
            "droppedAt": report.dropped_at,
        });

        SystemLogRequest {
            level: "ERROR",
            source: REPORT_SOURCE,
            message: format!(
                "Failed to save answer for question {} after {} attempts ({})",
                report.question_id, report.attempts, report.last_error
            ),
            submission_id,
            additional_data: additional_data.to_string(),
            client_id: &report.client_id,
        }
    }
}

#[async_trait]
impl ErrorReporter for HttpErrorReporter {
    async fn report_dropped(&self, report: &DroppedAnswer) {
        let body = self.build_request(report);
        let result = self
            .http_client
            .post(&self.url)
            .bearer_auth(&self.token)
            .json(&body)
            .send()
            .await;

        match result {
            Ok(response) if response.status().is_success() => {
                tracing::info!("[API] dropped-answer report {} delivered", report.report_id);
            }
            Ok(response) => {
                tracing::error!(
                    "[API] system log rejected report {}: {}",
                    report.report_id,
                    response.status()
                );
            }
            Err(e) => {
                tracing::error!(
                    "[API] failed to send report {} to system log: {}",
                    report.report_id,
                    e
                );
            }
        }
    }
}
