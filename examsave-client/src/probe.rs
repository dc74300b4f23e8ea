use async_trait::async_trait;
use examsave::HealthProbe;
use std::time::Duration;

use crate::{build_http_client, trim_base_url};

/// Reachability check: `HEAD {base}/api/exam-taking/available`.
pub struct HttpHealthProbe {
    url: String,
    http_client: reqwest::Client,
}

impl HttpHealthProbe {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            url: format!("{}/api/exam-taking/available", trim_base_url(base_url.into())),
            http_client: build_http_client(timeout),
        }
    }
}

#[async_trait]
impl HealthProbe for HttpHealthProbe {
    async fn probe(&self) -> bool {
        match self.http_client.head(&self.url).send().await {
            Ok(response) => {
                let ok = response.status().is_success();
                tracing::trace!(
                    "[API] health check {}: {}",
                    if ok { "SUCCESS" } else { "FAILED" },
                    response.status()
                );
                ok
            }
            Err(e) => {
                tracing::debug!("[API] health check failed: {}", e);
                false
            }
        }
    }
}
