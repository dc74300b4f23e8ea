//! HTTP side of examsave: the exam server's save endpoint, its availability
//! check and its system-log sink, each behind the trait the pipeline expects.

mod probe;
mod reporter;
mod submission;

pub use probe::HttpHealthProbe;
pub use reporter::HttpErrorReporter;
pub use submission::HttpSubmissionClient;

use std::time::Duration;

pub(crate) fn build_http_client(timeout: Duration) -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .unwrap_or_else(|_| reqwest::Client::new())
}

pub(crate) fn trim_base_url(base_url: String) -> String {
    base_url.trim_end_matches('/').to_string()
}
