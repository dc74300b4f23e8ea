use clap::Parser;
use examsave::{
    AutosaveCoordinator, EventBus, ExamSession, HealthMonitor, PendingStore, PipelineConfig,
    PipelineEvent, RecoveryCoordinator,
};
use examsave_client::{HttpErrorReporter, HttpHealthProbe, HttpSubmissionClient};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Reads answer edits from stdin as `question_id<TAB>answer` lines and prints
/// every pipeline event to stdout as one JSON object per line.
///
/// Commands: `:flush`, `:retry`, `:probe`, `:status`, `:quit`.
#[derive(Parser)]
#[command(name = "examsave", version)]
struct Cli {
    #[arg(long, env = "EXAMSAVE_BASE_URL", default_value = "http://localhost:8080")]
    base_url: String,
    #[arg(long, env = "EXAMSAVE_TOKEN", default_value = "")]
    token: String,
    #[arg(long, env = "EXAMSAVE_SUBMISSION_ID")]
    submission_id: String,
    #[arg(long)]
    exam_title: Option<String>,
    /// Overrides EXAMSAVE_QUEUE_FILE.
    #[arg(long)]
    queue_file: Option<PathBuf>,
    #[arg(long)]
    debounce_ms: Option<u64>,
    #[arg(long)]
    flush_interval_ms: Option<u64>,
    #[arg(long)]
    probe_interval_ms: Option<u64>,
    #[arg(long)]
    max_retry_attempts: Option<u32>,
}

impl Cli {
    fn pipeline_config(&self) -> PipelineConfig {
        let mut config = PipelineConfig::from_env();
        if let Some(ref path) = self.queue_file {
            config.queue_file = path.clone();
        }
        if let Some(ms) = self.debounce_ms {
            config.debounce_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = self.flush_interval_ms {
            config.flush_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = self.probe_interval_ms {
            config.probe_interval = Duration::from_millis(ms);
        }
        if let Some(n) = self.max_retry_attempts {
            config.max_retry_attempts = n;
        }
        config
    }
}

enum Flow {
    Continue,
    Quit,
}

struct Pipeline {
    autosave: Arc<AutosaveCoordinator>,
    recovery: Arc<RecoveryCoordinator>,
    health: Arc<HealthMonitor>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "examsave=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let config = cli.pipeline_config();
    if let Err(e) = config.validate() {
        eprintln!("error: {}", e);
        std::process::exit(1);
    }

    let store = Arc::new(PendingStore::open(&config.queue_file));
    let restored = store.restore_from_disk();
    if restored > 0 {
        tracing::info!(
            "restored {} unsaved answers from {}",
            restored,
            config.queue_file.display()
        );
    }

    let events = EventBus::new();
    let mut event_rx = events.subscribe();

    let api = Arc::new(HttpSubmissionClient::new(
        cli.base_url.clone(),
        cli.token.clone(),
        config.request_timeout,
    ));
    let reporter = Arc::new(HttpErrorReporter::new(
        cli.base_url.clone(),
        cli.token.clone(),
        config.request_timeout,
    ));
    let probe = Arc::new(HttpHealthProbe::new(cli.base_url.clone(), config.probe_timeout));

    let autosave = AutosaveCoordinator::new(config.clone(), store, api, reporter, events.clone());
    let recovery = RecoveryCoordinator::new(&config, autosave.clone(), events.clone());
    let health = HealthMonitor::new(&config, probe);
    health.add_listener(recovery.clone());

    let mut session = ExamSession::new(cli.submission_id.clone());
    if let Some(ref title) = cli.exam_title {
        session = session.with_title(title.clone());
    }
    autosave.start(session);
    health.start();

    let pipeline = Pipeline {
        autosave,
        recovery,
        health,
    };

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            Some(event) = event_rx.recv() => print_event(&event),
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    if let Flow::Quit = handle_line(&pipeline, &line).await {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::error!("failed to read stdin: {}", e);
                    break;
                }
            },
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupted, shutting down");
                break;
            }
        }
    }

    pipeline.health.stop().await;
    pipeline.autosave.stop().await;

    while let Ok(event) = event_rx.try_recv() {
        print_event(&event);
    }
    print_status(&pipeline);

    let left = pipeline.autosave.pending_count();
    if left > 0 {
        tracing::warn!(
            "{} answers still queued in {}, they will be retried on next start",
            left,
            config.queue_file.display()
        );
    }
}

async fn handle_line(pipeline: &Pipeline, line: &str) -> Flow {
    let line = line.trim_end_matches(['\r', '\n']);
    match line.trim() {
        "" => return Flow::Continue,
        ":quit" => return Flow::Quit,
        ":flush" => {
            // Off the input loop so edits and commands keep flowing while it runs.
            let autosave = Arc::clone(&pipeline.autosave);
            tokio::spawn(async move {
                match autosave.save_all_pending().await {
                    Ok(report) => tracing::info!(
                        "flush: {} attempted, {} saved",
                        report.attempted,
                        report.succeeded
                    ),
                    Err(e) => tracing::warn!("flush refused: {}", e),
                }
            });
            return Flow::Continue;
        }
        ":retry" => {
            pipeline.recovery.force_retry();
            return Flow::Continue;
        }
        ":probe" => {
            let connected = pipeline.health.force_probe().await;
            tracing::info!("probe: connected = {}", connected);
            return Flow::Continue;
        }
        ":status" => {
            print_status(pipeline);
            return Flow::Continue;
        }
        _ => {}
    }

    match line.split_once('\t') {
        Some((question_id, answer)) if !question_id.trim().is_empty() => {
            pipeline
                .autosave
                .on_answer_changed(question_id.trim(), unescape(answer));
        }
        _ => tracing::warn!("ignoring malformed line, expected question_id<TAB>answer"),
    }
    Flow::Continue
}

/// Essay answers arrive on one line with `\n` and `\t` escaped.
fn unescape(answer: &str) -> String {
    answer.replace("\\n", "\n").replace("\\t", "\t")
}

fn print_event(event: &PipelineEvent) {
    match serde_json::to_string(event) {
        Ok(json) => println!("{}", json),
        Err(e) => tracing::warn!("failed to serialize event: {}", e),
    }
}

fn print_status(pipeline: &Pipeline) {
    let status = serde_json::json!({
        "event": "status",
        "data": {
            "pending": pipeline.autosave.pending_count(),
            "connection": pipeline.recovery.status(),
            "connected": pipeline.health.is_connected(),
            "recovering": pipeline.recovery.is_recovering(),
            "time_expired": pipeline.autosave.is_time_expired(),
        }
    });
    println!("{}", status);
}
