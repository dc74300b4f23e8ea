#![allow(dead_code)]

use async_trait::async_trait;
use examsave::{
    DroppedAnswer, ErrorReporter, HealthProbe, PipelineConfig, PipelineEvent, SaveError,
    SubmissionApi,
};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;

pub fn test_config(dir: &Path) -> PipelineConfig {
    PipelineConfig {
        queue_file: dir.join("queue.json"),
        client_id: "test-client".to_string(),
        ..Default::default()
    }
}

/// Config where neither timer fires unless a test waits an hour.
pub fn manual_config(dir: &Path) -> PipelineConfig {
    PipelineConfig {
        debounce_delay: Duration::from_secs(3600),
        flush_interval: Duration::from_secs(3600),
        ..test_config(dir)
    }
}

pub fn drain(rx: &mut UnboundedReceiver<PipelineEvent>) -> Vec<PipelineEvent> {
    let mut out = Vec::new();
    while let Ok(event) = rx.try_recv() {
        out.push(event);
    }
    out
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaveCall {
    pub session_id: String,
    pub question_id: String,
    pub answer_value: String,
    pub is_auto_save: bool,
}

/// Submission endpoint that records every call and answers from rules.
#[derive(Default)]
pub struct FakeSubmissionApi {
    calls: Mutex<Vec<SaveCall>>,
    fail_all: Mutex<Option<SaveError>>,
    fail_questions: Mutex<HashMap<String, SaveError>>,
    delay: Mutex<Duration>,
}

impl FakeSubmissionApi {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_all(&self, err: SaveError) {
        *self.fail_all.lock().unwrap() = Some(err);
    }

    pub fn succeed_all(&self) {
        *self.fail_all.lock().unwrap() = None;
        self.fail_questions.lock().unwrap().clear();
    }

    pub fn fail_question(&self, question_id: &str, err: SaveError) {
        self.fail_questions
            .lock()
            .unwrap()
            .insert(question_id.to_string(), err);
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    pub fn calls(&self) -> Vec<SaveCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn values_sent_for(&self, question_id: &str) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.question_id == question_id)
            .map(|c| c.answer_value.clone())
            .collect()
    }
}

#[async_trait]
impl SubmissionApi for FakeSubmissionApi {
    async fn save_answer(
        &self,
        session_id: &str,
        question_id: &str,
        answer_value: &str,
        is_auto_save: bool,
    ) -> Result<(), SaveError> {
        self.calls.lock().unwrap().push(SaveCall {
            session_id: session_id.to_string(),
            question_id: question_id.to_string(),
            answer_value: answer_value.to_string(),
            is_auto_save,
        });

        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        if let Some(err) = self.fail_questions.lock().unwrap().get(question_id) {
            return Err(err.clone());
        }
        match self.fail_all.lock().unwrap().clone() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// Probe whose answer is flipped by the test.
pub struct FakeProbe {
    reachable: AtomicBool,
    hang: AtomicBool,
    probes: AtomicUsize,
}

impl FakeProbe {
    pub fn new(reachable: bool) -> Arc<Self> {
        Arc::new(Self {
            reachable: AtomicBool::new(reachable),
            hang: AtomicBool::new(false),
            probes: AtomicUsize::new(0),
        })
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Make every following probe wait forever.
    pub fn set_hang(&self, hang: bool) {
        self.hang.store(hang, Ordering::SeqCst);
    }

    pub fn probe_count(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HealthProbe for FakeProbe {
    async fn probe(&self) -> bool {
        self.probes.fetch_add(1, Ordering::SeqCst);
        if self.hang.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        self.reachable.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
pub struct RecordingReporter {
    reports: Mutex<Vec<DroppedAnswer>>,
}

impl RecordingReporter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn reports(&self) -> Vec<DroppedAnswer> {
        self.reports.lock().unwrap().clone()
    }
}

#[async_trait]
impl ErrorReporter for RecordingReporter {
    async fn report_dropped(&self, report: &DroppedAnswer) {
        self.reports.lock().unwrap().push(report.clone());
    }
}
