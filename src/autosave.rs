//! Autosave coordinator: the only writer of answers to the submission API.
//!
//! Edits are enqueued into the [`PendingStore`] immediately, then saved by
//! either a per-question debounce timer or the periodic batch flush. Both
//! paths take entries out of the store atomically before the network call, so
//! only one of them ever sends a given entry.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::api::{ErrorReporter, SubmissionApi};
use crate::config::PipelineConfig;
use crate::error::{ExamSaveError, Result, SaveError};
use crate::events::{EventBus, PipelineEvent};
use crate::recovery::PendingFlusher;
use crate::store::{PendingAnswer, PendingStore};
use crate::types::{DroppedAnswer, ExamSession, FlushReport, QuestionId, SaveStatus};

struct DebounceTimer {
    id: u64,
    handle: JoinHandle<()>,
}

struct PeriodicWorker {
    handle: JoinHandle<()>,
    shutdown: Arc<Notify>,
}

enum FailureOutcome {
    Requeued,
    Dropped,
    Expired,
}

pub struct AutosaveCoordinator {
    config: PipelineConfig,
    store: Arc<PendingStore>,
    api: Arc<dyn SubmissionApi>,
    reporter: Arc<dyn ErrorReporter>,
    events: EventBus,
    runtime: Handle,
    session: Mutex<Option<ExamSession>>,
    periodic: Mutex<Option<PeriodicWorker>>,
    /// question -> scheduled debounce timer; replaced and aborted on every edit
    debounces: DashMap<QuestionId, DebounceTimer>,
    next_timer_id: AtomicU64,
    running: AtomicBool,
    time_expired: AtomicBool,
    me: Weak<Self>,
}

impl AutosaveCoordinator {
    /// Must be called from within a Tokio runtime; timers are spawned onto it
    /// even when later calls come from non-runtime threads.
    pub fn new(
        config: PipelineConfig,
        store: Arc<PendingStore>,
        api: Arc<dyn SubmissionApi>,
        reporter: Arc<dyn ErrorReporter>,
        events: EventBus,
    ) -> Arc<Self> {
        let runtime = Handle::current();
        Arc::new_cyclic(|me| Self {
            config,
            store,
            api,
            reporter,
            events,
            runtime,
            session: Mutex::new(None),
            periodic: Mutex::new(None),
            debounces: DashMap::new(),
            next_timer_id: AtomicU64::new(1),
            running: AtomicBool::new(false),
            time_expired: AtomicBool::new(false),
            me: me.clone(),
        })
    }

    /// Begin periodic flushing for `session`. No-op if already running.
    pub fn start(&self, session: ExamSession) {
        if self.running.swap(true, Ordering::AcqRel) {
            tracing::warn!("[AUTOSAVE] already running, ignoring start");
            return;
        }

        tracing::info!(
            "[AUTOSAVE] starting for submission {}, flush every {:?}, debounce {:?}",
            session.submission_id,
            self.config.flush_interval,
            self.config.debounce_delay
        );
        *lock(&self.session) = Some(session);
        self.time_expired.store(false, Ordering::Release);

        let shutdown = Arc::new(Notify::new());
        let handle = self.runtime.spawn(run_flush_loop(
            self.me.clone(),
            Arc::clone(&shutdown),
            self.config.flush_interval,
        ));
        *lock(&self.periodic) = Some(PeriodicWorker { handle, shutdown });

        self.emit_status(SaveStatus::Ready);
    }

    /// Record an edit. The value is persisted before this returns; the
    /// network save happens once the question has been quiet for the
    /// debounce delay.
    pub fn on_answer_changed(&self, question_id: impl Into<QuestionId>, answer_value: impl Into<String>) {
        let question_id = question_id.into();
        self.store.enqueue(question_id.clone(), answer_value);

        if !self.running.load(Ordering::Acquire) {
            tracing::warn!(
                "[AUTOSAVE] not running, question {} kept in queue only",
                question_id
            );
            return;
        }
        if self.time_expired.load(Ordering::Acquire) {
            tracing::debug!(
                "[AUTOSAVE] session expired, question {} kept in queue only",
                question_id
            );
            return;
        }

        self.schedule_debounce(question_id);
    }

    /// Drain one batch of the oldest pending answers and try to save each.
    ///
    /// Refused with `NoActiveSession` before `start` and once `stop` has begun.
    pub async fn save_all_pending(&self) -> Result<FlushReport> {
        if !self.running.load(Ordering::Acquire) {
            tracing::warn!("[AUTOSAVE] not running, cannot flush");
            return Err(ExamSaveError::NoActiveSession);
        }
        let Some(session) = self.session() else {
            tracing::warn!("[AUTOSAVE] no active session, cannot flush");
            return Err(ExamSaveError::NoActiveSession);
        };
        self.flush_batch(&session).await
    }

    async fn flush_batch(&self, session: &ExamSession) -> Result<FlushReport> {
        if self.time_expired.load(Ordering::Acquire) {
            tracing::debug!("[AUTOSAVE] session expired, skipping flush");
            return Err(ExamSaveError::TimeExpired(
                "exam time window has closed".to_string(),
            ));
        }
        if self.store.pending_count() == 0 {
            tracing::debug!("[AUTOSAVE] nothing pending");
            return Ok(FlushReport::default());
        }

        let batch = self.store.dequeue_oldest(self.config.batch_size);
        if batch.is_empty() {
            return Ok(FlushReport::default());
        }

        tracing::info!("[AUTOSAVE] saving {} pending answers", batch.len());
        self.emit_status(SaveStatus::Saving);

        let mut report = FlushReport::default();
        let mut remaining = batch.into_iter();
        while let Some(entry) = remaining.next() {
            report.attempted += 1;
            let question_id = entry.question_id.clone();
            let retry_count = entry.retry_count;
            match self.submit(session, &entry, true).await {
                Ok(()) => {
                    report.succeeded += 1;
                    tracing::debug!(
                        "[AUTOSAVE] saved question {} (retry {})",
                        question_id,
                        retry_count
                    );
                }
                Err(e) => match self.handle_failure(session, entry, e).await {
                    FailureOutcome::Requeued => report.requeued += 1,
                    FailureOutcome::Dropped => report.dropped += 1,
                    FailureOutcome::Expired => {
                        report.time_expired = true;
                        self.store.put_back(remaining.by_ref().collect());
                        break;
                    }
                },
            }
        }

        tracing::info!(
            "[AUTOSAVE] batch done: {} saved, {} requeued, {} dropped, {} still pending",
            report.succeeded,
            report.requeued,
            report.dropped,
            self.store.pending_count()
        );
        if let Some(status) = report.status() {
            self.emit_status(status);
        }
        Ok(report)
    }

    /// Cancel every timer, flush once more, and wait (bounded) for the
    /// periodic worker. Safe to call when not running. No save starts after
    /// this returns; the session is cleared.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            tracing::debug!("[AUTOSAVE] stop called while not running");
            return;
        }
        tracing::info!("[AUTOSAVE] stopping");

        let worker = lock(&self.periodic).take();
        if let Some(ref w) = worker {
            w.shutdown.notify_one();
        }
        self.cancel_debounces();

        if let Some(session) = self.session() {
            if let Err(e) = self.flush_batch(&session).await {
                tracing::warn!("[AUTOSAVE] final flush skipped: {}", e);
            }
        }
        *lock(&self.session) = None;

        if let Some(w) = worker {
            let abort = w.handle.abort_handle();
            if tokio::time::timeout(self.config.shutdown_timeout, w.handle)
                .await
                .is_err()
            {
                tracing::warn!(
                    "[AUTOSAVE] periodic worker still busy after {:?}, aborting",
                    self.config.shutdown_timeout
                );
                abort.abort();
            }
        }
        tracing::info!(
            "[AUTOSAVE] stopped, {} answers left in queue",
            self.store.pending_count()
        );
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn is_time_expired(&self) -> bool {
        self.time_expired.load(Ordering::Acquire)
    }

    pub fn pending_count(&self) -> usize {
        self.store.pending_count()
    }

    /// Number of debounce timers currently waiting to fire.
    pub fn scheduled_debounces(&self) -> usize {
        self.debounces.len()
    }

    pub fn session(&self) -> Option<ExamSession> {
        lock(&self.session).clone()
    }

    fn schedule_debounce(&self, question_id: QuestionId) {
        let id = self.next_timer_id.fetch_add(1, Ordering::Relaxed);
        let spawn_timer = || {
            self.runtime.spawn(run_debounce_timer(
                self.me.clone(),
                question_id.clone(),
                id,
                self.config.debounce_delay,
            ))
        };

        // The shard lock is held while spawning, so the timer cannot claim
        // its slot before it has been inserted. `stop` and expiry flip their
        // flag before sweeping the map; re-checked here under the lock.
        let entry = self.debounces.entry(question_id.clone());
        if !self.running.load(Ordering::Acquire) || self.time_expired.load(Ordering::Acquire) {
            tracing::debug!(
                "[AUTOSAVE] question {} kept in queue only, autosave shutting down",
                question_id
            );
            return;
        }
        match entry {
            Entry::Occupied(mut slot) => {
                let previous = std::mem::replace(
                    slot.get_mut(),
                    DebounceTimer {
                        id,
                        handle: spawn_timer(),
                    },
                );
                previous.handle.abort();
            }
            Entry::Vacant(slot) => {
                slot.insert(DebounceTimer {
                    id,
                    handle: spawn_timer(),
                });
            }
        }
        tracing::debug!(
            "[AUTOSAVE] question {} changed, save scheduled in {:?}",
            question_id,
            self.config.debounce_delay
        );
    }

    fn cancel_debounces(&self) {
        self.debounces.retain(|_, timer| {
            timer.handle.abort();
            false
        });
    }

    async fn save_debounced(&self, question_id: &str) {
        if !self.running.load(Ordering::Acquire) || self.time_expired.load(Ordering::Acquire) {
            return;
        }
        let Some(session) = self.session() else {
            tracing::warn!("[AUTOSAVE] no active session, dropping debounce for {}", question_id);
            return;
        };
        let Some(entry) = self.store.take(question_id) else {
            tracing::debug!(
                "[AUTOSAVE] question {} already flushed, debounce is a no-op",
                question_id
            );
            return;
        };

        tracing::info!("[AUTOSAVE] debounced save for question {}", question_id);
        self.emit_status(SaveStatus::Saving);

        match self.submit(&session, &entry, false).await {
            Ok(()) => {
                tracing::debug!("[AUTOSAVE] debounced save ok for question {}", question_id);
                self.emit_status(SaveStatus::Success);
            }
            Err(e) => {
                self.handle_failure(&session, entry, e).await;
                self.emit_status(SaveStatus::Failure);
            }
        }
    }

    async fn submit(
        &self,
        session: &ExamSession,
        entry: &PendingAnswer,
        is_auto_save: bool,
    ) -> std::result::Result<(), SaveError> {
        let call = self.api.save_answer(
            &session.submission_id,
            &entry.question_id,
            &entry.answer_value,
            is_auto_save,
        );
        match tokio::time::timeout(self.config.request_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(SaveError::Network(format!(
                "request timed out after {:?}",
                self.config.request_timeout
            ))),
        }
    }

    async fn handle_failure(
        &self,
        session: &ExamSession,
        entry: PendingAnswer,
        error: SaveError,
    ) -> FailureOutcome {
        if !error.is_retryable() {
            tracing::error!(
                "[AUTOSAVE] save of question {} rejected, exam time expired",
                entry.question_id
            );
            self.store.put_back(vec![entry]);
            let message = match error {
                SaveError::TimeExpired(msg) => msg,
                other => other.to_string(),
            };
            self.mark_time_expired(message);
            return FailureOutcome::Expired;
        }

        if entry.retry_count < self.config.max_retry_attempts {
            let question_id = entry.question_id.clone();
            let retry = self.store.requeue(entry);
            tracing::warn!(
                "[AUTOSAVE] save failed for question {} ({}), requeued (retry {})",
                question_id,
                error,
                retry
            );
            FailureOutcome::Requeued
        } else {
            self.drop_answer(session, entry, &error).await;
            FailureOutcome::Dropped
        }
    }

    async fn drop_answer(&self, session: &ExamSession, entry: PendingAnswer, error: &SaveError) {
        let report = DroppedAnswer {
            report_id: uuid::Uuid::new_v4().to_string(),
            session_id: session.submission_id.clone(),
            question_id: entry.question_id,
            answer_value: entry.answer_value,
            attempts: entry.retry_count + 1,
            last_error: error.kind().to_string(),
            client_id: self.config.client_id.clone(),
            dropped_at: Utc::now(),
        };
        tracing::error!(
            "[AUTOSAVE] save failed for question {} after {} attempts, DROPPED (report {})",
            report.question_id,
            report.attempts,
            report.report_id
        );

        if tokio::time::timeout(
            self.config.request_timeout,
            self.reporter.report_dropped(&report),
        )
        .await
        .is_err()
        {
            tracing::error!(
                "[AUTOSAVE] error reporter timed out for report {}",
                report.report_id
            );
        }
        self.events.emit(PipelineEvent::AnswerDropped(report));
    }

    /// Terminal for the session: stop every automatic save and tell the UI once.
    fn mark_time_expired(&self, message: String) {
        if self.time_expired.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::error!("[AUTOSAVE] exam time expired, automatic saving halted: {}", message);
        self.cancel_debounces();
        if let Some(w) = lock(&self.periodic).as_ref() {
            w.shutdown.notify_one();
        }
        self.events.emit(PipelineEvent::TimeExpired(message));
    }

    fn emit_status(&self, status: SaveStatus) {
        self.events.emit(PipelineEvent::SaveStatusChanged(status));
    }
}

#[async_trait]
impl PendingFlusher for AutosaveCoordinator {
    async fn save_all_pending(&self) -> Result<FlushReport> {
        AutosaveCoordinator::save_all_pending(self).await
    }

    fn pending_count(&self) -> usize {
        self.store.pending_count()
    }
}

async fn run_flush_loop(coordinator: Weak<AutosaveCoordinator>, shutdown: Arc<Notify>, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await; // skip the first immediate tick

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let Some(this) = coordinator.upgrade() else {
                    break;
                };
                if let Err(e) = this.save_all_pending().await {
                    tracing::debug!("[AUTOSAVE] periodic flush skipped: {}", e);
                }
            }
            _ = shutdown.notified() => {
                tracing::info!("[AUTOSAVE] flush loop shutting down");
                break;
            }
        }
    }
}

async fn run_debounce_timer(
    coordinator: Weak<AutosaveCoordinator>,
    question_id: QuestionId,
    id: u64,
    delay: Duration,
) {
    tokio::time::sleep(delay).await;
    let Some(this) = coordinator.upgrade() else {
        return;
    };
    // Claim the slot; if a newer edit replaced this timer it will do the save.
    if this
        .debounces
        .remove_if(&question_id, |_, timer| timer.id == id)
        .is_none()
    {
        return;
    }
    this.save_debounced(&question_id).await;
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
