//! Durable map of answers the server has not confirmed yet.
//!
//! Every mutation updates the in-memory map first and then rewrites the whole
//! queue file (temp file + rename). A failed write is logged and otherwise
//! ignored: the in-memory map stays authoritative for this process.
//!
//! The file left by a previous process is merged in before the first write,
//! whether or not [`PendingStore::restore_from_disk`] has been called yet, so
//! an early edit can never overwrite answers queued before a crash.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

use crate::error::Result;
use crate::types::{AnswerValue, QuestionId};

const QUEUE_FILE_VERSION: u32 = 1;

/// One answer awaiting confirmation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingAnswer {
    pub question_id: QuestionId,
    pub answer_value: AnswerValue,
    pub queued_at: DateTime<Utc>,
    pub retry_count: u32,
    pub last_retry_at: Option<DateTime<Utc>>,
}

impl PendingAnswer {
    pub fn new(question_id: QuestionId, answer_value: AnswerValue, queued_at: DateTime<Utc>) -> Self {
        Self {
            question_id,
            answer_value,
            queued_at,
            retry_count: 0,
            last_retry_at: None,
        }
    }
}

#[derive(Serialize)]
struct QueueFileRef<'a> {
    version: u32,
    entries: Vec<&'a PendingAnswer>,
}

#[derive(Deserialize)]
struct QueueFile {
    #[allow(dead_code)]
    version: u32,
    entries: Vec<PendingAnswer>,
}

#[derive(Default)]
struct QueueState {
    entries: HashMap<QuestionId, PendingAnswer>,
    /// The queue file has been merged into `entries`.
    disk_loaded: bool,
    /// Entries merged from disk that `restore_from_disk` has not reported yet.
    unreported_restored: usize,
}

pub struct PendingStore {
    path: PathBuf,
    state: Mutex<QueueState>,
    len: AtomicUsize,
}

impl PendingStore {
    /// Bind a store to `path`. Nothing is read until [`restore_from_disk`] or
    /// the first mutation.
    ///
    /// [`restore_from_disk`]: PendingStore::restore_from_disk
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            state: Mutex::new(QueueState::default()),
            len: AtomicUsize::new(0),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Insert or overwrite the pending answer for `question_id`.
    pub fn enqueue(&self, question_id: impl Into<QuestionId>, answer_value: impl Into<AnswerValue>) {
        self.enqueue_at(question_id, answer_value, Utc::now());
    }

    /// [`enqueue`](PendingStore::enqueue) with an explicit clock reading.
    /// `now` becomes `queued_at` only when no entry exists for the question.
    pub fn enqueue_at(
        &self,
        question_id: impl Into<QuestionId>,
        answer_value: impl Into<AnswerValue>,
        now: DateTime<Utc>,
    ) {
        let question_id = question_id.into();
        let answer_value = answer_value.into();
        let mut state = self.lock_loaded();
        match state.entries.entry(question_id.clone()) {
            Entry::Occupied(mut existing) => {
                existing.get_mut().answer_value = answer_value;
            }
            Entry::Vacant(slot) => {
                slot.insert(PendingAnswer::new(question_id.clone(), answer_value, now));
            }
        }
        self.commit(&state.entries);
        tracing::debug!("[STORE] enqueued answer for question {}", question_id);
    }

    /// Remove and return up to `max_items` entries, oldest `queued_at` first.
    pub fn dequeue_oldest(&self, max_items: usize) -> Vec<PendingAnswer> {
        let mut state = self.lock_loaded();
        let entries = &mut state.entries;
        let mut keys: Vec<(DateTime<Utc>, QuestionId)> = entries
            .values()
            .map(|e| (e.queued_at, e.question_id.clone()))
            .collect();
        keys.sort();

        let taken: Vec<PendingAnswer> = keys
            .into_iter()
            .take(max_items)
            .filter_map(|(_, key)| entries.remove(&key))
            .collect();

        if !taken.is_empty() {
            self.commit(entries);
        }
        tracing::debug!(
            "[STORE] dequeued {} answers, {} left",
            taken.len(),
            entries.len()
        );
        taken
    }

    /// Put a failed entry back with its retry counter bumped.
    ///
    /// If the question was edited again while this entry was in flight, the
    /// newer entry wins and `entry` is discarded. Returns the retry count the
    /// entry was requeued with.
    pub fn requeue(&self, mut entry: PendingAnswer) -> u32 {
        entry.retry_count = entry.retry_count.saturating_add(1);
        entry.last_retry_at = Some(Utc::now());
        let retry_count = entry.retry_count;

        let mut state = self.lock_loaded();
        match state.entries.entry(entry.question_id.clone()) {
            Entry::Occupied(_) => {
                tracing::debug!(
                    "[STORE] question {} was edited while saving, keeping newer value",
                    entry.question_id
                );
                return retry_count;
            }
            Entry::Vacant(slot) => {
                tracing::debug!(
                    "[STORE] requeued question {} (retry {})",
                    entry.question_id,
                    retry_count
                );
                slot.insert(entry);
            }
        }
        self.commit(&state.entries);
        retry_count
    }

    /// Reinsert entries unchanged. A newer entry for the same question wins.
    pub fn put_back(&self, batch: Vec<PendingAnswer>) {
        if batch.is_empty() {
            return;
        }
        let mut state = self.lock_loaded();
        for entry in batch {
            state.entries.entry(entry.question_id.clone()).or_insert(entry);
        }
        self.commit(&state.entries);
    }

    /// Delete the entry for `question_id`. Returns whether one was present.
    pub fn remove(&self, question_id: &str) -> bool {
        let mut state = self.lock_loaded();
        let removed = state.entries.remove(question_id).is_some();
        if removed {
            self.commit(&state.entries);
            tracing::debug!("[STORE] removed question {}", question_id);
        }
        removed
    }

    /// Atomically remove and return the entry for `question_id`.
    pub fn take(&self, question_id: &str) -> Option<PendingAnswer> {
        let mut state = self.lock_loaded();
        let taken = state.entries.remove(question_id);
        if taken.is_some() {
            self.commit(&state.entries);
        }
        taken
    }

    pub fn get(&self, question_id: &str) -> Option<PendingAnswer> {
        self.lock().entries.get(question_id).cloned()
    }

    /// All entries, oldest first.
    pub fn snapshot(&self) -> Vec<PendingAnswer> {
        let mut all: Vec<PendingAnswer> = self.lock().entries.values().cloned().collect();
        all.sort_by(|a, b| {
            a.queued_at
                .cmp(&b.queued_at)
                .then_with(|| a.question_id.cmp(&b.question_id))
        });
        all
    }

    /// Approximate size; never blocks on the map lock.
    pub fn pending_count(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    /// Load entries persisted by a previous process. Entries already in
    /// memory are kept. Returns how many entries were restored, including
    /// any merged in earlier by a mutation that ran before this call.
    pub fn restore_from_disk(&self) -> usize {
        let mut state = self.lock_loaded();
        let restored = std::mem::take(&mut state.unreported_restored);
        tracing::info!("[STORE] restored {} answers from queue file", restored);
        restored
    }

    /// Drop every entry and delete the queue file.
    pub fn clear(&self) {
        let mut state = self.lock();
        state.entries.clear();
        state.disk_loaded = true;
        state.unreported_restored = 0;
        self.len.store(0, Ordering::Release);
        match std::fs::remove_file(&self.path) {
            Ok(()) => tracing::info!("[STORE] queue cleared"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::error!("[STORE] failed to delete queue file: {}", e),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Lock the state, merging the queue file in first if that has not
    /// happened yet. Every path that persists goes through here.
    fn lock_loaded(&self) -> MutexGuard<'_, QueueState> {
        let mut state = self.lock();
        if !state.disk_loaded {
            state.disk_loaded = true;
            let mut merged = 0;
            for entry in self.read_queue_file() {
                if let Entry::Vacant(slot) = state.entries.entry(entry.question_id.clone()) {
                    slot.insert(entry);
                    merged += 1;
                }
            }
            state.unreported_restored = merged;
            self.len.store(state.entries.len(), Ordering::Release);
        }
        state
    }

    fn read_queue_file(&self) -> Vec<PendingAnswer> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(
                    "[STORE] no queue file at {}, starting fresh",
                    self.path.display()
                );
                return Vec::new();
            }
            Err(e) => {
                tracing::error!(
                    "[STORE] failed to read queue file {}: {}",
                    self.path.display(),
                    e
                );
                return Vec::new();
            }
        };

        if content.trim().is_empty() {
            return Vec::new();
        }

        match serde_json::from_str::<QueueFile>(&content) {
            Ok(file) => file.entries,
            Err(e) => {
                let aside = self.corrupt_path();
                tracing::error!(
                    "[STORE] queue file {} is unreadable ({}), moving it to {}",
                    self.path.display(),
                    e,
                    aside.display()
                );
                if let Err(e) = std::fs::rename(&self.path, &aside) {
                    tracing::error!("[STORE] failed to move corrupt queue file: {}", e);
                }
                Vec::new()
            }
        }
    }

    /// Publish the new size and persist. Called with the map lock held so
    /// file writes land in mutation order.
    fn commit(&self, entries: &HashMap<QuestionId, PendingAnswer>) {
        self.len.store(entries.len(), Ordering::Release);
        if let Err(e) = self.persist(entries) {
            tracing::error!(
                "[STORE] failed to persist {} answers to {}: {}",
                entries.len(),
                self.path.display(),
                e
            );
        }
    }

    fn persist(&self, entries: &HashMap<QuestionId, PendingAnswer>) -> Result<()> {
        let mut ordered: Vec<&PendingAnswer> = entries.values().collect();
        ordered.sort_by(|a, b| {
            a.queued_at
                .cmp(&b.queued_at)
                .then_with(|| a.question_id.cmp(&b.question_id))
        });
        let body = serde_json::to_vec(&QueueFileRef {
            version: QUEUE_FILE_VERSION,
            entries: ordered,
        })?;

        let dir = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        std::fs::create_dir_all(&dir)?;

        let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
        tmp.write_all(&body)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path)?;
        tracing::trace!("[STORE] persisted {} answers", entries.len());
        Ok(())
    }

    fn corrupt_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(".corrupt");
        PathBuf::from(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 11, 23, h, m, s).unwrap()
    }

    #[test]
    fn test_overwrite_keeps_queued_at_and_retry_count() {
        let dir = tempfile::tempdir().unwrap();
        let store = PendingStore::open(dir.path().join("queue.json"));

        store.enqueue_at("q1", "first", at(10, 0, 0));
        let taken = store.take("q1").unwrap();
        store.requeue(taken);
        store.enqueue_at("q1", "second", at(10, 5, 0));

        let entry = store.get("q1").unwrap();
        assert_eq!(entry.answer_value, "second");
        assert_eq!(entry.queued_at, at(10, 0, 0));
        assert_eq!(entry.retry_count, 1);
        assert_eq!(store.pending_count(), 1);
    }

    #[test]
    fn test_requeue_does_not_clobber_newer_edit() {
        let dir = tempfile::tempdir().unwrap();
        let store = PendingStore::open(dir.path().join("queue.json"));

        store.enqueue_at("q1", "stale", at(10, 0, 0));
        let in_flight = store.take("q1").unwrap();
        store.enqueue_at("q1", "fresh", at(10, 0, 5));
        store.requeue(in_flight);

        let entry = store.get("q1").unwrap();
        assert_eq!(entry.answer_value, "fresh");
        assert_eq!(entry.retry_count, 0);
    }

    #[test]
    fn test_dequeue_ties_break_by_question_id() {
        let dir = tempfile::tempdir().unwrap();
        let store = PendingStore::open(dir.path().join("queue.json"));

        store.enqueue_at("b", "2", at(9, 0, 0));
        store.enqueue_at("a", "1", at(9, 0, 0));

        let ids: Vec<_> = store
            .dequeue_oldest(10)
            .into_iter()
            .map(|e| e.question_id)
            .collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[test]
    fn test_mutations_rewrite_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("queue.json");
        let store = PendingStore::open(&path);

        store.enqueue("q1", "x");
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("\"q1\""));

        store.remove("q1");
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(!content.contains("\"q1\""));
    }

    #[test]
    fn test_corrupt_file_is_moved_aside() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.json");
        std::fs::write(&path, "{not json").unwrap();

        let store = PendingStore::open(&path);
        assert_eq!(store.restore_from_disk(), 0);
        assert_eq!(store.pending_count(), 0);
        assert!(dir.path().join("queue.json.corrupt").exists());
        assert!(!path.exists());
    }

    #[test]
    fn test_empty_file_is_empty_queue() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.json");
        std::fs::write(&path, "").unwrap();

        let store = PendingStore::open(&path);
        assert_eq!(store.restore_from_disk(), 0);
    }

    #[test]
    fn test_clear_deletes_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.json");
        let store = PendingStore::open(&path);

        store.enqueue("q1", "x");
        assert!(path.exists());
        store.clear();
        assert!(!path.exists());
        assert_eq!(store.pending_count(), 0);
    }
}
