//! # examsave
//!
//! Reliable answer persistence for an exam-taking client. Every edit is
//! written to a local queue file before anything touches the network, then
//! saved by a per-question debounce or a periodic batch flush, retried a
//! bounded number of times, and reported if it can never be delivered.
//!
//! ## Wiring
//!
//! ```rust,no_run
//! use examsave::{
//!     AutosaveCoordinator, EventBus, ExamSession, HealthMonitor, PendingStore,
//!     PipelineConfig, RecoveryCoordinator, TracingReporter,
//! };
//! use std::sync::Arc;
//!
//! # async fn wire(
//! #     api: Arc<dyn examsave::SubmissionApi>,
//! #     probe: Arc<dyn examsave::HealthProbe>,
//! # ) -> examsave::Result<()> {
//! let config = PipelineConfig::from_env();
//! config.validate()?;
//!
//! let store = Arc::new(PendingStore::open(&config.queue_file));
//! store.restore_from_disk();
//!
//! let events = EventBus::new();
//! let autosave = AutosaveCoordinator::new(
//!     config.clone(),
//!     store,
//!     api,
//!     Arc::new(TracingReporter),
//!     events.clone(),
//! );
//! let recovery = RecoveryCoordinator::new(&config, autosave.clone(), events.clone());
//! let health = HealthMonitor::new(&config, probe);
//! health.add_listener(recovery);
//!
//! autosave.start(ExamSession::new("submission-42"));
//! health.start();
//!
//! autosave.on_answer_changed("q1", "B");
//!
//! health.stop().await;
//! autosave.stop().await;
//! # Ok(())
//! # }
//! ```

pub mod api;
pub mod autosave;
pub mod config;
pub mod error;
pub mod events;
pub mod health;
pub mod recovery;
pub mod store;
pub mod types;

pub use api::{ErrorReporter, HealthProbe, SubmissionApi, TracingReporter};
pub use autosave::AutosaveCoordinator;
pub use config::PipelineConfig;
pub use error::{ExamSaveError, Result, SaveError};
pub use events::{EventBus, PipelineEvent};
pub use health::{ConnectivityListener, HealthMonitor};
pub use recovery::{PendingFlusher, RecoveryCoordinator};
pub use store::{PendingAnswer, PendingStore};
pub use types::*;
