//! State file watcher
//!
//! The directory holding the state file is watched rather than the file, since
//! Secret volume updates swap a `..data` symlink instead of writing in place.
//! Every relevant event re-reads the file; content that hashes the same as the
//! last applied state is skipped.

use crate::error::AgentError;
use crate::settings::parent_dir;
use crate::state_file::load_state;
use crate::sync::Syncer;
use notify::{Event, EventKind, RecursiveMode, Watcher};
use std::ffi::OsString;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Symlink the kubelet swaps on Secret volume updates
const SECRET_DATA_LINK: &str = "..data";

/// Result of one apply attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// New content was validated and synced
    Synced,
    /// Content matches the last applied state
    Unchanged,
}

/// Applies the state file, remembering the hash of the last valid content
pub struct StateApplier {
    path: PathBuf,
    file_name: OsString,
    syncer: Arc<Syncer>,
    last_hash: Option<String>,
}

impl StateApplier {
    #[must_use]
    pub fn new(path: PathBuf, syncer: Arc<Syncer>) -> Self {
        let file_name = path.file_name().map(OsString::from).unwrap_or_default();
        Self {
            path,
            file_name,
            syncer,
            last_hash: None,
        }
    }

    /// Read, validate and sync the state file.
    ///
    /// The hash is recorded once the content validates, so a failed sync is
    /// retried on the next content change rather than on every event.
    ///
    /// # Errors
    ///
    /// Returns read, parse, validation or sync errors.
    pub async fn apply(&mut self) -> Result<ApplyOutcome, AgentError> {
        let (state, hash) = load_state(&self.path).await?;
        if self.last_hash.as_deref() == Some(hash.as_str()) {
            return Ok(ApplyOutcome::Unchanged);
        }

        state.validate()?;
        self.last_hash = Some(hash);
        self.syncer.sync(&state).await?;
        Ok(ApplyOutcome::Synced)
    }

    /// Whether a filesystem event may have changed the state file
    #[must_use]
    pub fn is_relevant(&self, event: &Event) -> bool {
        matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_))
            && event.paths.iter().any(|path| {
                path.file_name()
                    .is_some_and(|name| name == self.file_name.as_os_str() || name == SECRET_DATA_LINK)
            })
    }

    async fn apply_logged(&mut self) {
        match self.apply().await {
            Ok(ApplyOutcome::Synced) => info!("Applied state from {}", self.path.display()),
            Ok(ApplyOutcome::Unchanged) => debug!("State unchanged, skipping"),
            Err(AgentError::Validation(e)) => warn!("Ignoring state file: {}", e),
            Err(e) => error!("Failed to apply state: {}", e),
        }
    }
}

/// Running watcher; dropped or closed to stop
pub struct WatchHandle {
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl WatchHandle {
    /// Stop watching and wait for an in-flight apply to finish
    pub async fn close(self) {
        // The task may already be gone
        let _ = self.shutdown.send(());
        if let Err(e) = self.task.await {
            error!("State watcher task failed: {}", e);
        }
    }
}

/// Apply the state file once, then again on every change.
///
/// # Errors
///
/// Returns an error when the directory cannot be watched.
pub fn watch_state(path: PathBuf, syncer: Arc<Syncer>) -> Result<WatchHandle, AgentError> {
    let dir = parent_dir(&path).to_path_buf();
    let (events_tx, mut events_rx) = mpsc::unbounded_channel::<Event>();
    let (errors_tx, mut errors_rx) = mpsc::unbounded_channel::<notify::Error>();

    let mut watcher = notify::recommended_watcher(move |result: notify::Result<Event>| {
        // Receivers only close on shutdown
        match result {
            Ok(event) => {
                let _ = events_tx.send(event);
            }
            Err(e) => {
                let _ = errors_tx.send(e);
            }
        }
    })?;
    watcher.watch(&dir, RecursiveMode::NonRecursive)?;
    info!("Watching {} for state changes", dir.display());

    let (shutdown, mut shutdown_rx) = oneshot::channel();
    let mut applier = StateApplier::new(path, syncer);

    let task = tokio::spawn(async move {
        let _watcher = watcher;
        applier.apply_logged().await;

        loop {
            tokio::select! {
                _ = &mut shutdown_rx => break,
                Some(event) = events_rx.recv() => {
                    if applier.is_relevant(&event) {
                        applier.apply_logged().await;
                    }
                }
                Some(e) = errors_rx.recv() => error!("File watch error: {}", e),
                else => break,
            }
        }
        info!("State watcher stopped");
    });

    Ok(WatchHandle { shutdown, task })
}
