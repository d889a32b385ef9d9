//! Per-process record for a running language server (spec §3, §4.3).

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use lsp_types::{Diagnostic, Uri};
use tokio::process::Child;
use tokio::sync::{oneshot, Mutex, Notify, RwLock};
use tokio::task::JoinHandle;

use crate::capabilities::ServerCapabilitiesSnapshot;
use crate::config::ServerConfig;
use crate::manager::ServerKey;

/// Maximum number of files kept open on a single server before cleanup evicts the
/// oldest (spec §4.4).
pub const MAX_OPEN_FILES: usize = 100;

/// A one-shot barrier released exactly once when `initialize`/`initialized` completes.
/// Cloned waiters share the same underlying `Notify`; release is idempotent.
#[derive(Clone)]
pub struct InitializationBarrier {
    notify: Arc<Notify>,
    released: Arc<std::sync::atomic::AtomicBool>,
}

impl InitializationBarrier {
    pub fn new() -> Self {
        Self {
            notify: Arc::new(Notify::new()),
            released: Arc::new(std::sync::atomic::AtomicBool::new(false)),
        }
    }

    pub fn is_released(&self) -> bool {
        self.released.load(std::sync::atomic::Ordering::Acquire)
    }

    /// Idempotent: a second call is a no-op.
    pub fn release(&self) {
        if !self.released.swap(true, std::sync::atomic::Ordering::AcqRel) {
            self.notify.notify_waiters();
        }
    }

    pub async fn wait(&self) {
        if self.is_released() {
            return;
        }
        self.notify.notified().await;
    }
}

impl Default for InitializationBarrier {
    fn default() -> Self {
        Self::new()
    }
}

/// Diagnostics published for one document, plus when they were last updated.
#[derive(Debug, Clone, Default)]
pub struct DiagnosticEntry {
    pub diagnostics: Vec<Diagnostic>,
    pub last_update: Option<Instant>,
    pub version: Option<i32>,
}

/// Synchronization and diagnostic state mutated only from the server's single reader task
/// (for diagnostics) and the manager (for open-file bookkeeping); guarded by an async mutex
/// so the facade can also read/update it when syncing file content.
pub struct SyncState {
    /// Insertion-order set of open absolute paths; oldest-first for LRU eviction.
    pub open_files: Vec<PathBuf>,
    pub file_versions: HashMap<PathBuf, i64>,
    pub diagnostics: HashMap<Uri, DiagnosticEntry>,
}

impl SyncState {
    fn new() -> Self {
        Self {
            open_files: Vec::new(),
            file_versions: HashMap::new(),
            diagnostics: HashMap::new(),
        }
    }

    /// Drop the oldest open files down to `MAX_OPEN_FILES`, discarding their versions too.
    pub fn enforce_open_file_cap(&mut self) {
        while self.open_files.len() > MAX_OPEN_FILES {
            let evicted = self.open_files.remove(0);
            self.file_versions.remove(&evicted);
        }
    }

    /// Evict diagnostics whose last update predates `cutoff`.
    pub fn evict_stale_diagnostics(&mut self, cutoff: Instant) {
        self.diagnostics
            .retain(|_, entry| entry.last_update.map(|t| t >= cutoff).unwrap_or(true));
    }
}

/// One running (or starting) language server process and everything the supervisor
/// tracks about it.
pub struct ServerState {
    pub key: ServerKey,
    pub config: ServerConfig,
    pub process: Mutex<Child>,
    pub stdin: Mutex<tokio::process::ChildStdin>,
    pub initialized: std::sync::atomic::AtomicBool,
    pub initialization_barrier: InitializationBarrier,
    pub capabilities: RwLock<Option<ServerCapabilitiesSnapshot>>,
    pub sync: Mutex<SyncState>,
    pub restart_timer: Mutex<Option<JoinHandle<()>>>,
    pub reader_task: Mutex<Option<JoinHandle<()>>>,
    pub start_time: Instant,
    pub pending_requests: Mutex<HashMap<i64, PendingRequest>>,
    pub next_request_id: std::sync::atomic::AtomicI64,
}

/// A single outstanding request awaiting a response (spec §3 PendingRequest).
pub struct PendingRequest {
    pub method: String,
    pub deadline: tokio::time::Instant,
    pub resolver: oneshot::Sender<std::result::Result<serde_json::Value, crate::error::LspError>>,
}

impl ServerState {
    pub fn new(
        key: ServerKey,
        config: ServerConfig,
        process: Child,
        stdin: tokio::process::ChildStdin,
    ) -> Self {
        Self {
            key,
            config,
            process: Mutex::new(process),
            stdin: Mutex::new(stdin),
            initialized: std::sync::atomic::AtomicBool::new(false),
            initialization_barrier: InitializationBarrier::new(),
            capabilities: RwLock::new(None),
            sync: Mutex::new(SyncState::new()),
            restart_timer: Mutex::new(None),
            reader_task: Mutex::new(None),
            start_time: Instant::now(),
            pending_requests: Mutex::new(HashMap::new()),
            next_request_id: std::sync::atomic::AtomicI64::new(1),
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(std::sync::atomic::Ordering::Acquire)
    }

    pub fn next_request_id(&self) -> i64 {
        self.next_request_id
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst)
    }

    /// Abort and clear the restart timer, if any. Safe to call more than once: the second
    /// call finds `None` and is a no-op (exactly-one cancellation, spec §9).
    pub async fn cancel_restart_timer(&self) {
        if let Some(handle) = self.restart_timer.lock().await.take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn barrier_releases_exactly_once_and_is_idempotent() {
        let barrier = InitializationBarrier::new();
        assert!(!barrier.is_released());
        barrier.release();
        barrier.release();
        assert!(barrier.is_released());
        barrier.wait().await;
    }

    #[test]
    fn open_file_cap_evicts_oldest_first() {
        let mut sync = SyncState::new();
        for i in 0..120 {
            let path = PathBuf::from(format!("/f{i}.rs"));
            sync.file_versions.insert(path.clone(), 1);
            sync.open_files.push(path);
        }
        sync.enforce_open_file_cap();
        assert_eq!(sync.open_files.len(), MAX_OPEN_FILES);
        assert_eq!(sync.open_files[0], PathBuf::from("/f20.rs"));
        assert!(!sync.file_versions.contains_key(&PathBuf::from("/f0.rs")));
    }

    #[test]
    fn stale_diagnostics_are_evicted() {
        let mut sync = SyncState::new();
        let uri: Uri = "file:///a.rs".parse().unwrap();
        sync.diagnostics.insert(
            uri.clone(),
            DiagnosticEntry {
                diagnostics: vec![],
                last_update: Some(Instant::now() - std::time::Duration::from_secs(600)),
                version: Some(1),
            },
        );
        sync.evict_stale_diagnostics(Instant::now() - std::time::Duration::from_secs(300));
        assert!(!sync.diagnostics.contains_key(&uri));
    }
}
