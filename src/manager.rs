//! Server lifecycle: lazy start, concurrent-start dedup, failure quarantine, scheduled
//! restart, and shutdown (spec §4.4, §5).

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use lsp_types::request::Initialize;
use lsp_types::{InitializeParams, InitializeResult, InitializedParams};
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::capabilities::{client_capabilities, ServerCapabilitiesSnapshot};
use crate::config::{default_initialization_options, LspConfig, ServerConfig};
use crate::error::{LspError, Result};
use crate::framer;
use crate::install_hints::install_hint;
use crate::protocol;
use crate::server_state::ServerState;

/// Identifies a server process by its resolved command line and working directory;
/// two files whose config resolves to the same key share one server instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServerKey(String);

impl ServerKey {
    fn from_config(config: &ServerConfig) -> Self {
        let root = config
            .root_dir
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_default();
        Self(format!("{}|{}", config.command_line(), root))
    }
}

/// Window after spawning during which an immediate exit is treated as a startup failure
/// rather than a normal crash to quarantine-and-retry (spec §4.4 step 2).
const SPAWN_FAILURE_WINDOW: Duration = Duration::from_millis(100);

/// How long to give a freshly initialized server before trusting it is stable, before the
/// restart timer or cleanup sweep is allowed to touch it.
const POST_INITIALIZE_SETTLE: Duration = Duration::from_millis(500);

/// Timeout for the `initialize` handshake itself (spec §4.4 step 7).
const INITIALIZE_TIMEOUT: Duration = Duration::from_secs(10);

/// One retry after a transient startup failure, after this backoff.
const RETRY_BACKOFF: Duration = Duration::from_secs(2);

/// How often the background cleanup sweep runs.
const CLEANUP_INTERVAL: Duration = Duration::from_secs(120);

/// How old a cached diagnostic can get before the cleanup sweep evicts it.
const DIAGNOSTIC_MAX_AGE: Duration = Duration::from_secs(300);

#[derive(Debug, Clone)]
enum FailureKind {
    /// Worth retrying later: a fresh `get_server` call may succeed (e.g. the binary
    /// reappears on PATH).
    Transient { retries_used: u32 },
    /// Will not be retried until `clear_failed_servers` is called explicitly.
    Permanent,
}

/// At most one automatic retry per quarantined key (spec §4.4).
const MAX_TRANSIENT_RETRIES: u32 = 1;

/// Checked first: any match here classifies the failure as permanent regardless of
/// whether a transient pattern also matches (spec §4.4 "Permanent patterns ... take
/// precedence").
const PERMANENT_PATTERNS: &[&str] = &[
    "eisdir",
    "enotdir",
    "enomem",
    "configuration",
    "syntax",
    "parse",
    "invalid",
];

const TRANSIENT_PATTERNS: &[&str] = &[
    "enoent",
    "eacces",
    "econnrefused",
    "timeout",
    "network",
    "temporary",
    "busy",
    "eagain",
];

/// Classify a failure reason string by substring match (case-insensitive), per spec §4.4.
/// Permanent patterns take precedence over transient ones. A reason matching neither list
/// defaults to transient and is logged as such: an unrecognized failure is more likely a
/// flaky condition worth one retry than a permanent misconfiguration.
fn classify_failure(reason: &str) -> bool {
    let lower = reason.to_lowercase();
    if PERMANENT_PATTERNS.iter().any(|p| lower.contains(p)) {
        return true;
    }
    if !TRANSIENT_PATTERNS.iter().any(|p| lower.contains(p)) {
        debug!(reason, "failure reason matched neither quarantine pattern list; defaulting to transient");
    }
    false
}

/// Map an I/O error from spawning the child process to a reason string carrying the
/// POSIX errno keyword spec §4.4's patterns expect, where the stable `ErrorKind`/
/// `raw_os_error` lets us recover one.
fn io_error_reason(e: &std::io::Error) -> String {
    let keyword = match e.kind() {
        std::io::ErrorKind::NotFound => Some("enoent"),
        std::io::ErrorKind::PermissionDenied => Some("eacces"),
        std::io::ErrorKind::ConnectionRefused => Some("econnrefused"),
        std::io::ErrorKind::TimedOut => Some("timeout"),
        std::io::ErrorKind::WouldBlock => Some("eagain"),
        _ => None,
    };
    #[cfg(unix)]
    let keyword = keyword.or_else(|| match e.raw_os_error() {
        Some(21) => Some("eisdir"),
        Some(20) => Some("enotdir"),
        Some(12) => Some("enomem"),
        _ => None,
    });
    match keyword {
        Some(k) => format!("{e} ({k})"),
        None => e.to_string(),
    }
}

/// Reason text for a failed `initialize` handshake, normalized the same way as
/// [`io_error_reason`] so the quarantine classifier sees the expected keyword.
fn failure_reason(e: &LspError) -> String {
    match e {
        LspError::Io(io) => io_error_reason(io),
        LspError::RequestTimeout(d) => format!("initialize timed out after {d:?} (timeout)"),
        other => other.to_string(),
    }
}

struct FailureRecord {
    kind: FailureKind,
    reason: String,
    install_hint: String,
    recorded_at: Instant,
}

/// Owns every running language server process and the policy around starting, reusing,
/// quarantining, and restarting them.
pub struct ServerManager {
    config: LspConfig,
    servers: DashMap<ServerKey, Arc<ServerState>>,
    starting: Mutex<HashMap<ServerKey, Arc<tokio::sync::Mutex<()>>>>,
    failed: DashMap<ServerKey, FailureRecord>,
    cleanup_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl ServerManager {
    pub fn new(config: LspConfig) -> Arc<Self> {
        let manager = Arc::new(Self {
            config,
            servers: DashMap::new(),
            starting: Mutex::new(HashMap::new()),
            failed: DashMap::new(),
            cleanup_task: Mutex::new(None),
        });
        let for_cleanup = manager.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(CLEANUP_INTERVAL).await;
                for_cleanup.run_cleanup_sweep().await;
            }
        });
        if let Ok(mut slot) = manager.cleanup_task.try_lock() {
            *slot = Some(handle);
        }
        manager
    }

    async fn run_cleanup_sweep(&self) {
        let cutoff = Instant::now() - DIAGNOSTIC_MAX_AGE;
        for entry in self.servers.iter() {
            let mut sync = entry.value().sync.lock().await;
            sync.evict_stale_diagnostics(cutoff);
            sync.enforce_open_file_cap();
        }
    }

    /// Return the running server responsible for `path`'s extension, starting it first if
    /// necessary. Files with no configured server, or a server currently quarantined for a
    /// permanent failure, return an error instead.
    pub async fn get_server(self: &Arc<Self>, path: &Path) -> Result<Arc<ServerState>> {
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .ok_or_else(|| LspError::NoServerConfigured {
                extension: String::new(),
            })?;
        let config = self
            .config
            .server_for_extension(extension)
            .ok_or_else(|| LspError::NoServerConfigured {
                extension: extension.to_string(),
            })?
            .clone();

        let key = ServerKey::from_config(&config);

        if let Some(record) = self.failed.get(&key) {
            match &record.kind {
                FailureKind::Permanent => {
                    return Err(LspError::PermanentFailure {
                        command: config.command_line(),
                        reason: record.reason.clone(),
                    });
                }
                FailureKind::Transient { retries_used } if *retries_used >= MAX_TRANSIENT_RETRIES => {
                    return Err(LspError::ServerNotAvailable {
                        command: config.command_line(),
                        install_hint: record.install_hint.clone(),
                    });
                }
                FailureKind::Transient { .. } if record.recorded_at.elapsed() < RETRY_BACKOFF => {
                    return Err(LspError::ServerNotAvailable {
                        command: config.command_line(),
                        install_hint: record.install_hint.clone(),
                    });
                }
                FailureKind::Transient { retries_used } => {
                    let next_retry = *retries_used + 1;
                    drop(record);
                    self.failed.remove(&key);
                    info!(command = config.command_line(), "retrying transient startup failure after backoff");
                    tokio::time::sleep(RETRY_BACKOFF).await;
                    return self.start_server_deduped(key, config, next_retry).await;
                }
            }
        }

        if let Some(entry) = self.servers.get(&key) {
            let server = entry.value().clone();
            drop(entry);
            let exited = server.process.lock().await.try_wait().ok().flatten().is_some();
            if !exited {
                return Ok(server);
            }
            debug!(key = key.0.as_str(), "cached server process has exited, restarting");
            self.servers.remove(&key);
            server.cancel_restart_timer().await;
            protocol::reject_all_pending(&server).await;
        }

        self.start_server_deduped(key, config, 0).await
    }

    /// Start every configured server up front, ignoring individual failures so one bad
    /// config doesn't block the rest.
    pub async fn preload_servers(self: &Arc<Self>) {
        for config in self.config.servers.clone() {
            let key = ServerKey::from_config(&config);
            if let Err(e) = self.start_server_deduped(key, config.clone(), 0).await {
                warn!(command = config.command_line(), error = %e, "preload failed");
            }
        }
    }

    /// Kill every running server whose extensions intersect `extensions` (or every running
    /// server, if `None`), cancelling its restart timer. A fresh process starts lazily on
    /// the next `get_server` call for that key.
    pub async fn restart_server(&self, extensions: Option<&[String]>) -> Vec<String> {
        let mut restarted = Vec::new();
        let keys: Vec<ServerKey> = self
            .servers
            .iter()
            .filter(|entry| match extensions {
                None => true,
                Some(wanted) => entry
                    .value()
                    .config
                    .extensions
                    .iter()
                    .any(|e| wanted.iter().any(|w| w == e)),
            })
            .map(|entry| entry.key().clone())
            .collect();

        for key in keys {
            if let Some((_, state)) = self.servers.remove(&key) {
                state.cancel_restart_timer().await;
                protocol::reject_all_pending(&state).await;
                let mut process = state.process.lock().await;
                let _ = process.start_kill();
                restarted.push(state.config.command_line());
            }
        }
        restarted
    }

    /// Only one concurrent start per key proceeds; concurrent callers await the same
    /// in-flight attempt instead of racing to spawn duplicate processes (spec §4.4 step 1).
    /// `retries_used` records how many transient-retry attempts this startup has already
    /// consumed, so a failure here is quarantined at the right point on the retry budget
    /// rather than resetting it (spec §4.4: "at most 1 retry attempt per key").
    async fn start_server_deduped(
        self: &Arc<Self>,
        key: ServerKey,
        config: ServerConfig,
        retries_used: u32,
    ) -> Result<Arc<ServerState>> {
        let lock = {
            let mut starting = self.starting.lock().await;
            starting
                .entry(key.clone())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        let _guard = lock.lock().await;

        if let Some(server) = self.servers.get(&key) {
            return Ok(server.clone());
        }

        let result = self.start_server(key.clone(), config, retries_used).await;
        self.starting.lock().await.remove(&key);
        result
    }

    /// Spawn the server process, validating `npx`-launched commands against an available
    /// package manager before spawning (spec §4.4 step 1), run the `initialize`/`initialized`
    /// handshake, and on failure quarantine the key with `retries_used` already accounted for.
    async fn start_server(
        &self,
        key: ServerKey,
        config: ServerConfig,
        retries_used: u32,
    ) -> Result<Arc<ServerState>> {
        let spawn_start = Instant::now();
        let command_line = config.command_line();

        if config.is_npx() && !npm_available() {
            let hint = install_hint(&config.command[0]);
            self.record_failure(key, &command_line, "npm not found on PATH (enoent)".into(), &hint, spawn_start, retries_used);
            return Err(LspError::ServerNotAvailable {
                command: command_line,
                install_hint: hint,
            });
        }

        let mut cmd = Command::new(&config.command[0]);
        cmd.args(&config.command[1..])
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::null());
        if let Some(root) = &config.root_dir {
            cmd.current_dir(root);
        }

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                let hint = install_hint(&config.command[0]);
                self.record_failure(key, &command_line, io_error_reason(&e), &hint, spawn_start, retries_used);
                return Err(LspError::ServerNotAvailable {
                    command: command_line,
                    install_hint: hint,
                });
            }
        };

        if spawn_start.elapsed() < SPAWN_FAILURE_WINDOW {
            if let Ok(Some(status)) = child.try_wait() {
                let hint = install_hint(&config.command[0]);
                let reason = format!("exited immediately with {status}");
                self.record_failure(key, &command_line, reason, &hint, spawn_start, retries_used);
                return Err(LspError::ServerNotAvailable {
                    command: command_line,
                    install_hint: hint,
                });
            }
        }

        let stdin = child.stdin.take().ok_or(LspError::TransportClosed)?;
        let stdout = child.stdout.take().ok_or(LspError::TransportClosed)?;

        let state = Arc::new(ServerState::new(key.clone(), config.clone(), child, stdin));
        self.servers.insert(key.clone(), state.clone());

        spawn_reader_task(state.clone(), stdout).await;

        match self.initialize_server(&state, &config).await {
            Ok(()) => {
                self.failed.remove(&key);
                self.schedule_restart_if_configured(state.clone(), &config);
                info!(command = command_line.as_str(), "language server started");
                Ok(state)
            }
            Err(e) => {
                self.servers.remove(&key);
                let hint = install_hint(&config.command[0]);
                let reason = failure_reason(&e);
                self.record_failure(key, &command_line, reason, &hint, spawn_start, retries_used);
                Err(e)
            }
        }
    }

    #[allow(deprecated)]
    async fn initialize_server(&self, state: &Arc<ServerState>, config: &ServerConfig) -> Result<()> {
        let root = config
            .root_dir
            .clone()
            .unwrap_or(std::env::current_dir().unwrap_or_default());
        let root_uri = crate::utils::path_to_uri(&root).ok();
        let workspace_folders = root_uri.clone().map(|uri| {
            vec![lsp_types::WorkspaceFolder {
                uri,
                name: root
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| root.display().to_string()),
            }]
        });

        let params = InitializeParams {
            process_id: Some(std::process::id()),
            client_info: Some(lsp_types::ClientInfo {
                name: env!("CARGO_PKG_NAME").to_string(),
                version: Some(env!("CARGO_PKG_VERSION").to_string()),
            }),
            capabilities: client_capabilities(),
            root_uri,
            workspace_folders,
            initialization_options: config
                .initialization_options
                .clone()
                .or_else(|| default_initialization_options(&config.command)),
            ..Default::default()
        };

        let result = protocol::send_typed_request::<Initialize>(state, params, INITIALIZE_TIMEOUT)
            .await?
            .ok_or_else(|| LspError::ProtocolError("initialize returned no result".into()))?;

        *state.capabilities.write().await = Some(ServerCapabilitiesSnapshot::new(result_capabilities(result)));

        protocol::send_typed_notification::<lsp_types::notification::Initialized>(
            state,
            InitializedParams {},
        )
        .await?;

        state.initialized.store(true, std::sync::atomic::Ordering::Release);
        state.initialization_barrier.release();

        tokio::time::sleep(POST_INITIALIZE_SETTLE).await;
        Ok(())
    }

    /// Record a startup failure, classifying it permanent vs. transient from the reason
    /// string (spec §4.4), not from how many times it has already failed. `retries_used`
    /// carries forward how many transient retries this quarantine episode has already
    /// spent, so a retry that fails again doesn't reset the budget.
    fn record_failure(
        &self,
        key: ServerKey,
        command: &str,
        reason: String,
        hint: &str,
        spawn_start: Instant,
        retries_used: u32,
    ) {
        let is_permanent = classify_failure(&reason);
        let kind = if is_permanent {
            FailureKind::Permanent
        } else {
            FailureKind::Transient { retries_used }
        };

        error!(command, reason = reason.as_str(), permanent = is_permanent, "language server failed to start");
        self.failed.insert(
            key,
            FailureRecord {
                kind,
                reason,
                install_hint: hint.to_string(),
                recorded_at: spawn_start,
            },
        );

        if !is_permanent {
            debug!(
                command,
                backoff = ?RETRY_BACKOFF,
                "transient failure recorded; next get_server call after the backoff will retry"
            );
        }
    }

    fn schedule_restart_if_configured(&self, state: Arc<ServerState>, config: &ServerConfig) {
        let Some(minutes) = config.restart_interval.filter(|m| *m > 0.0) else {
            return;
        };
        let interval = Duration::from_secs_f64(minutes * 60.0);
        let timer_state = state.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(interval).await;
            let mut process = timer_state.process.lock().await;
            let _ = process.start_kill();
        });
        tokio::spawn(async move {
            *state.restart_timer.lock().await = Some(handle);
        });
    }

    /// Drop every quarantine record, letting the next `get_server` call retry from scratch.
    pub fn clear_failed_servers(&self) {
        self.failed.clear();
    }

    /// Terminate every running server and release all resources.
    pub async fn dispose(&self) {
        let keys: Vec<ServerKey> = self.servers.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            if let Some((_, state)) = self.servers.remove(&key) {
                state.cancel_restart_timer().await;
                protocol::reject_all_pending(&state).await;
                shutdown_process(&state).await;
            }
        }
        if let Some(handle) = self.cleanup_task.lock().await.take() {
            handle.abort();
        }
    }
}

fn result_capabilities(result: InitializeResult) -> lsp_types::ServerCapabilities {
    result.capabilities
}

/// Whether `npm` is resolvable on `PATH`, checked without shelling out (spec §4.4 step 1:
/// `npx` targets need a package manager present before spawning).
fn npm_available() -> bool {
    let Some(paths) = std::env::var_os("PATH") else {
        return false;
    };
    std::env::split_paths(&paths).any(|dir| dir.join("npm").is_file())
}

/// Ask the server to shut down via the standard LSP handshake (`shutdown` request then
/// `exit` notification); force-kill it if it hasn't exited within 3 seconds.
async fn shutdown_process(state: &Arc<ServerState>) {
    let handshake = async {
        protocol::send_request(state, "shutdown", serde_json::Value::Null, Duration::from_secs(2))
            .await
            .ok();
        protocol::send_notification(state, "exit", serde_json::Value::Null)
            .await
            .ok();
    };
    let _ = tokio::time::timeout(Duration::from_secs(2), handshake).await;

    let mut process = state.process.lock().await;
    match tokio::time::timeout(Duration::from_secs(3), process.wait()).await {
        Ok(_) => {}
        Err(_) => {
            let _ = process.start_kill();
        }
    }
}

async fn spawn_reader_task(state: Arc<ServerState>, stdout: tokio::process::ChildStdout) {
    use tokio::io::AsyncReadExt;

    let reader_state = state.clone();
    let handle = tokio::spawn(async move {
        let mut stdout = stdout;
        let mut buffer: Vec<u8> = Vec::new();
        let mut chunk = [0u8; 8192];
        loop {
            match stdout.read(&mut chunk).await {
                Ok(0) => {
                    debug!("language server stdout closed");
                    break;
                }
                Ok(n) => {
                    buffer.extend_from_slice(&chunk[..n]);
                    let (messages, remainder) = framer::parse_messages(&buffer);
                    buffer = remainder;
                    for message in messages {
                        protocol::handle_message(&reader_state, message).await;
                    }
                }
                Err(e) => {
                    warn!("error reading language server stdout: {e}");
                    break;
                }
            }
        }
        protocol::reject_all_pending(&reader_state).await;
    });

    *state.reader_task.lock().await = Some(handle);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permanent_patterns_are_detected_case_insensitively() {
        assert!(classify_failure("EISDIR: illegal operation on a directory"));
        assert!(classify_failure("invalid configuration syntax"));
    }

    #[test]
    fn transient_patterns_are_not_permanent() {
        assert!(!classify_failure("ENOENT: no such file or directory"));
        assert!(!classify_failure("connection timeout after 10s"));
    }

    #[test]
    fn permanent_pattern_takes_precedence_over_transient() {
        // "enoent" and "enomem" both appear; enomem is a permanent pattern.
        assert!(classify_failure("spawn failed: enoent then enomem exhausted"));
    }

    #[test]
    fn unrecognized_reason_defaults_to_transient() {
        assert!(!classify_failure("the gremlins ate the socket"));
    }

    #[test]
    fn io_error_reason_tags_common_errno_keywords() {
        let not_found = std::io::Error::from(std::io::ErrorKind::NotFound);
        assert!(io_error_reason(&not_found).to_lowercase().contains("enoent"));
        let refused = std::io::Error::from(std::io::ErrorKind::ConnectionRefused);
        assert!(io_error_reason(&refused).to_lowercase().contains("econnrefused"));
    }
}
