//! Error taxonomy for the LSP supervisor.

use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by the protocol engine, server manager, and client facade.
#[derive(Debug, Error)]
pub enum LspError {
    /// No configured server claims the file's extension.
    #[error("no language server configured for extension '{extension}'")]
    NoServerConfigured { extension: String },

    /// The server could not be started (missing binary, missing runtime).
    #[error("language server for '{command}' is not available: {install_hint}")]
    ServerNotAvailable { command: String, install_hint: String },

    /// stdin is not writable or stdout has closed.
    #[error("transport to language server is closed")]
    TransportClosed,

    /// A message could not be parsed or violated the framing contract.
    #[error("protocol error: {0}")]
    ProtocolError(String),

    /// A request's deadline elapsed before a response arrived.
    #[error("request timed out after {0:?}")]
    RequestTimeout(Duration),

    /// The server reported any error other than "method not found".
    #[error("server error ({code}): {message}")]
    ServerError { code: i64, message: String },

    /// The engine was disposed while the request was outstanding.
    #[error("client disposed")]
    ClientDisposed,

    /// Failure classified as permanent; no retry will be attempted.
    #[error("language server for '{command}' failed permanently: {reason}")]
    PermanentFailure { command: String, reason: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, LspError>;
