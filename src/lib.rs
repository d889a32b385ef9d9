//! A multiplexing Language Server Protocol client and supervisor.
//!
//! Routes files to per-language server subprocesses by extension, starting, quarantining,
//! and restarting them as needed, and exposes a typed client facade over the document sync
//! and language feature requests an editor integration needs.
//!
//! The [`client::LspClient`] facade is the entry point; it owns a [`manager::ServerManager`]
//! that multiplexes requests across however many language servers a project's file types
//! require.

pub mod capabilities;
pub mod client;
pub mod config;
pub mod error;
pub mod framer;
pub mod install_hints;
pub mod manager;
pub mod protocol;
pub mod server_state;
pub mod utils;

pub use client::LspClient;
pub use config::{LspConfig, ServerConfig};
pub use error::{LspError, Result};
pub use lsp_types::{self, CompletionItem, Diagnostic};
