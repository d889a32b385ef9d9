//! Client facade: the entry point an editor integration talks to. Resolves the right
//! language server for a file, keeps document sync state up to date, and exposes typed
//! wrappers over the common language features (spec §2, §4.6).

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use lsp_types::request::{
    CodeActionRequest, Completion, DocumentSymbolRequest, ExecuteCommand, Formatting,
    GotoDefinition, HoverRequest, References, Rename,
};
use lsp_types::{
    CodeActionParams, CodeActionResponse, CompletionParams, CompletionResponse, Diagnostic,
    DidChangeTextDocumentParams, DidCloseTextDocumentParams, DidOpenTextDocumentParams,
    DocumentFormattingParams, DocumentSymbolParams, DocumentSymbolResponse,
    ExecuteCommandParams, GotoDefinitionParams, GotoDefinitionResponse, Hover, HoverParams,
    Position, ReferenceParams, RenameParams, TextDocumentContentChangeEvent,
    TextDocumentIdentifier, TextDocumentItem, TextDocumentPositionParams, TextEdit,
    VersionedTextDocumentIdentifier, WorkDoneProgressParams, WorkspaceEdit,
};
use crate::config::LspConfig;
use crate::error::{LspError, Result};
use crate::manager::ServerManager;
use crate::protocol;
use crate::server_state::ServerState;

/// Default timeout applied to every typed request issued through the facade.
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// How long [`LspClient::wait_for_diagnostics_idle`] waits, by default, for a server to go
/// quiet before giving up (spec §4.6).
const DEFAULT_DIAGNOSTICS_MAX_WAIT: Duration = Duration::from_secs(1);
const DEFAULT_DIAGNOSTICS_IDLE_TIME: Duration = Duration::from_millis(100);
const DEFAULT_DIAGNOSTICS_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// The multiplexing LSP client: one facade in front of however many language servers a
/// project's file extensions require.
pub struct LspClient {
    manager: Arc<ServerManager>,
    language_id_by_extension: HashMap<&'static str, &'static str>,
}

impl LspClient {
    /// Build a client from the configuration fallback chain (spec §4.5): environment
    /// variable, explicit path, project-local file, then built-in defaults.
    pub fn new(explicit_config_path: Option<&Path>) -> Self {
        Self::with_config(LspConfig::load(explicit_config_path))
    }

    pub fn with_config(config: LspConfig) -> Self {
        Self {
            manager: ServerManager::new(config),
            language_id_by_extension: default_language_ids(),
        }
    }

    /// Start every configured language server eagerly rather than waiting for the first
    /// file of that type to be touched.
    pub async fn preload_servers(&self) {
        self.manager.preload_servers().await;
    }

    /// Drop all failure-quarantine records so the next request retries from scratch.
    pub fn clear_failed_servers(&self) {
        self.manager.clear_failed_servers();
    }

    /// Shut down every running server and release resources. The client is unusable
    /// afterward; outstanding requests resolve with [`LspError::ClientDisposed`].
    pub async fn dispose(&self) {
        self.manager.dispose().await;
    }

    /// Kill the server(s) covering `extensions` (or every running server, if `None`).
    /// Returns the command line of each server killed; a fresh process is started lazily
    /// on the next request against that key.
    pub async fn restart_server(&self, extensions: Option<&[String]>) -> Vec<String> {
        self.manager.restart_server(extensions).await
    }

    /// The `getServer` primitive, exposed directly for callers that need the process
    /// handle itself (capability inspection, custom requests).
    pub async fn get_server(&self, path: &Path) -> Result<Arc<ServerState>> {
        self.manager.get_server(path).await
    }

    /// Send an arbitrary JSON-RPC request to the server owning `path`, for methods the
    /// facade has no typed wrapper for.
    pub async fn send_request(
        &self,
        path: &Path,
        method: &str,
        params: serde_json::Value,
        timeout: Duration,
    ) -> Result<Option<serde_json::Value>> {
        let server = self.server_for(path).await?;
        server.initialization_barrier.wait().await;
        protocol::send_request(&server, method, params, timeout).await
    }

    /// Send an arbitrary JSON-RPC notification to the server owning `path`.
    pub async fn send_notification(
        &self,
        path: &Path,
        method: &str,
        params: serde_json::Value,
    ) -> Result<()> {
        let server = self.server_for(path).await?;
        protocol::send_notification(&server, method, params).await
    }

    async fn server_for(&self, path: &Path) -> Result<Arc<ServerState>> {
        self.manager.get_server(path).await
    }

    fn language_id_for(&self, path: &Path) -> &'static str {
        path.extension()
            .and_then(|e| e.to_str())
            .and_then(|ext| self.language_id_by_extension.get(ext).copied())
            .unwrap_or("plaintext")
    }

    /// Read `path` from disk and notify its owning server: `didOpen` the first time, or a
    /// full-content `didChange` on every call after that. Best-effort, per spec §4.5 —
    /// failures are logged and swallowed rather than surfaced to the caller.
    pub async fn sync_file_content(&self, path: &Path) {
        if let Err(e) = self.sync_file_content_inner(path).await {
            tracing::warn!(path = %path.display(), error = %e, "sync_file_content failed");
        }
    }

    async fn sync_file_content_inner(&self, path: &Path) -> Result<()> {
        let content = tokio::fs::read_to_string(path).await?;
        let server = self.server_for(path).await?;
        let uri = crate::utils::path_to_uri(path).map_err(LspError::ProtocolError)?;

        let mut sync = server.sync.lock().await;
        let is_open = sync.file_versions.contains_key(path);
        let version = sync.file_versions.entry(path.to_path_buf()).or_insert(0);
        *version += 1;
        let current_version = *version;
        if !is_open {
            sync.open_files.push(path.to_path_buf());
        }
        sync.enforce_open_file_cap();
        drop(sync);

        if is_open {
            protocol::send_typed_notification::<lsp_types::notification::DidChangeTextDocument>(
                &server,
                DidChangeTextDocumentParams {
                    text_document: VersionedTextDocumentIdentifier {
                        uri,
                        version: current_version as i32,
                    },
                    content_changes: vec![TextDocumentContentChangeEvent {
                        range: None,
                        range_length: None,
                        text: content,
                    }],
                },
            )
            .await
        } else {
            protocol::send_typed_notification::<lsp_types::notification::DidOpenTextDocument>(
                &server,
                DidOpenTextDocumentParams {
                    text_document: TextDocumentItem {
                        uri,
                        language_id: self.language_id_for(path).to_string(),
                        version: current_version as i32,
                        text: content,
                    },
                },
            )
            .await
        }
    }

    /// Tell the owning server a document has been closed and forget its local state.
    pub async fn close_file(&self, path: &Path) -> Result<()> {
        let server = self.server_for(path).await?;
        let uri = crate::utils::path_to_uri(path).map_err(LspError::ProtocolError)?;

        let mut sync = server.sync.lock().await;
        sync.file_versions.remove(path);
        sync.open_files.retain(|p| p != path);
        drop(sync);

        protocol::send_typed_notification::<lsp_types::notification::DidCloseTextDocument>(
            &server,
            DidCloseTextDocumentParams {
                text_document: TextDocumentIdentifier { uri },
            },
        )
        .await
    }

    pub async fn definition(
        &self,
        path: &Path,
        position: Position,
    ) -> Result<Option<GotoDefinitionResponse>> {
        let server = self.server_for(path).await?;
        let uri = crate::utils::path_to_uri(path).map_err(LspError::ProtocolError)?;
        self.typed_request::<GotoDefinition>(
            &server,
            GotoDefinitionParams {
                text_document_position_params: TextDocumentPositionParams {
                    text_document: TextDocumentIdentifier { uri },
                    position,
                },
                work_done_progress_params: Default::default(),
                partial_result_params: Default::default(),
            },
        )
        .await
    }

    pub async fn references(
        &self,
        path: &Path,
        position: Position,
        include_declaration: bool,
    ) -> Result<Option<Vec<lsp_types::Location>>> {
        let server = self.server_for(path).await?;
        let uri = crate::utils::path_to_uri(path).map_err(LspError::ProtocolError)?;
        self.typed_request::<References>(
            &server,
            ReferenceParams {
                text_document_position: TextDocumentPositionParams {
                    text_document: TextDocumentIdentifier { uri },
                    position,
                },
                work_done_progress_params: Default::default(),
                partial_result_params: Default::default(),
                context: lsp_types::ReferenceContext { include_declaration },
            },
        )
        .await
    }

    pub async fn hover(&self, path: &Path, position: Position) -> Result<Option<Hover>> {
        let server = self.server_for(path).await?;
        let uri = crate::utils::path_to_uri(path).map_err(LspError::ProtocolError)?;
        self.typed_request::<HoverRequest>(
            &server,
            HoverParams {
                text_document_position_params: TextDocumentPositionParams {
                    text_document: TextDocumentIdentifier { uri },
                    position,
                },
                work_done_progress_params: Default::default(),
            },
        )
        .await
    }

    /// Document symbols, flat or hierarchical depending on what the server advertised
    /// during initialize (spec §9 design note on capability paths).
    pub async fn document_symbols(&self, path: &Path) -> Result<Option<DocumentSymbolResponse>> {
        let server = self.server_for(path).await?;
        let uri = crate::utils::path_to_uri(path).map_err(LspError::ProtocolError)?;
        self.typed_request::<DocumentSymbolRequest>(
            &server,
            DocumentSymbolParams {
                text_document: TextDocumentIdentifier { uri },
                work_done_progress_params: Default::default(),
                partial_result_params: Default::default(),
            },
        )
        .await
    }

    pub async fn completion(
        &self,
        path: &Path,
        position: Position,
    ) -> Result<Option<CompletionResponse>> {
        let server = self.server_for(path).await?;
        let uri = crate::utils::path_to_uri(path).map_err(LspError::ProtocolError)?;
        self.typed_request::<Completion>(
            &server,
            CompletionParams {
                text_document_position: TextDocumentPositionParams {
                    text_document: TextDocumentIdentifier { uri },
                    position,
                },
                work_done_progress_params: Default::default(),
                partial_result_params: Default::default(),
                context: None,
            },
        )
        .await
    }

    pub async fn code_actions(
        &self,
        path: &Path,
        params: CodeActionParams,
    ) -> Result<Option<CodeActionResponse>> {
        let server = self.server_for(path).await?;
        self.typed_request::<CodeActionRequest>(&server, params).await
    }

    pub async fn rename_symbol(
        &self,
        path: &Path,
        position: Position,
        new_name: String,
    ) -> Result<Option<WorkspaceEdit>> {
        let server = self.server_for(path).await?;
        let uri = crate::utils::path_to_uri(path).map_err(LspError::ProtocolError)?;
        self.typed_request::<Rename>(
            &server,
            RenameParams {
                text_document_position: TextDocumentPositionParams {
                    text_document: TextDocumentIdentifier { uri },
                    position,
                },
                new_name,
                work_done_progress_params: Default::default(),
            },
        )
        .await
    }

    pub async fn format_document(
        &self,
        path: &Path,
        options: Option<DocumentFormattingParams>,
    ) -> Result<Option<Vec<TextEdit>>> {
        let server = self.server_for(path).await?;
        let uri = crate::utils::path_to_uri(path).map_err(LspError::ProtocolError)?;
        let params = options.unwrap_or_else(|| DocumentFormattingParams {
            text_document: TextDocumentIdentifier { uri },
            options: Default::default(),
            work_done_progress_params: WorkDoneProgressParams::default(),
        });
        self.typed_request::<Formatting>(&server, params).await
    }

    pub async fn execute_command(
        &self,
        path: &Path,
        command: String,
        arguments: Option<Vec<serde_json::Value>>,
    ) -> Result<Option<serde_json::Value>> {
        let server = self.server_for(path).await?;
        self.typed_request::<ExecuteCommand>(
            &server,
            ExecuteCommandParams {
                command,
                arguments: arguments.unwrap_or_default(),
                work_done_progress_params: Default::default(),
            },
        )
        .await
    }

    async fn typed_request<R>(&self, server: &Arc<ServerState>, params: R::Params) -> Result<R::Result>
    where
        R: lsp_types::request::Request,
        R::Result: Default,
    {
        server.initialization_barrier.wait().await;
        protocol::send_typed_request_optional::<R>(server, params, DEFAULT_REQUEST_TIMEOUT).await
    }

    /// Poll a document's cached diagnostics until either `idle_time` has passed since the
    /// last update, or `max_wait` elapses with no update at all (spec §4.6, §8 S4).
    pub async fn wait_for_diagnostics_idle(
        &self,
        path: &Path,
        max_wait: Option<Duration>,
        idle_time: Option<Duration>,
        poll_interval: Option<Duration>,
    ) -> Option<Vec<Diagnostic>> {
        let server = self.server_for(path).await.ok()?;
        let uri = crate::utils::path_to_uri(path).ok()?;

        let max_wait = max_wait.unwrap_or(DEFAULT_DIAGNOSTICS_MAX_WAIT);
        let idle_time = idle_time.unwrap_or(DEFAULT_DIAGNOSTICS_IDLE_TIME);
        let poll_interval = poll_interval.unwrap_or(DEFAULT_DIAGNOSTICS_POLL_INTERVAL);
        let deadline = Instant::now() + max_wait;

        loop {
            let sync = server.sync.lock().await;
            if let Some(entry) = sync.diagnostics.get(&uri) {
                if let Some(last_update) = entry.last_update {
                    if last_update.elapsed() >= idle_time {
                        return Some(entry.diagnostics.clone());
                    }
                }
            }
            drop(sync);

            if Instant::now() >= deadline {
                let sync = server.sync.lock().await;
                return sync.diagnostics.get(&uri).map(|e| e.diagnostics.clone());
            }
            tokio::time::sleep(poll_interval.min(deadline.saturating_duration_since(Instant::now())))
                .await;
        }
    }
}

fn default_language_ids() -> HashMap<&'static str, &'static str> {
    HashMap::from([
        ("rs", "rust"),
        ("py", "python"),
        ("go", "go"),
        ("ts", "typescript"),
        ("tsx", "typescriptreact"),
        ("js", "javascript"),
        ("jsx", "javascriptreact"),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn language_id_falls_back_to_plaintext_for_unknown_extensions() {
        let client = LspClient::with_config(LspConfig::builtin_defaults());
        assert_eq!(client.language_id_for(Path::new("a.rs")), "rust");
        assert_eq!(client.language_id_for(Path::new("a.weird")), "plaintext");
    }
}
