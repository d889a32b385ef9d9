//! The fixed client `initialize` capability block (spec §6), and a typed, optionally
//! nested snapshot over a server's advertised `ServerCapabilities` that resolves paths
//! like `workspace.workspace_edit.document_changes` through plain `Option` traversal
//! instead of dynamic dispatch over JSON (spec §9 "Recursive dynamic dispatch").

use lsp_types::{
    ClientCapabilities, CompletionClientCapabilities,
    DiagnosticClientCapabilities, DidChangeWatchedFilesClientCapabilities,
    DocumentSymbolClientCapabilities, HoverClientCapabilities, PublishDiagnosticsClientCapabilities,
    ReferenceClientCapabilities, RenameClientCapabilities, ServerCapabilities,
    SignatureHelpClientCapabilities, SymbolKind, SymbolKindCapability,
    TextDocumentClientCapabilities, TextDocumentSyncClientCapabilities,
    WorkspaceClientCapabilities, WorkspaceEditClientCapabilities,
};

/// All 26 symbol kinds defined by the LSP specification, `File` through `TypeParameter`.
const ALL_SYMBOL_KINDS: [SymbolKind; 26] = [
    SymbolKind::FILE,
    SymbolKind::MODULE,
    SymbolKind::NAMESPACE,
    SymbolKind::PACKAGE,
    SymbolKind::CLASS,
    SymbolKind::METHOD,
    SymbolKind::PROPERTY,
    SymbolKind::FIELD,
    SymbolKind::CONSTRUCTOR,
    SymbolKind::ENUM,
    SymbolKind::INTERFACE,
    SymbolKind::FUNCTION,
    SymbolKind::VARIABLE,
    SymbolKind::CONSTANT,
    SymbolKind::STRING,
    SymbolKind::NUMBER,
    SymbolKind::BOOLEAN,
    SymbolKind::ARRAY,
    SymbolKind::OBJECT,
    SymbolKind::KEY,
    SymbolKind::NULL,
    SymbolKind::ENUM_MEMBER,
    SymbolKind::STRUCT,
    SymbolKind::EVENT,
    SymbolKind::OPERATOR,
    SymbolKind::TYPE_PARAMETER,
];

/// Build the server-agnostic client capability block sent with every `initialize` request.
pub fn client_capabilities() -> ClientCapabilities {
    let symbol_kinds: Vec<SymbolKind> = ALL_SYMBOL_KINDS.to_vec();

    ClientCapabilities {
        text_document: Some(TextDocumentClientCapabilities {
            synchronization: Some(TextDocumentSyncClientCapabilities {
                did_save: Some(true),
                dynamic_registration: Some(false),
                will_save: Some(false),
                will_save_wait_until: Some(false),
            }),
            definition: Some(Default::default()),
            references: Some(ReferenceClientCapabilities {
                dynamic_registration: Some(false),
            }),
            rename: Some(RenameClientCapabilities {
                dynamic_registration: Some(false),
                prepare_support: Some(true),
                ..Default::default()
            }),
            document_symbol: Some(DocumentSymbolClientCapabilities {
                dynamic_registration: Some(false),
                hierarchical_document_symbol_support: Some(true),
                symbol_kind: Some(SymbolKindCapability {
                    value_set: Some(symbol_kinds),
                }),
                ..Default::default()
            }),
            completion: Some(CompletionClientCapabilities {
                completion_item: Some(lsp_types::CompletionItemCapability {
                    snippet_support: Some(true),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            hover: Some(HoverClientCapabilities::default()),
            signature_help: Some(SignatureHelpClientCapabilities::default()),
            diagnostic: Some(DiagnosticClientCapabilities {
                dynamic_registration: Some(false),
                related_document_support: Some(false),
            }),
            publish_diagnostics: Some(PublishDiagnosticsClientCapabilities {
                related_information: Some(true),
                ..Default::default()
            }),
            ..Default::default()
        }),
        workspace: Some(WorkspaceClientCapabilities {
            workspace_edit: Some(WorkspaceEditClientCapabilities {
                document_changes: Some(true),
                ..Default::default()
            }),
            workspace_folders: Some(true),
            did_change_watched_files: Some(DidChangeWatchedFilesClientCapabilities {
                dynamic_registration: Some(false),
                relative_pattern_support: Some(false),
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// A server's advertised capabilities, wrapped for ergonomic boolean queries.
#[derive(Debug, Clone)]
pub struct ServerCapabilitiesSnapshot(pub ServerCapabilities);

impl ServerCapabilitiesSnapshot {
    pub fn new(capabilities: ServerCapabilities) -> Self {
        Self(capabilities)
    }

    pub fn supports_hierarchical_document_symbols(&self) -> bool {
        // rust-analyzer and most modern servers report this via document_symbol_provider
        // being present; the hierarchical flag itself is a client-capability echo, not a
        // server capability, so presence of the provider is the signal we use.
        self.0.document_symbol_provider.is_some()
    }

    pub fn supports_rename(&self) -> bool {
        self.0.rename_provider.is_some()
    }

    pub fn supports_call_hierarchy(&self) -> bool {
        self.0.call_hierarchy_provider.is_some()
    }
}

/// Resolve `workspace.workspaceEdit.documentChanges` on a *client* capability block
/// through a series of `Option` traversals, per the design note on capability paths.
pub fn declares_document_changes(capabilities: &ClientCapabilities) -> bool {
    capabilities
        .workspace
        .as_ref()
        .and_then(|w| w.workspace_edit.as_ref())
        .and_then(|e| e.document_changes)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capability_path_resolves_through_option_traversal() {
        let mut caps = client_capabilities();
        caps.workspace.as_mut().unwrap().workspace_edit = Some(WorkspaceEditClientCapabilities {
            document_changes: Some(true),
            ..Default::default()
        });
        assert!(declares_document_changes(&caps));
    }

    #[test]
    fn absent_nested_capability_resolves_to_false() {
        assert!(!declares_document_changes(&ClientCapabilities::default()));

        let snapshot = ServerCapabilitiesSnapshot::new(ServerCapabilities::default());
        assert!(!snapshot.supports_rename());
    }

    #[test]
    fn symbol_kind_value_set_covers_1_through_26() {
        let caps = client_capabilities();
        let value_set = caps
            .text_document
            .unwrap()
            .document_symbol
            .unwrap()
            .symbol_kind
            .unwrap()
            .value_set
            .unwrap();
        assert_eq!(value_set.len(), 26);
    }
}
