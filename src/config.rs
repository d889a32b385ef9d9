//! Configuration schema, loading fallback chain, and extension-merge rule (spec §6).

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

/// Environment variable naming an explicit configuration file path.
pub const CONFIG_PATH_ENV: &str = "LSP_SUPERVISOR_CONFIG";

/// Project-local default configuration path, relative to the current working directory.
pub const PROJECT_LOCAL_CONFIG_PATH: &str = ".lsp-supervisor.json";

/// A single language server entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerConfig {
    pub extensions: Vec<String>,
    pub command: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root_dir: Option<PathBuf>,
    /// Minutes between forced restarts; `None` or non-positive disables the timer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restart_interval: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initialization_options: Option<Value>,
}

impl ServerConfig {
    pub fn extension_set(&self) -> HashSet<&str> {
        self.extensions.iter().map(String::as_str).collect()
    }

    pub fn command_line(&self) -> String {
        self.command.join(" ")
    }

    /// `npx`-launched servers require a package manager to resolve the package; surfaced
    /// separately from plain "binary not found" failures (spec §4.4 step 1).
    pub fn is_npx(&self) -> bool {
        self.command
            .first()
            .map(|c| c == "npx")
            .unwrap_or(false)
    }
}

/// The top-level configuration document (spec §6 JSON schema).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LspConfig {
    #[serde(default)]
    pub servers: Vec<ServerConfig>,
}

impl LspConfig {
    /// Built-in catalog used when no user configuration is found or valid.
    pub fn builtin_defaults() -> Self {
        Self {
            servers: vec![
                ServerConfig {
                    extensions: vec!["rs".into()],
                    command: vec!["rust-analyzer".into()],
                    root_dir: None,
                    restart_interval: None,
                    initialization_options: None,
                },
                ServerConfig {
                    extensions: vec!["ts".into(), "tsx".into(), "js".into(), "jsx".into()],
                    command: vec!["typescript-language-server".into(), "--stdio".into()],
                    root_dir: None,
                    restart_interval: None,
                    initialization_options: None,
                },
                ServerConfig {
                    extensions: vec!["py".into()],
                    command: vec!["pylsp".into()],
                    root_dir: None,
                    restart_interval: None,
                    initialization_options: None,
                },
                ServerConfig {
                    extensions: vec!["go".into()],
                    command: vec!["gopls".into()],
                    root_dir: None,
                    restart_interval: None,
                    initialization_options: None,
                },
            ],
        }
    }

    /// Merge a user-loaded configuration with the built-in defaults: a user entry claims
    /// the extensions it lists; a default entry contributes only the extensions the user
    /// did not already claim (spec §6 merging rule).
    pub fn merged_with_defaults(user: Self) -> Self {
        let defaults = Self::builtin_defaults();
        let mut claimed: HashSet<String> = HashSet::new();
        for server in &user.servers {
            claimed.extend(server.extensions.iter().cloned());
        }

        let mut servers = user.servers;
        for default_server in defaults.servers {
            let remaining: Vec<String> = default_server
                .extensions
                .iter()
                .filter(|ext| !claimed.contains(*ext))
                .cloned()
                .collect();
            if remaining.is_empty() {
                continue;
            }
            claimed.extend(remaining.iter().cloned());
            servers.push(ServerConfig {
                extensions: remaining,
                ..default_server
            });
        }

        Self { servers }
    }

    /// First server config whose extension set contains `extension`.
    pub fn server_for_extension(&self, extension: &str) -> Option<&ServerConfig> {
        self.servers
            .iter()
            .find(|s| s.extensions.iter().any(|e| e == extension))
    }

    fn from_json_str(contents: &str) -> Option<Self> {
        match serde_json::from_str(contents) {
            Ok(config) => Some(config),
            Err(e) => {
                warn!("failed to parse LSP supervisor config JSON: {e}");
                None
            }
        }
    }

    fn from_file(path: &Path) -> Option<Self> {
        if !path.exists() {
            return None;
        }
        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) => {
                warn!("failed to read LSP supervisor config at {path:?}: {e}");
                return None;
            }
        };
        Self::from_json_str(&contents)
    }

    /// Load configuration following the fallback chain in spec §4.5:
    /// env var path -> explicit path -> project-local default -> built-in defaults.
    /// Any failure at a step (missing file, parse error) falls through to the next step;
    /// the result is always merged with the built-in defaults.
    pub fn load(explicit_path: Option<&Path>) -> Self {
        if let Ok(env_path) = std::env::var(CONFIG_PATH_ENV) {
            let path = PathBuf::from(&env_path);
            if let Some(config) = Self::from_file(&path) {
                debug!("loaded LSP supervisor config from ${CONFIG_PATH_ENV}: {path:?}");
                return Self::merged_with_defaults(config);
            }
            warn!(
                "{CONFIG_PATH_ENV} set to {path:?} but the file is missing or invalid; falling back"
            );
        }

        if let Some(path) = explicit_path {
            if let Some(config) = Self::from_file(path) {
                debug!("loaded LSP supervisor config from explicit path: {path:?}");
                return Self::merged_with_defaults(config);
            }
        }

        let project_local = PathBuf::from(PROJECT_LOCAL_CONFIG_PATH);
        if let Some(config) = Self::from_file(&project_local) {
            debug!("loaded LSP supervisor config from project-local default: {project_local:?}");
            return Self::merged_with_defaults(config);
        }

        debug!("no LSP supervisor config found; using built-in defaults");
        Self::builtin_defaults()
    }
}

/// `initializationOptions` defaults for the two known server families, selected by
/// substring match on the command (spec §6). Returns `None` when neither family matches;
/// the caller then sends no `initializationOptions` at all.
pub fn default_initialization_options(command: &[String]) -> Option<Value> {
    let joined = command.join(" ").to_ascii_lowercase();
    if joined.contains("pyright") || joined.contains("pylsp") || joined.contains("python") {
        Some(serde_json::json!({
            "python": {
                "analysis": { "autoSearchPaths": true, "useLibraryCodeForTypes": true }
            }
        }))
    } else if joined.contains("typescript-language-server") || joined.contains("tsserver") {
        Some(serde_json::json!({
            "preferences": { "includeCompletionsForModuleExports": true },
            "hostInfo": "lsp-supervisor"
        }))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rust_server() -> ServerConfig {
        ServerConfig {
            extensions: vec!["rs".into()],
            command: vec!["rust-analyzer".into()],
            root_dir: None,
            restart_interval: None,
            initialization_options: None,
        }
    }

    #[test]
    fn user_entry_claims_its_extensions_and_defaults_fill_the_rest() {
        let user = LspConfig { servers: vec![rust_server()] };
        let merged = LspConfig::merged_with_defaults(user);

        assert_eq!(merged.server_for_extension("rs").unwrap().command, vec!["rust-analyzer"]);
        assert!(merged.server_for_extension("py").is_some());
        assert!(merged.server_for_extension("go").is_some());
    }

    #[test]
    fn user_entry_overrides_a_default_for_the_same_extension() {
        let custom = ServerConfig {
            extensions: vec!["py".into()],
            command: vec!["pyright-langserver".into(), "--stdio".into()],
            root_dir: None,
            restart_interval: None,
            initialization_options: None,
        };
        let merged = LspConfig::merged_with_defaults(LspConfig { servers: vec![custom] });
        let py = merged.server_for_extension("py").unwrap();
        assert_eq!(py.command, vec!["pyright-langserver", "--stdio"]);
    }

    #[test]
    fn malformed_json_falls_back_to_defaults() {
        assert!(LspConfig::from_json_str("not json").is_none());
    }

    #[test]
    fn npx_detection() {
        let server = ServerConfig {
            extensions: vec!["vue".into()],
            command: vec!["npx".into(), "vue-language-server".into()],
            root_dir: None,
            restart_interval: None,
            initialization_options: None,
        };
        assert!(server.is_npx());
        assert!(!rust_server().is_npx());
    }
}
