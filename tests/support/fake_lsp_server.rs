//! A scriptable stand-in for a real language server, used by the integration tests in
//! `tests/`. Speaks the same `Content-Length` framing as a real server; its canned
//! responses and scheduled diagnostic pushes are configured through environment
//! variables rather than command-line flags, since the test harness launches it via
//! `tokio::process::Command` the same way the supervisor launches a real server.
//!
//! - `FAKE_LSP_RESPONSES`: JSON object mapping method name to the `result` value to
//!   reply with. A method not present in this map gets a JSON-RPC `-32601` error,
//!   mirroring a server that doesn't support it.
//! - `FAKE_LSP_ERRORS`: JSON object mapping method name to `{"code": <i64>, "message": <string>}`,
//!   replied with verbatim instead of the `-32601` default — used to exercise the
//!   method-not-found substring heuristic with a non-standard error code.
//! - `FAKE_LSP_DIAGNOSTICS`: JSON array of `{"after_ms": <u64>, "params": <PublishDiagnosticsParams>}`,
//!   sent as `textDocument/publishDiagnostics` notifications on their own schedule after
//!   `initialized` is received.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::time::Duration;

fn main() {
    let responses: HashMap<String, serde_json::Value> = std::env::var("FAKE_LSP_RESPONSES")
        .ok()
        .and_then(|raw| serde_json::from_str(&raw).ok())
        .unwrap_or_default();
    let diagnostics_script: Vec<serde_json::Value> = std::env::var("FAKE_LSP_DIAGNOSTICS")
        .ok()
        .and_then(|raw| serde_json::from_str(&raw).ok())
        .unwrap_or_default();
    let forced_errors: HashMap<String, serde_json::Value> = std::env::var("FAKE_LSP_ERRORS")
        .ok()
        .and_then(|raw| serde_json::from_str(&raw).ok())
        .unwrap_or_default();

    let mut stdin = std::io::stdin();
    let mut buffer = Vec::new();
    let mut chunk = [0u8; 4096];

    loop {
        let message = loop {
            if let Some((message, rest)) = try_parse_one(&buffer) {
                buffer = rest;
                break Some(message);
            }
            let n = stdin.read(&mut chunk).unwrap_or(0);
            if n == 0 {
                break None;
            }
            buffer.extend_from_slice(&chunk[..n]);
        };

        let Some(message) = message else {
            break;
        };

        let method = message.get("method").and_then(|m| m.as_str());
        let id = message.get("id").cloned();

        match method {
            Some("initialize") => {
                let result = serde_json::json!({
                    "capabilities": {
                        "definitionProvider": true,
                        "referencesProvider": true,
                        "hoverProvider": true,
                        "documentSymbolProvider": true,
                        "renameProvider": {"prepareProvider": true},
                        "completionProvider": {},
                    }
                });
                write_message(&success(id, result));
            }
            Some("initialized") => {
                spawn_diagnostics_schedule(diagnostics_script.clone());
            }
            Some("shutdown") => {
                write_message(&success(id, serde_json::Value::Null));
            }
            Some("exit") => break,
            Some(other) => {
                if let Some(result) = responses.get(other) {
                    write_message(&success(id, result.clone()));
                } else if let Some(forced) = forced_errors.get(other) {
                    let code = forced.get("code").and_then(|v| v.as_i64()).unwrap_or(-32000);
                    let message = forced
                        .get("message")
                        .and_then(|v| v.as_str())
                        .unwrap_or("forced error")
                        .to_string();
                    write_message(&error(id, code, message));
                } else {
                    write_message(&error(id, -32601, format!("Unhandled method {other}")));
                }
            }
            None => {}
        }
    }
}

fn spawn_diagnostics_schedule(script: Vec<serde_json::Value>) {
    std::thread::spawn(move || {
        for entry in script {
            let after_ms = entry.get("after_ms").and_then(|v| v.as_u64()).unwrap_or(0);
            std::thread::sleep(Duration::from_millis(after_ms));
            let params = entry.get("params").cloned().unwrap_or(serde_json::Value::Null);
            let notification = serde_json::json!({
                "jsonrpc": "2.0",
                "method": "textDocument/publishDiagnostics",
                "params": params,
            });
            write_message(&notification);
        }
    });
}

fn success(id: Option<serde_json::Value>, result: serde_json::Value) -> serde_json::Value {
    serde_json::json!({"jsonrpc": "2.0", "id": id, "result": result})
}

fn error(id: Option<serde_json::Value>, code: i64, message: String) -> serde_json::Value {
    serde_json::json!({"jsonrpc": "2.0", "id": id, "error": {"code": code, "message": message}})
}

/// Locks stdout fresh per call rather than holding it for the process lifetime, so the
/// background diagnostics-pushing thread (see `spawn_diagnostics_schedule`) can interleave
/// its writes with the main request/response loop instead of blocking on a lock `main`
/// never releases until `exit`.
fn write_message(value: &serde_json::Value) {
    let body = serde_json::to_vec(value).unwrap();
    let mut out = std::io::stdout().lock();
    let _ = write!(out, "Content-Length: {}\r\n\r\n", body.len());
    let _ = out.write_all(&body);
    let _ = out.flush();
}

fn try_parse_one(buffer: &[u8]) -> Option<(serde_json::Value, Vec<u8>)> {
    let separator = b"\r\n\r\n";
    let header_end = buffer
        .windows(separator.len())
        .position(|w| w == separator)?;
    let header = std::str::from_utf8(&buffer[..header_end]).ok()?;
    let content_length: usize = header
        .split("\r\n")
        .find_map(|line| line.strip_prefix("Content-Length: "))?
        .trim()
        .parse()
        .ok()?;
    let body_start = header_end + separator.len();
    let body_end = body_start + content_length;
    if buffer.len() < body_end {
        return None;
    }
    let value = serde_json::from_slice(&buffer[body_start..body_end]).ok()?;
    Some((value, buffer[body_end..].to_vec()))
}
