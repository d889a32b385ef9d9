//! LSP wire framing: `Content-Length`-delimited JSON-RPC messages over a byte stream.

use serde_json::Value;
use tracing::{debug, warn};

const HEADER_SEPARATOR: &[u8] = b"\r\n\r\n";

/// Split `buffer` into zero or more complete JSON-RPC messages plus whatever unparsed
/// suffix remains. Malformed headers are skipped past their separator; malformed JSON
/// payloads are dropped and logged. Never panics on truncated input.
pub fn parse_messages(mut buffer: &[u8]) -> (Vec<Value>, Vec<u8>) {
    let mut messages = Vec::new();

    while let Some(header_end) = find_subslice(buffer, HEADER_SEPARATOR) {
        let header = &buffer[..header_end];
        let Some(content_length) = parse_content_length(header) else {
            warn!("dropping LSP header block with no valid Content-Length");
            buffer = &buffer[header_end + HEADER_SEPARATOR.len()..];
            continue;
        };

        let body_start = header_end + HEADER_SEPARATOR.len();
        let body_end = body_start + content_length;
        if buffer.len() < body_end {
            // Not enough bytes yet; wait for more.
            break;
        }

        let body = &buffer[body_start..body_end];
        match serde_json::from_slice::<Value>(body) {
            Ok(value) => messages.push(value),
            Err(e) => debug!("dropping unparsable LSP message: {e}"),
        }

        buffer = &buffer[body_end..];
    }

    (messages, buffer.to_vec())
}

fn parse_content_length(header: &[u8]) -> Option<usize> {
    let header = std::str::from_utf8(header).ok()?;
    for line in header.split("\r\n") {
        if let Some(rest) = case_insensitive_strip_prefix(line, "content-length:") {
            return rest.trim().parse().ok();
        }
    }
    None
}

fn case_insensitive_strip_prefix<'a>(line: &'a str, prefix: &str) -> Option<&'a str> {
    let trimmed = line.trim_start();
    if trimmed.len() >= prefix.len() && trimmed[..prefix.len()].eq_ignore_ascii_case(prefix) {
        Some(&trimmed[prefix.len()..])
    } else {
        None
    }
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Frame a JSON-RPC message for writing to a server's stdin.
pub fn encode_message(value: &Value) -> crate::error::Result<Vec<u8>> {
    let body = serde_json::to_vec(value)?;
    let mut framed = format!("Content-Length: {}\r\n\r\n", body.len()).into_bytes();
    framed.extend_from_slice(&body);
    Ok(framed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn frame(value: &Value) -> Vec<u8> {
        encode_message(value).unwrap()
    }

    #[test]
    fn round_trips_a_single_message() {
        let msg = json!({"jsonrpc": "2.0", "id": 1, "method": "initialize", "params": {}});
        let bytes = frame(&msg);
        let (messages, remainder) = parse_messages(&bytes);
        assert_eq!(messages, vec![msg]);
        assert!(remainder.is_empty());
    }

    #[test]
    fn decodes_a_concatenation_of_n_messages_exactly() {
        let a = json!({"jsonrpc": "2.0", "id": 1, "method": "a"});
        let b = json!({"jsonrpc": "2.0", "id": 2, "method": "b"});
        let c = json!({"jsonrpc": "2.0", "method": "c/notify", "params": {"x": 1}});
        let mut bytes = frame(&a);
        bytes.extend(frame(&b));
        bytes.extend(frame(&c));

        let (messages, remainder) = parse_messages(&bytes);
        assert_eq!(messages, vec![a, b, c]);
        assert!(remainder.is_empty());
    }

    #[test]
    fn preserves_a_truncated_prefix() {
        let msg = json!({"jsonrpc": "2.0", "id": 1, "method": "initialize"});
        let bytes = frame(&msg);
        let prefix = &bytes[..bytes.len() - 3];

        let (messages, remainder) = parse_messages(prefix);
        assert!(messages.is_empty());
        assert_eq!(remainder, prefix);
    }

    #[test]
    fn content_length_exceeding_available_bytes_yields_no_messages() {
        let header = b"Content-Length: 500\r\n\r\n{\"short\":true}";
        let (messages, remainder) = parse_messages(header);
        assert!(messages.is_empty());
        assert_eq!(remainder, header);
    }

    #[test]
    fn header_without_content_length_is_skipped_but_stream_continues() {
        let mut bytes = b"X-Custom: nope\r\n\r\n".to_vec();
        let good = json!({"jsonrpc": "2.0", "id": 7, "method": "ok"});
        bytes.extend(frame(&good));

        let (messages, remainder) = parse_messages(&bytes);
        assert_eq!(messages, vec![good]);
        assert!(remainder.is_empty());
    }

    #[test]
    fn invalid_json_payload_is_dropped_and_stream_continues() {
        let mut bytes = "Content-Length: 7\r\n\r\n{broke}".to_string().into_bytes();
        let good = json!({"jsonrpc": "2.0", "id": 9, "method": "ok"});
        bytes.extend(frame(&good));

        let (messages, remainder) = parse_messages(&bytes);
        assert_eq!(messages, vec![good]);
        assert!(remainder.is_empty());
    }

    #[test]
    fn unknown_headers_are_ignored() {
        let mut framed = b"X-Trace-Id: abc\r\nContent-Length: ".to_vec();
        let good = json!({"jsonrpc": "2.0", "id": 1, "method": "ok"});
        let body = serde_json::to_vec(&good).unwrap();
        framed.extend(format!("{}\r\n\r\n", body.len()).into_bytes());
        framed.extend(body);

        let (messages, remainder) = parse_messages(&framed);
        assert_eq!(messages, vec![good]);
        assert!(remainder.is_empty());
    }
}
