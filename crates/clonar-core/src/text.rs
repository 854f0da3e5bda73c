//! Helpers for pulling structured data out of free-form model output.

use serde_json::Value;

/// Find the first balanced JSON value opened by `open` that parses cleanly.
///
/// Tolerates markdown code fences and prose around the payload.
fn first_balanced(text: &str, open: u8, close: u8) -> Option<Value> {
    let bytes = text.as_bytes();
    let mut start = 0;
    while let Some(offset) = bytes[start..].iter().position(|&b| b == open) {
        let begin = start + offset;
        if let Some(end) = matching_close(&bytes[begin..], open, close) {
            if let Ok(value) = serde_json::from_str::<Value>(&text[begin..begin + end + 1]) {
                return Some(value);
            }
        }
        start = begin + 1;
    }
    None
}

/// Index of the bracket closing `bytes[0]`, skipping string literals.
fn matching_close(bytes: &[u8], open: u8, close: u8) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, &b) in bytes.iter().enumerate() {
        if in_string {
            match b {
                _ if escaped => escaped = false,
                b'\\' => escaped = true,
                b'"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            _ if b == open => depth += 1,
            _ if b == close => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}

/// First JSON object embedded in `text`.
pub fn extract_json_object(text: &str) -> Option<serde_json::Map<String, Value>> {
    match first_balanced(text, b'{', b'}')? {
        Value::Object(map) => Some(map),
        _ => None,
    }
}

/// First JSON array embedded in `text`.
pub fn extract_json_array(text: &str) -> Option<Vec<Value>> {
    match first_balanced(text, b'[', b']')? {
        Value::Array(items) => Some(items),
        _ => None,
    }
}
