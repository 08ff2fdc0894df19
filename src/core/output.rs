//! Compact output rendering helpers for CLI surfaces.

use serde_json::Value as JsonValue;

/// Collapse newlines/extra whitespace and bound length for terminal display.
pub fn compact_line(input: &str, max_chars: usize) -> String {
    let collapsed = input.split_whitespace().collect::<Vec<_>>().join(" ");
    let mut chars = collapsed.chars();
    let preview: String = chars.by_ref().take(max_chars).collect();
    if chars.next().is_some() {
        format!("{}...", preview)
    } else {
        preview
    }
}

/// One-line preview of a stored JSON value. `null` renders as empty.
pub fn preview_json(value: Option<&JsonValue>, max_chars: usize) -> String {
    match value {
        None | Some(JsonValue::Null) => String::new(),
        Some(JsonValue::String(s)) => compact_line(s, max_chars),
        Some(other) => compact_line(&other.to_string(), max_chars),
    }
}
