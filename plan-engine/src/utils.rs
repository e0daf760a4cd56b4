// Utilities
// Log truncation and panic payload helpers

use serde_json::Value;
use std::any::Any;

/// Cut a string to `max_chars` characters, noting the original length
pub fn truncate_for_log(input: &str, max_chars: usize) -> String {
    let char_count = input.chars().count();
    if char_count <= max_chars {
        return input.to_string();
    }
    let mut preview: String = input.chars().take(max_chars).collect();
    preview.push_str(&format!("... [truncated, total_chars={}]", char_count));
    preview
}

pub fn truncate_json_for_log(value: &Value, max_chars: usize) -> String {
    truncate_for_log(&value.to_string(), max_chars)
}

/// Best-effort message from a caught panic payload
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "panic with non-string payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_truncate_for_log() {
        assert_eq!(truncate_for_log("short", 10), "short");
        let out = truncate_for_log("abcdefghij", 4);
        assert!(out.starts_with("abcd..."));
        assert!(out.contains("total_chars=10"));
    }

    #[test]
    fn test_truncate_json_for_log() {
        let out = truncate_json_for_log(&json!({"rows": [1, 2, 3]}), 5);
        assert!(out.starts_with("{\"row"));
    }

    #[test]
    fn test_panic_message() {
        let payload = std::panic::catch_unwind(|| panic!("boom")).unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "boom");

        let payload = std::panic::catch_unwind(|| panic!("{} failed", "step")).unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "step failed");
    }
}
