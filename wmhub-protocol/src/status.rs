//! Status-line protocol types
//!
//! The first line written to stdout is a capability header object; every
//! line after it is a complete JSON array of status blocks, so each line is
//! independently parseable downstream. Click events arrive on stdin as one
//! JSON object per line; some terminals wrap the stream in an enclosing
//! array with leading commas, which the line parser tolerates.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Capability header, the first status-line written
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusHeader {
    pub version: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_signal: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cont_signal: Option<i32>,
    pub click_events: bool,
}

impl StatusHeader {
    pub fn new(click_events: bool) -> Self {
        Self {
            version: crate::STATUS_PROTOCOL_VERSION,
            stop_signal: None,
            cont_signal: None,
            click_events,
        }
    }
}

/// How inbound click events are framed on stdin
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClickFraming {
    /// One JSON object per line
    #[default]
    ObjectPerLine,
    /// Objects wrapped in an enclosing array: an opening `[` line, then
    /// comma-prefixed objects, one per logical tick
    EnclosingArray,
}

/// An inbound click event
///
/// `name` and `instance` echo whatever identifying fields the originating
/// block carried; they are used for routing, never reinterpreted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClickEvent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,
    pub button: u8,
    #[serde(flatten)]
    pub rest: Map<String, Value>,
}

impl ClickEvent {
    /// Parse one stdin line into a click event.
    ///
    /// Returns `Ok(None)` for structural lines that carry no event (the
    /// enclosing array's brackets, blank lines).
    pub fn parse_line(
        line: &str,
        framing: ClickFraming,
    ) -> Result<Option<ClickEvent>, serde_json::Error> {
        let mut line = line.trim();
        if framing == ClickFraming::EnclosingArray {
            if line == "[" || line == "]" {
                return Ok(None);
            }
            line = line.strip_prefix(',').unwrap_or(line).trim_start();
        }
        if line.is_empty() {
            return Ok(None);
        }
        serde_json::from_str(line).map(Some)
    }
}

/// Iterate the individual block objects inside an extension's status
/// content. Content is either one block object or an array of them.
pub fn content_blocks(content: &Value) -> impl Iterator<Item = &Value> {
    let slice: &[Value] = match content {
        Value::Array(items) => items.as_slice(),
        other => std::slice::from_ref(other),
    };
    slice.iter().filter(|v| v.is_object())
}

/// Whether a block's identifying fields match a click's `name`/`instance`
/// echo. Both fields must agree, including their absence.
pub fn block_matches(block: &Value, name: Option<&str>, instance: Option<&str>) -> bool {
    block.get("name").and_then(Value::as_str) == name
        && block.get("instance").and_then(Value::as_str) == instance
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_header_serialization() {
        let header = StatusHeader::new(true);
        let line = serde_json::to_string(&header).unwrap();
        assert_eq!(line, r#"{"version":1,"click_events":true}"#);
    }

    #[test]
    fn test_header_with_signals() {
        let header = StatusHeader {
            stop_signal: Some(10),
            cont_signal: Some(12),
            ..StatusHeader::new(false)
        };
        let value: Value = serde_json::to_value(&header).unwrap();
        assert_eq!(value["stop_signal"], json!(10));
        assert_eq!(value["cont_signal"], json!(12));
        assert_eq!(value["click_events"], json!(false));
    }

    #[test]
    fn test_parse_click_object_per_line() {
        let click = ClickEvent::parse_line(
            r#"{"name":"battery","instance":"bat0","button":1,"x":10,"y":20}"#,
            ClickFraming::ObjectPerLine,
        )
        .unwrap()
        .unwrap();
        assert_eq!(click.name.as_deref(), Some("battery"));
        assert_eq!(click.instance.as_deref(), Some("bat0"));
        assert_eq!(click.button, 1);
        assert_eq!(click.rest.get("x"), Some(&json!(10)));
    }

    #[test]
    fn test_parse_click_without_identity() {
        let click = ClickEvent::parse_line(r#"{"button":3}"#, ClickFraming::ObjectPerLine)
            .unwrap()
            .unwrap();
        assert_eq!(click.name, None);
        assert_eq!(click.instance, None);
        assert_eq!(click.button, 3);
    }

    #[test]
    fn test_parse_enclosing_array_framing() {
        let framing = ClickFraming::EnclosingArray;
        assert_eq!(ClickEvent::parse_line("[", framing).unwrap(), None);
        assert_eq!(ClickEvent::parse_line("]", framing).unwrap(), None);

        let first = ClickEvent::parse_line(r#"{"name":"a","button":1}"#, framing)
            .unwrap()
            .unwrap();
        assert_eq!(first.name.as_deref(), Some("a"));

        let comma_prefixed = ClickEvent::parse_line(r#",{"name":"b","button":2}"#, framing)
            .unwrap()
            .unwrap();
        assert_eq!(comma_prefixed.name.as_deref(), Some("b"));
        assert_eq!(comma_prefixed.button, 2);
    }

    #[test]
    fn test_parse_blank_line() {
        assert_eq!(
            ClickEvent::parse_line("  ", ClickFraming::ObjectPerLine).unwrap(),
            None
        );
    }

    #[test]
    fn test_parse_garbage_line() {
        assert!(ClickEvent::parse_line("not json", ClickFraming::ObjectPerLine).is_err());
    }

    #[test]
    fn test_content_blocks_single_object() {
        let content = json!({"full_text": "12:00", "name": "clock"});
        let blocks: Vec<_> = content_blocks(&content).collect();
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0]["name"], json!("clock"));
    }

    #[test]
    fn test_content_blocks_array() {
        let content = json!([
            {"full_text": "a", "name": "x"},
            {"full_text": "b", "name": "y"},
        ]);
        assert_eq!(content_blocks(&content).count(), 2);
    }

    #[test]
    fn test_content_blocks_skips_non_objects() {
        let content = json!(["stray", {"full_text": "ok"}]);
        assert_eq!(content_blocks(&content).count(), 1);
    }

    #[test]
    fn test_block_matches_both_fields() {
        let block = json!({"full_text": "x", "name": "net", "instance": "eth0"});
        assert!(block_matches(&block, Some("net"), Some("eth0")));
        assert!(!block_matches(&block, Some("net"), None));
        assert!(!block_matches(&block, Some("net"), Some("wlan0")));
        assert!(!block_matches(&block, None, Some("eth0")));
    }

    #[test]
    fn test_block_matches_absent_fields() {
        let block = json!({"full_text": "anonymous"});
        assert!(block_matches(&block, None, None));
        assert!(!block_matches(&block, Some("net"), None));
    }
}
