//! Best-effort structuring of Ethereum client log lines.
//!
//! Nethermind and Lighthouse both emit lines shaped like
//! `Aug 24 12:00:01.123 INFO  message key: value, service: beacon`, in two
//! dialects: service as a trailing `service:` field or bracketed after the
//! level. Lines that match neither pattern are passed through unparsed; the
//! frontend renders raw text in that case.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;

/// Structured view of one log line. `metadata` holds the `key: value` pairs
/// extracted from the message body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ParsedLogLine {
    pub timestamp: String,
    pub level: String,
    pub service: String,
    pub message: String,
    pub metadata: BTreeMap<String, String>,
}

static TRAILING_SERVICE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(?P<timestamp>\w{3} \d{2} \d{2}:\d{2}:\d{2}\.\d{3})\s+(?P<level>[A-Z]+)\s+(?P<message>.*?)(?:,\s+)?service:\s*(?P<service>[\w-]+)(?:,\s+service:\s*[\w-]+)*\r?$",
    )
    .expect("trailing-service pattern")
});

static BRACKETED_SERVICE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(?P<timestamp>\w{3} \d{2} \d{2}:\d{2}:\d{2}\.\d{3})\s+(?P<level>[A-Z]+)\s+\[(?P<service>[\w-]+)\]\s+(?P<message>.*)",
    )
    .expect("bracketed-service pattern")
});

static METADATA: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?P<key>\w+):\s*(?P<value>"[^"]*"|\[[^\]]*\]|[^\s,]+)"#)
        .expect("metadata pattern")
});

/// Try to structure one log line. `None` means the line matched no known
/// format and should be forwarded raw.
pub fn parse_log_line(line: &str) -> Option<ParsedLogLine> {
    let captures = TRAILING_SERVICE
        .captures(line)
        .or_else(|| BRACKETED_SERVICE.captures(line))?;

    let message_body = captures["message"].to_string();

    let mut metadata = BTreeMap::new();
    for m in METADATA.captures_iter(&message_body) {
        let key = &m["key"];
        if key == "service" {
            continue;
        }
        let value = m["value"]
            .trim_matches(|c| c == '"' || c == '[' || c == ']')
            .to_string();
        metadata.insert(key.to_string(), value);
    }

    let message = METADATA
        .replace_all(&message_body, "")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .trim_end_matches(',')
        .trim()
        .to_string();

    Some(ParsedLogLine {
        timestamp: captures["timestamp"].to_string(),
        level: captures["level"].to_string(),
        service: captures["service"].to_string(),
        message,
        metadata,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trailing_service_format() {
        let line = "Aug 24 12:00:01.123 INFO Synced slot: 42, service: beacon";
        let parsed = parse_log_line(line).unwrap();
        assert_eq!(parsed.timestamp, "Aug 24 12:00:01.123");
        assert_eq!(parsed.level, "INFO");
        assert_eq!(parsed.service, "beacon");
        assert_eq!(parsed.message, "Synced");
        assert_eq!(parsed.metadata.get("slot").map(String::as_str), Some("42"));
    }

    #[test]
    fn test_bracketed_service_format() {
        let line = "Aug 24 12:00:01.123 WARN [execution] Peer count low";
        let parsed = parse_log_line(line).unwrap();
        assert_eq!(parsed.service, "execution");
        assert_eq!(parsed.level, "WARN");
        assert_eq!(parsed.message, "Peer count low");
        assert!(parsed.metadata.is_empty());
    }

    #[test]
    fn test_quoted_metadata_values_are_unquoted() {
        let line = r#"Aug 24 12:00:01.123 INFO Block built hash: "0xabc", service: builder"#;
        let parsed = parse_log_line(line).unwrap();
        assert_eq!(
            parsed.metadata.get("hash").map(String::as_str),
            Some("0xabc")
        );
    }

    #[test]
    fn test_unrecognized_line_is_not_parsed() {
        assert!(parse_log_line("plain text without any structure").is_none());
        assert!(parse_log_line("").is_none());
    }
}
