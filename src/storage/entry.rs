//! Log Entry Model and Codec
//!
//! One entry per line, newline-terminated JSON. Fields may appear in any
//! order on disk; integrity is guarded by a CRC32 over a canonical
//! serialization, not the stored byte order.
//!
//! ## Canonical CRC form
//!
//! The checksum covers a compact JSON object with fields in the fixed order
//! `id, operation, key, value, version, client_id, request_id`, absent
//! optional fields omitted and the `crc` field excluded. The polynomial is
//! IEEE 802.3 (crc32fast). This form is part of the on-disk contract: every
//! node derives identical CRCs for identical entries.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt::Write as _;

/// Operation carried by a log entry or named by a client request.
///
/// Only `Set` and `Delete` are ever logged; `Get` exists so read requests
/// participate in request deduplication under their own operation key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operation {
    #[serde(rename = "SET")]
    Set,
    #[serde(rename = "DELETE")]
    Delete,
    #[serde(rename = "GET")]
    Get,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Set => "SET",
            Operation::Delete => "DELETE",
            Operation::Get => "GET",
        }
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single WAL record.
///
/// `id` is assigned by the leader and is strictly increasing and dense
/// across the log. Entries are immutable once appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub id: u64,
    pub operation: Operation,
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    pub crc: u32,
}

/// Why a record failed to decode.
#[derive(Debug)]
pub enum DecodeError {
    /// Not a parseable record (bad JSON, missing required field, empty key).
    Malformed(String),
    /// Parsed fine but the stored CRC does not match the canonical one.
    CrcMismatch { id: u64, expected: u32, actual: u32 },
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecodeError::Malformed(msg) => write!(f, "malformed log record: {}", msg),
            DecodeError::CrcMismatch { id, expected, actual } => {
                write!(
                    f,
                    "CRC mismatch on entry {}: stored {}, computed {}",
                    id, actual, expected
                )
            }
        }
    }
}

impl std::error::Error for DecodeError {}

impl LogEntry {
    /// Build an entry and seal it with its CRC.
    pub fn new(
        id: u64,
        operation: Operation,
        key: impl Into<String>,
        value: Option<Value>,
        version: Option<u64>,
        client_id: Option<String>,
        request_id: Option<String>,
    ) -> Self {
        let mut entry = LogEntry {
            id,
            operation,
            key: key.into(),
            value,
            version,
            client_id,
            request_id,
            crc: 0,
        };
        entry.crc = entry.compute_crc();
        entry
    }

    /// Canonical byte serialization the CRC covers.
    fn canonical_bytes(&self) -> Vec<u8> {
        let mut buf = String::with_capacity(96);
        buf.push_str("{\"id\":");
        let _ = write!(buf, "{}", self.id);
        buf.push_str(",\"operation\":");
        let _ = write!(buf, "\"{}\"", self.operation.as_str());
        buf.push_str(",\"key\":");
        buf.push_str(&json_string(&self.key));
        if let Some(value) = &self.value {
            buf.push_str(",\"value\":");
            // serde_json renders any Value compactly and deterministically
            buf.push_str(&serde_json::to_string(value).expect("JSON value is always serializable"));
        }
        if let Some(version) = self.version {
            buf.push_str(",\"version\":");
            let _ = write!(buf, "{}", version);
        }
        if let Some(client_id) = &self.client_id {
            buf.push_str(",\"client_id\":");
            buf.push_str(&json_string(client_id));
        }
        if let Some(request_id) = &self.request_id {
            buf.push_str(",\"request_id\":");
            buf.push_str(&json_string(request_id));
        }
        buf.push('}');
        buf.into_bytes()
    }

    /// CRC32 (IEEE) over the canonical serialization.
    pub fn compute_crc(&self) -> u32 {
        crc32fast::hash(&self.canonical_bytes())
    }

    /// Whether the stored CRC matches the canonical one.
    pub fn validate_crc(&self) -> bool {
        self.crc == self.compute_crc()
    }

    /// Recompute the CRC if it is missing or stale. Append paths call this;
    /// read paths never do.
    pub fn ensure_crc(&mut self) {
        if !self.validate_crc() {
            self.crc = self.compute_crc();
        }
    }

    /// Encode as one newline-terminated JSON line.
    pub fn encode(&self) -> Vec<u8> {
        let mut bytes =
            serde_json::to_vec(self).expect("log entry is always serializable");
        bytes.push(b'\n');
        bytes
    }

    /// Decode a single line (newline optional). Mismatching CRCs are
    /// surfaced, never silently repaired.
    pub fn decode(line: &[u8]) -> Result<LogEntry, DecodeError> {
        let line = strip_newline(line);
        if line.is_empty() {
            return Err(DecodeError::Malformed("empty line".to_string()));
        }

        let entry: LogEntry = serde_json::from_slice(line)
            .map_err(|e| DecodeError::Malformed(e.to_string()))?;

        if entry.key.is_empty() {
            return Err(DecodeError::Malformed("empty key".to_string()));
        }

        let expected = entry.compute_crc();
        if entry.crc != expected {
            return Err(DecodeError::CrcMismatch {
                id: entry.id,
                expected,
                actual: entry.crc,
            });
        }

        Ok(entry)
    }
}

fn strip_newline(line: &[u8]) -> &[u8] {
    match line {
        [rest @ .., b'\n'] => rest,
        other => other,
    }
}

fn json_string(s: &str) -> String {
    serde_json::to_string(s).expect("string is always serializable")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_entry() -> LogEntry {
        LogEntry::new(
            7,
            Operation::Set,
            "user:42",
            Some(json!({"name": "ada", "admin": true})),
            Some(3),
            Some("c1".to_string()),
            Some("r1".to_string()),
        )
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let entry = sample_entry();
        let encoded = entry.encode();
        assert_eq!(*encoded.last().unwrap(), b'\n');

        let decoded = LogEntry::decode(&encoded).unwrap();
        assert_eq!(decoded, entry);
    }

    #[test]
    fn test_crc_is_stable_for_equal_entries() {
        let a = sample_entry();
        let b = sample_entry();
        assert_eq!(a.crc, b.crc);
        assert!(a.validate_crc());
    }

    #[test]
    fn test_crc_ignores_field_order_on_disk() {
        let entry = LogEntry::new(1, Operation::Set, "k", Some(json!("v")), Some(1), None, None);
        // Same entry with fields shuffled in the stored JSON
        let reordered = format!(
            "{{\"crc\":{},\"key\":\"k\",\"value\":\"v\",\"version\":1,\"operation\":\"SET\",\"id\":1}}",
            entry.crc
        );
        let decoded = LogEntry::decode(reordered.as_bytes()).unwrap();
        assert_eq!(decoded, entry);
    }

    #[test]
    fn test_crc_changes_with_content() {
        let a = LogEntry::new(1, Operation::Set, "k", Some(json!("v1")), None, None, None);
        let b = LogEntry::new(1, Operation::Set, "k", Some(json!("v2")), None, None, None);
        let c = LogEntry::new(1, Operation::Delete, "k", None, None, None, None);
        assert_ne!(a.crc, b.crc);
        assert_ne!(a.crc, c.crc);
    }

    #[test]
    fn test_decode_rejects_wrong_crc() {
        let mut entry = sample_entry();
        entry.crc ^= 0xFFFF;
        let err = LogEntry::decode(&entry.encode()).unwrap_err();
        assert!(matches!(err, DecodeError::CrcMismatch { id: 7, .. }));
    }

    #[test]
    fn test_decode_rejects_malformed_line() {
        assert!(matches!(
            LogEntry::decode(b"not json\n"),
            Err(DecodeError::Malformed(_))
        ));
        assert!(matches!(
            LogEntry::decode(b"{\"id\":1}\n"),
            Err(DecodeError::Malformed(_))
        ));
        assert!(matches!(
            LogEntry::decode(b"\n"),
            Err(DecodeError::Malformed(_))
        ));
    }

    #[test]
    fn test_decode_rejects_empty_key() {
        let mut entry = LogEntry::new(1, Operation::Set, "x", Some(json!("v")), None, None, None);
        entry.key = String::new();
        entry.crc = entry.compute_crc();
        assert!(matches!(
            LogEntry::decode(&entry.encode()),
            Err(DecodeError::Malformed(_))
        ));
    }

    #[test]
    fn test_ensure_crc_repairs_stale_checksum() {
        let mut entry = sample_entry();
        entry.value = Some(json!("changed"));
        assert!(!entry.validate_crc());

        entry.ensure_crc();
        assert!(entry.validate_crc());
    }

    #[test]
    fn test_absent_fields_are_omitted_from_wire_form() {
        let entry = LogEntry::new(2, Operation::Delete, "gone", None, None, None, None);
        let line = String::from_utf8(entry.encode()).unwrap();
        assert!(!line.contains("value"));
        assert!(!line.contains("version"));
        assert!(!line.contains("client_id"));
        assert!(line.contains("\"operation\":\"DELETE\""));
    }
}
