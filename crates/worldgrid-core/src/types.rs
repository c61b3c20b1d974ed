//! Shared types used across worldgrid crates.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Opaque identifier the compute provider returns for an in-flight operation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OperationHandle(String);

impl OperationHandle {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for OperationHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Provider operation type. Serialized with the provider's spelling.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum OperationKind {
    Insert,
    Start,
    Reset,
    Delete,
    CreateSnapshot,
    Other(String),
}

impl OperationKind {
    pub fn as_str(&self) -> &str {
        match self {
            OperationKind::Insert => "insert",
            OperationKind::Start => "start",
            OperationKind::Reset => "reset",
            OperationKind::Delete => "delete",
            OperationKind::CreateSnapshot => "createSnapshot",
            OperationKind::Other(s) => s,
        }
    }

    pub fn is_delete(&self) -> bool {
        matches!(self, OperationKind::Delete)
    }
}

impl From<String> for OperationKind {
    fn from(s: String) -> Self {
        match s.as_str() {
            "insert" => OperationKind::Insert,
            "start" => OperationKind::Start,
            "reset" => OperationKind::Reset,
            "delete" => OperationKind::Delete,
            "createSnapshot" => OperationKind::CreateSnapshot,
            _ => OperationKind::Other(s),
        }
    }
}

impl From<&str> for OperationKind {
    fn from(s: &str) -> Self {
        OperationKind::from(s.to_string())
    }
}

impl From<OperationKind> for String {
    fn from(kind: OperationKind) -> Self {
        kind.as_str().to_string()
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Provider operation status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationStatus {
    Pending,
    Running,
    Done,
    #[serde(other)]
    Unknown,
}

impl OperationStatus {
    pub fn is_done(self) -> bool {
        self == OperationStatus::Done
    }
}

impl fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OperationStatus::Pending => "PENDING",
            OperationStatus::Running => "RUNNING",
            OperationStatus::Done => "DONE",
            OperationStatus::Unknown => "UNKNOWN",
        };
        f.write_str(s)
    }
}

/// Deterministic idempotency token for provider insert calls.
///
/// Formatted as a UUID-shaped hex string, which is what the Compute API
/// accepts for `requestId`.
pub fn idempotency_token(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_bytes());
        hasher.update([0u8]);
    }
    let digest = hex::encode(hasher.finalize());
    format!(
        "{}-{}-{}-{}-{}",
        &digest[0..8],
        &digest[8..12],
        &digest[12..16],
        &digest[16..20],
        &digest[20..32]
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operation_kind_uses_provider_spelling() {
        let json = serde_json::to_string(&OperationKind::CreateSnapshot).unwrap();
        assert_eq!(json, "\"createSnapshot\"");
        let kind: OperationKind = serde_json::from_str("\"delete\"").unwrap();
        assert!(kind.is_delete());
        let kind: OperationKind = serde_json::from_str("\"setMetadata\"").unwrap();
        assert_eq!(kind, OperationKind::Other("setMetadata".to_string()));
    }

    #[test]
    fn operation_status_tolerates_unknown_values() {
        let status: OperationStatus = serde_json::from_str("\"DONE\"").unwrap();
        assert!(status.is_done());
        let status: OperationStatus = serde_json::from_str("\"ABORTING\"").unwrap();
        assert_eq!(status, OperationStatus::Unknown);
    }

    #[test]
    fn idempotency_token_is_stable_and_distinct() {
        let a = idempotency_token(&["alpha", "insert", "1"]);
        let b = idempotency_token(&["alpha", "insert", "1"]);
        let c = idempotency_token(&["alpha", "insert", "2"]);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 36);
    }
}
