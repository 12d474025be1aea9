//! Typed error kinds and process exit codes.
//!
//! Every failure that can surface to the user is one of the [`CpmError`]
//! variants. Each variant maps to a stable kind string (used in JSON output)
//! and a process exit code:
//!
//! | Exit code | Meaning |
//! |-----------|---------|
//! | 0 | success |
//! | 2 | usage error |
//! | 3 | policy deny |
//! | 4 | trust violation |
//! | 5 | lock verification failure |
//! | 6 | benchmark KPI gate failed |
//! | >= 10 | unexpected (I/O, embedder, cache, index, ...) |

use serde_json::json;
use thiserror::Error;

/// Which trust verification component failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrustComponent {
    Signature,
    Sbom,
    Provenance,
    Score,
}

impl TrustComponent {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Signature => "signature",
            Self::Sbom => "sbom",
            Self::Provenance => "provenance",
            Self::Score => "score",
        }
    }
}

impl std::fmt::Display for TrustComponent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// All user-visible failure kinds.
#[derive(Debug, Error)]
pub enum CpmError {
    #[error("usage: {0}")]
    Usage(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("chunking failed for {path}: {reason}")]
    Chunking { path: String, reason: String },

    #[error("embedder error: {0}")]
    Embedder(String),

    #[error("cache error: {0}")]
    Cache(String),

    #[error("unable to resolve source '{uri}': {reason}")]
    SourceResolve { uri: String, reason: String },

    #[error("fetch failed for '{uri}': {reason}")]
    Fetch { uri: String, reason: String },

    #[error("trust violation ({component}): {reason}")]
    TrustViolation {
        component: TrustComponent,
        reason: String,
    },

    #[error("policy deny ({rule})")]
    PolicyDeny { rule: String },

    #[error("lock mismatch for '{artifact}': expected {expected}, found {actual}")]
    LockMismatch {
        artifact: String,
        expected: String,
        actual: String,
    },

    #[error("index error: {0}")]
    Index(String),

    #[error("query produced no results")]
    QueryEmpty,

    #[error("token budget exceeded: {used} > {limit}")]
    BudgetExceeded { used: usize, limit: usize },

    #[error("replay mismatch: expected {expected}, actual {actual}")]
    ReplayMismatch { expected: String, actual: String },

    #[error("benchmark KPI gate failed: {0}")]
    KpiGate(String),
}

impl CpmError {
    /// Stable machine-readable kind string, used in JSON output.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Usage(_) => "UsageError",
            Self::Io(_) => "IoError",
            Self::Chunking { .. } => "ChunkingError",
            Self::Embedder(_) => "EmbedderError",
            Self::Cache(_) => "CacheError",
            Self::SourceResolve { .. } => "SourceResolveError",
            Self::Fetch { .. } => "FetchError",
            Self::TrustViolation { .. } => "TrustViolation",
            Self::PolicyDeny { .. } => "PolicyDeny",
            Self::LockMismatch { .. } => "LockMismatch",
            Self::Index(_) => "IndexError",
            Self::QueryEmpty => "QueryEmpty",
            Self::BudgetExceeded { .. } => "BudgetExceeded",
            Self::ReplayMismatch { .. } => "ReplayMismatch",
            Self::KpiGate(_) => "KpiGateFailed",
        }
    }

    /// Process exit code for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Usage(_) => 2,
            Self::PolicyDeny { .. } => 3,
            Self::TrustViolation { .. } => 4,
            Self::LockMismatch { .. } => 5,
            Self::KpiGate(_) => 6,
            Self::Io(_) => 10,
            Self::Chunking { .. } => 11,
            Self::Embedder(_) => 12,
            Self::Cache(_) => 13,
            Self::SourceResolve { .. } => 14,
            Self::Fetch { .. } => 15,
            Self::Index(_) => 16,
            Self::QueryEmpty => 17,
            Self::BudgetExceeded { .. } => 18,
            Self::ReplayMismatch { .. } => 19,
        }
    }

    /// Offending rule or component detail, when one exists.
    pub fn detail(&self) -> Option<String> {
        match self {
            Self::PolicyDeny { rule } => Some(rule.clone()),
            Self::TrustViolation { component, .. } => Some(component.as_str().to_string()),
            Self::LockMismatch { artifact, .. } => Some(artifact.clone()),
            _ => None,
        }
    }

    /// JSON error envelope: `{ok: false, error: {kind, message, detail}}`.
    pub fn to_json(&self) -> serde_json::Value {
        json!({
            "ok": false,
            "error": {
                "kind": self.kind(),
                "message": self.to_string(),
                "detail": self.detail(),
            }
        })
    }
}

pub type Result<T> = std::result::Result<T, CpmError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(CpmError::Usage("x".into()).exit_code(), 2);
        assert_eq!(
            CpmError::PolicyDeny {
                rule: "source_not_allowlisted".into()
            }
            .exit_code(),
            3
        );
        assert_eq!(
            CpmError::TrustViolation {
                component: TrustComponent::Signature,
                reason: "missing".into()
            }
            .exit_code(),
            4
        );
        assert_eq!(
            CpmError::LockMismatch {
                artifact: "docs.jsonl".into(),
                expected: "a".into(),
                actual: "b".into()
            }
            .exit_code(),
            5
        );
        assert_eq!(CpmError::KpiGate("hit rate".into()).exit_code(), 6);
        assert!(CpmError::QueryEmpty.exit_code() >= 10);
    }

    #[test]
    fn test_json_envelope() {
        let err = CpmError::TrustViolation {
            component: TrustComponent::Sbom,
            reason: "unparseable".into(),
        };
        let value = err.to_json();
        assert_eq!(value["ok"], false);
        assert_eq!(value["error"]["kind"], "TrustViolation");
        assert_eq!(value["error"]["detail"], "sbom");
    }
}
