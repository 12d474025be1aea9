//! Deterministic replay logs.
//!
//! Every query writes `state/replay/query-<stamp>.json` recording the
//! parameters and output hashes. `replay <log>` re-runs the query with the
//! logged parameters against the logged packet digest and succeeds only if
//! both `result_hash` and `compiler_output_hash` reproduce exactly; missing
//! artifacts fail with an explicit error, never a partial success.

use std::path::{Path, PathBuf};

use anyhow::{Context as _, Result as AnyResult};
use serde::{Deserialize, Serialize};

use crate::error::{CpmError, Result};
use crate::policy::PolicyDecision;
use crate::query::{run_query, QueryOptions};
use crate::workspace::Context;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplayLog {
    pub query: String,
    pub packet_digest: String,
    pub model: String,
    pub indexer: String,
    pub reranker: String,
    pub k: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy_decision: Option<PolicyDecision>,
    pub result_hash: String,
    pub compiler_output_hash: String,
    /// Final lifecycle state (`emitted` or `failed`).
    pub state: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub warnings: Vec<String>,
}

impl ReplayLog {
    pub fn load(path: &Path) -> AnyResult<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read replay log {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("failed to parse replay log {}", path.display()))
    }
}

/// Write a replay log under `state/replay/`, returning its path.
pub fn write_replay(ctx: &Context, log: &ReplayLog) -> AnyResult<PathBuf> {
    let dir = ctx.workspace.replay_dir();
    std::fs::create_dir_all(&dir)?;
    let path = dir.join(format!("query-{}.json", ctx.clock.now_stamp()));
    let mut bytes = serde_json::to_vec_pretty(log)?;
    bytes.push(b'\n');
    crate::packet::atomic_write(&path, &bytes)?;
    Ok(path)
}

#[derive(Debug)]
pub struct ReplayOutcome {
    pub expected_result_hash: String,
    pub actual_result_hash: String,
    pub expected_compiler_hash: String,
    pub actual_compiler_hash: String,
}

/// Re-run a logged query and verify its hashes reproduce.
pub async fn replay(
    ctx: &Context,
    embedder: &dyn crate::embedder::Embedder,
    log_path: &Path,
) -> Result<ReplayOutcome> {
    let log = ReplayLog::load(log_path).map_err(|e| CpmError::Usage(e.to_string()))?;
    if log.result_hash.is_empty() {
        return Err(CpmError::Usage(format!(
            "replay log {} records a failed query (no result hash)",
            log_path.display()
        )));
    }
    let packet_dir = ctx
        .workspace
        .find_packet_by_digest(&log.packet_digest)
        .ok_or_else(|| CpmError::SourceResolve {
            uri: log.packet_digest.clone(),
            reason: "logged packet digest is not materialized in this workspace".to_string(),
        })?;
    if embedder.model() != log.model {
        return Err(CpmError::Usage(format!(
            "replay requires model '{}', embedder provides '{}'",
            log.model,
            embedder.model()
        )));
    }

    let opts = QueryOptions {
        packet: Some(packet_dir.to_string_lossy().into_owned()),
        source: None,
        query: log.query.clone(),
        k: log.k,
        indexer: Some(log.indexer.clone()),
        reranker: Some(log.reranker.clone()),
        as_of: None,
        max_tokens: None,
        frozen_lockfile: false,
        update_lock: false,
        write_replay: false,
    };
    let output = run_query(ctx, embedder, &opts).await?;

    let outcome = ReplayOutcome {
        expected_result_hash: log.result_hash.clone(),
        actual_result_hash: output.result_hash.clone(),
        expected_compiler_hash: log.compiler_output_hash.clone(),
        actual_compiler_hash: output.compiler_output_hash.clone(),
    };
    if outcome.actual_result_hash != outcome.expected_result_hash
        || outcome.actual_compiler_hash != outcome.expected_compiler_hash
    {
        return Err(CpmError::ReplayMismatch {
            expected: format!(
                "{}/{}",
                outcome.expected_result_hash, outcome.expected_compiler_hash
            ),
            actual: format!(
                "{}/{}",
                outcome.actual_result_hash, outcome.actual_compiler_hash
            ),
        });
    }
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workspace::{Clock, Workspace};

    #[test]
    fn test_log_roundtrip() {
        let tmp = tempfile::tempdir().unwrap();
        let mut ctx = Context::new(
            Workspace::new(tmp.path()),
            crate::config::Config::default(),
            crate::policy::Policy::default(),
        );
        ctx.clock = Clock::Fixed(
            chrono::DateTime::parse_from_rfc3339("2026-04-01T10:00:00Z")
                .unwrap()
                .with_timezone(&chrono::Utc),
        );
        let log = ReplayLog {
            query: "auth".into(),
            packet_digest: format!("sha256:{}", "0".repeat(64)),
            model: "m".into(),
            indexer: "faiss-flatip".into(),
            reranker: "none".into(),
            k: 5,
            policy_decision: None,
            result_hash: "abc".into(),
            compiler_output_hash: "def".into(),
            state: "emitted".into(),
            error: None,
            warnings: vec![],
        };
        let path = write_replay(&ctx, &log).unwrap();
        assert!(path
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("query-20260401T100000"));
        let back = ReplayLog::load(&path).unwrap();
        assert_eq!(back.query, "auth");
        assert_eq!(back.result_hash, "abc");
    }

    #[tokio::test]
    async fn test_replay_missing_packet_is_explicit_error() {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = Context::new(
            Workspace::new(tmp.path()),
            crate::config::Config::default(),
            crate::policy::Policy::default(),
        );
        let log = ReplayLog {
            query: "auth".into(),
            packet_digest: format!("sha256:{}", "1".repeat(64)),
            model: "m".into(),
            indexer: "faiss-flatip".into(),
            reranker: "none".into(),
            k: 5,
            policy_decision: None,
            result_hash: "abc".into(),
            compiler_output_hash: "def".into(),
            state: "emitted".into(),
            error: None,
            warnings: vec![],
        };
        let path = tmp.path().join("log.json");
        std::fs::write(&path, serde_json::to_vec(&log).unwrap()).unwrap();
        let embedder = crate::embedder::StubEmbedder::new("m".into(), 4);
        let err = replay(&ctx, &embedder, &path).await.unwrap_err();
        assert_eq!(err.kind(), "SourceResolveError");
    }
}
