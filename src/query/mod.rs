//! Query pipeline: the lifecycle state machine.
//!
//! ```text
//! Parsed → SourceResolved → Fetched → Verified → PolicyApproved
//!        → Retrieved → Reranked → Compiled → Emitted
//! ```
//!
//! Any state may transition to `Failed` with a typed reason; replay logs are
//! written on both `Emitted` and `Failed`. The trust/policy gate runs
//! between resolution and fetch so a strict deny leaves the CAS untouched.
//! `Verified → PolicyApproved` is the only gate that may produce a warning
//! (`mode: warn`) while continuing.

pub mod compiler;
pub mod rerank;
pub mod retriever;

use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::cas::SourceCache;
use crate::error::{CpmError, Result};
use crate::lockfile::{parse_as_of, resolve_as_of, Lockfile};
use crate::models::{sha256_hex, PacketReference, TrustReport};
use crate::packet::{self, vectors, DOCS_FILE, LOCK_FILE, MANIFEST_FILE, VECTORS_FILE};
use crate::policy::{decision_error, evaluate_with_hub, Decision, OperationKind, PolicyContext, PolicyDecision};
use crate::source::SourceResolver;
use crate::workspace::Context;

use compiler::CompiledContext;
use retriever::{Hit, IndexerKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryState {
    Parsed,
    SourceResolved,
    Fetched,
    Verified,
    PolicyApproved,
    Retrieved,
    Reranked,
    Compiled,
    Emitted,
    Failed,
}

impl QueryState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Parsed => "parsed",
            Self::SourceResolved => "source_resolved",
            Self::Fetched => "fetched",
            Self::Verified => "verified",
            Self::PolicyApproved => "policy_approved",
            Self::Retrieved => "retrieved",
            Self::Reranked => "reranked",
            Self::Compiled => "compiled",
            Self::Emitted => "emitted",
            Self::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone)]
pub struct QueryOptions {
    /// Local packet: a path, `name`, or `name@version` in the package store.
    pub packet: Option<String>,
    /// Remote source URI (`dir://`, `oci://`, `http(s)://`).
    pub source: Option<String>,
    pub query: String,
    pub k: usize,
    pub indexer: Option<String>,
    pub reranker: Option<String>,
    /// Time-travel: pin to the lock snapshot at or before this time.
    pub as_of: Option<String>,
    pub max_tokens: Option<usize>,
    pub frozen_lockfile: bool,
    pub update_lock: bool,
    pub write_replay: bool,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            packet: None,
            source: None,
            query: String::new(),
            k: 5,
            indexer: None,
            reranker: None,
            as_of: None,
            max_tokens: None,
            frozen_lockfile: false,
            update_lock: false,
            write_replay: true,
        }
    }
}

#[derive(Debug)]
pub struct QueryOutput {
    pub packet_dir: PathBuf,
    pub packet_digest: String,
    pub results: Vec<Hit>,
    pub compiled: CompiledContext,
    pub result_hash: String,
    pub compiler_output_hash: String,
    pub policy_decision: PolicyDecision,
    pub warnings: Vec<String>,
    pub replay_log: Option<PathBuf>,
    pub states: Vec<&'static str>,
}

/// Run a query end to end, writing a replay log on success and on failure.
pub async fn run_query(
    ctx: &Context,
    embedder: &dyn crate::embedder::Embedder,
    opts: &QueryOptions,
) -> Result<QueryOutput> {
    match run_pipeline(ctx, embedder, opts).await {
        Ok(output) => Ok(output),
        Err(err) => {
            if opts.write_replay {
                let log = crate::replay::ReplayLog {
                    query: opts.query.clone(),
                    packet_digest: String::new(),
                    model: embedder.model().to_string(),
                    indexer: opts
                        .indexer
                        .clone()
                        .unwrap_or_else(|| ctx.config.retrieval.indexer.clone()),
                    reranker: opts
                        .reranker
                        .clone()
                        .unwrap_or_else(|| ctx.config.retrieval.reranker.clone()),
                    k: opts.k,
                    policy_decision: None,
                    result_hash: String::new(),
                    compiler_output_hash: String::new(),
                    state: QueryState::Failed.as_str().to_string(),
                    error: Some(err.kind().to_string()),
                    warnings: Vec::new(),
                };
                if let Err(log_err) = crate::replay::write_replay(ctx, &log) {
                    debug!(%log_err, "failed to write failure replay log");
                }
            }
            Err(err)
        }
    }
}

async fn run_pipeline(
    ctx: &Context,
    embedder: &dyn crate::embedder::Embedder,
    opts: &QueryOptions,
) -> Result<QueryOutput> {
    let mut states: Vec<&'static str> = vec![QueryState::Parsed.as_str()];
    let mut warnings: Vec<String> = Vec::new();

    // Parsed: validate everything cheap before touching the network.
    if opts.query.trim().is_empty() {
        return Err(CpmError::Usage("query must not be empty".to_string()));
    }
    let k = opts.k.max(1);
    let indexer = IndexerKind::parse(
        opts.indexer
            .as_deref()
            .unwrap_or(&ctx.config.retrieval.indexer),
    )?;
    let reranker = rerank::create_reranker(
        opts.reranker
            .as_deref()
            .unwrap_or(&ctx.config.retrieval.reranker),
    )?;

    // Resolve the packet, locally or through a source.
    let (packet_dir, reference, trust) = if let Some(uri) = &opts.source {
        let resolved = resolve_remote(ctx, uri, &mut states).await?;
        (resolved.0, Some(resolved.1), resolved.2)
    } else if let Some(spec) = &opts.packet {
        let dir = resolve_local(ctx, spec, opts.as_of.as_deref())?;
        states.push(QueryState::SourceResolved.as_str());
        states.push(QueryState::Fetched.as_str());
        (dir, None, None)
    } else {
        return Err(CpmError::Usage(
            "either a packet or a source is required".to_string(),
        ));
    };

    // Verified: lock integrity for the materialized packet.
    let manifest = packet::load_manifest(&packet_dir.join(MANIFEST_FILE))
        .map_err(|e| CpmError::Index(e.to_string()))?;
    verify_lock(&packet_dir, opts, &mut warnings)?;
    states.push(QueryState::Verified.as_str());

    // PolicyApproved: the single gate that may warn and continue.
    let max_tokens = effective_max_tokens(ctx, opts);
    let mut policy_ctx = PolicyContext {
        source_uri: opts.source.clone(),
        trust: trust.clone(),
        tokens: None,
        declared_model: Some(manifest.embedding.model.clone()),
    };
    let gate = evaluate_with_hub(
        &ctx.policy,
        ctx.config.hub.as_ref(),
        &ctx.http,
        OperationKind::Query,
        &policy_ctx,
    )
    .await;
    if gate.is_deny() {
        return Err(decision_error(&gate));
    }
    if gate.decision == Decision::Warn {
        warnings.extend(gate.reasons.iter().cloned());
    }
    states.push(QueryState::PolicyApproved.as_str());

    // Retrieved.
    if embedder.model() != manifest.embedding.model {
        warnings.push(format!(
            "query_model_mismatch: packet embedded with '{}', querying with '{}'",
            manifest.embedding.model,
            embedder.model()
        ));
    }
    let batch = embedder.embed(&[opts.query.clone()]).await?;
    let mut query_vec = batch
        .vectors
        .into_iter()
        .next()
        .ok_or_else(|| CpmError::Embedder("empty embedding response".to_string()))?;
    vectors::normalize(&mut query_vec);
    if query_vec.len() != manifest.embedding.dim {
        return Err(CpmError::Index(format!(
            "query vector dim {} does not match packet dim {}",
            query_vec.len(),
            manifest.embedding.dim
        )));
    }
    let chunks = packet::read_docs_jsonl(&packet_dir.join(DOCS_FILE))
        .map_err(|e| CpmError::Index(e.to_string()))?;
    let outcome = retriever::retrieve(
        &packet_dir,
        &chunks,
        manifest.embedding.dim,
        &query_vec,
        &opts.query,
        indexer,
        k,
    )?;
    warnings.extend(outcome.warnings);
    if outcome.hits.is_empty() {
        return Err(CpmError::QueryEmpty);
    }
    states.push(QueryState::Retrieved.as_str());

    // Reranked.
    let row_vectors = vectors::read_vectors_f16(
        &packet_dir.join(VECTORS_FILE),
        manifest.embedding.dim,
    )
    .map_err(|e| CpmError::Index(e.to_string()))?;
    let results = reranker.rerank(outcome.hits, &row_vectors, k);
    if degenerate_scores(&results) {
        warnings.push(
            "all top-k similarity scores are nearly identical; embeddings may be degenerate"
                .to_string(),
        );
    }
    states.push(QueryState::Reranked.as_str());

    // Compiled.
    let compiled = compiler::compile(&results, &row_vectors, max_tokens, &warnings);
    states.push(QueryState::Compiled.as_str());

    // Final token gate against the policy budget.
    policy_ctx.tokens = Some(compiled.token_estimate);
    let final_decision = crate::policy::evaluate(&ctx.policy, OperationKind::Query, &policy_ctx);
    if final_decision.is_deny() {
        return Err(decision_error(&final_decision));
    }

    let packet_digest =
        packet::packet_digest(&packet_dir).map_err(|e| CpmError::Index(e.to_string()))?;
    if let Some(reference) = &reference {
        if reference.digest != packet_digest {
            warn!(
                expected = %reference.digest,
                actual = %packet_digest,
                "materialized packet digest does not match reference"
            );
        }
    }

    let result_hash = sha256_hex(
        serde_json::to_string(&results)
            .map_err(|e| CpmError::Index(e.to_string()))?
            .as_bytes(),
    );
    let compiler_output_hash = sha256_hex(compiled.canonical_json().as_bytes());

    // Emitted: write the replay log.
    states.push(QueryState::Emitted.as_str());
    let replay_log = if opts.write_replay {
        let log = crate::replay::ReplayLog {
            query: opts.query.clone(),
            packet_digest: packet_digest.clone(),
            model: embedder.model().to_string(),
            indexer: indexer.as_str().to_string(),
            reranker: reranker.name().to_string(),
            k,
            policy_decision: Some(final_decision.clone()),
            result_hash: result_hash.clone(),
            compiler_output_hash: compiler_output_hash.clone(),
            state: QueryState::Emitted.as_str().to_string(),
            error: None,
            warnings: warnings.clone(),
        };
        Some(crate::replay::write_replay(ctx, &log).map_err(|e| CpmError::Cache(e.to_string()))?)
    } else {
        None
    };

    Ok(QueryOutput {
        packet_dir,
        packet_digest,
        results,
        compiled,
        result_hash,
        compiler_output_hash,
        policy_decision: final_decision,
        warnings,
        replay_log,
        states,
    })
}

/// Resolve a remote source with the trust gate between resolve and fetch.
async fn resolve_remote(
    ctx: &Context,
    uri: &str,
    states: &mut Vec<&'static str>,
) -> Result<(PathBuf, PacketReference, Option<TrustReport>)> {
    // Source allowlist gate before any network traffic.
    let pre = evaluate_with_hub(
        &ctx.policy,
        ctx.config.hub.as_ref(),
        &ctx.http,
        OperationKind::Fetch,
        &PolicyContext {
            source_uri: Some(uri.to_string()),
            ..PolicyContext::default()
        },
    )
    .await;
    if pre.is_deny() {
        return Err(decision_error(&pre));
    }

    let resolver = SourceResolver::from_context(ctx);
    let reference = resolver.resolve(uri).await?;
    states.push(QueryState::SourceResolved.as_str());

    // Trust gate before fetch: a strict deny must leave the CAS untouched.
    let trust_gate = evaluate_with_hub(
        &ctx.policy,
        ctx.config.hub.as_ref(),
        &ctx.http,
        OperationKind::Fetch,
        &PolicyContext {
            source_uri: Some(uri.to_string()),
            trust: reference.trust.clone(),
            ..PolicyContext::default()
        },
    )
    .await;
    if trust_gate.is_deny() {
        return Err(decision_error(&trust_gate));
    }

    let cache = SourceCache::new(
        ctx.workspace.objects_dir(),
        ctx.config.cache.objects_quota_bytes,
    );
    let packet = resolver.fetch(&reference, &cache).await?;
    states.push(QueryState::Fetched.as_str());
    let trust = packet.trust.clone();
    Ok((packet.path, reference, trust))
}

/// Resolve a local packet spec (`path`, `name`, `name@version`) to its
/// materialized directory.
pub fn resolve_packet_spec(ctx: &Context, spec: &str) -> Result<PathBuf> {
    resolve_local(ctx, spec, None)
}

/// Resolve a local packet spec (`path`, `name`, `name@version`), honoring
/// `--as-of` via lock snapshots.
fn resolve_local(ctx: &Context, spec: &str, as_of: Option<&str>) -> Result<PathBuf> {
    if let Some(raw) = as_of {
        let at = parse_as_of(raw).ok_or_else(|| {
            CpmError::Usage(format!("unparseable --as-of value: '{}'", raw))
        })?;
        let (name, _) = split_spec(spec);
        let snapshot = resolve_as_of(&ctx.workspace, name, at).ok_or_else(|| {
            CpmError::SourceResolve {
                uri: spec.to_string(),
                reason: format!("no lock snapshot at or before {}", raw),
            }
        })?;
        let lock = Lockfile::load(&snapshot.path).map_err(|e| CpmError::SourceResolve {
            uri: spec.to_string(),
            reason: e.to_string(),
        })?;
        let manifest_sha =
            lock.outputs
                .get(MANIFEST_FILE)
                .ok_or_else(|| CpmError::SourceResolve {
                    uri: spec.to_string(),
                    reason: "snapshot records no manifest digest".to_string(),
                })?;
        let digest = format!("sha256:{}", manifest_sha);
        return ctx
            .workspace
            .find_packet_by_digest(&digest)
            .ok_or_else(|| CpmError::SourceResolve {
                uri: spec.to_string(),
                reason: format!("no materialized packet for snapshot digest {}", digest),
            });
    }

    let as_path = Path::new(spec);
    if as_path.join(MANIFEST_FILE).is_file() {
        return Ok(as_path.to_path_buf());
    }

    let (name, version) = split_spec(spec);
    let base = ctx.workspace.packages_dir().join(name);
    let version = match version {
        Some(version) => version.to_string(),
        None => latest_version(&base).ok_or_else(|| CpmError::SourceResolve {
            uri: spec.to_string(),
            reason: "no installed versions".to_string(),
        })?,
    };
    let dir = base.join(&version);
    if dir.join(MANIFEST_FILE).is_file() {
        Ok(dir)
    } else {
        Err(CpmError::SourceResolve {
            uri: spec.to_string(),
            reason: format!("packet not found at {}", dir.display()),
        })
    }
}

pub(crate) fn split_spec(spec: &str) -> (&str, Option<&str>) {
    match spec.split_once('@') {
        Some((name, version)) if !version.is_empty() => (name, Some(version)),
        _ => (spec, None),
    }
}

pub(crate) fn latest_version(base: &Path) -> Option<String> {
    let mut versions: Vec<(semver::Version, String)> = Vec::new();
    for entry in std::fs::read_dir(base).ok()?.flatten() {
        let name = entry.file_name().to_string_lossy().into_owned();
        if let Ok(parsed) = semver::Version::parse(&name) {
            versions.push((parsed, name));
        }
    }
    versions.sort_by(|a, b| a.0.cmp(&b.0));
    versions.pop().map(|(_, name)| name)
}

fn verify_lock(
    packet_dir: &Path,
    opts: &QueryOptions,
    warnings: &mut Vec<String>,
) -> Result<()> {
    let lock_path = packet_dir.join(LOCK_FILE);
    let Ok(lock) = Lockfile::load(&lock_path) else {
        return Ok(());
    };
    match lock.verify(packet_dir) {
        Ok(()) => Ok(()),
        Err(err) if opts.frozen_lockfile => Err(err),
        Err(err) => {
            warnings.push(format!("lock_mismatch: {}", err));
            if opts.update_lock {
                let mut updated = lock;
                let files: Vec<&str> = updated.outputs.keys().map(String::as_str).collect();
                let recomputed = packet::compute_checksums(packet_dir, &files)
                    .map_err(|e| CpmError::Cache(e.to_string()))?;
                updated.outputs = recomputed
                    .into_iter()
                    .map(|(file, checksum)| (file, checksum.value))
                    .collect();
                updated
                    .save(&lock_path)
                    .map_err(|e| CpmError::Cache(e.to_string()))?;
                warnings.push("lock_rewritten".to_string());
            }
            Ok(())
        }
    }
}

fn effective_max_tokens(ctx: &Context, opts: &QueryOptions) -> usize {
    let requested = opts
        .max_tokens
        .unwrap_or(ctx.config.retrieval.max_context_tokens);
    match ctx.policy.max_tokens {
        Some(policy_max) => requested.min(policy_max),
        None => requested,
    }
}

fn degenerate_scores(results: &[Hit]) -> bool {
    if results.len() < 2 {
        return false;
    }
    let min = results.iter().map(|h| h.score).fold(f32::INFINITY, f32::min);
    let max = results
        .iter()
        .map(|h| h.score)
        .fold(f32::NEG_INFINITY, f32::max);
    (max - min) <= 1e-6
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_spec() {
        assert_eq!(split_spec("pkt@1.0.0"), ("pkt", Some("1.0.0")));
        assert_eq!(split_spec("pkt"), ("pkt", None));
        assert_eq!(split_spec("pkt@"), ("pkt@", None));
    }

    #[test]
    fn test_latest_version_picks_semver_max() {
        let tmp = tempfile::tempdir().unwrap();
        for version in ["1.0.0", "1.10.0", "1.2.0", "not-a-version"] {
            std::fs::create_dir_all(tmp.path().join(version)).unwrap();
        }
        assert_eq!(latest_version(tmp.path()), Some("1.10.0".to_string()));
    }

    #[test]
    fn test_decision_error_maps_trust_rules() {
        use crate::policy::decision_error;
        let decision = PolicyDecision {
            decision: Decision::Deny,
            reasons: vec!["signature_required".to_string()],
        };
        let err = decision_error(&decision);
        assert_eq!(err.kind(), "TrustViolation");
        assert_eq!(err.exit_code(), 4);

        let decision = PolicyDecision {
            decision: Decision::Deny,
            reasons: vec!["source_not_allowlisted".to_string()],
        };
        let err = decision_error(&decision);
        assert_eq!(err.kind(), "PolicyDeny");
        assert_eq!(err.exit_code(), 3);
    }

    #[test]
    fn test_degenerate_scores() {
        let hit = |score: f32| Hit {
            row: 0,
            id: "a".into(),
            path: "a".into(),
            symbol: None,
            score,
            dense_score: None,
            text: String::new(),
        };
        assert!(degenerate_scores(&[hit(0.5), hit(0.5)]));
        assert!(!degenerate_scores(&[hit(0.5), hit(0.7)]));
        assert!(!degenerate_scores(&[hit(0.5)]));
    }
}
