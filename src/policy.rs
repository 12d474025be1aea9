//! Unified policy engine.
//!
//! One policy document (`policy.yml`) gates sources, trust, and token
//! budget across build, install, fetch, and query:
//!
//! ```yaml
//! mode: strict            # strict | warn
//! allowed_sources:
//!   - "oci://registry.internal/*"
//!   - "dir://*"
//! min_trust_score: 0.5
//! max_tokens: 6000
//! require:
//!   signature: true
//! trust_weights:
//!   signature: 0.5
//!   sbom: 0.25
//!   provenance: 0.25
//! ```
//!
//! In `strict` mode a violated rule denies the operation; in `warn` mode the
//! operation proceeds and the violation is recorded in the decision (and,
//! downstream, the replay log). When a hub is configured with
//! `enforce_remote_policy: true`, the remote `/v1/policy/evaluate` verdict
//! is combined with the local one and a hub failure is fail-closed;
//! otherwise hub failures are fail-open.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context as _, Result};
use globset::{Glob, GlobSetBuilder};
use serde::{Deserialize, Serialize};

use crate::config::HubConfig;
use crate::models::TrustReport;

/// Relative weights for the trust-score aggregation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrustWeights {
    #[serde(default = "default_w_signature")]
    pub signature: f64,
    #[serde(default = "default_w_sbom")]
    pub sbom: f64,
    #[serde(default = "default_w_provenance")]
    pub provenance: f64,
}

impl Default for TrustWeights {
    fn default() -> Self {
        Self {
            signature: default_w_signature(),
            sbom: default_w_sbom(),
            provenance: default_w_provenance(),
        }
    }
}

fn default_w_signature() -> f64 {
    0.5
}
fn default_w_sbom() -> f64 {
    0.25
}
fn default_w_provenance() -> f64 {
    0.25
}

/// Hard requirements on trust components.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequireFlags {
    #[serde(default)]
    pub signature: bool,
    #[serde(default)]
    pub sbom: bool,
    #[serde(default)]
    pub provenance: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyMode {
    Strict,
    Warn,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Policy {
    #[serde(default = "default_mode")]
    pub mode: PolicyMode,
    #[serde(default)]
    pub allowed_sources: Vec<String>,
    #[serde(default)]
    pub min_trust_score: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<usize>,
    #[serde(default)]
    pub require: RequireFlags,
    #[serde(default)]
    pub trust_weights: TrustWeights,
}

fn default_mode() -> PolicyMode {
    PolicyMode::Strict
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            mode: PolicyMode::Strict,
            allowed_sources: Vec::new(),
            min_trust_score: 0.0,
            max_tokens: Some(6000),
            require: RequireFlags::default(),
            trust_weights: TrustWeights::default(),
        }
    }
}

/// Load `policy.yml`, falling back to the default policy when absent.
pub fn load_policy(path: &Path) -> Result<Policy> {
    if !path.exists() {
        return Ok(Policy::default());
    }
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read policy {}", path.display()))?;
    serde_yaml::from_str(&content)
        .with_context(|| format!("failed to parse policy {}", path.display()))
}

/// What kind of operation is being gated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Build,
    Install,
    Query,
    Fetch,
}

/// Facts the engine evaluates against the policy.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PolicyContext {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_uri: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trust: Option<TrustReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tokens: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub declared_model: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    Allow,
    Deny,
    Warn,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyDecision {
    pub decision: Decision,
    pub reasons: Vec<String>,
}

impl PolicyDecision {
    fn allow() -> Self {
        Self {
            decision: Decision::Allow,
            reasons: Vec::new(),
        }
    }

    pub fn is_deny(&self) -> bool {
        self.decision == Decision::Deny
    }

    /// The first violated rule, for error reporting.
    pub fn rule(&self) -> String {
        self.reasons
            .first()
            .cloned()
            .unwrap_or_else(|| "policy".to_string())
    }
}

/// Evaluate the local policy for one operation.
pub fn evaluate(policy: &Policy, op: OperationKind, ctx: &PolicyContext) -> PolicyDecision {
    let mut violations: Vec<String> = Vec::new();

    if let Some(uri) = &ctx.source_uri {
        if !policy.allowed_sources.is_empty() && !source_allowed(&policy.allowed_sources, uri) {
            violations.push("source_not_allowlisted".to_string());
        }
    }

    if let Some(trust) = &ctx.trust {
        if policy.require.signature && !(trust.signature.present && trust.signature.valid) {
            violations.push("signature_required".to_string());
        }
        if policy.require.sbom && !(trust.sbom.present && trust.sbom.valid) {
            violations.push("sbom_required".to_string());
        }
        if policy.require.provenance && !(trust.provenance.present && trust.provenance.valid) {
            violations.push("provenance_required".to_string());
        }
        if trust.score < policy.min_trust_score {
            violations.push("trust_score_below_threshold".to_string());
        }
    }

    if op == OperationKind::Query {
        if let (Some(tokens), Some(max)) = (ctx.tokens, policy.max_tokens) {
            if tokens > max {
                violations.push("token_budget_exceeded".to_string());
            }
        }
    }

    if violations.is_empty() {
        return PolicyDecision::allow();
    }
    match policy.mode {
        PolicyMode::Strict => PolicyDecision {
            decision: Decision::Deny,
            reasons: violations,
        },
        PolicyMode::Warn => PolicyDecision {
            decision: Decision::Warn,
            reasons: violations,
        },
    }
}

fn source_allowed(patterns: &[String], uri: &str) -> bool {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        if let Ok(glob) = Glob::new(pattern) {
            builder.add(glob);
        }
    }
    match builder.build() {
        Ok(set) => set.is_match(uri),
        Err(_) => false,
    }
}

/// Evaluate the remote hub policy and combine it with a local decision.
///
/// A deny from either side is final. Hub failure denies when
/// `enforce_remote_policy` is set (fail-closed) and is ignored otherwise
/// (fail-open).
pub async fn evaluate_with_hub(
    policy: &Policy,
    hub: Option<&HubConfig>,
    http: &reqwest::Client,
    op: OperationKind,
    ctx: &PolicyContext,
) -> PolicyDecision {
    let local = evaluate(policy, op, ctx);
    if local.is_deny() {
        return local;
    }
    let Some(hub) = hub else {
        return local;
    };

    #[derive(Deserialize)]
    struct RemoteDecision {
        decision: Decision,
        #[serde(default)]
        reasons: Vec<String>,
    }

    let body = serde_json::json!({
        "policy": policy,
        "context": ctx,
        "operation": op,
    });
    let response = http
        .post(format!("{}/v1/policy/evaluate", hub.url.trim_end_matches('/')))
        .timeout(Duration::from_secs(hub.timeout_secs))
        .json(&body)
        .send()
        .await;

    let remote: Option<RemoteDecision> = match response {
        Ok(resp) if resp.status().is_success() => resp.json().await.ok(),
        _ => None,
    };

    match remote {
        Some(remote) => {
            if remote.decision == Decision::Deny {
                return PolicyDecision {
                    decision: Decision::Deny,
                    reasons: remote.reasons,
                };
            }
            let mut combined = local;
            if remote.decision == Decision::Warn {
                combined.decision = Decision::Warn;
                combined.reasons.extend(remote.reasons);
            }
            combined
        }
        None if hub.enforce_remote_policy => PolicyDecision {
            decision: Decision::Deny,
            reasons: vec!["hub_policy_unreachable".to_string()],
        },
        None => {
            tracing::warn!(hub = %hub.url, "hub policy evaluation unreachable, continuing (fail-open)");
            local
        }
    }
}

/// Map a policy denial onto the typed error surface: trust rules become
/// `TrustViolation` (exit 4), everything else `PolicyDeny` (exit 3).
pub fn decision_error(decision: &PolicyDecision) -> crate::error::CpmError {
    use crate::error::{CpmError, TrustComponent};
    for reason in &decision.reasons {
        let component = match reason.as_str() {
            "signature_required" => Some(TrustComponent::Signature),
            "sbom_required" => Some(TrustComponent::Sbom),
            "provenance_required" => Some(TrustComponent::Provenance),
            "trust_score_below_threshold" => Some(TrustComponent::Score),
            _ => None,
        };
        if let Some(component) = component {
            return CpmError::TrustViolation {
                component,
                reason: reason.clone(),
            };
        }
    }
    CpmError::PolicyDeny {
        rule: decision.rule(),
    }
}
