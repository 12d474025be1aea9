//! Hub source: resolution delegated to the registry service.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use crate::cas::SourceCache;
use crate::config::HubConfig;
use crate::error::{CpmError, Result};
use crate::models::{LocalPacket, PacketReference, TrustReport, UpdateInfo};
use crate::workspace::Workspace;

use super::{OciSource, Source as _};

pub struct HubSource {
    hub: HubConfig,
    http: reqwest::Client,
    /// Fetch delegate for `oci://` refs returned by the hub.
    oci: OciSource,
    workspace: Workspace,
}

#[derive(Debug, Deserialize)]
struct ResolveResponse {
    #[serde(default)]
    uri: Option<String>,
    digest: String,
    #[serde(default)]
    refs: Vec<String>,
    #[serde(default)]
    trust: Option<TrustReport>,
}

impl HubSource {
    pub fn new(
        hub: HubConfig,
        http: reqwest::Client,
        oci: OciSource,
        workspace: Workspace,
    ) -> Self {
        Self {
            hub,
            http,
            oci,
            workspace,
        }
    }

    async fn resolve_remote(&self, uri: &str) -> Result<ResolveResponse> {
        let endpoint = format!("{}/v1/resolve", self.hub.url.trim_end_matches('/'));
        let response = self
            .http
            .post(&endpoint)
            .timeout(Duration::from_secs(self.hub.timeout_secs))
            .json(&serde_json::json!({ "uri": uri }))
            .send()
            .await
            .map_err(|e| CpmError::SourceResolve {
                uri: uri.to_string(),
                reason: format!("hub unreachable: {}", e),
            })?;
        if !response.status().is_success() {
            return Err(CpmError::SourceResolve {
                uri: uri.to_string(),
                reason: format!("hub returned {}", response.status()),
            });
        }
        response.json().await.map_err(|e| CpmError::SourceResolve {
            uri: uri.to_string(),
            reason: format!("invalid hub response: {}", e),
        })
    }
}

/// `GET /v1/capabilities` — what the hub can verify and retrieve.
pub async fn hub_capabilities(
    hub: &HubConfig,
    http: &reqwest::Client,
) -> Result<serde_json::Value> {
    let endpoint = format!("{}/v1/capabilities", hub.url.trim_end_matches('/'));
    let response = http
        .get(&endpoint)
        .timeout(Duration::from_secs(hub.timeout_secs))
        .send()
        .await
        .map_err(|e| CpmError::SourceResolve {
            uri: endpoint.clone(),
            reason: format!("hub unreachable: {}", e),
        })?;
    response.json().await.map_err(|e| CpmError::SourceResolve {
        uri: endpoint,
        reason: format!("invalid capabilities response: {}", e),
    })
}

#[async_trait]
impl super::Source for HubSource {
    fn name(&self) -> &str {
        "hub"
    }

    fn can_handle(&self, uri: &str) -> bool {
        uri.starts_with("http://") || uri.starts_with("https://")
    }

    async fn resolve(&self, uri: &str) -> Result<PacketReference> {
        let resolved = self.resolve_remote(uri).await?;
        Ok(PacketReference {
            uri: resolved.uri.unwrap_or_else(|| uri.to_string()),
            digest: resolved.digest,
            refs: resolved.refs,
            trust: resolved.trust,
        })
    }

    async fn fetch(
        &self,
        reference: &PacketReference,
        cache: &SourceCache,
    ) -> Result<LocalPacket> {
        // Already materialized (an earlier install or fetch)?
        if let Some(path) = self.workspace.find_packet_by_digest(&reference.digest) {
            let mut packet = LocalPacket::load(&path).map_err(|e| CpmError::Fetch {
                uri: reference.uri.clone(),
                reason: e.to_string(),
            })?;
            packet.trust = reference.trust.clone();
            return Ok(packet);
        }

        // Delegate to the first fetchable ref the hub returned.
        for alt in &reference.refs {
            if !self.oci.can_handle(alt) {
                continue;
            }
            let delegated = PacketReference {
                uri: alt.clone(),
                digest: reference.digest.clone(),
                refs: Vec::new(),
                trust: reference.trust.clone(),
            };
            match self.oci.fetch(&delegated, cache).await {
                Ok(mut packet) => {
                    packet.trust = reference.trust.clone();
                    return Ok(packet);
                }
                Err(err) => {
                    tracing::warn!(alt, %err, "hub ref fetch failed, trying next");
                }
            }
        }
        Err(CpmError::Fetch {
            uri: reference.uri.clone(),
            reason: "hub returned no fetchable refs".to_string(),
        })
    }

    async fn check_updates(&self, reference: &PacketReference) -> Result<UpdateInfo> {
        let latest = self.resolve_remote(&reference.uri).await?;
        Ok(UpdateInfo {
            newer: latest.digest != reference.digest,
            latest_digest: latest.digest,
            current_digest: reference.digest.clone(),
            refs: latest.refs,
        })
    }
}
