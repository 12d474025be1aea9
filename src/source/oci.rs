//! OCI registry source.

use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::cas::SourceCache;
use crate::error::{CpmError, Result};
use crate::models::{LocalPacket, PacketReference, UpdateInfo};
use crate::oci::verify::{verify, VerifyMaterial};
use crate::oci::{
    safe_output_path, OciClient, OciRef, FILENAME_ANNOTATION, PROVENANCE_ARTIFACT_TYPE,
    SBOM_ARTIFACT_TYPE, SIGNATURE_ARTIFACT_TYPE,
};
use crate::policy::TrustWeights;
use crate::workspace::{Context, Workspace};

pub struct OciSource {
    client: OciClient,
    issuers: BTreeMap<String, String>,
    weights: TrustWeights,
    workspace: Workspace,
}

impl OciSource {
    pub fn new(
        client: OciClient,
        issuers: BTreeMap<String, String>,
        weights: TrustWeights,
        workspace: Workspace,
    ) -> Self {
        Self {
            client,
            issuers,
            weights,
            workspace,
        }
    }

    pub fn from_context(ctx: &Context) -> Self {
        Self::new(
            OciClient::new(&ctx.config.oci, ctx.http.clone()),
            ctx.config.oci.issuers.clone(),
            ctx.policy.trust_weights,
            ctx.workspace.clone(),
        )
    }

    /// Gather referrer payloads and verify them against the digest.
    async fn verify_reference(
        &self,
        reference: &OciRef,
        digest: &str,
    ) -> (crate::models::TrustReport, Vec<String>) {
        let referrers = self.client.list_referrers(reference, digest).await;
        let mut material = VerifyMaterial::default();
        let mut refs = Vec::new();
        for descriptor in &referrers {
            let Some(artifact_type) = descriptor.artifact_type.as_deref() else {
                continue;
            };
            refs.push(artifact_type.to_string());
            let payload = match self.client.fetch_referrer_payload(reference, descriptor).await {
                Ok(payload) => payload,
                Err(err) => {
                    tracing::debug!(%err, artifact_type, "referrer payload fetch failed");
                    continue;
                }
            };
            match artifact_type {
                SIGNATURE_ARTIFACT_TYPE => material.signature = Some(payload),
                SBOM_ARTIFACT_TYPE => material.sbom = Some(payload),
                PROVENANCE_ARTIFACT_TYPE => material.provenance = Some(payload),
                _ => {}
            }
        }
        (
            verify(&material, digest, &self.issuers, &self.weights),
            refs,
        )
    }
}

#[async_trait]
impl super::Source for OciSource {
    fn name(&self) -> &str {
        "oci"
    }

    fn can_handle(&self, uri: &str) -> bool {
        uri.starts_with("oci://")
    }

    async fn resolve(&self, uri: &str) -> Result<PacketReference> {
        let reference = OciRef::parse(uri)?;
        let digest = self.client.resolve(&reference).await?;
        let (trust, refs) = self.verify_reference(&reference, &digest).await;
        Ok(PacketReference {
            uri: uri.to_string(),
            digest,
            refs,
            trust: Some(trust),
        })
    }

    async fn fetch(
        &self,
        reference: &PacketReference,
        cache: &SourceCache,
    ) -> Result<LocalPacket> {
        let oci_ref = OciRef::parse(&reference.uri)?;
        let pinned = OciRef {
            reference: reference.digest.clone(),
            ..oci_ref.clone()
        };
        let _guard = cache.pin(&reference.digest)?;
        let (manifest, _) = self.client.fetch_manifest(&pinned).await?;

        let target = self.workspace.materialized_dir(&reference.digest);
        std::fs::create_dir_all(&target)?;
        for layer in &manifest.layers {
            let Some(filename) = layer.annotations.get(FILENAME_ANNOTATION) else {
                continue;
            };
            let bytes = match cache.read(&layer.digest)? {
                Some(bytes) => bytes,
                None => {
                    let bytes = self.client.fetch_blob(&pinned, &layer.digest).await?;
                    cache.put(&layer.digest, &bytes)?;
                    bytes
                }
            };
            let out = safe_output_path(&target, filename)?;
            if let Some(parent) = out.parent() {
                std::fs::create_dir_all(parent)?;
            }
            crate::packet::atomic_write(&out, &bytes)
                .map_err(|e| CpmError::Cache(e.to_string()))?;
        }

        let mut packet = LocalPacket::load(&target).map_err(|e| CpmError::Fetch {
            uri: reference.uri.clone(),
            reason: format!("materialized payload is not a packet: {}", e),
        })?;
        packet.trust = reference.trust.clone();
        Ok(packet)
    }

    async fn check_updates(&self, reference: &PacketReference) -> Result<UpdateInfo> {
        let oci_ref = OciRef::parse(&reference.uri)?;
        let latest = self.client.resolve(&oci_ref).await?;
        Ok(UpdateInfo {
            newer: latest != reference.digest,
            latest_digest: latest,
            current_digest: reference.digest.clone(),
            refs: reference.refs.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::super::Source as _;
    use super::*;
    use crate::config::OciConfig;

    fn source(tmp: &std::path::Path) -> OciSource {
        OciSource::new(
            OciClient::new(&OciConfig::default(), reqwest::Client::new()),
            BTreeMap::new(),
            TrustWeights::default(),
            Workspace::new(tmp),
        )
    }

    #[test]
    fn test_can_handle() {
        let tmp = tempfile::tempdir().unwrap();
        let source = source(tmp.path());
        assert!(source.can_handle("oci://r.example/team/pkt@1.0.0"));
        assert!(!source.can_handle("dir://x"));
        assert!(!source.can_handle("https://hub.example/v1/resolve"));
    }

    #[tokio::test]
    async fn test_resolve_bad_uri_is_resolve_error() {
        let tmp = tempfile::tempdir().unwrap();
        let source = source(tmp.path());
        let err = source.resolve("oci://registry-only@1").await.unwrap_err();
        assert_eq!(err.kind(), "SourceResolveError");
    }
}
