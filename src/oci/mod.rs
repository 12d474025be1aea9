//! OCI distribution client and publish layout.
//!
//! Packets are distributed as OCI artifacts: an image manifest whose layers
//! are the payload files (`cpm.yml`, `manifest.json`, `docs.jsonl`,
//! `vectors.f16.bin`, `faiss/index.faiss`, optional `bm25.bin`), each layer
//! annotated with its filename. Immutable identity is `name@sha256:<digest>`;
//! tags are mutable pointers.
//!
//! Referrers (signature, SBOM, provenance) attach via the referrers API when
//! the registry supports it, with `sha256-<digest>.sig|.sbom|.prov` tag
//! fallbacks otherwise.
//!
//! Registry hosts can be allowlisted; blob fetches have a 300 s default
//! deadline. Extraction is guarded against path traversal.

pub mod verify;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::config::OciConfig;
use crate::error::{CpmError, Result};

pub const MANIFEST_MEDIA_TYPE: &str = "application/vnd.oci.image.manifest.v1+json";
pub const CONFIG_MEDIA_TYPE: &str = "application/vnd.cpm.packet.config.v1+json";
pub const LAYER_MEDIA_TYPE: &str = "application/vnd.cpm.packet.layer.v1";
pub const SIGNATURE_ARTIFACT_TYPE: &str = "application/vnd.cpm.signature.v1+json";
pub const SBOM_ARTIFACT_TYPE: &str = "application/vnd.cyclonedx+json";
pub const PROVENANCE_ARTIFACT_TYPE: &str = "application/vnd.in-toto+json";
pub const FILENAME_ANNOTATION: &str = "org.cpm.filename";

/// Parsed `oci://host/repo/name@reference` value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OciRef {
    pub host: String,
    pub repository: String,
    /// Tag (`1.0.0`) or digest (`sha256:<hex>`).
    pub reference: String,
}

impl OciRef {
    pub fn parse(uri: &str) -> Result<Self> {
        let rest = uri
            .strip_prefix("oci://")
            .ok_or_else(|| CpmError::SourceResolve {
                uri: uri.to_string(),
                reason: "not an oci:// reference".to_string(),
            })?;
        let (path, reference) = rest.rsplit_once('@').ok_or_else(|| CpmError::SourceResolve {
            uri: uri.to_string(),
            reason: "missing @version or @digest".to_string(),
        })?;
        let (host, repository) = path.split_once('/').ok_or_else(|| CpmError::SourceResolve {
            uri: uri.to_string(),
            reason: "missing repository path".to_string(),
        })?;
        if host.is_empty() || repository.is_empty() || reference.is_empty() {
            return Err(CpmError::SourceResolve {
                uri: uri.to_string(),
                reason: "empty host, repository, or reference".to_string(),
            });
        }
        Ok(Self {
            host: host.to_lowercase(),
            repository: repository.to_string(),
            reference: reference.to_string(),
        })
    }

    pub fn is_digest(&self) -> bool {
        self.reference.starts_with("sha256:")
    }

    pub fn uri(&self) -> String {
        format!("oci://{}/{}@{}", self.host, self.repository, self.reference)
    }
}

/// Reject registry hosts outside the allowlist (empty allowlist = any).
pub fn assert_allowlisted(reference: &OciRef, allowlist: &[String]) -> Result<()> {
    if allowlist.is_empty() {
        return Ok(());
    }
    for allowed in allowlist {
        let key = allowed.trim().to_lowercase();
        if key.is_empty() {
            continue;
        }
        if reference.host == key || reference.host.ends_with(&format!(".{}", key)) {
            return Ok(());
        }
    }
    Err(CpmError::Fetch {
        uri: reference.uri(),
        reason: format!("registry host '{}' is not allowlisted", reference.host),
    })
}

/// Resolve an extraction target, refusing traversal outside the base.
pub fn safe_output_path(base: &Path, relative: &str) -> Result<PathBuf> {
    if relative.split('/').any(|part| part == "..") || relative.starts_with('/') {
        return Err(CpmError::Fetch {
            uri: relative.to_string(),
            reason: "path traversal blocked".to_string(),
        });
    }
    Ok(base.join(relative))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Descriptor {
    #[serde(rename = "mediaType")]
    pub media_type: String,
    pub digest: String,
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "artifactType")]
    pub artifact_type: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OciManifest {
    #[serde(rename = "schemaVersion")]
    pub schema_version: u32,
    #[serde(rename = "mediaType")]
    pub media_type: String,
    pub config: Descriptor,
    pub layers: Vec<Descriptor>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct ReferrerIndex {
    #[serde(default)]
    manifests: Vec<Descriptor>,
}

/// Minimal distribution-spec v2 client.
pub struct OciClient {
    http: reqwest::Client,
    timeout: Duration,
    insecure: bool,
    allowlist: Vec<String>,
}

impl OciClient {
    pub fn new(config: &OciConfig, http: reqwest::Client) -> Self {
        Self {
            http,
            timeout: Duration::from_secs(config.timeout_secs),
            insecure: config.insecure,
            allowlist: config.allowed_registries.clone(),
        }
    }

    fn base_url(&self, reference: &OciRef) -> String {
        let scheme = if self.insecure { "http" } else { "https" };
        format!("{}://{}/v2/{}", scheme, reference.host, reference.repository)
    }

    /// Resolve a tag (or verify a digest reference) to the manifest digest.
    pub async fn resolve(&self, reference: &OciRef) -> Result<String> {
        assert_allowlisted(reference, &self.allowlist)?;
        let (_, digest) = self.fetch_manifest(reference).await?;
        Ok(digest)
    }

    /// Fetch the manifest for a tag or digest reference.
    pub async fn fetch_manifest(&self, reference: &OciRef) -> Result<(OciManifest, String)> {
        assert_allowlisted(reference, &self.allowlist)?;
        let url = format!(
            "{}/manifests/{}",
            self.base_url(reference),
            reference.reference
        );
        let response = self
            .http
            .get(&url)
            .header("Accept", MANIFEST_MEDIA_TYPE)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| fetch_err(reference, format!("manifest request failed: {}", e)))?;
        if !response.status().is_success() {
            return Err(fetch_err(
                reference,
                format!("manifest request returned {}", response.status()),
            ));
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|e| fetch_err(reference, e.to_string()))?;
        let digest = format!("sha256:{}", hex::encode(Sha256::digest(&bytes)));
        if reference.is_digest() && digest != reference.reference {
            return Err(fetch_err(
                reference,
                format!("manifest digest {} does not match reference", digest),
            ));
        }
        let manifest: OciManifest = serde_json::from_slice(&bytes)
            .map_err(|e| fetch_err(reference, format!("invalid manifest: {}", e)))?;
        Ok((manifest, digest))
    }

    /// Fetch a blob and verify it against its digest.
    pub async fn fetch_blob(&self, reference: &OciRef, digest: &str) -> Result<Vec<u8>> {
        assert_allowlisted(reference, &self.allowlist)?;
        let url = format!("{}/blobs/{}", self.base_url(reference), digest);
        let response = self
            .http
            .get(&url)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| fetch_err(reference, format!("blob request failed: {}", e)))?;
        if !response.status().is_success() {
            return Err(fetch_err(
                reference,
                format!("blob {} returned {}", digest, response.status()),
            ));
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|e| fetch_err(reference, e.to_string()))?
            .to_vec();
        let actual = format!("sha256:{}", hex::encode(Sha256::digest(&bytes)));
        if actual != digest {
            return Err(fetch_err(
                reference,
                format!("blob digest mismatch: expected {}, got {}", digest, actual),
            ));
        }
        Ok(bytes)
    }

    /// List referrers of a manifest digest: the referrers API first, then
    /// the `.sig` / `.sbom` / `.prov` tag fallbacks.
    pub async fn list_referrers(&self, reference: &OciRef, digest: &str) -> Vec<Descriptor> {
        let scheme = if self.insecure { "http" } else { "https" };
        let url = format!(
            "{}://{}/v2/{}/referrers/{}",
            scheme, reference.host, reference.repository, digest
        );
        if let Ok(response) = self.http.get(&url).timeout(self.timeout).send().await {
            if response.status().is_success() {
                if let Ok(index) = response.json::<ReferrerIndex>().await {
                    if !index.manifests.is_empty() {
                        return index.manifests;
                    }
                }
            }
        }
        self.referrers_from_tags(reference, digest).await
    }

    async fn referrers_from_tags(&self, reference: &OciRef, digest: &str) -> Vec<Descriptor> {
        let hex = digest.strip_prefix("sha256:").unwrap_or(digest);
        let mut referrers = Vec::new();
        for (suffix, artifact_type) in [
            (".sig", SIGNATURE_ARTIFACT_TYPE),
            (".sbom", SBOM_ARTIFACT_TYPE),
            (".prov", PROVENANCE_ARTIFACT_TYPE),
        ] {
            let tag_ref = OciRef {
                host: reference.host.clone(),
                repository: reference.repository.clone(),
                reference: format!("sha256-{}{}", hex, suffix),
            };
            if let Ok((manifest, referrer_digest)) = self.fetch_manifest(&tag_ref).await {
                if let Some(layer) = manifest.layers.first() {
                    referrers.push(Descriptor {
                        media_type: layer.media_type.clone(),
                        digest: referrer_digest,
                        size: layer.size,
                        artifact_type: Some(artifact_type.to_string()),
                        annotations: BTreeMap::new(),
                    });
                }
            }
        }
        referrers
    }

    /// Fetch a referrer's payload (the first layer of its manifest).
    pub async fn fetch_referrer_payload(
        &self,
        reference: &OciRef,
        referrer: &Descriptor,
    ) -> Result<serde_json::Value> {
        let manifest_ref = OciRef {
            host: reference.host.clone(),
            repository: reference.repository.clone(),
            reference: referrer.digest.clone(),
        };
        let (manifest, _) = self.fetch_manifest(&manifest_ref).await?;
        let layer = manifest.layers.first().ok_or_else(|| {
            fetch_err(reference, format!("referrer {} has no layers", referrer.digest))
        })?;
        let bytes = self.fetch_blob(reference, &layer.digest).await?;
        serde_json::from_slice(&bytes)
            .map_err(|e| fetch_err(reference, format!("invalid referrer payload: {}", e)))
    }

    /// Upload a blob (monolithic POST+PUT flow). Returns its digest.
    pub async fn push_blob(&self, reference: &OciRef, bytes: &[u8]) -> Result<String> {
        assert_allowlisted(reference, &self.allowlist)?;
        let digest = format!("sha256:{}", hex::encode(Sha256::digest(bytes)));
        let start = format!("{}/blobs/uploads/", self.base_url(reference));
        let response = self
            .http
            .post(&start)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| fetch_err(reference, format!("upload start failed: {}", e)))?;
        let location = response
            .headers()
            .get("Location")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| fetch_err(reference, "upload start returned no location".into()))?;
        let scheme = if self.insecure { "http" } else { "https" };
        let upload_url = if location.starts_with("http") {
            location
        } else {
            format!("{}://{}{}", scheme, reference.host, location)
        };
        let separator = if upload_url.contains('?') { '&' } else { '?' };
        let response = self
            .http
            .put(format!("{}{}digest={}", upload_url, separator, digest))
            .header("Content-Type", "application/octet-stream")
            .timeout(self.timeout)
            .body(bytes.to_vec())
            .send()
            .await
            .map_err(|e| fetch_err(reference, format!("blob upload failed: {}", e)))?;
        if !response.status().is_success() {
            return Err(fetch_err(
                reference,
                format!("blob upload returned {}", response.status()),
            ));
        }
        Ok(digest)
    }

    /// Upload a manifest under a tag or digest reference.
    pub async fn push_manifest(
        &self,
        reference: &OciRef,
        manifest: &OciManifest,
    ) -> Result<String> {
        assert_allowlisted(reference, &self.allowlist)?;
        let bytes = serde_json::to_vec(manifest).map_err(|e| fetch_err(reference, e.to_string()))?;
        let digest = format!("sha256:{}", hex::encode(Sha256::digest(&bytes)));
        let url = format!(
            "{}/manifests/{}",
            self.base_url(reference),
            reference.reference
        );
        let response = self
            .http
            .put(&url)
            .header("Content-Type", MANIFEST_MEDIA_TYPE)
            .timeout(self.timeout)
            .body(bytes)
            .send()
            .await
            .map_err(|e| fetch_err(reference, format!("manifest upload failed: {}", e)))?;
        if !response.status().is_success() {
            return Err(fetch_err(
                reference,
                format!("manifest upload returned {}", response.status()),
            ));
        }
        Ok(digest)
    }
}

fn fetch_err(reference: &OciRef, reason: String) -> CpmError {
    CpmError::Fetch {
        uri: reference.uri(),
        reason,
    }
}

/// Payload files included in the publish layout, in layer order.
pub const PAYLOAD_FILES: &[&str] = &[
    crate::packet::CPM_YML_FILE,
    crate::packet::MANIFEST_FILE,
    crate::packet::DOCS_FILE,
    crate::packet::VECTORS_FILE,
    crate::packet::INDEX_FILE,
    crate::packet::BM25_FILE,
];

/// Build the OCI manifest for a packet directory: one layer per payload
/// file, annotated with its filename.
pub fn build_packet_manifest(packet_dir: &Path) -> Result<(OciManifest, Vec<(String, Vec<u8>)>)> {
    let mut layers = Vec::new();
    let mut blobs: Vec<(String, Vec<u8>)> = Vec::new();

    let config_bytes = b"{}".to_vec();
    let config_digest = format!("sha256:{}", hex::encode(Sha256::digest(&config_bytes)));
    blobs.push((config_digest.clone(), config_bytes.clone()));

    for file in PAYLOAD_FILES {
        let path = packet_dir.join(file);
        if !path.exists() {
            continue;
        }
        let bytes = std::fs::read(&path).map_err(CpmError::Io)?;
        let digest = format!("sha256:{}", hex::encode(Sha256::digest(&bytes)));
        let mut annotations = BTreeMap::new();
        annotations.insert(FILENAME_ANNOTATION.to_string(), file.to_string());
        layers.push(Descriptor {
            media_type: LAYER_MEDIA_TYPE.to_string(),
            digest: digest.clone(),
            size: bytes.len() as u64,
            artifact_type: None,
            annotations,
        });
        blobs.push((digest, bytes));
    }
    if layers.is_empty() {
        return Err(CpmError::Usage(format!(
            "{} does not contain packet artifacts",
            packet_dir.display()
        )));
    }

    let manifest = OciManifest {
        schema_version: 2,
        media_type: MANIFEST_MEDIA_TYPE.to_string(),
        config: Descriptor {
            media_type: CONFIG_MEDIA_TYPE.to_string(),
            digest: config_digest,
            size: config_bytes.len() as u64,
            artifact_type: None,
            annotations: BTreeMap::new(),
        },
        layers,
        annotations: BTreeMap::new(),
    };
    Ok((manifest, blobs))
}

/// Write the local publish layout: `packet.manifest.json`,
/// `packet.lock.json`, and a `payload/` tree.
pub fn write_publish_layout(packet_dir: &Path, out_dir: &Path) -> Result<String> {
    let (manifest, _) = build_packet_manifest(packet_dir)?;
    std::fs::create_dir_all(out_dir)?;
    let manifest_bytes =
        serde_json::to_vec_pretty(&manifest).map_err(|e| CpmError::Cache(e.to_string()))?;
    let digest = format!("sha256:{}", hex::encode(Sha256::digest(&manifest_bytes)));
    crate::packet::atomic_write(&out_dir.join("packet.manifest.json"), &manifest_bytes)
        .map_err(|e| CpmError::Cache(e.to_string()))?;

    let lock_src = packet_dir.join(crate::packet::LOCK_FILE);
    if lock_src.exists() {
        std::fs::copy(&lock_src, out_dir.join("packet.lock.json"))?;
    }

    let payload_dir = out_dir.join("payload");
    for file in PAYLOAD_FILES {
        let src = packet_dir.join(file);
        if !src.exists() {
            continue;
        }
        let target = safe_output_path(&payload_dir, file)?;
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::copy(&src, &target)?;
    }
    Ok(digest)
}

/// Push a packet to a registry: blobs, manifest, and an optional signature
/// referrer via the `.sig` tag fallback. Returns the manifest digest.
pub async fn publish_packet(
    client: &OciClient,
    reference: &OciRef,
    packet_dir: &Path,
    sign: Option<(&str, &str)>,
) -> Result<String> {
    let (manifest, blobs) = build_packet_manifest(packet_dir)?;
    for (_, bytes) in &blobs {
        client.push_blob(reference, bytes).await?;
    }
    let digest = client.push_manifest(reference, &manifest).await?;

    if let Some((keyid, key)) = sign {
        let envelope = verify::signature_envelope(keyid, key, &digest);
        let payload = serde_json::to_vec(&envelope).map_err(|e| fetch_err(reference, e.to_string()))?;
        let payload_digest = client.push_blob(reference, &payload).await?;
        let config_bytes = b"{}".to_vec();
        let config_digest = client.push_blob(reference, &config_bytes).await?;
        let sig_manifest = OciManifest {
            schema_version: 2,
            media_type: MANIFEST_MEDIA_TYPE.to_string(),
            config: Descriptor {
                media_type: CONFIG_MEDIA_TYPE.to_string(),
                digest: config_digest,
                size: config_bytes.len() as u64,
                artifact_type: None,
                annotations: BTreeMap::new(),
            },
            layers: vec![Descriptor {
                media_type: SIGNATURE_ARTIFACT_TYPE.to_string(),
                digest: payload_digest,
                size: payload.len() as u64,
                artifact_type: Some(SIGNATURE_ARTIFACT_TYPE.to_string()),
                annotations: BTreeMap::new(),
            }],
            annotations: BTreeMap::new(),
        };
        let hex = digest.strip_prefix("sha256:").unwrap_or(&digest);
        let sig_ref = OciRef {
            host: reference.host.clone(),
            repository: reference.repository.clone(),
            reference: format!("sha256-{}.sig", hex),
        };
        client.push_manifest(&sig_ref, &sig_manifest).await?;
    }
    Ok(digest)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_tag_reference() {
        let parsed = OciRef::parse("oci://registry.example/team/pkt@1.2.0").unwrap();
        assert_eq!(parsed.host, "registry.example");
        assert_eq!(parsed.repository, "team/pkt");
        assert_eq!(parsed.reference, "1.2.0");
        assert!(!parsed.is_digest());
    }

    #[test]
    fn test_parse_digest_reference() {
        let digest = format!("sha256:{}", "a".repeat(64));
        let parsed = OciRef::parse(&format!("oci://r.example/p@{}", digest)).unwrap();
        assert!(parsed.is_digest());
        assert_eq!(parsed.reference, digest);
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(OciRef::parse("https://r.example/p@1").is_err());
        assert!(OciRef::parse("oci://r.example/p").is_err());
        assert!(OciRef::parse("oci://nopath@1").is_err());
    }

    #[test]
    fn test_allowlist() {
        let reference = OciRef::parse("oci://registry.corp.example/team/pkt@1.0.0").unwrap();
        assert!(assert_allowlisted(&reference, &[]).is_ok());
        assert!(assert_allowlisted(&reference, &["corp.example".into()]).is_ok());
        assert!(assert_allowlisted(&reference, &["other.example".into()]).is_err());
    }

    #[test]
    fn test_safe_output_path_blocks_traversal() {
        let base = Path::new("/tmp/payload");
        assert!(safe_output_path(base, "docs.jsonl").is_ok());
        assert!(safe_output_path(base, "faiss/index.faiss").is_ok());
        assert!(safe_output_path(base, "../escape").is_err());
        assert!(safe_output_path(base, "/absolute").is_err());
    }

    #[test]
    fn test_publish_layout() {
        let tmp = tempfile::tempdir().unwrap();
        let packet = tmp.path().join("pkt");
        std::fs::create_dir_all(packet.join("faiss")).unwrap();
        std::fs::write(packet.join("cpm.yml"), "cpm_schema: 1\n").unwrap();
        std::fs::write(packet.join("manifest.json"), "{}").unwrap();
        std::fs::write(packet.join("docs.jsonl"), "{}\n").unwrap();
        std::fs::write(packet.join("vectors.f16.bin"), [0u8; 8]).unwrap();
        std::fs::write(packet.join("faiss/index.faiss"), [0u8; 14]).unwrap();

        let out = tmp.path().join("publish");
        let digest = write_publish_layout(&packet, &out).unwrap();
        assert!(digest.starts_with("sha256:"));
        assert!(out.join("packet.manifest.json").exists());
        assert!(out.join("payload/docs.jsonl").exists());
        assert!(out.join("payload/faiss/index.faiss").exists());
    }
}
