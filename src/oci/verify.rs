//! Trust verification: signature, SBOM, and provenance referrers.
//!
//! Verification runs against the packet's manifest digest before any payload
//! bytes enter the CAS:
//!
//! 1. **Signature** — a detached envelope whose `payload.digest` must match
//!    the manifest digest and whose signature must verify under a configured
//!    issuer key.
//! 2. **SBOM** — CycloneDX or SPDX; the manifest digest must appear among
//!    the artifact hashes it records.
//! 3. **Provenance** — an in-toto statement whose subject digest matches;
//!    the SLSA level is extracted from the predicate.
//!
//! The trust score is the weighted sum of the three boolean outcomes,
//! normalized by the total weight so tuned weights still land in [0, 1].

use std::collections::BTreeMap;

use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::models::{TrustCheck, TrustReport};
use crate::policy::TrustWeights;

/// Referrer payloads gathered for a packet, any subset may be present.
#[derive(Debug, Default, Clone)]
pub struct VerifyMaterial {
    pub signature: Option<Value>,
    pub sbom: Option<Value>,
    pub provenance: Option<Value>,
}

/// Compute the detached signature for a manifest digest under an issuer key.
/// The publisher calls this; the verifier recomputes and compares.
pub fn sign_digest(key: &str, manifest_digest: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    hasher.update([0]);
    hasher.update(manifest_digest.as_bytes());
    hex::encode(hasher.finalize())
}

/// Build a signature envelope for publishing.
pub fn signature_envelope(keyid: &str, key: &str, manifest_digest: &str) -> Value {
    serde_json::json!({
        "payloadType": super::MANIFEST_MEDIA_TYPE,
        "payload": { "digest": manifest_digest },
        "signatures": [
            { "keyid": keyid, "sig": sign_digest(key, manifest_digest) }
        ],
    })
}

/// Run all verification steps and aggregate a [`TrustReport`].
pub fn verify(
    material: &VerifyMaterial,
    manifest_digest: &str,
    issuers: &BTreeMap<String, String>,
    weights: &TrustWeights,
) -> TrustReport {
    let mut reasons = Vec::new();

    let signature = match &material.signature {
        None => {
            reasons.push("signature missing".to_string());
            TrustCheck::default()
        }
        Some(envelope) => {
            let check = verify_signature(envelope, manifest_digest, issuers);
            if !check.valid {
                reasons.push("signature invalid".to_string());
            }
            check
        }
    };

    let sbom = match &material.sbom {
        None => {
            reasons.push("sbom missing".to_string());
            TrustCheck::default()
        }
        Some(doc) => {
            let check = verify_sbom(doc, manifest_digest);
            if !check.valid {
                reasons.push("sbom invalid".to_string());
            }
            check
        }
    };

    let provenance = match &material.provenance {
        None => {
            reasons.push("provenance missing".to_string());
            TrustCheck::default()
        }
        Some(statement) => {
            let check = verify_provenance(statement, manifest_digest);
            if !check.valid {
                reasons.push("provenance invalid".to_string());
            }
            check
        }
    };

    let total = weights.signature + weights.sbom + weights.provenance;
    let score = if total <= f64::EPSILON {
        0.0
    } else {
        (weights.signature * f64::from(u8::from(signature.valid))
            + weights.sbom * f64::from(u8::from(sbom.valid))
            + weights.provenance * f64::from(u8::from(provenance.valid)))
            / total
    };

    TrustReport {
        signature,
        sbom,
        provenance,
        score,
        reasons,
    }
}

fn verify_signature(
    envelope: &Value,
    manifest_digest: &str,
    issuers: &BTreeMap<String, String>,
) -> TrustCheck {
    let payload_digest = envelope
        .pointer("/payload/digest")
        .and_then(Value::as_str)
        .unwrap_or_default();
    if payload_digest != manifest_digest {
        return TrustCheck {
            present: true,
            valid: false,
            detail: None,
        };
    }
    let Some(signatures) = envelope.get("signatures").and_then(Value::as_array) else {
        return TrustCheck {
            present: true,
            valid: false,
            detail: None,
        };
    };
    for entry in signatures {
        let keyid = entry.get("keyid").and_then(Value::as_str).unwrap_or_default();
        let sig = entry.get("sig").and_then(Value::as_str).unwrap_or_default();
        if let Some(key) = issuers.get(keyid) {
            if sign_digest(key, manifest_digest) == sig {
                return TrustCheck {
                    present: true,
                    valid: true,
                    detail: Some(keyid.to_string()),
                };
            }
        }
    }
    TrustCheck {
        present: true,
        valid: false,
        detail: None,
    }
}

fn verify_sbom(doc: &Value, manifest_digest: &str) -> TrustCheck {
    let format = if doc.get("bomFormat").and_then(Value::as_str) == Some("CycloneDX") {
        Some("cyclonedx")
    } else if doc.get("spdxVersion").and_then(Value::as_str).is_some() {
        Some("spdx")
    } else {
        None
    };
    let Some(format) = format else {
        return TrustCheck {
            present: true,
            valid: false,
            detail: None,
        };
    };
    let hex = manifest_digest
        .strip_prefix("sha256:")
        .unwrap_or(manifest_digest);
    let valid = json_contains_string(doc, hex);
    TrustCheck {
        present: true,
        valid,
        detail: Some(format.to_string()),
    }
}

fn verify_provenance(statement: &Value, manifest_digest: &str) -> TrustCheck {
    let is_in_toto = statement
        .get("_type")
        .and_then(Value::as_str)
        .is_some_and(|t| t.contains("in-toto.io"));
    let hex = manifest_digest
        .strip_prefix("sha256:")
        .unwrap_or(manifest_digest);
    let subject_matches = statement
        .get("subject")
        .and_then(Value::as_array)
        .is_some_and(|subjects| {
            subjects.iter().any(|s| {
                s.pointer("/digest/sha256").and_then(Value::as_str) == Some(hex)
            })
        });
    let slsa_level = statement
        .pointer("/predicate/slsa_level")
        .and_then(Value::as_u64)
        .or_else(|| {
            statement
                .pointer("/predicate/buildLevel")
                .and_then(Value::as_u64)
        });
    TrustCheck {
        present: true,
        valid: is_in_toto && subject_matches,
        detail: slsa_level.map(|level| format!("slsa-{}", level)),
    }
}

fn json_contains_string(value: &Value, needle: &str) -> bool {
    match value {
        Value::String(s) => s == needle,
        Value::Array(items) => items.iter().any(|v| json_contains_string(v, needle)),
        Value::Object(map) => map.values().any(|v| json_contains_string(v, needle)),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn digest() -> String {
        format!("sha256:{}", "ab".repeat(32))
    }

    fn issuers() -> BTreeMap<String, String> {
        let mut map = BTreeMap::new();
        map.insert("release-key".to_string(), "secret".to_string());
        map
    }

    fn sbom_doc(digest_hex: &str) -> Value {
        serde_json::json!({
            "bomFormat": "CycloneDX",
            "specVersion": "1.5",
            "components": [
                { "name": "pkt", "hashes": [{ "alg": "SHA-256", "content": digest_hex }] }
            ],
        })
    }

    fn provenance_doc(digest_hex: &str) -> Value {
        serde_json::json!({
            "_type": "https://in-toto.io/Statement/v0.1",
            "predicateType": "https://slsa.dev/provenance/v1",
            "subject": [{ "name": "pkt", "digest": { "sha256": digest_hex } }],
            "predicate": { "slsa_level": 2 },
        })
    }

    #[test]
    fn test_full_material_scores_one() {
        let digest = digest();
        let hex = digest.strip_prefix("sha256:").unwrap();
        let material = VerifyMaterial {
            signature: Some(signature_envelope("release-key", "secret", &digest)),
            sbom: Some(sbom_doc(hex)),
            provenance: Some(provenance_doc(hex)),
        };
        let report = verify(&material, &digest, &issuers(), &TrustWeights::default());
        assert!(report.signature.valid);
        assert!(report.sbom.valid);
        assert!(report.provenance.valid);
        assert!((report.score - 1.0).abs() < 1e-9);
        assert!(report.reasons.is_empty());
        assert_eq!(report.provenance.detail.as_deref(), Some("slsa-2"));
    }

    #[test]
    fn test_missing_signature_halves_score() {
        let digest = digest();
        let hex = digest.strip_prefix("sha256:").unwrap();
        let material = VerifyMaterial {
            signature: None,
            sbom: Some(sbom_doc(hex)),
            provenance: Some(provenance_doc(hex)),
        };
        let report = verify(&material, &digest, &issuers(), &TrustWeights::default());
        assert!(!report.signature.present);
        assert!((report.score - 0.5).abs() < 1e-9);
        assert!(report.reasons.contains(&"signature missing".to_string()));
    }

    #[test]
    fn test_wrong_key_invalid() {
        let digest = digest();
        let envelope = signature_envelope("release-key", "wrong-secret", &digest);
        let material = VerifyMaterial {
            signature: Some(envelope),
            ..VerifyMaterial::default()
        };
        let report = verify(&material, &digest, &issuers(), &TrustWeights::default());
        assert!(report.signature.present);
        assert!(!report.signature.valid);
    }

    #[test]
    fn test_signature_over_other_digest_invalid() {
        let digest = digest();
        let other = format!("sha256:{}", "cd".repeat(32));
        let envelope = signature_envelope("release-key", "secret", &other);
        let material = VerifyMaterial {
            signature: Some(envelope),
            ..VerifyMaterial::default()
        };
        let report = verify(&material, &digest, &issuers(), &TrustWeights::default());
        assert!(!report.signature.valid);
    }

    #[test]
    fn test_sbom_without_digest_invalid() {
        let digest = digest();
        let material = VerifyMaterial {
            sbom: Some(sbom_doc(&"ff".repeat(32))),
            ..VerifyMaterial::default()
        };
        let report = verify(&material, &digest, &issuers(), &TrustWeights::default());
        assert!(report.sbom.present);
        assert!(!report.sbom.valid);
    }

    #[test]
    fn test_tuned_weights_normalize() {
        let digest = digest();
        let material = VerifyMaterial {
            signature: Some(signature_envelope("release-key", "secret", &digest)),
            ..VerifyMaterial::default()
        };
        let weights = TrustWeights {
            signature: 2.0,
            sbom: 1.0,
            provenance: 1.0,
        };
        let report = verify(&material, &digest, &issuers(), &weights);
        assert!((report.score - 0.5).abs() < 1e-9);
    }
}
