//! Workspace layout and the call-site context.
//!
//! A workspace is a directory with the following layout:
//!
//! ```text
//! <workspace>/
//!   packages/<name>/<version>/     # installed / built packets
//!   cache/objects/<2-hex>/<rest>   # content-addressed source cache
//!   cache/embed/<model>/...        # workspace embedding cache
//!   cache/packets/<digest12>/      # transient source materializations
//!   state/locks/<packet>/<ts>.json # lock snapshots (time-travel)
//!   state/replay/query-<ts>.json   # replay logs
//!   policy.yml
//!   config/embeddings.yml
//! ```
//!
//! All components receive a [`Context`] instead of touching globals; the
//! clock is part of the context so deterministic tests can pin it.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};

use crate::config::Config;
use crate::policy::Policy;

/// Path helper over a workspace root.
#[derive(Debug, Clone)]
pub struct Workspace {
    root: PathBuf,
}

impl Workspace {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn packages_dir(&self) -> PathBuf {
        self.root.join("packages")
    }

    pub fn package_dir(&self, name: &str, version: &str) -> PathBuf {
        self.packages_dir().join(name).join(version)
    }

    pub fn objects_dir(&self) -> PathBuf {
        self.root.join("cache").join("objects")
    }

    pub fn embed_cache_dir(&self) -> PathBuf {
        self.root.join("cache").join("embed")
    }

    pub fn materialized_dir(&self, digest: &str) -> PathBuf {
        let hex = digest.strip_prefix("sha256:").unwrap_or(digest);
        let short = &hex[..hex.len().min(12)];
        self.root.join("cache").join("packets").join(short)
    }

    pub fn locks_dir(&self, packet: &str) -> PathBuf {
        self.root.join("state").join("locks").join(packet)
    }

    pub fn replay_dir(&self) -> PathBuf {
        self.root.join("state").join("replay")
    }

    pub fn policy_path(&self) -> PathBuf {
        self.root.join("policy.yml")
    }

    pub fn config_path(&self) -> PathBuf {
        self.root.join("config").join("embeddings.yml")
    }

    /// Find an installed or materialized packet whose manifest digest matches.
    pub fn find_packet_by_digest(&self, digest: &str) -> Option<PathBuf> {
        let mut candidates: Vec<PathBuf> = Vec::new();
        for base in [self.packages_dir(), self.root.join("cache").join("packets")] {
            let Ok(entries) = std::fs::read_dir(&base) else {
                continue;
            };
            for entry in entries.flatten() {
                let path = entry.path();
                if path.join("manifest.json").is_file() {
                    candidates.push(path);
                    continue;
                }
                // packages/<name>/<version>/
                let Ok(versions) = std::fs::read_dir(&path) else {
                    continue;
                };
                for version in versions.flatten() {
                    if version.path().join("manifest.json").is_file() {
                        candidates.push(version.path());
                    }
                }
            }
        }
        candidates.sort();
        for dir in candidates {
            if let Ok(bytes) = std::fs::read(dir.join("manifest.json")) {
                let found = format!("sha256:{}", crate::models::sha256_hex(&bytes));
                if found == digest {
                    return Some(dir);
                }
            }
        }
        None
    }
}

/// Clock abstraction so replay and snapshot tests can pin time.
#[derive(Debug, Clone)]
pub enum Clock {
    System,
    Fixed(DateTime<Utc>),
}

impl Clock {
    pub fn now(&self) -> DateTime<Utc> {
        match self {
            Self::System => Utc::now(),
            Self::Fixed(at) => *at,
        }
    }

    /// UTC ISO-8601 with a trailing `Z`, seconds precision.
    pub fn now_iso(&self) -> String {
        self.now().format("%Y-%m-%dT%H:%M:%SZ").to_string()
    }

    /// Filesystem-safe stamp for snapshot and replay file names.
    pub fn now_stamp(&self) -> String {
        self.now().format("%Y%m%dT%H%M%S%.3fZ").to_string()
    }
}

/// Everything a pipeline stage needs, passed explicitly through call sites.
#[derive(Clone)]
pub struct Context {
    pub workspace: Workspace,
    pub config: Config,
    pub policy: Policy,
    pub http: reqwest::Client,
    pub clock: Clock,
}

impl Context {
    pub fn new(workspace: Workspace, config: Config, policy: Policy) -> Self {
        Self {
            workspace,
            config,
            policy,
            http: reqwest::Client::new(),
            clock: Clock::System,
        }
    }

    /// Load config and policy from the workspace layout.
    pub fn load(root: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let workspace = Workspace::new(root);
        let config = crate::config::load_config(&workspace.config_path())?;
        let policy = crate::policy::load_policy(&workspace.policy_path())?;
        Ok(Self::new(workspace, config, policy))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_paths() {
        let ws = Workspace::new("/tmp/ws");
        assert_eq!(
            ws.package_dir("pkt", "1.0.0"),
            PathBuf::from("/tmp/ws/packages/pkt/1.0.0")
        );
        assert_eq!(ws.objects_dir(), PathBuf::from("/tmp/ws/cache/objects"));
        assert_eq!(
            ws.locks_dir("pkt"),
            PathBuf::from("/tmp/ws/state/locks/pkt")
        );
        assert_eq!(ws.policy_path(), PathBuf::from("/tmp/ws/policy.yml"));
    }

    #[test]
    fn test_fixed_clock_stamp() {
        let at = DateTime::parse_from_rfc3339("2026-03-01T12:30:45.250Z")
            .unwrap()
            .with_timezone(&Utc);
        let clock = Clock::Fixed(at);
        assert_eq!(clock.now_iso(), "2026-03-01T12:30:45Z");
        assert_eq!(clock.now_stamp(), "20260301T123045.250Z");
    }

    #[test]
    fn test_materialized_dir_shortens_digest() {
        let ws = Workspace::new("/tmp/ws");
        let dir = ws.materialized_dir("sha256:abcdef0123456789ffff");
        assert!(dir.ends_with("cache/packets/abcdef012345"));
    }
}
