//! Feature registry: `(kind, qualified name)` → registration.
//!
//! Builders, retrievers, and sources register under `group:name` keys.
//! A collision is a typed error that disables only the offending
//! registration; everything already registered keeps working. Compile-time
//! adapters (the built-ins) and manifest-discovered plugins go through the
//! same table.

use std::collections::BTreeMap;

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum FeatureKind {
    Builder,
    Retriever,
    Source,
    Command,
}

impl FeatureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Builder => "builder",
            Self::Retriever => "retriever",
            Self::Source => "source",
            Self::Command => "command",
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("{kind} '{name}' is already registered by {existing_origin}")]
    Collision {
        kind: &'static str,
        name: String,
        existing_origin: String,
    },
    #[error("invalid feature name '{0}': expected group:name")]
    InvalidName(String),
}

/// One registration: where it came from and what it provides.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeatureEntry {
    pub kind: FeatureKind,
    /// Qualified `group:name` key (e.g. `cpm:default-builder`).
    pub name: String,
    /// `builtin` or a plugin manifest path.
    pub origin: String,
}

/// Registration table keyed by `(kind, qualified name)`.
#[derive(Debug, Default)]
pub struct FeatureRegistry {
    entries: BTreeMap<(FeatureKind, String), FeatureEntry>,
}

impl FeatureRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry pre-loaded with the built-in features.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        for (kind, name) in [
            (FeatureKind::Builder, "cpm:default-builder"),
            (FeatureKind::Retriever, "cpm:native-retriever"),
            (FeatureKind::Source, "cpm:dir"),
            (FeatureKind::Source, "cpm:oci"),
            (FeatureKind::Source, "cpm:hub"),
        ] {
            registry
                .register(kind, name, "builtin")
                .expect("builtins are collision-free");
        }
        registry
    }

    /// Register a feature. Collisions leave the existing entry untouched
    /// and return the error so the caller can log and continue.
    pub fn register(
        &mut self,
        kind: FeatureKind,
        name: &str,
        origin: &str,
    ) -> Result<(), RegistryError> {
        if !name.contains(':') || name.starts_with(':') || name.ends_with(':') {
            return Err(RegistryError::InvalidName(name.to_string()));
        }
        let key = (kind, name.to_string());
        if let Some(existing) = self.entries.get(&key) {
            return Err(RegistryError::Collision {
                kind: kind.as_str(),
                name: name.to_string(),
                existing_origin: existing.origin.clone(),
            });
        }
        self.entries.insert(
            key,
            FeatureEntry {
                kind,
                name: name.to_string(),
                origin: origin.to_string(),
            },
        );
        Ok(())
    }

    pub fn find(&self, kind: FeatureKind, name: &str) -> Option<&FeatureEntry> {
        self.entries.get(&(kind, name.to_string()))
    }

    /// All entries of one kind, sorted by name.
    pub fn by_kind(&self, kind: FeatureKind) -> Vec<&FeatureEntry> {
        self.entries
            .iter()
            .filter(|((entry_kind, _), _)| *entry_kind == kind)
            .map(|(_, entry)| entry)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
