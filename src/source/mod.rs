//! Pluggable packet sources.
//!
//! A source turns a URI into a [`PacketReference`] and materializes it as a
//! [`LocalPacket`]:
//!
//! | Source | URIs | Digest |
//! |--------|------|--------|
//! | [`DirSource`] | `dir://path` or a plain path | sha256 of `manifest.json` |
//! | [`OciSource`] | `oci://host/repo/name@version` / `@sha256:…` | OCI manifest digest |
//! | [`HubSource`] | `http(s)://hub/...` | delegated to `/v1/resolve` |
//!
//! Remote fetches go through the content-addressed cache; trust verification
//! happens at resolve time, before any payload bytes are cached, so a strict
//! policy deny leaves the CAS untouched.

mod dir;
mod hub;
mod oci;

pub use dir::DirSource;
pub use hub::HubSource;
pub use oci::OciSource;

use async_trait::async_trait;

use crate::cas::SourceCache;
use crate::error::{CpmError, Result};
use crate::models::{LocalPacket, PacketReference, UpdateInfo};
use crate::workspace::Context;

/// A packet source. Implementations must be cheap to construct; fetches are
/// cached by digest.
#[async_trait]
pub trait Source: Send + Sync {
    /// Source name (`dir`, `oci`, `hub`), used in logs and the registry.
    fn name(&self) -> &str;

    /// True when this source understands the URI.
    fn can_handle(&self, uri: &str) -> bool;

    /// Resolve the URI to a digest-pinned reference. For remote sources this
    /// includes trust verification of the referenced manifest.
    async fn resolve(&self, uri: &str) -> Result<PacketReference>;

    /// Materialize the referenced packet locally, using the cache.
    async fn fetch(&self, reference: &PacketReference, cache: &SourceCache)
        -> Result<LocalPacket>;

    /// Compare the reference against the latest upstream state.
    async fn check_updates(&self, reference: &PacketReference) -> Result<UpdateInfo>;
}

/// Ordered collection of sources; the first one that can handle a URI wins.
pub struct SourceResolver {
    sources: Vec<Box<dyn Source>>,
}

impl SourceResolver {
    pub fn new(sources: Vec<Box<dyn Source>>) -> Self {
        Self { sources }
    }

    /// Build the resolver with all built-in sources for this context.
    pub fn from_context(ctx: &Context) -> Self {
        let mut sources: Vec<Box<dyn Source>> = Vec::new();
        sources.push(Box::new(OciSource::from_context(ctx)));
        if let Some(hub) = &ctx.config.hub {
            sources.push(Box::new(HubSource::new(
                hub.clone(),
                ctx.http.clone(),
                OciSource::from_context(ctx),
                ctx.workspace.clone(),
            )));
        }
        sources.push(Box::new(DirSource));
        Self::new(sources)
    }

    fn source_for(&self, uri: &str) -> Result<&dyn Source> {
        self.sources
            .iter()
            .find(|source| source.can_handle(uri))
            .map(|source| source.as_ref())
            .ok_or_else(|| CpmError::SourceResolve {
                uri: uri.to_string(),
                reason: "no source can handle this URI".to_string(),
            })
    }

    pub async fn resolve(&self, uri: &str) -> Result<PacketReference> {
        self.source_for(uri)?.resolve(uri).await
    }

    pub async fn fetch(
        &self,
        reference: &PacketReference,
        cache: &SourceCache,
    ) -> Result<LocalPacket> {
        self.source_for(&reference.uri)?.fetch(reference, cache).await
    }

    pub async fn resolve_and_fetch(
        &self,
        uri: &str,
        cache: &SourceCache,
    ) -> Result<(PacketReference, LocalPacket)> {
        let source = self.source_for(uri)?;
        let reference = source.resolve(uri).await?;
        let packet = source.fetch(&reference, cache).await?;
        Ok((reference, packet))
    }

    pub async fn check_updates(&self, reference: &PacketReference) -> Result<UpdateInfo> {
        self.source_for(&reference.uri)?
            .check_updates(reference)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolver_routes_by_scheme() {
        let resolver = SourceResolver::new(vec![Box::new(DirSource)]);
        assert!(resolver.source_for("dir://some/path").is_ok());
        assert!(resolver.source_for("oci://r.example/p@1").is_err());
    }
}
