//! # cpm — context packet manager
//!
//! **A context supply-chain engine for retrieval-augmented generation.**
//!
//! cpm turns source trees into immutable, digest-identified **context
//! packets** (chunked documents, dense vectors, similarity indexes, and a
//! signed manifest), then resolves, verifies, and queries those packets
//! locally or from remote registries under an explicit trust/policy regime.
//!
//! ## Architecture
//!
//! ```text
//! Source tree ─► Chunker router ─► Chunks (id, text, hash, meta)
//!                                       │
//!              Embed cache (hash→vec) ◄─┤
//!                                       ▼
//!                                Embedder client (HTTP)
//!                                       │
//!                                       ▼
//!                 Packet {docs, vectors, index, manifest, lock}
//!                                       │
//!                                       ├──► Publish (OCI + referrers)
//!                                       │
//! Query ─► Source resolver ─► CAS ─► Verifier ─► Policy ─► Retriever
//!                                                             │
//!                                                  dense | bm25 | hybrid
//!                                                             │
//!                                                         Reranker
//!                                                             │
//!                                                     Context compiler
//!                                                             │
//!                                              Result + replay log + citations
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | Workspace configuration (`config/embeddings.yml`) |
//! | [`workspace`] | Workspace layout and the per-call [`workspace::Context`] |
//! | [`error`] | Typed error kinds and exit codes |
//! | [`models`] | `Chunk`, `PacketManifest`, `TrustReport`, references |
//! | [`tokenizer`] | The one tokenizer shared by chunking, BM25, and budgets |
//! | [`chunker`] | Extension-routed chunking strategies with fallback |
//! | [`build`] | Build pipeline with incremental embedding cache |
//! | [`embedder`] | HTTP embedding client (and the deterministic stub) |
//! | [`embed_cache`] | Cross-packet workspace vector cache |
//! | [`packet`] | Artifact I/O: docs.jsonl, f16 vectors, indexes, manifest |
//! | [`lockfile`] | Lockfiles, verification, and time-travel snapshots |
//! | [`cas`] | Digest-keyed object cache with LRU eviction |
//! | [`source`] | `dir://`, `oci://`, and hub sources |
//! | [`oci`] | OCI client, publish layout, trust verification |
//! | [`policy`] | Local + remote policy engine |
//! | [`query`] | Query lifecycle: retrieve, rerank, compile |
//! | [`replay`] | Deterministic replay logs |
//! | [`diff`] | Packet diff and drift scoring |
//! | [`install`] | Package store: install/uninstall/list/update |
//! | [`benchmark`] | Retrieval KPI gate |
//! | [`registry`] | `(kind, group:name)` feature registry |

pub mod benchmark;
pub mod build;
pub mod cas;
pub mod chunker;
pub mod config;
pub mod diff;
pub mod embed_cache;
pub mod embedder;
pub mod error;
pub mod install;
pub mod lockfile;
pub mod models;
pub mod oci;
pub mod packet;
pub mod policy;
pub mod query;
pub mod registry;
pub mod replay;
pub mod source;
pub mod tokenizer;
pub mod workspace;
