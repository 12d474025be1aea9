//! Build pipeline orchestration.
//!
//! Turns a source tree into a packet:
//!
//! 1. **Scan** — walk the source recursively, keep supported extensions,
//!    hash every file (the lock's input key).
//! 2. **Chunk** — route each file through the chunker (CPU-parallel over
//!    files). A file that cannot be read is logged and skipped; the build
//!    continues.
//! 3. **Cache load** — a prior `manifest.json` + `docs.jsonl` +
//!    `vectors.f16.bin` in the destination with a matching model and
//!    max_seq_length becomes a `content_hash → vector` map. The optional
//!    workspace embed cache is consulted next.
//! 4. **Partition** — chunks split into `reused` (hash cached) and
//!    `to_embed`; cached hashes absent from the new set are `removed`.
//! 5. **Embed** — batches of at most `batch_size` texts through a bounded
//!    worker pool. Embedder failure after retries aborts the build before
//!    any artifact rename.
//! 6. **Assemble** — the full vector matrix in chunk order, dimension
//!    checked. A dimension change disables the cache and re-embeds
//!    everything.
//! 7. **Index** — flat inner-product index; BM25 alongside it when hybrid
//!    retrieval is configured.
//! 8. **Write** — all artifacts atomically, then the lockfile and an
//!    optional lock snapshot, then an optional archive.
//!
//! At most one builder runs per destination (`.build.lock` advisory lock);
//! concurrent packet reads need no lock.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use futures::{stream, StreamExt, TryStreamExt};
use rayon::prelude::*;
use tracing::{debug, info, warn};

use crate::chunker::{self, SUPPORTED_EXTS};
use crate::embed_cache::EmbedCache;
use crate::embedder::Embedder;
use crate::error::{CpmError, Result};
use crate::lockfile::{list_snapshots, Lockfile, PipelineLock, LOCK_SCHEMA_VERSION};
use crate::models::{
    Chunk, EmbeddingSpec, IncrementalStats, PacketCounts, PacketManifest, PacketMeta, SourceInfo,
};
use crate::packet::{
    self, bm25::Bm25Index, dense::FlatIpIndex, vectors, BM25_FILE, CPM_YML_FILE, DOCS_FILE,
    INDEX_FILE, LOCK_FILE, MANIFEST_FILE, VECTORS_FILE,
};
use crate::workspace::Context;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    TarGz,
    Zip,
}

impl std::str::FromStr for ArchiveFormat {
    type Err = CpmError;

    fn from_str(value: &str) -> Result<Self> {
        match value {
            "tar.gz" => Ok(Self::TarGz),
            "zip" => Ok(Self::Zip),
            other => Err(CpmError::Usage(format!(
                "unsupported archive format: '{}' (tar.gz or zip)",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BuildOptions {
    pub source: PathBuf,
    pub dest: PathBuf,
    pub name: String,
    pub version: String,
    pub description: String,
    pub archive: Option<ArchiveFormat>,
    /// Write a lock snapshot for time-travel.
    pub snapshot: bool,
}

#[derive(Debug, Clone)]
pub struct BuildReport {
    pub files_indexed: usize,
    pub total_chunks: usize,
    pub reused: usize,
    pub embedded: usize,
    pub removed: usize,
    pub dim: usize,
    pub manifest_digest: String,
    pub snapshot: Option<String>,
    pub archive_path: Option<PathBuf>,
}

struct ScannedFile {
    rel_path: String,
    ext: String,
    text: String,
    sha256: String,
}

/// Build a packet from a source tree. See the module docs for the pipeline.
pub async fn build_packet(
    ctx: &Context,
    embedder: &dyn Embedder,
    opts: &BuildOptions,
) -> Result<BuildReport> {
    if !opts.source.is_dir() {
        return Err(CpmError::Usage(format!(
            "source '{}' is not a directory",
            opts.source.display()
        )));
    }
    fs::create_dir_all(&opts.dest)?;
    let _build_lock = acquire_build_lock(&opts.dest)?;

    // Scan + chunk.
    let files = scan_source(&opts.source)?;
    let files_indexed = files.len();
    let mut ext_counts: BTreeMap<String, usize> = BTreeMap::new();
    for file in &files {
        *ext_counts.entry(file.ext.clone()).or_insert(0) += 1;
    }
    let mut inputs: BTreeMap<String, String> = BTreeMap::new();
    for file in &files {
        inputs.insert(file.rel_path.clone(), file.sha256.clone());
    }

    let chunking = ctx.config.chunking.clone();
    let chunks: Vec<Chunk> = files
        .par_iter()
        .map(|file| chunker::chunk_file(&file.text, &file.rel_path, &file.ext, &chunking))
        .collect::<Vec<_>>()
        .into_iter()
        .flatten()
        .collect();
    info!(files = files_indexed, chunks = chunks.len(), "scan complete");
    if chunks.is_empty() {
        return Err(CpmError::Usage(format!(
            "no chunks found under '{}'",
            opts.source.display()
        )));
    }

    // Per-packet incremental cache.
    let model = embedder.model().to_string();
    let cache_pack = load_existing_cache(
        &opts.dest,
        &model,
        ctx.config.embedding.max_seq_length,
    );
    let (mut cache_vecs, mut cache_dim) = match cache_pack {
        Some((vecs, dim)) => {
            info!(cached_vectors = vecs.len(), dim, "incremental cache enabled");
            (vecs, Some(dim))
        }
        None => {
            debug!("incremental cache disabled (no compatible previous build)");
            (HashMap::new(), None)
        }
    };
    let cache_enabled = cache_dim.is_some();

    // Workspace embed cache, second level.
    let embed_cache = ctx.config.cache.workspace_embed_cache.then(|| {
        EmbedCache::new(
            ctx.workspace.embed_cache_dir(),
            model.clone(),
            ctx.config.cache.embed_quota_bytes,
        )
    });
    if let Some(cache) = &embed_cache {
        for chunk in &chunks {
            if cache_vecs.contains_key(&chunk.hash) {
                continue;
            }
            if let Some(vector) = cache.get(&cache.key(&chunk.text)) {
                if cache_dim.is_none() || cache_dim == Some(vector.len()) {
                    cache_dim.get_or_insert(vector.len());
                    cache_vecs.insert(chunk.hash.clone(), vector);
                }
            }
        }
    }

    // Partition.
    let new_hashes: Vec<String> = chunks.iter().map(|c| c.hash.clone()).collect();
    let new_set: HashSet<&String> = new_hashes.iter().collect();
    let removed = cache_vecs
        .keys()
        .filter(|hash| !new_set.contains(hash))
        .count();
    let mut reused = new_hashes
        .iter()
        .filter(|hash| cache_vecs.contains_key(*hash))
        .count();
    let mut to_embed: Vec<usize> = new_hashes
        .iter()
        .enumerate()
        .filter(|(_, hash)| !cache_vecs.contains_key(*hash))
        .map(|(idx, _)| idx)
        .collect();
    info!(
        new_chunks = chunks.len(),
        reused,
        to_embed = to_embed.len(),
        removed,
        "incremental partition"
    );

    if !embedder.health().await {
        return Err(CpmError::Embedder(
            "embedding server is not reachable".to_string(),
        ));
    }

    let mut embedded_vectors = embed_rows(ctx, embedder, &chunks, &to_embed).await?;
    let mut dim = embedded_vectors
        .first()
        .map(|v| v.len())
        .or(cache_dim)
        .ok_or_else(|| CpmError::Embedder("embedder returned no vectors".to_string()))?;

    // A dimension change invalidates the cache entirely.
    if let Some(cached) = cache_dim {
        if !embedded_vectors.is_empty() && cached != dim {
            warn!(cache_dim = cached, new_dim = dim, "dimension mismatch, cache disabled");
            cache_vecs.clear();
            reused = 0;
            to_embed = (0..chunks.len()).collect();
            embedded_vectors = embed_rows(ctx, embedder, &chunks, &to_embed).await?;
            dim = embedded_vectors
                .first()
                .map(|v| v.len())
                .ok_or_else(|| CpmError::Embedder("embedder returned no vectors".to_string()))?;
        }
    }

    // Assemble the matrix in chunk order: cached rows by hash, new rows by
    // embedder response order.
    let mut matrix: Vec<Vec<f32>> = vec![Vec::new(); chunks.len()];
    for (idx, hash) in new_hashes.iter().enumerate() {
        if let Some(vector) = cache_vecs.get(hash) {
            matrix[idx] = vector.clone();
        }
    }
    for (position, &chunk_idx) in to_embed.iter().enumerate() {
        matrix[chunk_idx] = embedded_vectors[position].clone();
    }
    for (idx, row) in matrix.iter().enumerate() {
        if row.len() != dim {
            return Err(CpmError::Embedder(format!(
                "vector row {} has width {}, expected {}",
                idx,
                row.len(),
                dim
            )));
        }
    }
    // Quantize through f16 before indexing so the dense index and
    // vectors.f16.bin are built from identical values; otherwise a rebuild
    // that reuses cached (f16) rows would produce different index bytes.
    for row in matrix.iter_mut() {
        for value in row.iter_mut() {
            *value = half::f16::from_f32(*value).to_f32();
        }
    }

    // Persist newly embedded vectors into the workspace cache.
    if let Some(cache) = &embed_cache {
        for &chunk_idx in &to_embed {
            let chunk = &chunks[chunk_idx];
            if let Err(err) = cache.put(&cache.key(&chunk.text), &matrix[chunk_idx]) {
                debug!(%err, "workspace embed cache write failed");
            }
        }
        if let Err(err) = cache.evict_to_quota() {
            debug!(%err, "workspace embed cache eviction failed");
        }
    }

    // Indexes.
    let mut index = FlatIpIndex::new(dim);
    index.add(&matrix)?;
    let build_sparse = matches!(ctx.config.retrieval.indexer.as_str(), "hybrid-rrf" | "bm25");
    let sparse = build_sparse.then(|| Bm25Index::build(chunks.iter().map(|c| c.text.as_str())));

    // Decide created_at before writing: a rebuild whose content artifacts
    // are unchanged keeps the original timestamp so those artifacts stay
    // byte-identical.
    let prior_manifest = packet::load_manifest(&opts.dest.join(MANIFEST_FILE)).ok();
    write_artifacts(WriteArtifacts {
        ctx,
        opts,
        chunks: &chunks,
        matrix: &matrix,
        index: &index,
        sparse: sparse.as_ref(),
        dim,
        model: &model,
        ext_counts,
        inputs,
        incremental: IncrementalStats {
            enabled: cache_enabled,
            reused,
            embedded: to_embed.len(),
            removed,
        },
        prior_manifest,
    })
    .await
    .map(|(manifest_digest, snapshot, archive_path)| BuildReport {
        files_indexed,
        total_chunks: chunks.len(),
        reused,
        embedded: to_embed.len(),
        removed,
        dim,
        manifest_digest,
        snapshot,
        archive_path,
    })
}

fn acquire_build_lock(dest: &Path) -> Result<fs::File> {
    let path = dest.join(".build.lock");
    let file = fs::File::create(&path)?;
    file.try_lock_exclusive().map_err(|_| {
        CpmError::Cache(format!(
            "another build is already running against {}",
            dest.display()
        ))
    })?;
    Ok(file)
}

fn scan_source(source: &Path) -> Result<Vec<ScannedFile>> {
    let supported: HashSet<&str> = SUPPORTED_EXTS.iter().copied().collect();
    let mut files = Vec::new();
    for entry in walkdir::WalkDir::new(source)
        .sort_by_file_name()
        .into_iter()
        .flatten()
    {
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        let ext = path
            .extension()
            .map(|e| format!(".{}", e.to_string_lossy().to_lowercase()))
            .unwrap_or_default();
        if !supported.contains(ext.as_str()) {
            continue;
        }
        let rel_path = path
            .strip_prefix(source)
            .unwrap_or(path)
            .to_string_lossy()
            .replace('\\', "/");
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(path = %path.display(), %err, "skipping unreadable file");
                continue;
            }
        };
        let text = String::from_utf8_lossy(&bytes).into_owned();
        if text.trim().is_empty() {
            continue;
        }
        files.push(ScannedFile {
            rel_path,
            ext,
            sha256: crate::models::sha256_hex(&bytes),
            text,
        });
    }
    Ok(files)
}

/// Read a previous build in the destination as a `content_hash → vector`
/// map, if its model and max_seq_length match the current configuration.
fn load_existing_cache(
    dest: &Path,
    model: &str,
    max_seq_length: usize,
) -> Option<(HashMap<String, Vec<f32>>, usize)> {
    let manifest = packet::load_manifest(&dest.join(MANIFEST_FILE)).ok()?;
    if manifest.embedding.model != model {
        return None;
    }
    if manifest
        .embedding
        .max_seq_length
        .is_some_and(|m| m != max_seq_length)
    {
        return None;
    }
    let dim = manifest.embedding.dim;
    let chunks = packet::read_docs_jsonl(&dest.join(DOCS_FILE)).ok()?;
    let rows = vectors::read_vectors_f16(&dest.join(VECTORS_FILE), dim).ok()?;
    if rows.len() != chunks.len() || chunks.is_empty() {
        return None;
    }
    let mut cache = HashMap::with_capacity(chunks.len());
    for (chunk, row) in chunks.into_iter().zip(rows) {
        cache.entry(chunk.hash).or_insert(row);
    }
    Some((cache, dim))
}

/// Embed the selected chunk rows in batches through a bounded worker pool,
/// preserving order.
async fn embed_rows(
    ctx: &Context,
    embedder: &dyn Embedder,
    chunks: &[Chunk],
    to_embed: &[usize],
) -> Result<Vec<Vec<f32>>> {
    if to_embed.is_empty() {
        return Ok(Vec::new());
    }
    let batch_size = ctx.config.embedding.batch_size.max(1);
    let texts: Vec<String> = to_embed
        .iter()
        .map(|&idx| chunks[idx].text.clone())
        .collect();
    let batches: Vec<Vec<String>> = texts
        .chunks(batch_size)
        .map(|batch| batch.to_vec())
        .collect();

    let results: Vec<crate::embedder::EmbedBatch> = stream::iter(
        batches
            .into_iter()
            .map(|batch| async move { embedder.embed(&batch).await }),
    )
    .buffered(ctx.config.embedding.workers.max(1))
    .try_collect()
    .await?;

    let mut rows = Vec::with_capacity(texts.len());
    let mut dim = None;
    for batch in results {
        if *dim.get_or_insert(batch.dim) != batch.dim {
            return Err(CpmError::Embedder(
                "embedder returned mixed dimensions across batches".to_string(),
            ));
        }
        rows.extend(batch.vectors);
    }
    Ok(rows)
}

struct WriteArtifacts<'a> {
    ctx: &'a Context,
    opts: &'a BuildOptions,
    chunks: &'a [Chunk],
    matrix: &'a [Vec<f32>],
    index: &'a FlatIpIndex,
    sparse: Option<&'a Bm25Index>,
    dim: usize,
    model: &'a str,
    ext_counts: BTreeMap<String, usize>,
    inputs: BTreeMap<String, String>,
    incremental: IncrementalStats,
    prior_manifest: Option<PacketManifest>,
}

async fn write_artifacts(
    args: WriteArtifacts<'_>,
) -> Result<(String, Option<String>, Option<PathBuf>)> {
    let WriteArtifacts {
        ctx,
        opts,
        chunks,
        matrix,
        index,
        sparse,
        dim,
        model,
        ext_counts,
        inputs,
        incremental,
        prior_manifest,
    } = args;
    let dest = &opts.dest;

    packet::write_docs_jsonl(chunks, &dest.join(DOCS_FILE))
        .map_err(|e| CpmError::Cache(e.to_string()))?;
    vectors::write_vectors_f16(matrix, &dest.join(VECTORS_FILE))
        .map_err(|e| CpmError::Cache(e.to_string()))?;
    index
        .save(&dest.join(INDEX_FILE))
        .map_err(|e| CpmError::Index(e.to_string()))?;
    if let Some(sparse) = sparse {
        sparse
            .save(&dest.join(BM25_FILE))
            .map_err(|e| CpmError::Index(e.to_string()))?;
    }

    // Content checksums decide whether this rebuild may keep the prior
    // created_at (keeping unchanged rebuilds byte-stable).
    let mut content_files = vec![DOCS_FILE, VECTORS_FILE, INDEX_FILE];
    if sparse.is_some() {
        content_files.push(BM25_FILE);
    }
    let content_checksums = packet::compute_checksums(dest, &content_files)
        .map_err(|e| CpmError::Cache(e.to_string()))?;
    let created_at = match &prior_manifest {
        Some(prior)
            if prior.embedding.model == model
                && prior.embedding.dim == dim
                && content_files
                    .iter()
                    .all(|f| prior.checksums.get(*f) == content_checksums.get(*f)) =>
        {
            prior.created_at.clone()
        }
        _ => ctx.clock.now_iso(),
    };

    let embedding = EmbeddingSpec {
        model: model.to_string(),
        dim,
        dtype: "float16".to_string(),
        normalized: ctx.config.embedding.normalize,
        max_seq_length: Some(ctx.config.embedding.max_seq_length),
    };
    let mut manifest = PacketManifest {
        schema_version: PacketManifest::SCHEMA_VERSION.to_string(),
        packet_id: opts.name.clone(),
        version: opts.version.clone(),
        created_at,
        embedding,
        counts: PacketCounts {
            docs: chunks.len(),
            vectors: index.len(),
        },
        incremental,
        checksums: BTreeMap::new(),
        cpm: PacketMeta {
            name: opts.name.clone(),
            version: opts.version.clone(),
            description: opts.description.clone(),
            tags: packet::infer_tags(&ext_counts),
            entrypoints: vec!["query".to_string()],
            builder: "cpm:default-builder".to_string(),
        },
        source: SourceInfo {
            input_dir: opts.source.to_string_lossy().replace('\\', "/"),
            file_ext_counts: ext_counts,
        },
    };
    packet::write_cpm_yml(&manifest, &dest.join(CPM_YML_FILE))
        .map_err(|e| CpmError::Cache(e.to_string()))?;

    let mut checksum_files = content_files.clone();
    checksum_files.insert(0, CPM_YML_FILE);
    manifest.checksums = packet::compute_checksums(dest, &checksum_files)
        .map_err(|e| CpmError::Cache(e.to_string()))?;
    packet::write_manifest(&manifest, &dest.join(MANIFEST_FILE))
        .map_err(|e| CpmError::Cache(e.to_string()))?;
    let manifest_digest = packet::packet_digest(dest).map_err(|e| CpmError::Cache(e.to_string()))?;

    // Lockfile binds inputs → pipeline → outputs.
    let parent_snapshot = list_snapshots(&ctx.workspace, &opts.name)
        .last()
        .map(|s| s.stamp.clone());
    let mut output_files = checksum_files.clone();
    output_files.push(MANIFEST_FILE);
    let outputs: BTreeMap<String, String> = packet::compute_checksums(dest, &output_files)
        .map_err(|e| CpmError::Cache(e.to_string()))?
        .into_iter()
        .map(|(file, checksum)| (file, checksum.value))
        .collect();
    let lock = Lockfile {
        schema_version: LOCK_SCHEMA_VERSION,
        inputs,
        pipeline: PipelineLock {
            chunker_config: ctx.config.chunking.clone(),
            embed_model: model.to_string(),
            retrieval_caps: ctx.config.retrieval.clone(),
        },
        outputs,
        source: None,
        parent_snapshot,
    };
    lock.save(&dest.join(LOCK_FILE))
        .map_err(|e| CpmError::Cache(e.to_string()))?;

    let snapshot = if opts.snapshot {
        let stamp = ctx.clock.now_stamp();
        Some(
            lock.snapshot(&ctx.workspace, &opts.name, &stamp)
                .map_err(|e| CpmError::Cache(e.to_string()))?,
        )
    } else {
        None
    };

    let archive_path = match opts.archive {
        Some(format) => {
            Some(archive_packet(dest, format).map_err(|e| CpmError::Cache(e.to_string()))?)
        }
        None => None,
    };

    info!(digest = %manifest_digest, "build complete");
    Ok((manifest_digest, snapshot, archive_path))
}

/// Archive the packet directory as `<dest>.tar.gz` or `<dest>.zip`.
fn archive_packet(dest: &Path, format: ArchiveFormat) -> anyhow::Result<PathBuf> {
    let dir_name = dest
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "packet".to_string());
    match format {
        ArchiveFormat::TarGz => {
            let archive_path = PathBuf::from(format!("{}.tar.gz", dest.display()));
            let file = fs::File::create(&archive_path)?;
            let encoder = flate2::write::GzEncoder::new(file, flate2::Compression::default());
            let mut builder = tar::Builder::new(encoder);
            builder.append_dir_all(&dir_name, dest)?;
            builder.into_inner()?.finish()?;
            Ok(archive_path)
        }
        ArchiveFormat::Zip => {
            let archive_path = PathBuf::from(format!("{}.zip", dest.display()));
            let file = fs::File::create(&archive_path)?;
            let mut writer = zip::ZipWriter::new(file);
            let options = zip::write::SimpleFileOptions::default()
                .compression_method(zip::CompressionMethod::Deflated);
            for entry in walkdir::WalkDir::new(dest)
                .sort_by_file_name()
                .into_iter()
                .flatten()
            {
                if !entry.file_type().is_file() {
                    continue;
                }
                let rel = entry.path().strip_prefix(dest)?;
                let name = format!("{}/{}", dir_name, rel.to_string_lossy().replace('\\', "/"));
                writer.start_file(name, options)?;
                std::io::copy(
                    &mut fs::File::open(entry.path())?,
                    &mut writer,
                )?;
            }
            writer.finish()?;
            Ok(archive_path)
        }
    }
}
