//! # cpm CLI
//!
//! The `cpm` binary drives the full packet lifecycle: build, query,
//! install, publish, replay, diff, and cache maintenance.
//!
//! All commands accept `--workspace-dir` pointing at the workspace root
//! (policy, config, caches, and state live under it) and `--format` for
//! machine-readable output.
//!
//! ## Exit codes
//!
//! | Code | Meaning |
//! |------|---------|
//! | 0 | success |
//! | 2 | usage error |
//! | 3 | policy deny |
//! | 4 | trust violation |
//! | 5 | lock verification failure |
//! | 6 | benchmark KPI gate failed |
//! | >= 10 | unexpected |

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use cpm::benchmark;
use cpm::build::{ArchiveFormat, BuildOptions};
use cpm::cas::SourceCache;
use cpm::embed_cache::EmbedCache;
use cpm::embedder::create_embedder;
use cpm::error::CpmError;
use cpm::install;
use cpm::lockfile::Lockfile;
use cpm::oci::{publish_packet, write_publish_layout, OciClient, OciRef};
use cpm::packet::LOCK_FILE;
use cpm::query::{resolve_packet_spec, run_query, QueryOptions};
use cpm::workspace::Context;

/// cpm — build, verify, and query versioned RAG context packets.
#[derive(Parser)]
#[command(
    name = "cpm",
    about = "Context packet manager — build, verify, and query versioned RAG context packets",
    version
)]
struct Cli {
    /// Workspace root directory (policy.yml, config/, caches, state).
    #[arg(long, global = true, default_value = ".")]
    workspace_dir: PathBuf,

    /// Output format.
    #[arg(long, global = true, default_value = "text")]
    format: OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Build a packet from a source tree.
    ///
    /// Scans, chunks, embeds (incrementally against any previous build in
    /// the destination), indexes, and writes the packet artifacts plus a
    /// lockfile and lock snapshot.
    Build {
        /// Source directory to index.
        source: PathBuf,

        /// Destination packet directory.
        #[arg(long)]
        dest: PathBuf,

        /// Packet name.
        #[arg(long, default_value = "packet")]
        name: String,

        /// Packet semver version.
        #[arg(long, default_value = "0.0.0")]
        version: String,

        /// Packet description (defaults to the source path).
        #[arg(long)]
        description: Option<String>,

        /// Also write an archive: `tar.gz` or `zip`.
        #[arg(long)]
        archive: Option<String>,

        /// Skip the lock snapshot (disables time-travel to this build).
        #[arg(long)]
        no_snapshot: bool,
    },

    /// Query a packet for relevant context.
    Query {
        /// The query text.
        query: String,

        /// Local packet: path, `name`, or `name@version`.
        #[arg(long)]
        packet: Option<String>,

        /// Remote source URI (`dir://`, `oci://`, `http(s)://`).
        #[arg(long)]
        source: Option<String>,

        /// Number of results.
        #[arg(short, default_value_t = 5)]
        k: usize,

        /// Indexer: `faiss-flatip`, `bm25`, or `hybrid-rrf`.
        #[arg(long)]
        indexer: Option<String>,

        /// Reranker: `none` or `token-diversity`.
        #[arg(long)]
        reranker: Option<String>,

        /// Time-travel: answer from the lock snapshot at or before this
        /// time (RFC 3339, YYYY-MM-DD, or a snapshot stamp).
        #[arg(long)]
        as_of: Option<String>,

        /// Context compiler token budget override.
        #[arg(long)]
        max_tokens: Option<usize>,

        /// Abort on any lockfile mismatch.
        #[arg(long)]
        frozen_lockfile: bool,

        /// Rewrite the lockfile when artifacts drifted.
        #[arg(long)]
        update_lock: bool,
    },

    /// Re-run a logged query and verify its hashes reproduce.
    Replay {
        /// Path to a replay log under state/replay/.
        log: PathBuf,
    },

    /// Resolve, verify, and install a packet from a source URI.
    Install {
        /// Source URI (`dir://`, `oci://`, `http(s)://`).
        uri: String,
    },

    /// Remove an installed packet.
    Uninstall {
        name: String,
        #[arg(long)]
        version: Option<String>,
    },

    /// List installed packets.
    List,

    /// Check installed packets for upstream updates.
    Update,

    /// Publish a packet: OCI layout on disk, or push to a registry.
    Publish {
        /// Built packet directory.
        packet: PathBuf,

        /// Target: a directory for the local layout, or an
        /// `oci://host/repo/name@tag` reference to push.
        #[arg(long)]
        to: String,

        /// Signature key id (requires --sign-key).
        #[arg(long)]
        sign_keyid: Option<String>,

        /// Signature key secret.
        #[arg(long)]
        sign_key: Option<String>,
    },

    /// Verify a packet's lockfile against its artifacts.
    Verify {
        /// Packet spec: path, `name`, or `name@version`.
        packet: String,
    },

    /// Compare two packets and report drift.
    Diff {
        /// First packet spec (`name@version` or path).
        a: String,
        /// Second packet spec.
        b: String,
        /// Exit non-zero when the drift score exceeds this value.
        #[arg(long)]
        max_drift: Option<f32>,
    },

    /// Cache maintenance.
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },

    /// Run a query suite against a packet with a hit-rate KPI gate.
    Benchmark {
        /// Packet spec: path, `name`, or `name@version`.
        packet: String,

        /// YAML benchmark suite.
        #[arg(long)]
        suite: PathBuf,

        /// Default top-k per case.
        #[arg(short, default_value_t = 5)]
        k: usize,

        /// Fail (exit 6) when hit rate falls below this value.
        #[arg(long)]
        min_hit_rate: Option<f64>,
    },
}

#[derive(Subcommand)]
enum CacheAction {
    /// Entry counts and byte totals for the object and embed caches.
    Stats,
    /// Evict to the configured byte quotas (LRU).
    Gc,
    /// Re-verify a sample of cached objects against their digests.
    Verify {
        #[arg(long, default_value_t = 64)]
        sample: usize,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let json = cli.format == OutputFormat::Json;
    let code = match run(cli).await {
        Ok(()) => 0,
        Err(err) => {
            if json {
                println!("{}", err.to_json());
            }
            eprintln!("{}: {}", err.kind(), err);
            err.exit_code()
        }
    };
    std::process::exit(code);
}

async fn run(cli: Cli) -> Result<(), CpmError> {
    let ctx = Context::load(&cli.workspace_dir).map_err(|e| CpmError::Usage(e.to_string()))?;
    let json = cli.format == OutputFormat::Json;

    match cli.command {
        Commands::Build {
            source,
            dest,
            name,
            version,
            description,
            archive,
            no_snapshot,
        } => {
            let embedder = create_embedder(&ctx.config.embedding, &ctx.http)?;
            let opts = BuildOptions {
                description: description
                    .unwrap_or_else(|| source.to_string_lossy().into_owned()),
                source,
                dest,
                name,
                version,
                archive: archive.as_deref().map(str::parse::<ArchiveFormat>).transpose()?,
                snapshot: !no_snapshot,
            };
            let report = cpm::build::build_packet(&ctx, embedder.as_ref(), &opts).await?;
            if json {
                println!(
                    "{}",
                    serde_json::json!({
                        "ok": true,
                        "files_indexed": report.files_indexed,
                        "chunks": report.total_chunks,
                        "reused": report.reused,
                        "embedded": report.embedded,
                        "removed": report.removed,
                        "dim": report.dim,
                        "digest": report.manifest_digest,
                        "snapshot": report.snapshot,
                    })
                );
            } else {
                println!(
                    "built {} chunks ({} reused, {} embedded, {} removed) dim={}",
                    report.total_chunks, report.reused, report.embedded, report.removed, report.dim
                );
                println!("digest: {}", report.manifest_digest);
                if let Some(archive) = report.archive_path {
                    println!("archive: {}", archive.display());
                }
            }
            Ok(())
        }

        Commands::Query {
            query,
            packet,
            source,
            k,
            indexer,
            reranker,
            as_of,
            max_tokens,
            frozen_lockfile,
            update_lock,
        } => {
            let embedder = create_embedder(&ctx.config.embedding, &ctx.http)?;
            let opts = QueryOptions {
                packet,
                source,
                query,
                k,
                indexer,
                reranker,
                as_of,
                max_tokens,
                frozen_lockfile,
                update_lock,
                write_replay: true,
            };
            let output = run_query(&ctx, embedder.as_ref(), &opts).await?;
            if json {
                println!(
                    "{}",
                    serde_json::json!({
                        "ok": true,
                        "packet_digest": output.packet_digest,
                        "results": output.results,
                        "compiled_context": output.compiled,
                        "result_hash": output.result_hash,
                        "compiler_output_hash": output.compiler_output_hash,
                        "policy": output.policy_decision,
                        "warnings": output.warnings,
                        "replay_log": output.replay_log,
                    })
                );
            } else {
                for warning in &output.warnings {
                    eprintln!("warning: {}", warning);
                }
                for (rank, hit) in output.results.iter().enumerate() {
                    println!("{:2}. [{:.4}] {}", rank + 1, hit.score, hit.id);
                    let preview: String = hit.text.chars().take(160).collect();
                    println!("      {}", preview.replace('\n', " "));
                }
                println!("result_hash: {}", output.result_hash);
                if let Some(log) = &output.replay_log {
                    println!("replay log: {}", log.display());
                }
            }
            Ok(())
        }

        Commands::Replay { log } => {
            let embedder = create_embedder(&ctx.config.embedding, &ctx.http)?;
            let outcome = cpm::replay::replay(&ctx, embedder.as_ref(), &log).await?;
            if json {
                println!(
                    "{}",
                    serde_json::json!({
                        "ok": true,
                        "result_hash": outcome.actual_result_hash,
                        "compiler_output_hash": outcome.actual_compiler_hash,
                    })
                );
            } else {
                println!("replay ok");
                println!("result_hash: {}", outcome.actual_result_hash);
            }
            Ok(())
        }

        Commands::Install { uri } => {
            let report = install::install(&ctx, &uri).await?;
            if json {
                println!("{}", serde_json::json!({ "ok": true, "installed": report }));
            } else {
                for warning in &report.warnings {
                    eprintln!("warning: {}", warning);
                }
                println!(
                    "installed {}@{} ({})",
                    report.name, report.version, report.digest
                );
            }
            Ok(())
        }

        Commands::Uninstall { name, version } => {
            install::uninstall(&ctx, &name, version.as_deref())?;
            println!("removed {}", name);
            Ok(())
        }

        Commands::List => {
            let installed = install::list_installed(&ctx)?;
            if json {
                println!("{}", serde_json::json!({ "ok": true, "packets": installed }));
            } else if installed.is_empty() {
                println!("no packets installed");
            } else {
                for packet in installed {
                    println!("{}@{}  {}", packet.name, packet.version, packet.digest);
                }
            }
            Ok(())
        }

        Commands::Update => {
            let reports = install::check_updates(&ctx).await?;
            if json {
                let rows: Vec<_> = reports
                    .iter()
                    .map(|(packet, update)| {
                        serde_json::json!({ "packet": packet, "update": update })
                    })
                    .collect();
                println!("{}", serde_json::json!({ "ok": true, "updates": rows }));
            } else if reports.is_empty() {
                println!("no installed packets track a source");
            } else {
                for (packet, update) in reports {
                    let status = if update.newer { "update available" } else { "up to date" };
                    println!("{}@{}  {}", packet.name, packet.version, status);
                }
            }
            Ok(())
        }

        Commands::Publish {
            packet,
            to,
            sign_keyid,
            sign_key,
        } => {
            let digest = if to.starts_with("oci://") {
                let reference = OciRef::parse(&to)?;
                let client = OciClient::new(&ctx.config.oci, ctx.http.clone());
                let sign = match (&sign_keyid, &sign_key) {
                    (Some(keyid), Some(key)) => Some((keyid.as_str(), key.as_str())),
                    (None, None) => None,
                    _ => {
                        return Err(CpmError::Usage(
                            "--sign-keyid and --sign-key must be given together".to_string(),
                        ))
                    }
                };
                publish_packet(&client, &reference, &packet, sign).await?
            } else {
                write_publish_layout(&packet, PathBuf::from(&to).as_path())?
            };
            if json {
                println!("{}", serde_json::json!({ "ok": true, "digest": digest }));
            } else {
                println!("published: {}", digest);
            }
            Ok(())
        }

        Commands::Verify { packet } => {
            let dir = resolve_packet_spec(&ctx, &packet)?;
            let lock = Lockfile::load(&dir.join(LOCK_FILE))
                .map_err(|e| CpmError::Usage(e.to_string()))?;
            lock.verify(&dir)?;
            println!("lock ok: {}", dir.display());
            Ok(())
        }

        Commands::Diff { a, b, max_drift } => {
            let a_dir = resolve_packet_spec(&ctx, &a)?;
            let b_dir = resolve_packet_spec(&ctx, &b)?;
            let report = cpm::diff::diff_packets(&a_dir, &b_dir)?;
            if json {
                println!("{}", serde_json::json!({ "ok": true, "diff": report }));
            } else {
                println!(
                    "added={} removed={} changed={} unchanged={}",
                    report.added.len(),
                    report.removed.len(),
                    report.changed.len(),
                    report.unchanged
                );
                println!("drift score: {:.4}", report.drift_score);
                for (section, drift) in &report.sections {
                    println!(
                        "  {}  changed={} added={} removed={} drift={:.4}",
                        section, drift.changed, drift.added, drift.removed, drift.drift
                    );
                }
            }
            if let Some(max) = max_drift {
                if report.exceeds(max) {
                    return Err(CpmError::KpiGate(format!(
                        "drift score {:.4} exceeds --max-drift {:.4}",
                        report.drift_score, max
                    )));
                }
            }
            Ok(())
        }

        Commands::Cache { action } => {
            let objects = SourceCache::new(
                ctx.workspace.objects_dir(),
                ctx.config.cache.objects_quota_bytes,
            );
            let embed = EmbedCache::new(
                ctx.workspace.embed_cache_dir(),
                ctx.config.embedding.model.clone(),
                ctx.config.cache.embed_quota_bytes,
            );
            match action {
                CacheAction::Stats => {
                    let (object_count, object_bytes) = objects.stats();
                    let (embed_count, embed_bytes) = embed.stats();
                    if json {
                        println!(
                            "{}",
                            serde_json::json!({
                                "ok": true,
                                "objects": { "entries": object_count, "bytes": object_bytes },
                                "embed": { "entries": embed_count, "bytes": embed_bytes },
                            })
                        );
                    } else {
                        println!("objects: {} entries, {} bytes", object_count, object_bytes);
                        println!("embed:   {} entries, {} bytes", embed_count, embed_bytes);
                    }
                }
                CacheAction::Gc => {
                    let partials = objects.sweep_partials()?;
                    let (removed, freed) = objects.evict_to_quota()?;
                    let embed_removed = embed
                        .evict_to_quota()
                        .map_err(|e| CpmError::Cache(e.to_string()))?;
                    println!(
                        "evicted {} objects ({} bytes), {} embed entries, {} partials",
                        removed, freed, embed_removed, partials
                    );
                }
                CacheAction::Verify { sample } => {
                    let failures = objects.verify_sample(sample)?;
                    if failures.is_empty() {
                        println!("cache ok ({} sampled)", sample);
                    } else {
                        for failure in &failures {
                            eprintln!("corrupt: {}", failure);
                        }
                        return Err(CpmError::Cache(format!(
                            "{} corrupt cache entries",
                            failures.len()
                        )));
                    }
                }
            }
            Ok(())
        }

        Commands::Benchmark {
            packet,
            suite,
            k,
            min_hit_rate,
        } => {
            let embedder = create_embedder(&ctx.config.embedding, &ctx.http)?;
            let cases = benchmark::load_suite(&suite)?;
            let report =
                benchmark::run_benchmark(&ctx, embedder.as_ref(), &packet, &cases, k, min_hit_rate)
                    .await?;
            if json {
                println!("{}", serde_json::json!({ "ok": true, "benchmark": report }));
            } else {
                println!(
                    "hit rate: {:.3}  mean latency: {:.1} ms  ({} cases)",
                    report.hit_rate,
                    report.mean_latency_ms,
                    report.cases.len()
                );
            }
            Ok(())
        }
    }
}
