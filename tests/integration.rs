//! End-to-end tests driving the compiled `cpm` binary.
//!
//! Each test gets a fresh workspace with a stub-embedder configuration so
//! no network or embedding server is needed.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn cpm_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("cpm");
    path
}

fn setup_workspace() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();
    fs::write(
        config_dir.join("embeddings.yml"),
        "embedding:\n  provider: stub\n  model: stub-model\n  dim: 8\nretrieval:\n  indexer: hybrid-rrf\nchunking:\n  chunk_tokens: 64\n  overlap_tokens: 8\n  hard_cap_tokens: 128\n",
    )
    .unwrap();

    let source_dir = root.join("files");
    fs::create_dir_all(&source_dir).unwrap();
    fs::write(
        source_dir.join("alpha.md"),
        "# Alpha Document\n\nThis is the alpha document about Rust programming.\n\nIt covers cargo workspaces and crates.",
    )
    .unwrap();
    fs::write(
        source_dir.join("beta.py"),
        "def deploy():\n    \"\"\"Deployment helper for kubernetes clusters.\"\"\"\n    return \"rolling update\"\n",
    )
    .unwrap();
    fs::write(
        source_dir.join("gamma.txt"),
        "Gamma notes about deployment and infrastructure.\n\nKubernetes and Docker are mentioned here.",
    )
    .unwrap();

    (tmp, root)
}

fn run_cpm(workspace: &Path, args: &[&str]) -> (String, String, i32) {
    let output = Command::new(cpm_binary())
        .arg("--workspace-dir")
        .arg(workspace)
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("failed to run cpm binary: {}", e));
    (
        String::from_utf8_lossy(&output.stdout).to_string(),
        String::from_utf8_lossy(&output.stderr).to_string(),
        output.status.code().unwrap_or(-1),
    )
}

fn build(workspace: &Path, version: &str) -> String {
    let dest = workspace
        .join("packages")
        .join("demo")
        .join(version)
        .to_string_lossy()
        .into_owned();
    let source = workspace.join("files").to_string_lossy().into_owned();
    let (stdout, stderr, code) = run_cpm(
        workspace,
        &[
            "build", &source, "--dest", &dest, "--name", "demo", "--version", version,
        ],
    );
    assert_eq!(code, 0, "build failed:\n{}\n{}", stdout, stderr);
    dest
}

#[test]
fn test_build_writes_all_artifacts() {
    let (_tmp, ws) = setup_workspace();
    let dest = PathBuf::from(build(&ws, "1.0.0"));

    for artifact in [
        "cpm.yml",
        "manifest.json",
        "docs.jsonl",
        "vectors.f16.bin",
        "faiss/index.faiss",
        "bm25.bin",
        "cpm-lock.json",
    ] {
        assert!(dest.join(artifact).is_file(), "missing {}", artifact);
    }

    let manifest: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(dest.join("manifest.json")).unwrap()).unwrap();
    assert_eq!(manifest["counts"]["docs"], manifest["counts"]["vectors"]);
    assert_eq!(manifest["embedding"]["model"], "stub-model");
    assert_eq!(manifest["embedding"]["dim"], 8);

    // docs.jsonl line count matches the manifest.
    let lines = fs::read_to_string(dest.join("docs.jsonl")).unwrap();
    let docs = lines.lines().filter(|l| !l.trim().is_empty()).count();
    assert_eq!(docs as u64, manifest["counts"]["docs"].as_u64().unwrap());
}

#[test]
fn test_incremental_rebuild_counts() {
    let (_tmp, ws) = setup_workspace();
    build(&ws, "1.0.0");

    // Unchanged rebuild: everything reused.
    let dest = ws.join("packages/demo/1.0.0").to_string_lossy().into_owned();
    let source = ws.join("files").to_string_lossy().into_owned();
    let (stdout, _, code) = run_cpm(
        &ws,
        &[
            "--format", "json", "build", &source, "--dest", &dest, "--name", "demo",
            "--version", "1.0.0",
        ],
    );
    assert_eq!(code, 0);
    let report: serde_json::Value = serde_json::from_str(stdout.trim()).unwrap();
    assert_eq!(report["embedded"], 0);
    assert_eq!(report["reused"], report["chunks"]);

    // Add a file: only its chunks embed.
    fs::write(ws.join("files/delta.md"), "# Delta\n\nbrand new content").unwrap();
    let (stdout, _, code) = run_cpm(
        &ws,
        &[
            "--format", "json", "build", &source, "--dest", &dest, "--name", "demo",
            "--version", "1.0.0",
        ],
    );
    assert_eq!(code, 0);
    let report: serde_json::Value = serde_json::from_str(stdout.trim()).unwrap();
    assert_eq!(report["removed"], 0);
    assert!(report["embedded"].as_u64().unwrap() >= 1);
    assert!(report["reused"].as_u64().unwrap() >= 3);
}

#[test]
fn test_query_returns_cited_results() {
    let (_tmp, ws) = setup_workspace();
    build(&ws, "1.0.0");

    let (stdout, stderr, code) = run_cpm(
        &ws,
        &[
            "--format", "json", "query", "deployment", "--packet", "demo@1.0.0", "-k", "3",
        ],
    );
    assert_eq!(code, 0, "query failed:\n{}\n{}", stdout, stderr);
    let output: serde_json::Value = serde_json::from_str(stdout.trim()).unwrap();
    let results = output["results"].as_array().unwrap();
    assert!(!results.is_empty());

    // Every compiled snippet carries a citation with a chunk id.
    let citations = output["compiled_context"]["citations"].as_array().unwrap();
    let snippets = output["compiled_context"]["core_snippets"].as_array().unwrap();
    assert_eq!(citations.len(), snippets.len());
    for citation in citations {
        assert!(!citation["id"].as_str().unwrap().is_empty());
    }
    assert!(output["replay_log"].as_str().is_some());
}

#[test]
fn test_query_deterministic_across_runs() {
    let (_tmp, ws) = setup_workspace();
    build(&ws, "1.0.0");

    let run = || {
        let (stdout, _, code) = run_cpm(
            &ws,
            &[
                "--format", "json", "query", "rust cargo", "--packet", "demo@1.0.0", "-k", "3",
            ],
        );
        assert_eq!(code, 0);
        let output: serde_json::Value = serde_json::from_str(stdout.trim()).unwrap();
        (
            output["result_hash"].as_str().unwrap().to_string(),
            output["compiler_output_hash"].as_str().unwrap().to_string(),
        )
    };
    assert_eq!(run(), run());
}

#[test]
fn test_replay_reproduces_hashes() {
    let (_tmp, ws) = setup_workspace();
    build(&ws, "1.0.0");

    let (stdout, _, code) = run_cpm(
        &ws,
        &[
            "--format", "json", "query", "kubernetes", "--packet", "demo@1.0.0",
        ],
    );
    assert_eq!(code, 0);
    let output: serde_json::Value = serde_json::from_str(stdout.trim()).unwrap();
    let log = output["replay_log"].as_str().unwrap().to_string();
    let expected = output["result_hash"].as_str().unwrap().to_string();

    let (stdout, stderr, code) = run_cpm(&ws, &["--format", "json", "replay", &log]);
    assert_eq!(code, 0, "replay failed:\n{}\n{}", stdout, stderr);
    let replayed: serde_json::Value = serde_json::from_str(stdout.trim()).unwrap();
    assert_eq!(replayed["result_hash"].as_str().unwrap(), expected);
}

#[test]
fn test_lock_verify_detects_tampering() {
    let (_tmp, ws) = setup_workspace();
    let dest = PathBuf::from(build(&ws, "1.0.0"));

    let (_, _, code) = run_cpm(&ws, &["verify", "demo@1.0.0"]);
    assert_eq!(code, 0);

    // Tamper with an artifact.
    let docs = dest.join("docs.jsonl");
    let mut content = fs::read_to_string(&docs).unwrap();
    content.push('\n');
    content.push_str("{\"id\":\"evil:0\",\"text\":\"injected\",\"hash\":\"0\",\"metadata\":{\"path\":\"evil\",\"ext\":\".md\"}}");
    fs::write(&docs, content).unwrap();

    let (_, stderr, code) = run_cpm(&ws, &["verify", "demo@1.0.0"]);
    assert_eq!(code, 5, "expected lock mismatch exit: {}", stderr);
    assert!(stderr.contains("LockMismatch"));

    // Frozen lockfile aborts a query against the tampered packet.
    let (_, _, code) = run_cpm(
        &ws,
        &[
            "query", "anything", "--packet", "demo@1.0.0", "--frozen-lockfile",
        ],
    );
    assert_eq!(code, 5);
}

#[test]
fn test_time_travel_resolves_snapshot() {
    let (_tmp, ws) = setup_workspace();
    build(&ws, "1.0.0");
    let t0 = chrono::Utc::now().to_rfc3339();
    std::thread::sleep(std::time::Duration::from_millis(1100));

    // Change content and build a new version.
    fs::write(
        ws.join("files/alpha.md"),
        "# Alpha Document\n\nCompletely rewritten content about zig and comptime.",
    )
    .unwrap();
    build(&ws, "1.1.0");

    // As-of t0 answers from the 1.0.0 snapshot.
    let (stdout, stderr, code) = run_cpm(
        &ws,
        &[
            "--format", "json", "query", "rust cargo", "--packet", "demo", "--as-of", &t0,
        ],
    );
    assert_eq!(code, 0, "as-of query failed:\n{}\n{}", stdout, stderr);
    let pinned: serde_json::Value = serde_json::from_str(stdout.trim()).unwrap();

    let (stdout, _, code) = run_cpm(
        &ws,
        &["--format", "json", "query", "rust cargo", "--packet", "demo"],
    );
    assert_eq!(code, 0);
    let latest: serde_json::Value = serde_json::from_str(stdout.trim()).unwrap();

    assert_ne!(
        pinned["packet_digest"].as_str().unwrap(),
        latest["packet_digest"].as_str().unwrap(),
        "as-of and latest should pin different digests"
    );
    let pinned_text = pinned["results"].as_array().unwrap().iter().fold(
        String::new(),
        |mut acc, r| {
            acc.push_str(r["text"].as_str().unwrap_or(""));
            acc
        },
    );
    assert!(pinned_text.contains("Rust programming"));
}

#[test]
fn test_policy_deny_exits_3() {
    let (_tmp, ws) = setup_workspace();
    let dest = build(&ws, "1.0.0");
    fs::write(
        ws.join("policy.yml"),
        "mode: strict\nallowed_sources:\n  - \"oci://trusted.example/*\"\n",
    )
    .unwrap();

    let uri = format!("dir://{}", dest);
    let (_, stderr, code) = run_cpm(&ws, &["query", "anything", "--source", &uri]);
    assert_eq!(code, 3, "expected policy deny: {}", stderr);
    assert!(stderr.contains("PolicyDeny"));
}

#[test]
fn test_install_list_uninstall_roundtrip() {
    let (_tmp, ws) = setup_workspace();
    // Build outside the package store, then install from it.
    let built = ws.join("out");
    let source = ws.join("files").to_string_lossy().into_owned();
    let (_, stderr, code) = run_cpm(
        &ws,
        &[
            "build", &source, "--dest", built.to_str().unwrap(), "--name", "demo",
            "--version", "2.0.0",
        ],
    );
    assert_eq!(code, 0, "{}", stderr);

    let uri = format!("dir://{}", built.display());
    let (stdout, stderr, code) = run_cpm(&ws, &["install", &uri]);
    assert_eq!(code, 0, "install failed:\n{}\n{}", stdout, stderr);

    let (stdout, _, code) = run_cpm(&ws, &["list"]);
    assert_eq!(code, 0);
    assert!(stdout.contains("demo@2.0.0"));

    // Installed packet answers queries.
    let (_, _, code) = run_cpm(&ws, &["query", "deployment", "--packet", "demo@2.0.0"]);
    assert_eq!(code, 0);

    let (_, _, code) = run_cpm(&ws, &["uninstall", "demo", "--version", "2.0.0"]);
    assert_eq!(code, 0);
    let (stdout, _, _) = run_cpm(&ws, &["list"]);
    assert!(!stdout.contains("demo@2.0.0"));
}

#[test]
fn test_diff_reports_drift() {
    let (_tmp, ws) = setup_workspace();
    build(&ws, "1.0.0");
    fs::write(
        ws.join("files/alpha.md"),
        "# Alpha Document\n\nEntirely different topic: quantum entanglement experiments.",
    )
    .unwrap();
    build(&ws, "1.1.0");

    let (stdout, stderr, code) = run_cpm(
        &ws,
        &["--format", "json", "diff", "demo@1.0.0", "demo@1.1.0"],
    );
    assert_eq!(code, 0, "diff failed:\n{}\n{}", stdout, stderr);
    let output: serde_json::Value = serde_json::from_str(stdout.trim()).unwrap();
    let drift = output["diff"]["drift_score"].as_f64().unwrap();
    assert!(drift > 0.0, "changed content should drift");

    // The gate trips when the threshold is below the observed drift.
    let (_, _, code) = run_cpm(
        &ws,
        &["diff", "demo@1.0.0", "demo@1.1.0", "--max-drift", "0.000001"],
    );
    assert_eq!(code, 6);
}

#[test]
fn test_publish_layout_roundtrip() {
    let (_tmp, ws) = setup_workspace();
    let dest = build(&ws, "1.0.0");
    let out = ws.join("publish");

    let (stdout, stderr, code) = run_cpm(
        &ws,
        &["publish", &dest, "--to", out.to_str().unwrap()],
    );
    assert_eq!(code, 0, "publish failed:\n{}\n{}", stdout, stderr);
    assert!(out.join("packet.manifest.json").is_file());
    assert!(out.join("packet.lock.json").is_file());

    // The payload tree is a queryable packet with identical checksums.
    for artifact in ["manifest.json", "docs.jsonl", "vectors.f16.bin"] {
        let original = fs::read(PathBuf::from(&dest).join(artifact)).unwrap();
        let published = fs::read(out.join("payload").join(artifact)).unwrap();
        assert_eq!(original, published, "{} differs after publish", artifact);
    }
    let payload = out.join("payload").to_string_lossy().into_owned();
    let (_, _, code) = run_cpm(&ws, &["query", "deployment", "--packet", &payload]);
    assert_eq!(code, 0);
}

#[test]
fn test_benchmark_gate() {
    let (_tmp, ws) = setup_workspace();
    build(&ws, "1.0.0");
    let suite = ws.join("suite.yml");
    fs::write(&suite, "- query: deployment kubernetes\n- query: rust cargo\n").unwrap();

    let (_, _, code) = run_cpm(
        &ws,
        &["benchmark", "demo@1.0.0", "--suite", suite.to_str().unwrap()],
    );
    assert_eq!(code, 0);

    // An impossible expectation fails the gate with exit 6.
    fs::write(
        &suite,
        "- query: deployment\n  expect: [\"nonexistent.md:999\"]\n",
    )
    .unwrap();
    let (_, stderr, code) = run_cpm(
        &ws,
        &[
            "benchmark", "demo@1.0.0", "--suite", suite.to_str().unwrap(),
            "--min-hit-rate", "1.0",
        ],
    );
    assert_eq!(code, 6, "expected KPI gate failure: {}", stderr);
}

#[test]
fn test_usage_error_exits_2() {
    let (_tmp, ws) = setup_workspace();
    let (_, stderr, code) = run_cpm(&ws, &["query", "no packet given"]);
    assert_eq!(code, 2, "{}", stderr);
    assert!(stderr.contains("UsageError"));
}
