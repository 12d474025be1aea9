//! Retrieval benchmark with a KPI gate.
//!
//! A benchmark suite is a YAML list of cases:
//!
//! ```yaml
//! - query: "how does auth work"
//!   expect:
//!     - "docs/auth.md:0"
//! - query: "cache eviction"
//!   expect:
//!     - "src/cache.rs:evict:0"
//!   k: 10
//! ```
//!
//! Hit rate is the fraction of cases whose top-k contains at least one
//! expected chunk id. `--min-hit-rate` turns the run into a gate (exit 6).

use std::path::Path;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::error::{CpmError, Result};
use crate::query::{run_query, QueryOptions};
use crate::workspace::Context;

#[derive(Debug, Deserialize)]
pub struct BenchCase {
    pub query: String,
    #[serde(default)]
    pub expect: Vec<String>,
    #[serde(default)]
    pub k: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct CaseResult {
    pub query: String,
    pub hit: bool,
    pub latency_ms: f64,
}

#[derive(Debug, Serialize)]
pub struct BenchReport {
    pub cases: Vec<CaseResult>,
    pub hit_rate: f64,
    pub mean_latency_ms: f64,
}

pub fn load_suite(path: &Path) -> Result<Vec<BenchCase>> {
    let content = std::fs::read_to_string(path)?;
    serde_yaml::from_str(&content)
        .map_err(|e| CpmError::Usage(format!("invalid benchmark suite {}: {}", path.display(), e)))
}

/// Run the suite against a packet and evaluate the KPI gate.
pub async fn run_benchmark(
    ctx: &Context,
    embedder: &dyn crate::embedder::Embedder,
    packet: &str,
    suite: &[BenchCase],
    default_k: usize,
    min_hit_rate: Option<f64>,
) -> Result<BenchReport> {
    if suite.is_empty() {
        return Err(CpmError::Usage("benchmark suite is empty".to_string()));
    }

    let mut cases = Vec::with_capacity(suite.len());
    let mut hits = 0usize;
    let mut total_latency = 0.0f64;

    for case in suite {
        let opts = QueryOptions {
            packet: Some(packet.to_string()),
            query: case.query.clone(),
            k: case.k.unwrap_or(default_k),
            write_replay: false,
            ..QueryOptions::default()
        };
        let started = Instant::now();
        let outcome = run_query(ctx, embedder, &opts).await;
        let latency_ms = started.elapsed().as_secs_f64() * 1000.0;
        total_latency += latency_ms;

        let hit = match &outcome {
            Ok(output) => {
                case.expect.is_empty()
                    || output
                        .results
                        .iter()
                        .any(|result| case.expect.contains(&result.id))
            }
            Err(_) => false,
        };
        if hit {
            hits += 1;
        }
        cases.push(CaseResult {
            query: case.query.clone(),
            hit,
            latency_ms,
        });
    }

    let report = BenchReport {
        hit_rate: hits as f64 / suite.len() as f64,
        mean_latency_ms: total_latency / suite.len() as f64,
        cases,
    };
    if let Some(min) = min_hit_rate {
        if report.hit_rate < min {
            return Err(CpmError::KpiGate(format!(
                "hit rate {:.3} below required {:.3}",
                report.hit_rate, min
            )));
        }
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_suite() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("suite.yml");
        std::fs::write(
            &path,
            "- query: auth\n  expect: [\"docs/auth.md:0\"]\n- query: cache\n  k: 10\n",
        )
        .unwrap();
        let suite = load_suite(&path).unwrap();
        assert_eq!(suite.len(), 2);
        assert_eq!(suite[0].expect, vec!["docs/auth.md:0"]);
        assert_eq!(suite[1].k, Some(10));
    }

    #[test]
    fn test_load_suite_rejects_garbage() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("suite.yml");
        std::fs::write(&path, "query: not-a-list\n").unwrap();
        assert!(load_suite(&path).is_err());
    }
}
