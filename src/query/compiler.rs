//! Context compiler: retrieved chunks → structured, citation-carrying
//! context package.
//!
//! The compiler guarantees:
//!
//! - every included snippet carries a non-empty citation resolving to a
//!   chunk id present in the packet (snippets that cannot be cited are
//!   dropped);
//! - the total token estimate never exceeds the budget, allocated 10%
//!   outline / 70% snippets / 10% glossary / 10% risks;
//! - output is deterministic for fixed input ordering and tokenizer.

use serde::Serialize;

use crate::packet::vectors::cosine_similarity;
use crate::tokenizer::count_tokens;

use super::retriever::Hit;

const DEDUP_COSINE: f32 = 0.95;
const OUTLINE_SHARE: f64 = 0.10;
const SNIPPET_SHARE: f64 = 0.70;
const GLOSSARY_SHARE: f64 = 0.10;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Citation {
    pub id: String,
    pub path: String,
    pub score: f32,
}

#[derive(Debug, Clone, Serialize)]
pub struct Snippet {
    pub text: String,
    pub citation: Citation,
}

#[derive(Debug, Clone, Serialize)]
pub struct GlossaryEntry {
    pub term: String,
    pub def: String,
    pub citation: Citation,
}

#[derive(Debug, Clone, Serialize)]
pub struct CompiledContext {
    pub outline: Vec<String>,
    pub core_snippets: Vec<Snippet>,
    pub glossary: Vec<GlossaryEntry>,
    pub risks: Vec<String>,
    pub citations: Vec<Citation>,
    pub token_estimate: usize,
}

impl CompiledContext {
    /// Canonical JSON for the replay log's output hash.
    pub fn canonical_json(&self) -> String {
        serde_json::to_string(self).expect("compiled context serializes")
    }
}

/// Compile reranked hits into a context package within `max_tokens`.
pub fn compile(
    hits: &[Hit],
    vectors: &[Vec<f32>],
    max_tokens: usize,
    warnings: &[String],
) -> CompiledContext {
    let budget = max_tokens.max(1);
    let outline_budget = (budget as f64 * OUTLINE_SHARE) as usize;
    let snippet_budget = (budget as f64 * SNIPPET_SHARE) as usize;
    let glossary_budget = (budget as f64 * GLOSSARY_SHARE) as usize;
    let risk_budget = budget
        .saturating_sub(outline_budget)
        .saturating_sub(snippet_budget)
        .saturating_sub(glossary_budget);

    // 1. Drop snippets without a citable id, then near-duplicates
    //    (cosine >= 0.95 against anything already kept).
    let mut kept: Vec<&Hit> = Vec::new();
    for hit in hits {
        if hit.id.trim().is_empty() {
            continue;
        }
        let duplicate = kept.iter().any(|prev| {
            match (vectors.get(hit.row), vectors.get(prev.row)) {
                (Some(a), Some(b)) => cosine_similarity(a, b) >= DEDUP_COSINE,
                _ => false,
            }
        });
        if !duplicate {
            kept.push(hit);
        }
    }

    // 2. Section affinity: group by the path's directory prefix, groups
    //    ordered by their best score, snippets within a group by score then
    //    id.
    let mut groups: Vec<(String, Vec<&Hit>)> = Vec::new();
    for hit in &kept {
        let section = section_of(&hit.path);
        match groups.iter_mut().find(|(name, _)| *name == section) {
            Some((_, members)) => members.push(hit),
            None => groups.push((section, vec![hit])),
        }
    }
    for (_, members) in groups.iter_mut() {
        members.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.id.cmp(&b.id))
        });
    }
    groups.sort_by(|(_, a), (_, b)| {
        let best_a = a.first().map(|h| h.score).unwrap_or(f32::NEG_INFINITY);
        let best_b = b.first().map(|h| h.score).unwrap_or(f32::NEG_INFINITY);
        best_b
            .partial_cmp(&best_a)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    let ordered: Vec<&Hit> = groups
        .iter()
        .flat_map(|(_, members)| members.iter().copied())
        .collect();

    // 3. Greedy pack: selection prefers high score-weighted length, output
    //    keeps the affinity order.
    let mut by_weight: Vec<(usize, f64)> = ordered
        .iter()
        .enumerate()
        .map(|(pos, hit)| {
            let tokens = count_tokens(&hit.text) as f64;
            (pos, f64::from(hit.score.max(0.0)) * tokens)
        })
        .collect();
    by_weight.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.0.cmp(&b.0))
    });
    let mut selected = vec![false; ordered.len()];
    let mut snippet_tokens = 0usize;
    for (pos, _) in by_weight {
        let tokens = count_tokens(&ordered[pos].text);
        if snippet_tokens + tokens > snippet_budget {
            continue;
        }
        snippet_tokens += tokens;
        selected[pos] = true;
    }

    let core_snippets: Vec<Snippet> = ordered
        .iter()
        .enumerate()
        .filter(|(pos, _)| selected[*pos])
        .map(|(_, hit)| Snippet {
            text: hit.text.clone(),
            citation: Citation {
                id: hit.id.clone(),
                path: hit.path.clone(),
                score: hit.score,
            },
        })
        .collect();

    // Outline: section titles of included snippets, affinity order.
    let mut outline: Vec<String> = Vec::new();
    let mut outline_tokens = 0usize;
    for snippet in &core_snippets {
        let section = section_of(&snippet.citation.path);
        if outline.contains(&section) {
            continue;
        }
        let cost = count_tokens(&section).max(1);
        if outline_tokens + cost > outline_budget {
            break;
        }
        outline_tokens += cost;
        outline.push(section);
    }

    // Glossary: long distinctive terms from included snippets, each defined
    // by the sentence it first appears in.
    let mut glossary: Vec<GlossaryEntry> = Vec::new();
    let mut glossary_tokens = 0usize;
    'outer: for snippet in &core_snippets {
        for term in crate::tokenizer::tokenize(&snippet.text) {
            if term.len() < 6 || glossary.iter().any(|g| g.term == term) {
                continue;
            }
            let def = defining_sentence(&snippet.text, &term);
            let cost = count_tokens(&def) + 1;
            if glossary_tokens + cost > glossary_budget {
                break 'outer;
            }
            glossary_tokens += cost;
            glossary.push(GlossaryEntry {
                term,
                def,
                citation: snippet.citation.clone(),
            });
            if glossary.len() >= 12 {
                break 'outer;
            }
        }
    }

    // Risks: pipeline warnings, budget-capped.
    let mut risks: Vec<String> = Vec::new();
    let mut risk_tokens = 0usize;
    for warning in warnings {
        let cost = count_tokens(warning).max(1);
        if risk_tokens + cost > risk_budget {
            break;
        }
        risk_tokens += cost;
        risks.push(warning.clone());
    }
    if core_snippets.is_empty() && risk_tokens + 3 <= risk_budget.max(3) {
        risks.push("no_snippets_within_budget".to_string());
    }

    let citations: Vec<Citation> = core_snippets.iter().map(|s| s.citation.clone()).collect();
    CompiledContext {
        outline,
        core_snippets,
        glossary,
        risks,
        citations,
        token_estimate: outline_tokens + snippet_tokens + glossary_tokens + risk_tokens,
    }
}

fn section_of(path: &str) -> String {
    match path.rsplit_once('/') {
        Some((dir, _)) => dir.to_string(),
        None => path.to_string(),
    }
}

fn defining_sentence(text: &str, term: &str) -> String {
    let lower = text.to_lowercase();
    for sentence in lower.split(['.', '\n']) {
        if sentence.contains(term) {
            let trimmed = sentence.trim();
            if !trimmed.is_empty() {
                let mut def: String = trimmed.chars().take(160).collect();
                if trimmed.chars().count() > 160 {
                    def.push('…');
                }
                return def;
            }
        }
    }
    term.to_string()
}
