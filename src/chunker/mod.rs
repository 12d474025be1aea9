//! Chunking strategies and the extension router.
//!
//! Every source file is cut into [`Chunk`]s by exactly one strategy, selected
//! by file extension with a fallback chain:
//!
//! ```text
//! route(ext) ─► strategy ──parse error──► brace_fallback ──► text
//! ```
//!
//! A file is never skipped: the text strategy accepts anything.
//!
//! # Strategies
//!
//! | Strategy | Extensions | Boundary |
//! |----------|------------|----------|
//! | `python_ast` | `.py` | function / class definitions |
//! | `java` | `.java` | method scope |
//! | `treesitter_generic` | `.rs .go .js .jsx .mjs .cjs .ts .tsx .c .h .cpp .cc .cxx .hpp .hh` | syntax-tree sections |
//! | `markdown` | `.md .markdown` | header hierarchy |
//! | `text` | `.txt .rst` + unknown | token-budget line windows |
//! | `brace_fallback` | `.cs .kt .swift .scala` + parse failures | C-style braces |
//!
//! # Guarantees
//!
//! - Deterministic output for a fixed input.
//! - `Chunk::hash` is stable across runs.
//! - Consecutive chunks overlap by at most `overlap_tokens`.
//! - No chunk exceeds `hard_cap_tokens`.

mod braces;
mod java;
mod markdown;
mod python;
mod text;
mod treesitter;

use std::collections::HashMap;

use anyhow::Result;

use crate::config::ChunkingConfig;
use crate::models::{Chunk, ChunkMetadata};
use crate::tokenizer::count_tokens;

/// Intermediate output of a strategy, before ids are assigned.
#[derive(Debug, Clone)]
pub struct ChunkPiece {
    pub text: String,
    /// Symbol path for AST strategies (e.g. `"Router.dispatch"`).
    pub symbol: Option<String>,
}

impl ChunkPiece {
    pub fn plain(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            symbol: None,
        }
    }

    pub fn named(text: impl Into<String>, symbol: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            symbol: Some(symbol.into()),
        }
    }
}

/// Chunking strategy names, closed set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    PythonAst,
    Java,
    TreesitterGeneric,
    Markdown,
    Text,
    BraceFallback,
}

impl Strategy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PythonAst => "python_ast",
            Self::Java => "java",
            Self::TreesitterGeneric => "treesitter_generic",
            Self::Markdown => "markdown",
            Self::Text => "text",
            Self::BraceFallback => "brace_fallback",
        }
    }
}

/// Extensions accepted by the build scanner. Closed set; everything else is
/// ignored during the scan.
pub const SUPPORTED_EXTS: &[&str] = &[
    ".py", ".java", ".rs", ".go", ".js", ".jsx", ".mjs", ".cjs", ".ts", ".tsx", ".c", ".h",
    ".cpp", ".cc", ".cxx", ".hpp", ".hh", ".cs", ".kt", ".swift", ".scala", ".md", ".markdown",
    ".txt", ".rst",
];

/// Route an extension (lowercased, with dot) to its chunking strategy.
/// Unknown extensions route to `text`.
pub fn route(ext: &str) -> Strategy {
    match ext {
        ".py" => Strategy::PythonAst,
        ".java" => Strategy::Java,
        ".rs" | ".go" | ".js" | ".jsx" | ".mjs" | ".cjs" | ".ts" | ".tsx" | ".c" | ".h"
        | ".cpp" | ".cc" | ".cxx" | ".hpp" | ".hh" => Strategy::TreesitterGeneric,
        ".md" | ".markdown" => Strategy::Markdown,
        ".cs" | ".kt" | ".swift" | ".scala" => Strategy::BraceFallback,
        _ => Strategy::Text,
    }
}

fn run_strategy(
    strategy: Strategy,
    text: &str,
    ext: &str,
    config: &ChunkingConfig,
) -> Result<Vec<ChunkPiece>> {
    match strategy {
        Strategy::PythonAst => python::chunk(text, config),
        Strategy::Java => java::chunk(text, config),
        Strategy::TreesitterGeneric => treesitter::chunk(text, ext, config),
        Strategy::Markdown => Ok(markdown::chunk(text, config)),
        Strategy::Text => Ok(text::chunk(text, config)),
        Strategy::BraceFallback => braces::chunk(text, config),
    }
}

/// Cut one file into chunks.
///
/// Applies the routed strategy with the `brace_fallback` → `text` fallback
/// chain, enforces the hard token cap, optionally expands hierarchical
/// micro-chunks, and assigns packet-unique ids.
pub fn chunk_file(
    text: &str,
    source_path: &str,
    ext: &str,
    config: &ChunkingConfig,
) -> Vec<Chunk> {
    let strategy = route(ext);
    let pieces = run_strategy(strategy, text, ext, config)
        .or_else(|err| {
            tracing::debug!(path = source_path, strategy = strategy.as_str(), %err, "strategy failed, trying brace fallback");
            run_strategy(Strategy::BraceFallback, text, ext, config)
        })
        .unwrap_or_else(|err| {
            tracing::debug!(path = source_path, %err, "brace fallback failed, using text");
            text::chunk(text, config)
        });

    let pieces = enforce_hard_cap(pieces, config);
    let pieces = expand_hierarchy(pieces, config);
    assign_ids(pieces, source_path, ext)
}

/// Split any piece above `hard_cap_tokens` into line windows that fit.
fn enforce_hard_cap(pieces: Vec<ChunkPiece>, config: &ChunkingConfig) -> Vec<ChunkPiece> {
    let cap = config.hard_cap_tokens.max(1);
    let mut out = Vec::with_capacity(pieces.len());
    for piece in pieces {
        if count_tokens(&piece.text) <= cap {
            out.push(piece);
            continue;
        }
        for window in text::window_text(&piece.text, cap, 0) {
            out.push(ChunkPiece {
                text: window,
                symbol: piece.symbol.clone(),
            });
        }
    }
    out
}

/// When hierarchical chunking is on, split large pieces into micro windows,
/// keeping the parent alongside them when `emit_parent_chunks` is set.
fn expand_hierarchy(pieces: Vec<ChunkPiece>, config: &ChunkingConfig) -> Vec<ChunkPiece> {
    if !config.hierarchical {
        return pieces;
    }
    let micro = config.micro_chunk_tokens.max(1);
    let mut out = Vec::with_capacity(pieces.len());
    for piece in pieces {
        if count_tokens(&piece.text) <= micro {
            out.push(piece);
            continue;
        }
        if config.emit_parent_chunks {
            out.push(piece.clone());
        }
        for window in text::window_text(&piece.text, micro, 0) {
            out.push(ChunkPiece {
                text: window,
                symbol: piece.symbol.clone(),
            });
        }
    }
    out
}

fn assign_ids(pieces: Vec<ChunkPiece>, source_path: &str, ext: &str) -> Vec<Chunk> {
    let mut plain_index = 0usize;
    let mut symbol_ords: HashMap<String, usize> = HashMap::new();
    let mut chunks = Vec::with_capacity(pieces.len());
    for piece in pieces {
        if piece.text.trim().is_empty() {
            continue;
        }
        let id = match &piece.symbol {
            Some(symbol) => {
                let ord = symbol_ords.entry(symbol.clone()).or_insert(0);
                let id = format!("{}:{}:{}", source_path, symbol, ord);
                *ord += 1;
                id
            }
            None => {
                let id = format!("{}:{}", source_path, plain_index);
                plain_index += 1;
                id
            }
        };
        chunks.push(Chunk::new(
            id,
            piece.text,
            ChunkMetadata {
                path: source_path.to_string(),
                ext: ext.to_string(),
                symbol: piece.symbol,
            },
        ));
    }
    chunks
}
