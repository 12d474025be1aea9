//! Generic tree-sitter chunker: syntax-tree section boundaries.
//!
//! Covers every extension with a compiled grammar. Top-level declarations
//! become section boundaries; declarations larger than the chunk budget are
//! descended into so their members become boundaries instead. Trivia between
//! declarations (comments, blank lines) stays attached to the following
//! section, so the concatenation of all chunks covers the file.

use anyhow::{Context as _, Result};
use tree_sitter::{Language, Node, Parser};

use crate::config::ChunkingConfig;
use crate::tokenizer::count_tokens;

use super::ChunkPiece;

/// Grammar lookup for the generic strategy (and the AST strategies, which
/// share it).
pub fn language_for_ext(ext: &str) -> Option<Language> {
    match ext {
        ".py" => Some(tree_sitter_python::LANGUAGE.into()),
        ".java" => Some(tree_sitter_java::LANGUAGE.into()),
        ".rs" => Some(tree_sitter_rust::LANGUAGE.into()),
        ".go" => Some(tree_sitter_go::LANGUAGE.into()),
        ".js" | ".jsx" | ".mjs" | ".cjs" => Some(tree_sitter_javascript::LANGUAGE.into()),
        ".ts" => Some(tree_sitter_typescript::LANGUAGE_TYPESCRIPT.into()),
        ".tsx" => Some(tree_sitter_typescript::LANGUAGE_TSX.into()),
        ".c" | ".h" => Some(tree_sitter_c::LANGUAGE.into()),
        ".cpp" | ".cc" | ".cxx" | ".hpp" | ".hh" => Some(tree_sitter_cpp::LANGUAGE.into()),
        _ => None,
    }
}

/// Parse a file with the grammar for `ext` and return its root, via the
/// shared parser setup.
pub fn parse(text: &str, ext: &str) -> Result<tree_sitter::Tree> {
    let language =
        language_for_ext(ext).with_context(|| format!("no grammar for extension '{}'", ext))?;
    let mut parser = Parser::new();
    parser
        .set_language(&language)
        .context("incompatible grammar version")?;
    let tree = parser.parse(text, None).context("parser returned no tree")?;
    let root = tree.root_node();
    if root.named_child_count() == 0 && !text.trim().is_empty() {
        anyhow::bail!("parse produced no syntax nodes");
    }
    Ok(tree)
}

pub fn chunk(text: &str, ext: &str, config: &ChunkingConfig) -> Result<Vec<ChunkPiece>> {
    let tree = parse(text, ext)?;
    let root = tree.root_node();

    let mut sections: Vec<(std::ops::Range<usize>, Option<String>)> = Vec::new();
    collect_sections(root, text, config, 0, &mut sections);
    if sections.is_empty() {
        anyhow::bail!("no sections");
    }

    // Attach inter-node trivia to the following section and cover the file
    // end-to-end.
    let mut prev_end = 0usize;
    for section in sections.iter_mut() {
        if section.0.start > prev_end {
            section.0.start = prev_end;
        }
        prev_end = section.0.end;
    }
    if let Some(last) = sections.last_mut() {
        last.0.end = text.len();
    }

    // Merge consecutive small sections up to the chunk budget.
    let mut pieces: Vec<ChunkPiece> = Vec::new();
    let mut group: Option<(std::ops::Range<usize>, Option<String>, usize)> = None;
    for (range, symbol) in sections {
        let tokens = count_tokens(&text[range.clone()]);
        match group.take() {
            None => group = Some((range, symbol, tokens)),
            Some((grange, gsymbol, gtokens)) => {
                if gtokens + tokens <= config.chunk_tokens {
                    // A merged group spans several declarations, so it has
                    // no single symbol.
                    group = Some((grange.start..range.end, None, gtokens + tokens));
                } else {
                    push_piece(&mut pieces, text, grange, gsymbol);
                    group = Some((range, symbol, tokens));
                }
            }
        }
    }
    if let Some((grange, gsymbol, _)) = group {
        push_piece(&mut pieces, text, grange, gsymbol);
    }
    Ok(pieces)
}

fn push_piece(
    pieces: &mut Vec<ChunkPiece>,
    text: &str,
    range: std::ops::Range<usize>,
    symbol: Option<String>,
) {
    let slice = text[range].trim_matches('\n');
    if slice.trim().is_empty() {
        return;
    }
    pieces.push(ChunkPiece {
        text: slice.to_string(),
        symbol,
    });
}

fn collect_sections(
    node: Node<'_>,
    src: &str,
    config: &ChunkingConfig,
    depth: usize,
    out: &mut Vec<(std::ops::Range<usize>, Option<String>)>,
) {
    let mut cursor = node.walk();
    for child in node.named_children(&mut cursor) {
        let range = child.byte_range();
        let tokens = count_tokens(&src[range.clone()]);
        if tokens > config.chunk_tokens && child.named_child_count() > 1 && depth < 3 {
            collect_sections(child, src, config, depth + 1, out);
        } else {
            out.push((range, symbol_of(child, src)));
        }
    }
}

fn symbol_of(node: Node<'_>, src: &str) -> Option<String> {
    let name = node.child_by_field_name("name")?;
    let text = src.get(name.byte_range())?.trim();
    if text.is_empty() {
        None
    } else {
        Some(text.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ChunkingConfig {
        ChunkingConfig {
            chunk_tokens: 24,
            overlap_tokens: 0,
            hard_cap_tokens: 96,
            ..ChunkingConfig::default()
        }
    }

    #[test]
    fn test_rust_functions_become_sections() {
        let src = "fn alpha() -> u32 { let a = 1; let b = 2; let c = 3; a + b + c }\n\nfn beta() -> u32 { let x = 10; let y = 20; let z = 30; x * y * z }\n";
        let pieces = chunk(src, ".rs", &config()).unwrap();
        assert!(pieces.len() >= 2);
        assert!(pieces[0].text.contains("fn alpha"));
        assert!(pieces.iter().any(|p| p.text.contains("fn beta")));
    }

    #[test]
    fn test_symbols_extracted() {
        let src = "fn with_a_reasonably_long_body() { let a = 1; let b = 2; let c = 3; let d = 4; let e = 5; let f = a + b + c + d + e; println!(\"{}\", f); }\n";
        let pieces = chunk(src, ".rs", &config()).unwrap();
        assert!(pieces
            .iter()
            .any(|p| p.symbol.as_deref() == Some("with_a_reasonably_long_body")));
    }

    #[test]
    fn test_go_source() {
        let src = "package main\n\nfunc Add(a int, b int) int {\n\treturn a + b\n}\n";
        let pieces = chunk(src, ".go", &config()).unwrap();
        assert!(!pieces.is_empty());
        let combined: String = pieces.iter().map(|p| p.text.as_str()).collect();
        assert!(combined.contains("func Add"));
    }

    #[test]
    fn test_no_grammar_errors() {
        assert!(chunk("x", ".xyz", &config()).is_err());
    }

    #[test]
    fn test_trivia_preserved() {
        let src = "// leading comment about alpha and beta and gamma\nfn tiny() { let value = 1; let other = 2; let third = value + other; println!(\"{}\", third); }\n";
        let pieces = chunk(src, ".rs", &config()).unwrap();
        let combined: String = pieces.iter().map(|p| p.text.as_str()).collect::<Vec<_>>().join("\n");
        assert!(combined.contains("leading comment"));
    }
}
