//! Python AST chunker: function and class boundaries.

use anyhow::Result;
use tree_sitter::Node;

use crate::config::ChunkingConfig;

use super::treesitter::parse;
use super::ChunkPiece;

/// Cut a Python module at function/class boundaries.
///
/// Top-level `def`s become `"<name>"` pieces; methods become
/// `"<Class>.<method>"` pieces with the class header (decorators, bases,
/// class-level assignments, docstring) emitted as its own `"<Class>"` piece.
/// Module-level statements before the first definition are emitted only when
/// `include_source_preamble` is set; statements between definitions are kept
/// as unnamed pieces so no text is lost.
pub fn chunk(text: &str, config: &ChunkingConfig) -> Result<Vec<ChunkPiece>> {
    let tree = parse(text, ".py")?;
    let root = tree.root_node();

    let mut pieces: Vec<ChunkPiece> = Vec::new();
    let mut interstitial: Vec<&str> = Vec::new();
    let mut seen_definition = false;

    let mut cursor = root.walk();
    for child in root.named_children(&mut cursor) {
        match unwrap_decorated(child) {
            ("function_definition", node) => {
                flush_interstitial(
                    &mut pieces,
                    &mut interstitial,
                    seen_definition || config.include_source_preamble,
                );
                seen_definition = true;
                let name = node_name(node, text).unwrap_or_else(|| "def".to_string());
                pieces.push(ChunkPiece::named(slice(text, child), name));
            }
            ("class_definition", node) => {
                flush_interstitial(
                    &mut pieces,
                    &mut interstitial,
                    seen_definition || config.include_source_preamble,
                );
                seen_definition = true;
                let class_name = node_name(node, text).unwrap_or_else(|| "class".to_string());
                emit_class(node, child, text, &class_name, &mut pieces);
            }
            _ => interstitial.push(slice(text, child)),
        }
    }
    flush_interstitial(
        &mut pieces,
        &mut interstitial,
        seen_definition || config.include_source_preamble,
    );

    if pieces.is_empty() {
        anyhow::bail!("no python definitions or statements");
    }
    Ok(pieces)
}

/// Decorated definitions wrap the real node; return (kind, definition node)
/// while keeping the outer node for text extraction.
fn unwrap_decorated(node: Node<'_>) -> (&'static str, Node<'_>) {
    if node.kind() == "decorated_definition" {
        if let Some(def) = node.child_by_field_name("definition") {
            if def.kind() == "function_definition" {
                return ("function_definition", def);
            }
            if def.kind() == "class_definition" {
                return ("class_definition", def);
            }
        }
    }
    (node.kind(), node)
}

fn emit_class(
    class_node: Node<'_>,
    outer: Node<'_>,
    src: &str,
    class_name: &str,
    pieces: &mut Vec<ChunkPiece>,
) {
    let Some(body) = class_node.child_by_field_name("body") else {
        pieces.push(ChunkPiece::named(slice(src, outer), class_name));
        return;
    };

    // Class header: everything from the (possibly decorated) class start to
    // the first method, covering bases, docstring, and class attributes.
    let mut methods: Vec<(Node<'_>, String)> = Vec::new();
    let mut cursor = body.walk();
    for member in body.named_children(&mut cursor) {
        let (kind, def) = unwrap_decorated(member);
        if kind == "function_definition" {
            let name = node_name(def, src).unwrap_or_else(|| "def".to_string());
            methods.push((member, format!("{}.{}", class_name, name)));
        }
    }

    match methods.first() {
        None => pieces.push(ChunkPiece::named(slice(src, outer), class_name)),
        Some((first, _)) => {
            let header = src[outer.start_byte()..first.start_byte()].trim_end();
            if !header.trim().is_empty() {
                pieces.push(ChunkPiece::named(header, class_name));
            }
            for (node, symbol) in methods {
                pieces.push(ChunkPiece::named(slice(src, node), symbol));
            }
        }
    }
}

fn flush_interstitial(pieces: &mut Vec<ChunkPiece>, buffer: &mut Vec<&str>, keep: bool) {
    if buffer.is_empty() {
        return;
    }
    if keep {
        let joined = buffer.join("\n");
        if !joined.trim().is_empty() {
            pieces.push(ChunkPiece::plain(joined));
        }
    }
    buffer.clear();
}

fn node_name(node: Node<'_>, src: &str) -> Option<String> {
    let name = node.child_by_field_name("name")?;
    Some(src.get(name.byte_range())?.to_string())
}

fn slice<'a>(src: &'a str, node: Node<'_>) -> &'a str {
    &src[node.byte_range()]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ChunkingConfig {
        ChunkingConfig {
            chunk_tokens: 64,
            overlap_tokens: 0,
            hard_cap_tokens: 256,
            ..ChunkingConfig::default()
        }
    }

    #[test]
    fn test_top_level_functions() {
        let src = "def f():\n    pass\n\ndef g():\n    return 1\n";
        let pieces = chunk(src, &config()).unwrap();
        assert_eq!(pieces.len(), 2);
        assert_eq!(pieces[0].symbol.as_deref(), Some("f"));
        assert_eq!(pieces[1].symbol.as_deref(), Some("g"));
    }

    #[test]
    fn test_class_methods_get_dotted_symbols() {
        let src = "class Router:\n    \"\"\"Docs.\"\"\"\n\n    table = {}\n\n    def dispatch(self):\n        pass\n\n    def register(self, k):\n        pass\n";
        let pieces = chunk(src, &config()).unwrap();
        let symbols: Vec<&str> = pieces.iter().filter_map(|p| p.symbol.as_deref()).collect();
        assert!(symbols.contains(&"Router"));
        assert!(symbols.contains(&"Router.dispatch"));
        assert!(symbols.contains(&"Router.register"));
    }

    #[test]
    fn test_preamble_gated_by_config() {
        let src = "import os\n\nVERSION = \"1.0\"\n\ndef main():\n    pass\n";
        let without = chunk(src, &config()).unwrap();
        assert!(!without.iter().any(|p| p.text.contains("import os")));

        let mut cfg = config();
        cfg.include_source_preamble = true;
        let with = chunk(src, &cfg).unwrap();
        assert!(with.iter().any(|p| p.text.contains("import os")));
    }

    #[test]
    fn test_decorated_function() {
        let src = "@cached\ndef expensive():\n    return compute()\n";
        let pieces = chunk(src, &config()).unwrap();
        assert_eq!(pieces[0].symbol.as_deref(), Some("expensive"));
        assert!(pieces[0].text.contains("@cached"));
    }

    #[test]
    fn test_deterministic() {
        let src = "def a():\n    pass\n\nclass B:\n    def m(self):\n        pass\n";
        let one = chunk(src, &config()).unwrap();
        let two = chunk(src, &config()).unwrap();
        assert_eq!(one.len(), two.len());
        for (x, y) in one.iter().zip(two.iter()) {
            assert_eq!(x.text, y.text);
            assert_eq!(x.symbol, y.symbol);
        }
    }
}
