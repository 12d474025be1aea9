//! Java chunker: method scope within class declarations.

use anyhow::Result;
use tree_sitter::Node;

use crate::config::ChunkingConfig;

use super::treesitter::parse;
use super::ChunkPiece;

/// Cut a Java compilation unit at method scope.
///
/// Each method and constructor becomes a `"<Class>.<method>"` piece; the
/// class header (javadoc, annotations, fields, nested type signatures up to
/// the first method) becomes a `"<Class>"` piece. Package and import
/// declarations are the preamble, gated by `include_source_preamble`.
pub fn chunk(text: &str, config: &ChunkingConfig) -> Result<Vec<ChunkPiece>> {
    let tree = parse(text, ".java")?;
    let root = tree.root_node();

    let mut pieces: Vec<ChunkPiece> = Vec::new();
    let mut preamble: Vec<&str> = Vec::new();
    let mut seen_type = false;

    let mut cursor = root.walk();
    for child in root.named_children(&mut cursor) {
        match child.kind() {
            "class_declaration" | "interface_declaration" | "enum_declaration"
            | "record_declaration" => {
                if !seen_type && config.include_source_preamble && !preamble.is_empty() {
                    pieces.push(ChunkPiece::plain(preamble.join("\n")));
                }
                preamble.clear();
                seen_type = true;
                emit_type(child, text, &mut pieces);
            }
            _ => preamble.push(&text[child.byte_range()]),
        }
    }

    if pieces.is_empty() {
        anyhow::bail!("no java type declarations");
    }
    Ok(pieces)
}

fn emit_type(node: Node<'_>, src: &str, pieces: &mut Vec<ChunkPiece>) {
    let type_name = node
        .child_by_field_name("name")
        .and_then(|n| src.get(n.byte_range()))
        .unwrap_or("type")
        .to_string();

    let Some(body) = node.child_by_field_name("body") else {
        pieces.push(ChunkPiece::named(&src[node.byte_range()], type_name));
        return;
    };

    let mut methods: Vec<(Node<'_>, String)> = Vec::new();
    let mut cursor = body.walk();
    for member in body.named_children(&mut cursor) {
        match member.kind() {
            "method_declaration" | "constructor_declaration" => {
                let name = member
                    .child_by_field_name("name")
                    .and_then(|n| src.get(n.byte_range()))
                    .unwrap_or("method");
                methods.push((member, format!("{}.{}", type_name, name)));
            }
            "class_declaration" | "interface_declaration" | "enum_declaration" => {
                // Nested types get their own method-scope pieces.
                emit_type(member, src, pieces);
            }
            _ => {}
        }
    }

    match methods.first() {
        None => pieces.push(ChunkPiece::named(&src[node.byte_range()], type_name)),
        Some((first, _)) => {
            let header = src[node.start_byte()..first.start_byte()].trim_end();
            if !header.trim().is_empty() {
                pieces.push(ChunkPiece::named(header, type_name.clone()));
            }
            for (method, symbol) in methods {
                pieces.push(ChunkPiece::named(&src[method.byte_range()], symbol));
            }
        }
    }
}
