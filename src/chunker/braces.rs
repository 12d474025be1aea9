//! Brace fallback: C-style block boundaries without a parser.

use anyhow::Result;

use crate::config::ChunkingConfig;
use crate::tokenizer::count_tokens;

use super::ChunkPiece;

/// Split at top-level closing braces, merging small blocks up to the chunk
/// token budget. Used when no grammar is available or a parse failed.
pub fn chunk(text: &str, config: &ChunkingConfig) -> Result<Vec<ChunkPiece>> {
    let blocks = top_level_blocks(text);
    if blocks.is_empty() {
        anyhow::bail!("no top-level blocks");
    }

    let mut pieces: Vec<ChunkPiece> = Vec::new();
    let mut buf = String::new();
    let mut buf_tokens = 0usize;

    for block in blocks {
        let block_tokens = count_tokens(&block);
        if buf_tokens + block_tokens > config.chunk_tokens && !buf.is_empty() {
            pieces.push(ChunkPiece::plain(buf.trim_end().to_string()));
            buf.clear();
            buf_tokens = 0;
        }
        if !buf.is_empty() {
            buf.push('\n');
        }
        buf.push_str(&block);
        buf_tokens += block_tokens;
    }
    if !buf.trim().is_empty() {
        pieces.push(ChunkPiece::plain(buf.trim_end().to_string()));
    }
    Ok(pieces)
}

/// Cut the text into segments that close at brace depth zero. String and
/// char literals are skipped so braces inside them don't count.
fn top_level_blocks(text: &str) -> Vec<String> {
    let mut blocks = Vec::new();
    let mut depth = 0i32;
    let mut start = 0usize;
    let mut in_string: Option<char> = None;
    let mut escaped = false;
    let bytes = text.as_bytes();

    for (i, &b) in bytes.iter().enumerate() {
        let c = b as char;
        if let Some(quote) = in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == quote {
                in_string = None;
            }
            continue;
        }
        match c {
            '"' | '\'' => in_string = Some(c),
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth <= 0 {
                    depth = 0;
                    let segment = &text[start..=i];
                    if !segment.trim().is_empty() {
                        blocks.push(segment.trim_matches('\n').to_string());
                    }
                    start = i + 1;
                }
            }
            _ => {}
        }
    }
    if start < text.len() {
        let tail = &text[start..];
        if !tail.trim().is_empty() {
            blocks.push(tail.trim_matches('\n').to_string());
        }
    }
    blocks
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ChunkingConfig {
        ChunkingConfig {
            chunk_tokens: 16,
            overlap_tokens: 0,
            hard_cap_tokens: 64,
            ..ChunkingConfig::default()
        }
    }

    #[test]
    fn test_splits_at_top_level_braces() {
        let text = "void a() { x = 1; }\nvoid b() { y = 2; if (y) { y++; } }\n";
        let blocks = top_level_blocks(text);
        assert_eq!(blocks.len(), 2);
        assert!(blocks[0].contains("void a"));
        assert!(blocks[1].contains("void b"));
    }

    #[test]
    fn test_braces_in_strings_ignored() {
        let text = "void a() { s = \"{not a block}\"; }\nvoid b() { }\n";
        let blocks = top_level_blocks(text);
        assert_eq!(blocks.len(), 2);
    }

    #[test]
    fn test_empty_input_errors() {
        assert!(chunk("", &config()).is_err());
    }

    #[test]
    fn test_merges_small_blocks() {
        let text = "int a() { return 1; }\nint b() { return 2; }\n";
        let pieces = chunk(text, &config()).unwrap();
        assert_eq!(pieces.len(), 1);
        assert!(pieces[0].text.contains("int a"));
        assert!(pieces[0].text.contains("int b"));
    }
}
