//! Token-budget line windows, the universal fallback strategy.

use crate::config::ChunkingConfig;
use crate::tokenizer::count_tokens;

use super::ChunkPiece;

/// Split text into line windows of at most `chunk_tokens` tokens, with
/// consecutive windows sharing at most `overlap_tokens` of trailing lines.
pub fn chunk(text: &str, config: &ChunkingConfig) -> Vec<ChunkPiece> {
    window_text(text, config.chunk_tokens, config.overlap_tokens)
        .into_iter()
        .map(ChunkPiece::plain)
        .collect()
}

/// Line-window splitter shared with the hard-cap and micro-chunk passes.
///
/// A single line that alone exceeds `max_tokens` is split at whitespace
/// boundaries so the cap always holds.
pub fn window_text(text: &str, max_tokens: usize, overlap_tokens: usize) -> Vec<String> {
    let max_tokens = max_tokens.max(1);
    let overlap_tokens = overlap_tokens.min(max_tokens.saturating_sub(1));

    let mut lines: Vec<String> = Vec::new();
    for line in text.lines() {
        if count_tokens(line) > max_tokens {
            lines.extend(split_long_line(line, max_tokens));
        } else {
            lines.push(line.to_string());
        }
    }

    let mut windows: Vec<String> = Vec::new();
    let mut buf: Vec<String> = Vec::new();
    let mut buf_tokens = 0usize;

    for line in lines {
        let line_tokens = count_tokens(&line);
        if buf_tokens + line_tokens > max_tokens && !buf.is_empty() {
            flush(&mut windows, &buf);
            let keep = overlap_lines(&buf, overlap_tokens);
            buf = keep;
            buf_tokens = buf.iter().map(|l| count_tokens(l)).sum();
        }
        buf_tokens += line_tokens;
        buf.push(line);
    }
    flush(&mut windows, &buf);

    if windows.is_empty() && !text.trim().is_empty() {
        windows.push(text.trim().to_string());
    }
    windows
}

fn flush(windows: &mut Vec<String>, buf: &[String]) {
    let joined = buf.join("\n");
    if !joined.trim().is_empty() {
        windows.push(joined.trim_end().to_string());
    }
}

/// Trailing lines of the previous window worth at most `overlap_tokens`.
fn overlap_lines(buf: &[String], overlap_tokens: usize) -> Vec<String> {
    if overlap_tokens == 0 {
        return Vec::new();
    }
    let mut keep: Vec<String> = Vec::new();
    let mut tokens = 0usize;
    for line in buf.iter().rev() {
        let line_tokens = count_tokens(line);
        if tokens + line_tokens > overlap_tokens {
            break;
        }
        tokens += line_tokens;
        keep.push(line.clone());
    }
    keep.reverse();
    keep
}

fn split_long_line(line: &str, max_tokens: usize) -> Vec<String> {
    let words: Vec<&str> = line.split_whitespace().collect();
    words
        .chunks(max_tokens)
        .map(|group| group.join(" "))
        .collect()
}
