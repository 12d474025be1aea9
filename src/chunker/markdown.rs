//! Markdown chunker: sections follow the header hierarchy.

use crate::config::ChunkingConfig;

use super::text::window_text;
use super::ChunkPiece;

/// Split markdown into header-delimited sections, windowing any section that
/// exceeds the chunk token budget. Text before the first header becomes its
/// own section.
pub fn chunk(text: &str, config: &ChunkingConfig) -> Vec<ChunkPiece> {
    let mut sections: Vec<String> = Vec::new();
    let mut current: Vec<&str> = Vec::new();

    for line in text.lines() {
        if header_level(line).is_some() && !current.is_empty() {
            sections.push(current.join("\n"));
            current.clear();
        }
        current.push(line);
    }
    if !current.is_empty() {
        sections.push(current.join("\n"));
    }

    let mut pieces = Vec::new();
    for section in sections {
        if section.trim().is_empty() {
            continue;
        }
        for window in window_text(&section, config.chunk_tokens, config.overlap_tokens) {
            pieces.push(ChunkPiece::plain(window));
        }
    }
    pieces
}

/// ATX header level (1-6), or None for a non-header line.
fn header_level(line: &str) -> Option<usize> {
    let trimmed = line.trim_start();
    let hashes = trimmed.chars().take_while(|&c| c == '#').count();
    if (1..=6).contains(&hashes) && trimmed.chars().nth(hashes).is_none_or(|c| c == ' ') {
        Some(hashes)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ChunkingConfig {
        ChunkingConfig {
            chunk_tokens: 64,
            overlap_tokens: 0,
            hard_cap_tokens: 128,
            ..ChunkingConfig::default()
        }
    }

    #[test]
    fn test_sections_follow_headers() {
        let text = "# One\nalpha\n\n## Two\nbeta\n\n# Three\ngamma\n";
        let pieces = chunk(text, &config());
        assert_eq!(pieces.len(), 3);
        assert!(pieces[0].text.starts_with("# One"));
        assert!(pieces[1].text.starts_with("## Two"));
        assert!(pieces[2].text.starts_with("# Three"));
    }

    #[test]
    fn test_preamble_before_first_header() {
        let text = "intro text\n\n# First\nbody\n";
        let pieces = chunk(text, &config());
        assert_eq!(pieces.len(), 2);
        assert!(pieces[0].text.starts_with("intro text"));
    }

    #[test]
    fn test_header_detection() {
        assert_eq!(header_level("# h1"), Some(1));
        assert_eq!(header_level("### h3"), Some(3));
        assert_eq!(header_level("#nospace"), None);
        assert_eq!(header_level("####### too deep"), None);
        assert_eq!(header_level("plain"), None);
    }

    #[test]
    fn test_long_section_windowed() {
        let body = (0..200).map(|i| format!("w{}", i)).collect::<Vec<_>>().join(" ");
        let text = format!("# Big\n{}", body);
        let pieces = chunk(&text, &config());
        assert!(pieces.len() > 1);
    }
}
