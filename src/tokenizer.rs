//! The shared tokenizer.
//!
//! One tokenizer is used everywhere token counts matter: cutting chunks,
//! building and querying the BM25 index, and context-compiler budget
//! accounting. Keeping these consistent is what makes the token budget of a
//! compiled context honest with respect to how chunks were cut.
//!
//! The tokenizer is a whitespace splitter with punctuation stripping and
//! lowercasing. It approximates a BPE vocabulary closely enough for window
//! sizing while staying deterministic and identical across build and query
//! time.

/// Split text into lowercase terms.
///
/// Terms are whitespace-separated runs with leading/trailing punctuation
/// stripped. Empty terms are dropped. The output is deterministic for a
/// fixed input.
pub fn tokenize(text: &str) -> Vec<String> {
    text.split_whitespace()
        .map(|raw| {
            raw.trim_matches(|c: char| !c.is_alphanumeric())
                .to_lowercase()
        })
        .filter(|t| !t.is_empty())
        .collect()
}

/// Count tokens in a text.
pub fn count_tokens(text: &str) -> usize {
    text.split_whitespace()
        .filter(|raw| raw.chars().any(|c| c.is_alphanumeric()))
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokenize_strips_punctuation() {
        assert_eq!(
            tokenize("Hello, World! (rust)"),
            vec!["hello", "world", "rust"]
        );
    }

    #[test]
    fn test_tokenize_empty() {
        assert!(tokenize("  ...  ").is_empty());
        assert!(tokenize("").is_empty());
    }

    #[test]
    fn test_count_matches_tokenize() {
        let text = "alpha beta: gamma, delta.";
        assert_eq!(count_tokens(text), tokenize(text).len());
    }

    #[test]
    fn test_deterministic() {
        let text = "The SAME text; tokenized twice.";
        assert_eq!(tokenize(text), tokenize(text));
    }
}
