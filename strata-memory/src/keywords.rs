//! Query keyword extraction for relevance scoring.
//!
//! Deliberately simple: lowercase tokens, drop stopwords and short words,
//! dedupe preserving order, cap the count. Matches the tag-overlap term of
//! the structured tier's scoring formula.

use std::sync::LazyLock;

use regex::Regex;

/// Tokens start alphanumeric and may continue with chars that appear inside
/// technical terms ("ci/cd", "node.js", "c++").
static TOKEN_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[a-z0-9][a-z0-9+./_-]*").unwrap());

/// English function words that never make useful keywords.
const STOPWORDS: &[&str] = &[
    "the", "a", "an", "and", "or", "but", "in", "on", "at", "to", "for", "of", "with", "by",
    "from", "is", "are", "was", "were", "be", "been", "being", "have", "has", "had", "do", "does",
    "did", "will", "would", "should", "could", "may", "might", "can", "this", "that", "these",
    "those",
];

const MAX_KEYWORDS: usize = 10;

fn is_stopword(word: &str) -> bool {
    STOPWORDS.contains(&word)
}

/// Extract up to [`MAX_KEYWORDS`] lowercase keywords from free text.
///
/// Keeps words longer than three characters that are not stopwords, in
/// first-occurrence order.
pub fn extract_keywords(text: &str) -> Vec<String> {
    let lowered = text.to_lowercase();
    let mut keywords: Vec<String> = Vec::new();

    for token in TOKEN_PATTERN.find_iter(&lowered) {
        let word = token
            .as_str()
            .trim_end_matches(|c: char| !c.is_ascii_alphanumeric());
        if word.len() <= 3 || is_stopword(word) {
            continue;
        }
        if !keywords.iter().any(|k| k == word) {
            keywords.push(word.to_string());
        }
        if keywords.len() == MAX_KEYWORDS {
            break;
        }
    }

    keywords
}
