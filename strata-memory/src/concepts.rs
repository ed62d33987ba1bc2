//! Concept extraction for the graph tier.
//!
//! The extractor is a seam: the default implementation matches a curated
//! technology vocabulary, which is all the provenance graph needs, but a
//! deployment can swap in anything that implements [`ConceptExtractor`].

use std::collections::HashSet;
use std::sync::LazyLock;

use aho_corasick::AhoCorasick;
use strata_common::{Error, Result};

/// Extracts graph-worthy concepts from record content.
pub trait ConceptExtractor: Send + Sync {
    /// All distinct concepts in the text, in first-occurrence order, in the
    /// casing found in the text.
    fn extract(&self, text: &str) -> Vec<String>;

    /// Categorical tag applied to concepts this extractor produces.
    fn concept_type(&self) -> &str {
        "technology"
    }

    /// The first concept in the text, if any.
    fn first_concept(&self, text: &str) -> Option<String> {
        self.extract(text).into_iter().next()
    }
}

/// Curated terms the default extractor recognizes. Substring matching is
/// intentional so "PostgreSQL migration" and "postgres-based" both register;
/// the graph cares about topics, not token boundaries.
pub const DEFAULT_VOCABULARY: &[&str] = &[
    "postgresql",
    "mongodb",
    "mysql",
    "redis",
    "neo4j",
    "qdrant",
    "microservices",
    "monolith",
    "api",
    "rest",
    "graphql",
    "react",
    "vue",
    "angular",
    "node",
    "python",
    "typescript",
    "docker",
    "kubernetes",
    "aws",
    "azure",
    "gcp",
    "security",
    "authentication",
    "authorization",
    "oauth",
    "testing",
    "deployment",
    "ci/cd",
    "monitoring",
];

// The built-in vocabulary is static; a build failure would be a programming
// error caught by every test that touches extraction.
static DEFAULT_MATCHER: LazyLock<AhoCorasick> = LazyLock::new(|| {
    AhoCorasick::builder()
        .ascii_case_insensitive(true)
        .build(DEFAULT_VOCABULARY)
        .unwrap()
});

/// Case-insensitive substring matcher over a fixed vocabulary.
#[derive(Debug, Clone)]
pub struct VocabularyExtractor {
    matcher: AhoCorasick,
}

impl VocabularyExtractor {
    /// Build an extractor over a custom vocabulary.
    pub fn new<I, P>(vocabulary: I) -> Result<Self>
    where
        I: IntoIterator<Item = P>,
        P: AsRef<[u8]>,
    {
        let matcher = AhoCorasick::builder()
            .ascii_case_insensitive(true)
            .build(vocabulary)
            .map_err(|e| Error::Internal(format!("building concept matcher: {e}")))?;
        Ok(Self { matcher })
    }
}

impl Default for VocabularyExtractor {
    fn default() -> Self {
        Self {
            matcher: DEFAULT_MATCHER.clone(),
        }
    }
}

impl ConceptExtractor for VocabularyExtractor {
    fn extract(&self, text: &str) -> Vec<String> {
        let mut seen: HashSet<usize> = HashSet::new();
        let mut concepts = Vec::new();
        for m in self.matcher.find_iter(text) {
            if seen.insert(m.pattern().as_usize()) {
                concepts.push(text[m.range()].to_string());
            }
        }
        concepts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extracts_in_occurrence_order() {
        let extractor = VocabularyExtractor::default();
        let concepts = extractor.extract("We will use PostgreSQL behind a GraphQL api");
        assert_eq!(concepts, vec!["PostgreSQL", "GraphQL", "api"]);
    }

    #[test]
    fn test_preserves_found_casing() {
        let extractor = VocabularyExtractor::default();
        assert_eq!(extractor.extract("POSTGRESQL rocks"), vec!["POSTGRESQL"]);
        assert_eq!(extractor.extract("postgresql rocks"), vec!["postgresql"]);
    }

    #[test]
    fn test_dedupes_repeated_terms() {
        let extractor = VocabularyExtractor::default();
        let concepts = extractor.extract("docker docker DOCKER everywhere");
        assert_eq!(concepts, vec!["docker"]);
    }

    #[test]
    fn test_substring_matching() {
        let extractor = VocabularyExtractor::default();
        // "node" inside "node.js", "ci/cd" with its slash.
        let concepts = extractor.extract("node.js service with a ci/cd pipeline");
        assert!(concepts.iter().any(|c| c.eq_ignore_ascii_case("node")));
        assert!(concepts.iter().any(|c| c.eq_ignore_ascii_case("ci/cd")));
    }

    #[test]
    fn test_no_known_concepts() {
        let extractor = VocabularyExtractor::default();
        assert!(extractor.extract("lunch is at noon").is_empty());
        assert_eq!(extractor.first_concept("lunch is at noon"), None);
    }

    #[test]
    fn test_first_concept() {
        let extractor = VocabularyExtractor::default();
        assert_eq!(
            extractor.first_concept("Why did we pick Redis over MongoDB?"),
            Some("Redis".to_string())
        );
    }

    #[test]
    fn test_custom_vocabulary() {
        let extractor = VocabularyExtractor::new(["sqlite", "duckdb"]).unwrap();
        assert_eq!(extractor.extract("SQLite beats DuckDB here"), vec!["SQLite", "DuckDB"]);
        assert!(extractor.extract("postgresql").is_empty());
    }
}
