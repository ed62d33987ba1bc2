//! Configuration for the memory system.
//!
//! Plain serde structs with field-level defaults so an empty `{}` document
//! yields a fully working local setup. The library never reads config files
//! itself; embedding processes deserialize from wherever they keep settings.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use strata_common::{Error, Result};

/// Top-level configuration aggregating every tier section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemoryConfig {
    #[serde(default)]
    pub hot: HotConfig,
    #[serde(default)]
    pub structured: StructuredConfig,
    #[serde(default)]
    pub vector: VectorConfig,
    #[serde(default)]
    pub graph: GraphConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub router: RouterConfig,
}

impl MemoryConfig {
    /// Reject configurations that would misbehave silently at runtime.
    pub fn validate(&self) -> Result<()> {
        self.structured.relevance.validate()?;
        if self.hot.recent_cap == 0 {
            return Err(Error::Validation("hot.recent_cap must be at least 1".into()));
        }
        if self.structured.max_thread_depth == 0 {
            return Err(Error::Validation(
                "structured.max_thread_depth must be at least 1".into(),
            ));
        }
        if !self.router.rrf_k.is_finite() || self.router.rrf_k <= 0.0 {
            return Err(Error::Validation(format!(
                "router.rrf_k must be positive, got {}",
                self.router.rrf_k
            )));
        }
        if self.embedding.dimensions == 0 {
            return Err(Error::Validation(
                "embedding.dimensions must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Redis-backed hot tier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HotConfig {
    #[serde(default = "default_redis_url")]
    pub url: String,
    /// Namespace prefix for every key this system touches.
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
    /// Recent-list cap per project.
    #[serde(default = "default_recent_cap")]
    pub recent_cap: usize,
    /// TTL for cached search results.
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
}

impl Default for HotConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
            key_prefix: default_key_prefix(),
            recent_cap: default_recent_cap(),
            cache_ttl_secs: default_cache_ttl_secs(),
        }
    }
}

/// Relevance scoring weights used by the structured tier.
///
/// The defaults are starting points, not calibrated values; deployments are
/// expected to tune them against their own retrieval quality data.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RelevanceWeights {
    #[serde(default = "default_keyword_weight")]
    pub keyword: f32,
    #[serde(default = "default_recency_weight")]
    pub recency: f32,
    #[serde(default = "default_importance_weight")]
    pub importance: f32,
    #[serde(default = "default_involvement_weight")]
    pub involvement: f32,
}

impl RelevanceWeights {
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("keyword", self.keyword),
            ("recency", self.recency),
            ("importance", self.importance),
            ("involvement", self.involvement),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(Error::Validation(format!(
                    "relevance weight '{name}' must be a non-negative number, got {value}"
                )));
            }
        }
        Ok(())
    }
}

impl Default for RelevanceWeights {
    fn default() -> Self {
        Self {
            keyword: default_keyword_weight(),
            recency: default_recency_weight(),
            importance: default_importance_weight(),
            involvement: default_involvement_weight(),
        }
    }
}

/// SQLite-backed structured tier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StructuredConfig {
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
    /// Reply chains longer than this fail closed at write time.
    #[serde(default = "default_max_thread_depth")]
    pub max_thread_depth: usize,
    /// How many rows the relevance query pulls before scoring in memory.
    #[serde(default = "default_candidate_limit")]
    pub candidate_limit: usize,
    /// Relevance scores at or below this are dropped.
    #[serde(default = "default_min_score")]
    pub min_score: f32,
    #[serde(default)]
    pub relevance: RelevanceWeights,
}

impl Default for StructuredConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            max_thread_depth: default_max_thread_depth(),
            candidate_limit: default_candidate_limit(),
            min_score: default_min_score(),
            relevance: RelevanceWeights::default(),
        }
    }
}

/// Qdrant-backed vector tier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorConfig {
    #[serde(default = "default_qdrant_url")]
    pub url: String,
    /// Collections are named `{prefix}-{project_id}`.
    #[serde(default = "default_key_prefix")]
    pub collection_prefix: String,
    /// Similarity floor applied to searches unless the query overrides it.
    #[serde(default = "default_score_threshold")]
    pub score_threshold: f32,
    /// Records below this importance are not indexed (0.0 indexes all).
    #[serde(default)]
    pub min_importance: f32,
}

impl Default for VectorConfig {
    fn default() -> Self {
        Self {
            url: default_qdrant_url(),
            collection_prefix: default_key_prefix(),
            score_threshold: default_score_threshold(),
            min_importance: 0.0,
        }
    }
}

/// Cypher-over-HTTP graph tier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphConfig {
    #[serde(default = "default_graph_url")]
    pub url: String,
    #[serde(default = "default_graph_database")]
    pub database: String,
    #[serde(default = "default_graph_username")]
    pub username: String,
    #[serde(default)]
    pub password: String,
    /// Upper bound for related-concept traversals (clamped to 1..=5).
    #[serde(default = "default_max_traversal_depth")]
    pub max_traversal_depth: u32,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            url: default_graph_url(),
            database: default_graph_database(),
            username: default_graph_username(),
            password: String::new(),
            max_traversal_depth: default_max_traversal_depth(),
        }
    }
}

/// OpenAI-compatible embedding endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    #[serde(default = "default_embedding_base_url")]
    pub base_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    /// Model for general prose.
    #[serde(default = "default_general_model")]
    pub general_model: String,
    /// Model for financial and tabular content.
    #[serde(default = "default_financial_model")]
    pub financial_model: String,
    #[serde(default = "default_dimensions")]
    pub dimensions: usize,
    #[serde(default = "default_embedding_timeout_secs")]
    pub timeout_secs: u64,
    /// Entries held in the in-process embedding memo cache.
    #[serde(default = "default_embedding_cache_size")]
    pub cache_size: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            base_url: default_embedding_base_url(),
            api_key: None,
            general_model: default_general_model(),
            financial_model: default_financial_model(),
            dimensions: default_dimensions(),
            timeout_secs: default_embedding_timeout_secs(),
            cache_size: default_embedding_cache_size(),
        }
    }
}

/// Per-tier time budgets for router dispatch, in milliseconds.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TierTimeouts {
    #[serde(default = "default_hot_timeout_ms")]
    pub hot_ms: u64,
    #[serde(default = "default_structured_timeout_ms")]
    pub structured_ms: u64,
    #[serde(default = "default_vector_timeout_ms")]
    pub vector_ms: u64,
    #[serde(default = "default_graph_timeout_ms")]
    pub graph_ms: u64,
}

impl Default for TierTimeouts {
    fn default() -> Self {
        Self {
            hot_ms: default_hot_timeout_ms(),
            structured_ms: default_structured_timeout_ms(),
            vector_ms: default_vector_timeout_ms(),
            graph_ms: default_graph_timeout_ms(),
        }
    }
}

/// Router and fusion settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    /// Reciprocal Rank Fusion constant. A default flagged for calibration.
    #[serde(default = "default_rrf_k")]
    pub rrf_k: f32,
    #[serde(default)]
    pub timeouts: TierTimeouts,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            rrf_k: default_rrf_k(),
            timeouts: TierTimeouts::default(),
        }
    }
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_key_prefix() -> String {
    "strata".to_string()
}

fn default_recent_cap() -> usize {
    10
}

fn default_cache_ttl_secs() -> u64 {
    300
}

fn default_db_path() -> PathBuf {
    PathBuf::from("data/strata.db")
}

fn default_max_thread_depth() -> usize {
    64
}

fn default_candidate_limit() -> usize {
    500
}

fn default_min_score() -> f32 {
    0.1
}

fn default_keyword_weight() -> f32 {
    0.3
}

fn default_recency_weight() -> f32 {
    0.2
}

fn default_importance_weight() -> f32 {
    0.3
}

fn default_involvement_weight() -> f32 {
    0.2
}

fn default_qdrant_url() -> String {
    "http://localhost:6334".to_string()
}

fn default_score_threshold() -> f32 {
    0.6
}

fn default_graph_url() -> String {
    "http://localhost:7474".to_string()
}

fn default_graph_database() -> String {
    "neo4j".to_string()
}

fn default_graph_username() -> String {
    "neo4j".to_string()
}

fn default_max_traversal_depth() -> u32 {
    3
}

fn default_embedding_base_url() -> String {
    "http://localhost:1234".to_string()
}

fn default_general_model() -> String {
    "text-embedding-multilingual-e5-large-instruct".to_string()
}

fn default_financial_model() -> String {
    "jina-embeddings-v4-text-retrieval".to_string()
}

fn default_dimensions() -> usize {
    1024
}

fn default_embedding_timeout_secs() -> u64 {
    30
}

fn default_embedding_cache_size() -> usize {
    1000
}

fn default_hot_timeout_ms() -> u64 {
    250
}

fn default_structured_timeout_ms() -> u64 {
    2000
}

fn default_vector_timeout_ms() -> u64 {
    3000
}

fn default_graph_timeout_ms() -> u64 {
    3000
}

fn default_rrf_k() -> f32 {
    60.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_document_yields_defaults() {
        let config: MemoryConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.hot.url, "redis://127.0.0.1:6379");
        assert_eq!(config.hot.recent_cap, 10);
        assert_eq!(config.hot.cache_ttl_secs, 300);
        assert_eq!(config.structured.min_score, 0.1);
        assert_eq!(config.structured.max_thread_depth, 64);
        assert_eq!(config.vector.score_threshold, 0.6);
        assert_eq!(config.vector.min_importance, 0.0);
        assert_eq!(config.graph.database, "neo4j");
        assert_eq!(config.embedding.dimensions, 1024);
        assert_eq!(config.router.rrf_k, 60.0);
        assert_eq!(config.router.timeouts.hot_ms, 250);
        config.validate().unwrap();
    }

    #[test]
    fn test_partial_override_keeps_other_defaults() {
        let config: MemoryConfig = serde_json::from_str(
            r#"{
                "hot": { "url": "redis://cache:6379", "recent_cap": 25 },
                "structured": { "relevance": { "keyword": 0.5 } }
            }"#,
        )
        .unwrap();
        assert_eq!(config.hot.url, "redis://cache:6379");
        assert_eq!(config.hot.recent_cap, 25);
        assert_eq!(config.hot.key_prefix, "strata");
        assert_eq!(config.structured.relevance.keyword, 0.5);
        assert_eq!(config.structured.relevance.recency, 0.2);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = MemoryConfig::default();
        config.hot.recent_cap = 0;
        assert!(config.validate().is_err());

        let mut config = MemoryConfig::default();
        config.router.rrf_k = 0.0;
        assert!(config.validate().is_err());

        let mut config = MemoryConfig::default();
        config.structured.relevance.importance = -0.3;
        assert!(config.validate().is_err());

        let mut config = MemoryConfig::default();
        config.embedding.dimensions = 0;
        assert!(config.validate().is_err());
    }
}
