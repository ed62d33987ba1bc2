//! Strata Memory - Tiered shared memory for multi-agent projects.
//!
//! This crate stores agent communications once and serves them back through
//! four complementary tiers:
//! - Redis for recent-context lists and a short-TTL search cache
//! - SQLite with FTS5 as the canonical record store (keyword search,
//!   relevance scoring, reply threads, decisions, work queue)
//! - Qdrant for semantic similarity over embedded content
//! - A Cypher graph for concept links and decision provenance
//!
//! ## Architecture
//!
//! ```text
//!                        ┌── Redis ────── recent / cache
//!                        ├── SQLite ───── canonical records, FTS5
//! Client → MemoryRouter ─┤
//!                        ├── Qdrant ───── embeddings, cosine search
//!                        └── Cypher ───── concepts, decision chains
//! ```
//!
//! Writes commit to SQLite and replicate to the other tiers best-effort;
//! reads pick a [`types::SearchMode`] and degrade tier by tier instead of
//! erroring when a backend is down. Hybrid mode fuses the semantic and
//! keyword rankings with Reciprocal Rank Fusion.

#![warn(clippy::all)]
#![allow(clippy::pedantic)]

pub mod concepts;
pub mod config;
pub mod embeddings;
pub mod fusion;
pub mod graph;
pub mod hot;
pub mod keywords;
pub mod router;
pub mod structured;
pub mod traits;
pub mod types;
pub mod vector;

// Re-export commonly used types
pub use concepts::{ConceptExtractor, VocabularyExtractor};
pub use config::{
    EmbeddingConfig, GraphConfig, HotConfig, MemoryConfig, RelevanceWeights, RouterConfig,
    StructuredConfig, TierTimeouts, VectorConfig,
};
pub use embeddings::{EmbeddingProvider, HttpEmbeddingProvider, ModelRouter, NoopEmbedding};
pub use fusion::{reciprocal_rank_fusion, DEFAULT_RRF_K};
pub use graph::CypherGraph;
pub use hot::RedisHot;
pub use keywords::extract_keywords;
pub use router::MemoryRouter;
pub use structured::SqliteStructured;
pub use traits::{GraphTier, HotTier, StructuredTier, VectorTier};
pub use types::{
    Decision, DecisionChainEntry, HitSource, NewRecord, ProjectStats, Record, RecordKind,
    RecordPatch, RelatedConcept, RelevanceQuery, SearchHit, SearchMode, SearchRequest,
    TeardownReport, TierHealth, TierOutcome, VectorQuery, WorkItem, WorkStatus, WriteReceipt,
    WriteResult,
};
pub use vector::QdrantVector;
