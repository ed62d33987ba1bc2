//! Capability traits for the four storage tiers.
//!
//! The router holds `Arc<dyn ...>` handles and never names a concrete
//! backend, so tests swap in shared-state fakes and deployments can replace
//! any tier without touching the others. Backends map their driver errors
//! into [`strata_common::Error`] at this boundary.

use std::collections::BTreeMap;

use async_trait::async_trait;
use strata_common::Result;

use crate::types::{
    Decision, DecisionChainEntry, ProjectStats, Record, RecordKind, RecordPatch, RelatedConcept,
    RelevanceQuery, SearchHit, VectorQuery, WorkItem,
};

/// Recent-context list and result cache. Losing this tier costs latency,
/// never data.
#[async_trait]
pub trait HotTier: Send + Sync {
    /// Prepend to the project's recent list, trimming to the cap.
    async fn push(&self, record: &Record) -> Result<()>;

    /// Most-recent-first recent list.
    async fn recent(&self, project_id: &str) -> Result<Vec<Record>>;

    /// Cache a search result under a logical key with a TTL.
    async fn cache_result(&self, key: &str, ttl_secs: u64, hits: &[SearchHit]) -> Result<()>;

    /// Cached hits for a logical key, if present and fresh.
    async fn cached(&self, key: &str) -> Result<Option<Vec<SearchHit>>>;

    /// Drop the project's recent list and cached results.
    async fn clear_project(&self, project_id: &str) -> Result<()>;

    async fn health_check(&self) -> bool;
}

/// Canonical record store. Writes that fail here fail the whole operation.
#[async_trait]
pub trait StructuredTier: Send + Sync {
    /// Idempotent store keyed on record id; same id with divergent content
    /// is a conflict. Returns the record id.
    async fn store(&self, record: &Record) -> Result<String>;

    async fn get(&self, record_id: &str) -> Result<Option<Record>>;

    /// Amend the mutable fields of a stored record.
    async fn amend(&self, record_id: &str, patch: RecordPatch) -> Result<Record>;

    /// Weighted relevance retrieval (keywords, recency, importance,
    /// involvement) for an agent's query.
    async fn relevant_context(&self, query: &RelevanceQuery) -> Result<Vec<SearchHit>>;

    /// A record and all transitive replies to it, oldest first.
    async fn thread_of(&self, record_id: &str) -> Result<Vec<Record>>;

    /// Full-text search, newest first.
    async fn search_by_keyword(
        &self,
        project_id: &str,
        query: &str,
        limit: usize,
    ) -> Result<Vec<SearchHit>>;

    /// Records an agent sent or received, newest first.
    async fn agent_history(
        &self,
        project_id: &str,
        agent_id: &str,
        limit: usize,
    ) -> Result<Vec<Record>>;

    async fn records_by_kind(
        &self,
        project_id: &str,
        kind: RecordKind,
        limit: usize,
    ) -> Result<Vec<Record>>;

    /// Append to the decisions table. The underlying record must already be
    /// stored.
    async fn log_decision(&self, decision: &Decision) -> Result<()>;

    /// Idempotent project registration.
    async fn ensure_project(&self, project_id: &str, name: &str) -> Result<()>;

    async fn project_stats(&self, project_id: &str) -> Result<ProjectStats>;

    /// Per-agent key/value store scoped to a project.
    async fn set_agent_context(
        &self,
        project_id: &str,
        agent_id: &str,
        key: &str,
        value: &serde_json::Value,
    ) -> Result<()>;

    async fn get_agent_context(
        &self,
        project_id: &str,
        agent_id: &str,
        key: &str,
    ) -> Result<Option<serde_json::Value>>;

    async fn agent_context_all(
        &self,
        project_id: &str,
        agent_id: &str,
    ) -> Result<BTreeMap<String, serde_json::Value>>;

    /// Queue a task; lower priority runs sooner. Returns the item id.
    async fn add_work_item(
        &self,
        project_id: &str,
        agent_id: &str,
        task: &str,
        priority: i64,
    ) -> Result<i64>;

    /// Highest-priority pending item, FIFO within a priority.
    async fn next_work_item(&self, project_id: &str) -> Result<Option<WorkItem>>;

    /// Mark done. False when the id is unknown or already done.
    async fn complete_work_item(&self, item_id: i64) -> Result<bool>;

    /// Remove every row belonging to the project. Returns removed records.
    async fn clear_project(&self, project_id: &str) -> Result<usize>;

    async fn health_check(&self) -> bool;
}

/// Semantic similarity over embedded record content.
#[async_trait]
pub trait VectorTier: Send + Sync {
    /// Idempotently create the project's collection.
    async fn ensure_collection(&self, project_id: &str) -> Result<()>;

    /// Embed and upsert one record. `Ok(false)` means the record was
    /// intentionally skipped (importance gate), not an error.
    async fn index(&self, record: &Record) -> Result<bool>;

    async fn search(&self, query: &VectorQuery) -> Result<Vec<SearchHit>>;

    /// Drop the project's collection (teardown).
    async fn delete_collection(&self, project_id: &str) -> Result<()>;

    async fn health_check(&self) -> bool;
}

/// Concept and decision provenance graph.
#[async_trait]
pub trait GraphTier: Send + Sync {
    /// Idempotently create uniqueness constraints.
    async fn ensure_constraints(&self) -> Result<()>;

    /// Merge a concept node by case-folded name.
    async fn upsert_concept(
        &self,
        name: &str,
        concept_type: &str,
        properties: &serde_json::Value,
    ) -> Result<()>;

    /// Extract concepts from the record's content and merge MENTIONS edges.
    /// Returns the number of concepts linked.
    async fn link_record(&self, record: &Record) -> Result<usize>;

    /// Store a decision with CHOSE / REJECTED / BECAUSE / MADE_DECISION
    /// edges.
    async fn record_decision(&self, decision: &Decision) -> Result<()>;

    /// Decisions that chose the concept, newest first.
    async fn decision_chain(
        &self,
        concept: &str,
        project_id: Option<&str>,
    ) -> Result<Vec<DecisionChainEntry>>;

    /// Concepts within `max_depth` hops, ordered by distance then name.
    async fn related_concepts(&self, concept: &str, max_depth: u32)
        -> Result<Vec<RelatedConcept>>;

    /// Answer a "why ...?" question from the first recognized concept.
    /// `NotFound` when the question names no known concept.
    async fn why_question(
        &self,
        question: &str,
        project_id: Option<&str>,
    ) -> Result<Vec<DecisionChainEntry>>;

    /// Remove the project's records, decisions, and reasons. Concepts are
    /// shared across projects and survive.
    async fn clear_project(&self, project_id: &str) -> Result<()>;

    async fn health_check(&self) -> bool;
}
