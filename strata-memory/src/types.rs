//! Core data model: records, decisions, search hits, and the small report
//! structs the router hands back to callers.
//!
//! A [`Record`] is the unit of memory. The structured tier holds the
//! canonical copy; every other tier stores a denormalized projection that
//! must agree on `id`, `project_id`, and `content`.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strata_common::{Error, Result};
use uuid::Uuid;

/// Closed set of communication kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RecordKind {
    Request,
    Announcement,
    Decision,
    Update,
    Response,
    Debate,
    Approval,
}

impl RecordKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordKind::Request => "REQUEST",
            RecordKind::Announcement => "ANNOUNCEMENT",
            RecordKind::Decision => "DECISION",
            RecordKind::Update => "UPDATE",
            RecordKind::Response => "RESPONSE",
            RecordKind::Debate => "DEBATE",
            RecordKind::Approval => "APPROVAL",
        }
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecordKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "REQUEST" => Ok(RecordKind::Request),
            "ANNOUNCEMENT" => Ok(RecordKind::Announcement),
            "DECISION" => Ok(RecordKind::Decision),
            "UPDATE" => Ok(RecordKind::Update),
            "RESPONSE" => Ok(RecordKind::Response),
            "DEBATE" => Ok(RecordKind::Debate),
            "APPROVAL" => Ok(RecordKind::Approval),
            other => Err(Error::Validation(format!("unknown record kind '{other}'"))),
        }
    }
}

/// A single stored communication.
///
/// Immutable once written except for `importance` and `tags`, which can be
/// amended through the structured tier. Records are never deleted
/// individually; only project teardown removes them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: String,
    pub project_id: String,
    pub sender: String,
    /// `None` addresses every agent on the project.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient: Option<String>,
    pub kind: RecordKind,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default = "default_importance")]
    pub importance: f32,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub tags: BTreeSet<String>,
    /// Reply-chain pointer to another record's id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_to: Option<String>,
    /// Free-form JSON carried only by the structured tier. A
    /// `document_type` string here hints the embedding model router.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<serde_json::Value>,
}

fn default_importance() -> f32 {
    0.5
}

impl Record {
    /// Check the write-time invariants that do not need storage access.
    pub fn validate(&self) -> Result<()> {
        if self.project_id.trim().is_empty() {
            return Err(Error::Validation("project_id must not be empty".into()));
        }
        if self.sender.trim().is_empty() {
            return Err(Error::Validation("sender must not be empty".into()));
        }
        if self.content.trim().is_empty() {
            return Err(Error::Validation("content must not be empty".into()));
        }
        if !self.importance.is_finite() || !(0.0..=1.0).contains(&self.importance) {
            return Err(Error::Validation(format!(
                "importance must be within [0, 1], got {}",
                self.importance
            )));
        }
        if self.response_to.as_deref() == Some(self.id.as_str()) {
            return Err(Error::Validation(format!(
                "record '{}' cannot reply to itself",
                self.id
            )));
        }
        Ok(())
    }

    /// The `document_type` hint carried in the context blob, if any.
    pub fn document_type(&self) -> Option<&str> {
        self.context
            .as_ref()
            .and_then(|c| c.get("document_type"))
            .and_then(|v| v.as_str())
    }
}

/// Builder for a new [`Record`]. Fills in the id (UUID v4) and timestamp,
/// and validates on `build`.
#[derive(Debug, Clone)]
pub struct NewRecord {
    project_id: String,
    sender: String,
    kind: RecordKind,
    content: String,
    recipient: Option<String>,
    importance: f32,
    tags: BTreeSet<String>,
    response_to: Option<String>,
    context: Option<serde_json::Value>,
}

impl NewRecord {
    pub fn new(
        project_id: impl Into<String>,
        sender: impl Into<String>,
        kind: RecordKind,
        content: impl Into<String>,
    ) -> Self {
        Self {
            project_id: project_id.into(),
            sender: sender.into(),
            kind,
            content: content.into(),
            recipient: None,
            importance: default_importance(),
            tags: BTreeSet::new(),
            response_to: None,
            context: None,
        }
    }

    pub fn recipient(mut self, recipient: impl Into<String>) -> Self {
        self.recipient = Some(recipient.into());
        self
    }

    pub fn importance(mut self, importance: f32) -> Self {
        self.importance = importance;
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    pub fn tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }

    pub fn response_to(mut self, record_id: impl Into<String>) -> Self {
        self.response_to = Some(record_id.into());
        self
    }

    pub fn context(mut self, context: serde_json::Value) -> Self {
        self.context = Some(context);
        self
    }

    pub fn build(self) -> Result<Record> {
        let record = Record {
            id: Uuid::new_v4().to_string(),
            project_id: self.project_id,
            sender: self.sender,
            recipient: self.recipient,
            kind: self.kind,
            content: self.content,
            timestamp: Utc::now(),
            importance: self.importance,
            tags: self.tags,
            response_to: self.response_to,
            context: self.context,
        };
        record.validate()?;
        Ok(record)
    }
}

/// A decision with its provenance: what was chosen, what was turned down,
/// and why. Immutable once recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    /// The underlying record; `kind` must be [`RecordKind::Decision`].
    pub record: Record,
    pub chosen: Vec<String>,
    pub rejected: Vec<String>,
    /// Ordered list of reasons.
    pub reasoning: Vec<String>,
    pub decided_by: Vec<String>,
}

impl Decision {
    pub fn validate(&self) -> Result<()> {
        self.record.validate()?;
        if self.record.kind != RecordKind::Decision {
            return Err(Error::Validation(format!(
                "decision record must have kind DECISION, got {}",
                self.record.kind
            )));
        }
        Ok(())
    }
}

/// Which tier produced a search hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HitSource {
    Hot,
    Keyword,
    /// Structured-tier weighted relevance scoring.
    Relevance,
    Semantic,
    Graph,
    Fused,
}

/// A scored search result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub record: Record,
    pub score: f32,
    pub source: HitSource,
}

/// Retrieval mode for router searches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchMode {
    Hot,
    Keyword,
    Semantic,
    Graph,
    Hybrid,
}

impl SearchMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SearchMode::Hot => "hot",
            SearchMode::Keyword => "keyword",
            SearchMode::Semantic => "semantic",
            SearchMode::Graph => "graph",
            SearchMode::Hybrid => "hybrid",
        }
    }
}

impl fmt::Display for SearchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SearchMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "hot" => Ok(SearchMode::Hot),
            "keyword" => Ok(SearchMode::Keyword),
            "semantic" => Ok(SearchMode::Semantic),
            "graph" => Ok(SearchMode::Graph),
            "hybrid" => Ok(SearchMode::Hybrid),
            other => Err(Error::Validation(format!("unknown search mode '{other}'"))),
        }
    }
}

/// Outcome of one best-effort tier during a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TierOutcome {
    Stored,
    /// Intentionally not written (e.g. below the vector importance gate).
    Skipped,
    Failed,
}

/// Per-tier report of a completed write. The structured tier is not listed:
/// a write that reaches the receipt has already committed there.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteReceipt {
    pub hot: TierOutcome,
    pub vector: TierOutcome,
    pub graph: TierOutcome,
}

impl WriteReceipt {
    /// True when no best-effort tier failed (skips count as success).
    pub fn fully_replicated(&self) -> bool {
        self.hot != TierOutcome::Failed
            && self.vector != TierOutcome::Failed
            && self.graph != TierOutcome::Failed
    }
}

/// Receipt returned by [`crate::router::MemoryRouter::write`], pairing the
/// canonical record id with the replication outcomes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriteResult {
    pub record_id: String,
    pub replication: WriteReceipt,
}

/// Per-tier report of a project teardown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TeardownReport {
    /// Rows removed from the structured tier.
    pub records_removed: usize,
    pub hot_cleared: bool,
    pub vector_cleared: bool,
    pub graph_cleared: bool,
}

/// Snapshot of tier reachability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierHealth {
    pub hot: bool,
    pub structured: bool,
    pub vector: bool,
    pub graph: bool,
}

impl TierHealth {
    pub fn all_healthy(&self) -> bool {
        self.hot && self.structured && self.vector && self.graph
    }
}

/// One decision in a provenance chain, newest first when listed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionChainEntry {
    pub decision_id: String,
    pub decision_text: String,
    pub timestamp: DateTime<Utc>,
    pub decided_by: Vec<String>,
    pub rejected_alternatives: Vec<String>,
    pub reasons: Vec<String>,
}

/// A concept reachable from another concept in the graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelatedConcept {
    pub name: String,
    pub concept_type: String,
    /// Shortest path length from the origin concept.
    pub distance: u32,
}

/// Aggregate counters for one project in the structured tier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectStats {
    pub project_id: String,
    pub records: usize,
    pub by_kind: BTreeMap<String, usize>,
    pub decisions: usize,
    /// Distinct senders seen on the project.
    pub agents: usize,
    pub first_activity: Option<DateTime<Utc>>,
    pub last_activity: Option<DateTime<Utc>>,
}

/// Status of a work-queue item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkStatus {
    Pending,
    Done,
}

impl WorkStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkStatus::Pending => "pending",
            WorkStatus::Done => "done",
        }
    }
}

impl FromStr for WorkStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "pending" => Ok(WorkStatus::Pending),
            "done" => Ok(WorkStatus::Done),
            other => Err(Error::Validation(format!("unknown work status '{other}'"))),
        }
    }
}

/// A queued task in the structured tier's work queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: i64,
    pub project_id: String,
    pub agent_name: String,
    pub task: String,
    /// Lower runs sooner; ties are FIFO by insertion.
    pub priority: i64,
    pub status: WorkStatus,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Mutable-field amendment for a stored record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecordPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub importance: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<BTreeSet<String>>,
}

impl RecordPatch {
    pub fn is_empty(&self) -> bool {
        self.importance.is_none() && self.tags.is_none()
    }
}

/// Parameters for the structured tier's relevance scoring.
#[derive(Debug, Clone)]
pub struct RelevanceQuery {
    pub project_id: String,
    /// Agent whose involvement earns the bonus term.
    pub agent_id: String,
    pub query_text: String,
    pub max_results: usize,
    pub min_importance: f32,
    /// Only records newer than now - window are considered.
    pub time_window: Option<chrono::Duration>,
}

impl RelevanceQuery {
    pub fn new(
        project_id: impl Into<String>,
        agent_id: impl Into<String>,
        query_text: impl Into<String>,
    ) -> Self {
        Self {
            project_id: project_id.into(),
            agent_id: agent_id.into(),
            query_text: query_text.into(),
            max_results: 10,
            min_importance: 0.0,
            time_window: None,
        }
    }
}

/// Parameters for a vector tier similarity search.
#[derive(Debug, Clone)]
pub struct VectorQuery {
    pub project_id: String,
    pub query_text: String,
    pub limit: usize,
    /// Overrides the tier's configured threshold when set.
    pub score_threshold: Option<f32>,
    /// Server-side equality filters over payload fields, e.g. ("sender", "pm").
    pub filters: Vec<(String, String)>,
    /// Embedding model routing hint.
    pub document_type: Option<String>,
}

impl VectorQuery {
    pub fn new(project_id: impl Into<String>, query_text: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            query_text: query_text.into(),
            limit: 10,
            score_threshold: None,
            filters: Vec::new(),
            document_type: None,
        }
    }
}

/// Full search request accepted by the router.
#[derive(Debug, Clone)]
pub struct SearchRequest {
    pub project_id: String,
    pub query: String,
    pub mode: SearchMode,
    pub limit: usize,
    /// Caps every per-tier budget for this call.
    pub deadline: Option<std::time::Duration>,
    pub score_threshold: Option<f32>,
    /// Drops hits below this importance after retrieval.
    pub min_importance: Option<f32>,
}

impl SearchRequest {
    pub fn new(project_id: impl Into<String>, query: impl Into<String>, mode: SearchMode) -> Self {
        Self {
            project_id: project_id.into(),
            query: query.into(),
            mode,
            limit: 10,
            deadline: None,
            score_threshold: None,
            min_importance: None,
        }
    }
}
