//! The router: single entry point over the four tiers.
//!
//! Writes commit to the structured tier first and fail hard there; the
//! other tiers are replicated best-effort under per-tier timeouts, with
//! failures logged and reported in the receipt instead of propagated.
//! Reads are cache-first and degrade tier by tier, so a down backend costs
//! result quality, never an error.

use std::collections::hash_map::DefaultHasher;
use std::collections::BTreeSet;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use strata_common::{Error, Result};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::config::MemoryConfig;
use crate::fusion::reciprocal_rank_fusion;
use crate::traits::{GraphTier, HotTier, StructuredTier, VectorTier};
use crate::types::{
    Decision, DecisionChainEntry, HitSource, NewRecord, Record, RecordKind, RelatedConcept,
    RelevanceQuery, SearchHit, SearchMode, SearchRequest, TeardownReport, TierHealth, TierOutcome,
    VectorQuery, WriteReceipt, WriteResult,
};

/// Routes reads and writes across the hot, structured, vector, and graph
/// tiers. All tier handles are injected; the router owns no connections.
pub struct MemoryRouter {
    hot: Arc<dyn HotTier>,
    structured: Arc<dyn StructuredTier>,
    vector: Arc<dyn VectorTier>,
    graph: Arc<dyn GraphTier>,
    config: MemoryConfig,
}

fn normalize_query(query: &str) -> String {
    let lowered = query.to_lowercase();
    lowered.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Logical cache key. Prefixed with the project id so teardown can clear a
/// project's cache entries by pattern.
fn cache_key(project_id: &str, mode: SearchMode, query: &str) -> String {
    let mut hasher = DefaultHasher::new();
    project_id.hash(&mut hasher);
    mode.as_str().hash(&mut hasher);
    normalize_query(query).hash(&mut hasher);
    format!("{}:{:016x}", project_id, hasher.finish())
}

/// Per-tier time budget, capped by the caller's deadline when one is set.
fn budget(tier_ms: u64, deadline: Option<Duration>) -> Duration {
    let tier = Duration::from_millis(tier_ms);
    match deadline {
        Some(cap) if cap < tier => cap,
        _ => tier,
    }
}

/// Present a provenance chain entry as a search hit. The synthesized
/// record carries the decision text; the full record stays in the
/// structured tier under the same id.
fn chain_entry_hit(entry: DecisionChainEntry, project_id: &str) -> SearchHit {
    SearchHit {
        record: Record {
            id: entry.decision_id,
            project_id: project_id.to_string(),
            sender: entry.decided_by.first().cloned().unwrap_or_default(),
            recipient: None,
            kind: RecordKind::Decision,
            content: entry.decision_text,
            timestamp: entry.timestamp,
            importance: 0.5,
            tags: BTreeSet::new(),
            context: None,
            response_to: None,
        },
        score: 0.0,
        source: HitSource::Graph,
    }
}

fn finalize(mut hits: Vec<SearchHit>, request: &SearchRequest) -> Vec<SearchHit> {
    if let Some(floor) = request.min_importance {
        hits.retain(|h| h.record.importance >= floor);
    }
    hits.truncate(request.limit);
    hits
}

impl MemoryRouter {
    pub fn new(
        hot: Arc<dyn HotTier>,
        structured: Arc<dyn StructuredTier>,
        vector: Arc<dyn VectorTier>,
        graph: Arc<dyn GraphTier>,
        config: MemoryConfig,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            hot,
            structured,
            vector,
            graph,
            config,
        })
    }

    /// Build and store a new record. The structured tier must accept it;
    /// the other tiers are replicated best-effort.
    pub async fn write(&self, new_record: NewRecord) -> Result<WriteResult> {
        self.write_record(new_record.build()?).await
    }

    /// Store an already-built record.
    pub async fn write_record(&self, record: Record) -> Result<WriteResult> {
        record.validate()?;
        let record_id = self.structured.store(&record).await?;
        let replication = self.replicate(&record, None).await;
        if !replication.fully_replicated() {
            debug!(record_id = %record_id, ?replication, "write committed with degraded replication");
        }
        Ok(WriteResult {
            record_id,
            replication,
        })
    }

    /// Store a decision record plus its structured decision row, then
    /// replicate with full provenance edges in the graph.
    pub async fn record_decision(&self, decision: Decision) -> Result<WriteResult> {
        decision.validate()?;
        let record_id = self.structured.store(&decision.record).await?;
        self.structured.log_decision(&decision).await?;
        let replication = self.replicate(&decision.record, Some(&decision)).await;
        Ok(WriteResult {
            record_id,
            replication,
        })
    }

    async fn replicate(&self, record: &Record, decision: Option<&Decision>) -> WriteReceipt {
        let timeouts = self.config.router.timeouts;

        let hot_branch = async {
            match timeout(
                Duration::from_millis(timeouts.hot_ms),
                self.hot.push(record),
            )
            .await
            {
                Ok(Ok(())) => TierOutcome::Stored,
                Ok(Err(e)) => {
                    warn!(record_id = %record.id, tier = "hot", error = %e, "replication failed");
                    TierOutcome::Failed
                }
                Err(_) => {
                    warn!(record_id = %record.id, tier = "hot", "replication timed out");
                    TierOutcome::Failed
                }
            }
        };

        let vector_branch = async {
            let work = async {
                self.vector.ensure_collection(&record.project_id).await?;
                self.vector.index(record).await
            };
            match timeout(Duration::from_millis(timeouts.vector_ms), work).await {
                Ok(Ok(true)) => TierOutcome::Stored,
                Ok(Ok(false)) => TierOutcome::Skipped,
                Ok(Err(e)) => {
                    warn!(record_id = %record.id, tier = "vector", error = %e, "replication failed");
                    TierOutcome::Failed
                }
                Err(_) => {
                    warn!(record_id = %record.id, tier = "vector", "replication timed out");
                    TierOutcome::Failed
                }
            }
        };

        let graph_branch = async {
            let work = async {
                match decision {
                    Some(d) => self.graph.record_decision(d).await,
                    None => self.graph.link_record(record).await.map(|_| ()),
                }
            };
            match timeout(Duration::from_millis(timeouts.graph_ms), work).await {
                Ok(Ok(())) => TierOutcome::Stored,
                Ok(Err(e)) => {
                    warn!(record_id = %record.id, tier = "graph", error = %e, "replication failed");
                    TierOutcome::Failed
                }
                Err(_) => {
                    warn!(record_id = %record.id, tier = "graph", "replication timed out");
                    TierOutcome::Failed
                }
            }
        };

        let (hot, vector, graph) = tokio::join!(hot_branch, vector_branch, graph_branch);
        WriteReceipt { hot, vector, graph }
    }

    pub async fn get(&self, record_id: &str) -> Result<Option<Record>> {
        self.structured.get(record_id).await
    }

    /// A record and all transitive replies, oldest first.
    pub async fn thread_of(&self, record_id: &str) -> Result<Vec<Record>> {
        self.structured.thread_of(record_id).await
    }

    /// Weighted relevance retrieval for an agent. Degrades to empty when
    /// the structured tier is unreachable; other failures propagate.
    pub async fn relevant_context(&self, query: &RelevanceQuery) -> Result<Vec<SearchHit>> {
        let budget = Duration::from_millis(self.config.router.timeouts.structured_ms);
        match timeout(budget, self.structured.relevant_context(query)).await {
            Ok(Ok(hits)) => Ok(hits),
            Ok(Err(e)) if e.is_unavailable() => {
                warn!(project_id = %query.project_id, error = %e, "relevance retrieval degraded to empty");
                Ok(Vec::new())
            }
            Ok(Err(e)) => Err(e),
            Err(_) => {
                warn!(project_id = %query.project_id, "relevance retrieval timed out");
                Ok(Vec::new())
            }
        }
    }

    pub async fn search(
        &self,
        project_id: &str,
        query: &str,
        mode: SearchMode,
        limit: usize,
    ) -> Result<Vec<SearchHit>> {
        let mut request = SearchRequest::new(project_id, query, mode);
        request.limit = limit;
        self.search_with(&request).await
    }

    /// Cache-first search. A degraded tier narrows the result set; it never
    /// turns the call into an error.
    pub async fn search_with(&self, request: &SearchRequest) -> Result<Vec<SearchHit>> {
        let key = cache_key(&request.project_id, request.mode, &request.query);

        match self.hot.cached(&key).await {
            Ok(Some(hits)) => {
                debug!(project_id = %request.project_id, mode = %request.mode, "search served from cache");
                return Ok(finalize(hits, request));
            }
            Ok(None) => {}
            Err(e) => debug!(error = %e, "cache probe failed"),
        }

        let hits = match request.mode {
            SearchMode::Hot => self.hot_search(request).await,
            SearchMode::Keyword => self.keyword_search(request).await,
            SearchMode::Semantic => self.semantic_search(request).await,
            SearchMode::Graph => self.graph_search(request).await,
            SearchMode::Hybrid => self.hybrid_search(request).await,
        }?;

        if !hits.is_empty() {
            let ttl = self.config.hot.cache_ttl_secs;
            if let Err(e) = self.hot.cache_result(&key, ttl, &hits).await {
                debug!(error = %e, "caching search result failed");
            }
        }
        Ok(finalize(hits, request))
    }

    async fn hot_search(&self, request: &SearchRequest) -> Result<Vec<SearchHit>> {
        let budget = budget(self.config.router.timeouts.hot_ms, request.deadline);
        let recent = match timeout(budget, self.hot.recent(&request.project_id)).await {
            Ok(Ok(records)) => records,
            Ok(Err(e)) => {
                warn!(project_id = %request.project_id, error = %e, "hot search degraded to empty");
                return Ok(Vec::new());
            }
            Err(_) => {
                warn!(project_id = %request.project_id, "hot search timed out");
                return Ok(Vec::new());
            }
        };

        let needle = normalize_query(&request.query);
        Ok(recent
            .into_iter()
            .filter(|r| needle.is_empty() || r.content.to_lowercase().contains(&needle))
            .take(request.limit)
            .map(|record| SearchHit {
                record,
                score: 0.0,
                source: HitSource::Hot,
            })
            .collect())
    }

    async fn keyword_search(&self, request: &SearchRequest) -> Result<Vec<SearchHit>> {
        if request.query.trim().is_empty() {
            return Ok(Vec::new());
        }
        let budget = budget(self.config.router.timeouts.structured_ms, request.deadline);
        let work =
            self.structured
                .search_by_keyword(&request.project_id, &request.query, request.limit);
        match timeout(budget, work).await {
            Ok(Ok(hits)) => Ok(hits),
            Ok(Err(e)) => {
                warn!(project_id = %request.project_id, error = %e, "keyword search degraded to empty");
                Ok(Vec::new())
            }
            Err(_) => {
                warn!(project_id = %request.project_id, "keyword search timed out");
                Ok(Vec::new())
            }
        }
    }

    /// Raw vector search; `None` on failure so the caller picks the
    /// fallback.
    async fn try_semantic(&self, request: &SearchRequest) -> Option<Vec<SearchHit>> {
        if request.query.trim().is_empty() {
            return Some(Vec::new());
        }
        let budget = budget(self.config.router.timeouts.vector_ms, request.deadline);
        let mut query = VectorQuery::new(&request.project_id, &request.query);
        query.limit = request.limit;
        query.score_threshold = request.score_threshold;

        match timeout(budget, self.vector.search(&query)).await {
            Ok(Ok(hits)) => Some(hits),
            Ok(Err(e)) => {
                warn!(project_id = %request.project_id, error = %e, "vector search failed");
                None
            }
            Err(_) => {
                warn!(project_id = %request.project_id, "vector search timed out");
                None
            }
        }
    }

    async fn semantic_search(&self, request: &SearchRequest) -> Result<Vec<SearchHit>> {
        match self.try_semantic(request).await {
            Some(hits) => Ok(hits),
            None => {
                debug!(project_id = %request.project_id, "falling back to keyword search");
                self.keyword_search(request).await
            }
        }
    }

    async fn graph_search(&self, request: &SearchRequest) -> Result<Vec<SearchHit>> {
        let budget = budget(self.config.router.timeouts.graph_ms, request.deadline);
        let work = self
            .graph
            .why_question(&request.query, Some(&request.project_id));
        match timeout(budget, work).await {
            Ok(Ok(entries)) => Ok(entries
                .into_iter()
                .map(|entry| chain_entry_hit(entry, &request.project_id))
                .take(request.limit)
                .collect()),
            Ok(Err(Error::NotFound(_))) => {
                debug!(project_id = %request.project_id, "query names no known concept");
                Ok(Vec::new())
            }
            Ok(Err(e)) => {
                warn!(project_id = %request.project_id, error = %e, "graph search degraded to empty");
                Ok(Vec::new())
            }
            Err(_) => {
                warn!(project_id = %request.project_id, "graph search timed out");
                Ok(Vec::new())
            }
        }
    }

    /// Semantic and keyword legs in parallel, widened to 2x the limit,
    /// fused by reciprocal rank.
    async fn hybrid_search(&self, request: &SearchRequest) -> Result<Vec<SearchHit>> {
        let mut widened = request.clone();
        widened.limit = request.limit.saturating_mul(2).max(1);

        let (semantic, keyword) = tokio::join!(
            self.try_semantic(&widened),
            self.keyword_search(&widened)
        );
        let lists = vec![semantic.unwrap_or_default(), keyword?];
        Ok(reciprocal_rank_fusion(
            lists,
            self.config.router.rrf_k,
            request.limit,
        ))
    }

    /// Provenance answer for a "why ...?" question. `NotFound` when the
    /// question names no known concept.
    pub async fn why(
        &self,
        question: &str,
        project_id: Option<&str>,
    ) -> Result<Vec<DecisionChainEntry>> {
        self.graph.why_question(question, project_id).await
    }

    pub async fn decision_chain(
        &self,
        concept: &str,
        project_id: Option<&str>,
    ) -> Result<Vec<DecisionChainEntry>> {
        self.graph.decision_chain(concept, project_id).await
    }

    pub async fn related_concepts(&self, concept: &str) -> Result<Vec<RelatedConcept>> {
        self.graph
            .related_concepts(concept, self.config.graph.max_traversal_depth)
            .await
    }

    /// Remove every trace of a project. The structured delete must
    /// succeed; the other tiers are cleared best-effort and reported.
    pub async fn teardown_project(&self, project_id: &str) -> Result<TeardownReport> {
        let records_removed = self.structured.clear_project(project_id).await?;

        let hot_branch = async {
            match self.hot.clear_project(project_id).await {
                Ok(()) => true,
                Err(e) => {
                    warn!(project_id = %project_id, tier = "hot", error = %e, "teardown incomplete");
                    false
                }
            }
        };
        let vector_branch = async {
            match self.vector.delete_collection(project_id).await {
                Ok(()) => true,
                Err(e) => {
                    warn!(project_id = %project_id, tier = "vector", error = %e, "teardown incomplete");
                    false
                }
            }
        };
        let graph_branch = async {
            match self.graph.clear_project(project_id).await {
                Ok(()) => true,
                Err(e) => {
                    warn!(project_id = %project_id, tier = "graph", error = %e, "teardown incomplete");
                    false
                }
            }
        };

        let (hot_cleared, vector_cleared, graph_cleared) =
            tokio::join!(hot_branch, vector_branch, graph_branch);

        info!(
            project_id = %project_id,
            records_removed,
            hot_cleared,
            vector_cleared,
            graph_cleared,
            "project teardown finished"
        );
        Ok(TeardownReport {
            records_removed,
            hot_cleared,
            vector_cleared,
            graph_cleared,
        })
    }

    pub async fn health(&self) -> TierHealth {
        let (hot, structured, vector, graph) = tokio::join!(
            self.hot.health_check(),
            self.structured.health_check(),
            self.vector.health_check(),
            self.graph.health_check(),
        );
        TierHealth {
            hot,
            structured,
            vector,
            graph,
        }
    }

    pub fn hot(&self) -> &Arc<dyn HotTier> {
        &self.hot
    }

    pub fn structured(&self) -> &Arc<dyn StructuredTier> {
        &self.structured
    }

    pub fn vector(&self) -> &Arc<dyn VectorTier> {
        &self.vector
    }

    pub fn graph(&self) -> &Arc<dyn GraphTier> {
        &self.graph
    }
}
