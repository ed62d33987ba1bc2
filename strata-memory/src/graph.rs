//! Neo4j-backed graph tier for concept and decision provenance.
//!
//! Talks to the HTTP transactional endpoint (`/db/{name}/tx/commit`), so a
//! batch of statements commits atomically without a driver dependency.
//! Concept identity is the case-folded `key` property; the display `name`
//! keeps whatever casing was first seen. Concepts and agents are shared
//! across projects and survive teardown.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strata_common::{Error, Result};
use tracing::{debug, warn};

use crate::concepts::ConceptExtractor;
use crate::config::GraphConfig;
use crate::traits::GraphTier;
use crate::types::{Decision, DecisionChainEntry, Record, RelatedConcept};

/// How much record content is kept on the graph node. The full text lives
/// in the structured tier.
const CONTENT_PREVIEW_CHARS: usize = 500;

const GRAPH_TIMEOUT_SECS: u64 = 10;

#[derive(Serialize)]
struct CypherPayload {
    statements: Vec<CypherStatement>,
}

#[derive(Serialize)]
struct CypherStatement {
    statement: String,
    parameters: serde_json::Value,
}

impl CypherStatement {
    fn new(statement: impl Into<String>, parameters: serde_json::Value) -> Self {
        Self {
            statement: statement.into(),
            parameters,
        }
    }
}

#[derive(Deserialize)]
struct CypherResponse {
    #[serde(default)]
    results: Vec<CypherResult>,
    #[serde(default)]
    errors: Vec<CypherError>,
}

#[derive(Deserialize, Default)]
struct CypherResult {
    #[serde(default)]
    data: Vec<CypherRow>,
}

#[derive(Deserialize)]
struct CypherRow {
    #[serde(default)]
    row: Vec<serde_json::Value>,
}

#[derive(Deserialize)]
struct CypherError {
    #[serde(default)]
    code: String,
    message: String,
}

/// Graph tier speaking Cypher over HTTP.
pub struct CypherGraph {
    client: reqwest::Client,
    endpoint: String,
    username: String,
    password: String,
    extractor: Arc<dyn ConceptExtractor>,
    max_depth: u32,
}

impl CypherGraph {
    pub fn new(config: &GraphConfig, extractor: Arc<dyn ConceptExtractor>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(GRAPH_TIMEOUT_SECS))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        let base = config.url.trim_end_matches('/');
        Self {
            client,
            endpoint: format!("{}/db/{}/tx/commit", base, config.database),
            username: config.username.clone(),
            password: config.password.clone(),
            extractor,
            max_depth: config.max_traversal_depth,
        }
    }

    async fn run_all(&self, statements: Vec<CypherStatement>) -> Result<Vec<CypherResult>> {
        let response = self
            .client
            .post(&self.endpoint)
            .basic_auth(&self.username, Some(&self.password))
            .json(&CypherPayload { statements })
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    Error::Timeout("graph query".to_string())
                } else {
                    Error::unavailable("graph", e)
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(Error::unavailable(
                "graph",
                format!("endpoint returned {status}: {detail}"),
            ));
        }

        let parsed: CypherResponse = response
            .json()
            .await
            .map_err(|e| Error::Internal(format!("decoding cypher response: {e}")))?;

        if let Some(err) = parsed.errors.first() {
            return Err(Error::Internal(format!(
                "cypher error {}: {}",
                err.code, err.message
            )));
        }

        Ok(parsed.results)
    }

    async fn run(
        &self,
        statement: impl Into<String>,
        parameters: serde_json::Value,
    ) -> Result<CypherResult> {
        let mut results = self
            .run_all(vec![CypherStatement::new(statement, parameters)])
            .await?;
        let result = results.drain(..).next().unwrap_or_default();
        Ok(result)
    }

    fn chain_query(&self, concept: &str, project_id: Option<&str>) -> CypherStatement {
        CypherStatement::new(
            "MATCH (c:Concept {key: toLower($concept)})<-[:CHOSE]-(d:Decision) \
             WHERE $project_id IS NULL OR d.project_id = $project_id \
             OPTIONAL MATCH (d)-[:REJECTED]->(alt:Concept) \
             OPTIONAL MATCH (d)-[:BECAUSE]->(reason:Reason) \
             OPTIONAL MATCH (a:Agent)-[:MADE_DECISION]->(d) \
             RETURN d.id, d.decision, d.timestamp, \
                    collect(DISTINCT a.name), collect(DISTINCT alt.name), \
                    collect(DISTINCT reason.text) \
             ORDER BY d.timestamp DESC",
            serde_json::json!({ "concept": concept, "project_id": project_id }),
        )
    }
}

fn string_list(value: Option<&serde_json::Value>) -> Vec<String> {
    value
        .and_then(|v| v.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str().map(|s| s.to_string()))
                .collect()
        })
        .unwrap_or_default()
}

fn chain_entry_from_row(row: &[serde_json::Value]) -> Option<DecisionChainEntry> {
    let decision_id = row.first()?.as_str()?.to_string();
    let decision_text = row.get(1)?.as_str()?.to_string();
    let timestamp = DateTime::parse_from_rfc3339(row.get(2)?.as_str()?)
        .ok()?
        .with_timezone(&Utc);

    Some(DecisionChainEntry {
        decision_id,
        decision_text,
        timestamp,
        decided_by: string_list(row.get(3)),
        rejected_alternatives: string_list(row.get(4)),
        reasons: string_list(row.get(5)),
    })
}

fn chain_entries(result: CypherResult) -> Vec<DecisionChainEntry> {
    result
        .data
        .iter()
        .filter_map(|r| {
            let entry = chain_entry_from_row(&r.row);
            if entry.is_none() {
                warn!("skipping malformed decision row from graph");
            }
            entry
        })
        .collect()
}

#[async_trait::async_trait]
impl GraphTier for CypherGraph {
    async fn ensure_constraints(&self) -> Result<()> {
        let statements = vec![
            CypherStatement::new(
                "CREATE CONSTRAINT concept_key IF NOT EXISTS \
                 FOR (c:Concept) REQUIRE c.key IS UNIQUE",
                serde_json::json!({}),
            ),
            CypherStatement::new(
                "CREATE CONSTRAINT record_id IF NOT EXISTS \
                 FOR (r:Record) REQUIRE r.id IS UNIQUE",
                serde_json::json!({}),
            ),
            CypherStatement::new(
                "CREATE CONSTRAINT decision_id IF NOT EXISTS \
                 FOR (d:Decision) REQUIRE d.id IS UNIQUE",
                serde_json::json!({}),
            ),
            CypherStatement::new(
                "CREATE CONSTRAINT agent_name IF NOT EXISTS \
                 FOR (a:Agent) REQUIRE a.name IS UNIQUE",
                serde_json::json!({}),
            ),
        ];
        self.run_all(statements).await?;
        Ok(())
    }

    async fn upsert_concept(
        &self,
        name: &str,
        concept_type: &str,
        properties: &serde_json::Value,
    ) -> Result<()> {
        let props = if properties.is_object() {
            properties.clone()
        } else {
            serde_json::json!({})
        };
        self.run(
            "MERGE (c:Concept {key: toLower($name)}) \
             ON CREATE SET c.name = $name \
             SET c.concept_type = $type, c += $props",
            serde_json::json!({ "name": name, "type": concept_type, "props": props }),
        )
        .await?;
        Ok(())
    }

    async fn link_record(&self, record: &Record) -> Result<usize> {
        let concepts = self.extractor.extract(&record.content);
        let preview: String = record.content.chars().take(CONTENT_PREVIEW_CHARS).collect();
        let node_params = serde_json::json!({
            "id": record.id,
            "project_id": record.project_id,
            "sender": record.sender,
            "kind": record.kind.as_str(),
            "timestamp": record.timestamp.to_rfc3339(),
            "preview": preview,
        });

        const MERGE_RECORD: &str = "MERGE (r:Record {id: $id}) \
             SET r.project_id = $project_id, r.sender = $sender, r.kind = $kind, \
                 r.timestamp = $timestamp, r.preview = $preview";

        if concepts.is_empty() {
            self.run(MERGE_RECORD, node_params).await?;
            return Ok(0);
        }

        let mut params = node_params;
        params["concepts"] = serde_json::json!(concepts);
        params["concept_type"] = serde_json::json!(self.extractor.concept_type());

        let result = self
            .run(
                format!(
                    "{MERGE_RECORD} \
                     WITH r \
                     UNWIND $concepts AS concept \
                     MERGE (c:Concept {{key: toLower(concept)}}) \
                     ON CREATE SET c.name = concept, c.concept_type = $concept_type \
                     MERGE (r)-[:MENTIONS]->(c) \
                     RETURN count(DISTINCT c)"
                ),
                params,
            )
            .await?;

        let linked = result
            .data
            .first()
            .and_then(|r| r.row.first())
            .and_then(|v| v.as_u64())
            .unwrap_or(0) as usize;
        debug!(record_id = %record.id, linked, "linked record to concepts");
        Ok(linked)
    }

    async fn record_decision(&self, decision: &Decision) -> Result<()> {
        decision.validate()?;
        let record = &decision.record;
        let base = serde_json::json!({
            "id": record.id,
            "project_id": record.project_id,
            "decision": record.content,
            "timestamp": record.timestamp.to_rfc3339(),
        });

        let mut statements = vec![CypherStatement::new(
            "MERGE (d:Decision {id: $id}) \
             SET d.project_id = $project_id, d.decision = $decision, \
                 d.timestamp = $timestamp",
            base,
        )];

        // UNWIND over an empty list produces no rows, so each edge batch is
        // only issued when it has members.
        if !decision.decided_by.is_empty() {
            statements.push(CypherStatement::new(
                "MATCH (d:Decision {id: $id}) \
                 UNWIND $agents AS agent \
                 MERGE (a:Agent {name: agent}) \
                 MERGE (a)-[:MADE_DECISION]->(d)",
                serde_json::json!({ "id": record.id, "agents": decision.decided_by }),
            ));
        }
        if !decision.chosen.is_empty() {
            statements.push(CypherStatement::new(
                "MATCH (d:Decision {id: $id}) \
                 UNWIND $chosen AS choice \
                 MERGE (c:Concept {key: toLower(choice)}) \
                 ON CREATE SET c.name = choice, c.concept_type = 'topic' \
                 MERGE (d)-[:CHOSE]->(c)",
                serde_json::json!({ "id": record.id, "chosen": decision.chosen }),
            ));
        }
        if !decision.rejected.is_empty() {
            statements.push(CypherStatement::new(
                "MATCH (d:Decision {id: $id}) \
                 UNWIND $rejected AS alternative \
                 MERGE (c:Concept {key: toLower(alternative)}) \
                 ON CREATE SET c.name = alternative, c.concept_type = 'topic' \
                 MERGE (d)-[:REJECTED]->(c)",
                serde_json::json!({ "id": record.id, "rejected": decision.rejected }),
            ));
        }
        if !decision.reasoning.is_empty() {
            statements.push(CypherStatement::new(
                "MATCH (d:Decision {id: $id}) \
                 UNWIND $reasons AS reason \
                 MERGE (x:Reason {text: reason}) \
                 MERGE (d)-[:BECAUSE]->(x)",
                serde_json::json!({ "id": record.id, "reasons": decision.reasoning }),
            ));
        }

        self.run_all(statements).await?;
        debug!(record_id = %record.id, "recorded decision in graph");
        Ok(())
    }

    async fn decision_chain(
        &self,
        concept: &str,
        project_id: Option<&str>,
    ) -> Result<Vec<DecisionChainEntry>> {
        let query = self.chain_query(concept, project_id);
        let mut results = self.run_all(vec![query]).await?;
        let result = results.drain(..).next().unwrap_or_default();
        Ok(chain_entries(result))
    }

    async fn related_concepts(
        &self,
        concept: &str,
        max_depth: u32,
    ) -> Result<Vec<RelatedConcept>> {
        let depth = max_depth.min(self.max_depth).clamp(1, 5);
        // Variable-length bounds cannot be parameterized in Cypher.
        let statement = format!(
            "MATCH path = (c:Concept {{key: toLower($concept)}})-[*1..{depth}]-(related:Concept) \
             WHERE related.key <> c.key \
             RETURN related.name, related.concept_type, min(length(path)) AS distance \
             ORDER BY distance ASC, related.name ASC"
        );
        let result = self
            .run(statement, serde_json::json!({ "concept": concept }))
            .await?;

        Ok(result
            .data
            .iter()
            .filter_map(|r| {
                let name = r.row.first()?.as_str()?.to_string();
                let concept_type = r
                    .row
                    .get(1)
                    .and_then(|v| v.as_str())
                    .unwrap_or("unknown")
                    .to_string();
                let distance = r.row.get(2)?.as_u64()? as u32;
                Some(RelatedConcept {
                    name,
                    concept_type,
                    distance,
                })
            })
            .collect())
    }

    async fn why_question(
        &self,
        question: &str,
        project_id: Option<&str>,
    ) -> Result<Vec<DecisionChainEntry>> {
        let concept = self.extractor.first_concept(question).ok_or_else(|| {
            Error::NotFound(format!("no known concept in question '{question}'"))
        })?;
        debug!(concept = %concept, "answering why-question from decision chain");
        self.decision_chain(&concept, project_id).await
    }

    async fn clear_project(&self, project_id: &str) -> Result<()> {
        let statements = vec![
            CypherStatement::new(
                "MATCH (r:Record {project_id: $project_id}) DETACH DELETE r",
                serde_json::json!({ "project_id": project_id }),
            ),
            CypherStatement::new(
                "MATCH (d:Decision {project_id: $project_id}) DETACH DELETE d",
                serde_json::json!({ "project_id": project_id }),
            ),
            // Reasons can be shared, so only drop the ones left dangling.
            CypherStatement::new(
                "MATCH (x:Reason) WHERE NOT (x)<-[:BECAUSE]-(:Decision) DELETE x",
                serde_json::json!({}),
            ),
        ];
        self.run_all(statements).await?;
        debug!(project_id = %project_id, "cleared graph tier for project");
        Ok(())
    }

    async fn health_check(&self) -> bool {
        self.run("RETURN 1", serde_json::json!({})).await.is_ok()
    }
}
