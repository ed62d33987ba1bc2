//! Qdrant-backed vector tier for semantic search.
//!
//! Each project gets its own collection so teardown is a collection drop.
//! Records below the importance floor are skipped rather than embedded;
//! the caller sees the skip as `Ok(false)`, never as an error. The
//! embedding model is chosen per text by the [`ModelRouter`], and the
//! chosen model id is kept in the point payload for later audits.

use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use qdrant_client::qdrant::value::Kind;
use qdrant_client::qdrant::{
    Condition, CreateCollectionBuilder, Distance, Filter, ListValue, PointId, PointStruct,
    SearchPointsBuilder, Struct, UpsertPointsBuilder, Value, VectorParamsBuilder,
};
use qdrant_client::Qdrant;
use strata_common::{Error, Result};
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::config::{EmbeddingConfig, VectorConfig};
use crate::embeddings::{EmbeddingProvider, ModelRouter};
use crate::traits::VectorTier;
use crate::types::{HitSource, Record, RecordKind, SearchHit, VectorQuery};

/// Vector tier over a Qdrant instance, one collection per project.
pub struct QdrantVector {
    client: Qdrant,
    embedder: Arc<dyn EmbeddingProvider>,
    router: ModelRouter,
    collection_prefix: String,
    dimension: usize,
    score_threshold: f32,
    min_importance: f32,
    known_collections: RwLock<HashSet<String>>,
}

impl QdrantVector {
    /// Connect to Qdrant. Fails fast if the embedding provider reports
    /// zero dimensions, since such vectors cannot be indexed.
    pub fn connect(
        config: &VectorConfig,
        embedding: &EmbeddingConfig,
        embedder: Arc<dyn EmbeddingProvider>,
    ) -> Result<Self> {
        let dimension = embedder.dimensions();
        if dimension == 0 {
            return Err(Error::Validation(
                "embedding provider must have non-zero dimensions for vector indexing".to_string(),
            ));
        }

        let client = Qdrant::from_url(&config.url)
            .build()
            .map_err(|e| Error::unavailable("vector", e))?;
        let router = ModelRouter::from_config(embedding)?;

        Ok(Self {
            client,
            embedder,
            router,
            collection_prefix: config.collection_prefix.clone(),
            dimension,
            score_threshold: config.score_threshold,
            min_importance: config.min_importance,
            known_collections: RwLock::new(HashSet::new()),
        })
    }

    fn collection_name(&self, project_id: &str) -> String {
        format!("{}-{}", self.collection_prefix, project_id)
    }

    async fn collection_exists(&self, name: &str) -> Result<bool> {
        let collections = self
            .client
            .list_collections()
            .await
            .map_err(|e| Error::unavailable("vector", e))?;
        Ok(collections.collections.iter().any(|c| c.name == name))
    }

    /// Deterministic point id from the record id, so re-indexing the same
    /// record overwrites its point.
    fn point_id(record_id: &str) -> u64 {
        let mut hasher = DefaultHasher::new();
        record_id.hash(&mut hasher);
        hasher.finish()
    }

    fn build_point(record: &Record, model_id: &str, vector: Vec<f32>) -> PointStruct {
        let payload = serde_json::json!({
            "record_id": record.id,
            "project_id": record.project_id,
            "sender": record.sender,
            "recipient": record.recipient,
            "kind": record.kind.as_str(),
            "content": record.content,
            "timestamp": record.timestamp.to_rfc3339(),
            "importance": record.importance,
            "tags": record.tags,
            "model_id": model_id,
        });

        let fields = match payload {
            serde_json::Value::Object(map) => map
                .into_iter()
                .map(|(k, v)| (k, qdrant_value(v)))
                .collect::<HashMap<_, _>>(),
            _ => HashMap::new(),
        };

        PointStruct::new(PointId::from(Self::point_id(&record.id)), vector, fields)
    }
}

/// Convert a JSON value into the Qdrant payload representation.
fn qdrant_value(json: serde_json::Value) -> Value {
    let kind = match json {
        serde_json::Value::Null => Kind::NullValue(0),
        serde_json::Value::Bool(b) => Kind::BoolValue(b),
        serde_json::Value::Number(n) => match (n.as_i64(), n.as_f64()) {
            (Some(i), _) => Kind::IntegerValue(i),
            (None, Some(f)) => Kind::DoubleValue(f),
            (None, None) => Kind::StringValue(n.to_string()),
        },
        serde_json::Value::String(s) => Kind::StringValue(s),
        serde_json::Value::Array(items) => Kind::ListValue(ListValue {
            values: items.into_iter().map(qdrant_value).collect(),
        }),
        serde_json::Value::Object(entries) => Kind::StructValue(Struct {
            fields: entries
                .into_iter()
                .map(|(k, v)| (k, qdrant_value(v)))
                .collect(),
        }),
    };
    Value { kind: Some(kind) }
}

/// Rebuild the searchable projection of a record from a point payload.
/// `context` and `response_to` live only in the structured tier.
fn record_from_payload(payload: &HashMap<String, Value>) -> Option<Record> {
    let timestamp = DateTime::parse_from_rfc3339(payload.get("timestamp")?.as_str()?)
        .ok()?
        .with_timezone(&Utc);
    let importance = payload
        .get("importance")
        .and_then(|v| v.as_double())
        .unwrap_or(0.5) as f32;
    let tags: BTreeSet<String> = match payload.get("tags").and_then(|v| v.kind.as_ref()) {
        Some(Kind::ListValue(list)) => list
            .values
            .iter()
            .filter_map(|v| v.as_str().map(|s| s.to_string()))
            .collect(),
        _ => BTreeSet::new(),
    };

    Some(Record {
        id: payload.get("record_id")?.as_str()?.to_string(),
        project_id: payload.get("project_id")?.as_str()?.to_string(),
        sender: payload.get("sender")?.as_str()?.to_string(),
        recipient: payload
            .get("recipient")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string()),
        kind: payload.get("kind")?.as_str()?.parse::<RecordKind>().ok()?,
        content: payload.get("content")?.as_str()?.to_string(),
        timestamp,
        importance,
        tags,
        context: None,
        response_to: None,
    })
}

#[async_trait::async_trait]
impl VectorTier for QdrantVector {
    async fn ensure_collection(&self, project_id: &str) -> Result<()> {
        let name = self.collection_name(project_id);
        if self.known_collections.read().await.contains(&name) {
            return Ok(());
        }

        if !self.collection_exists(&name).await? {
            info!(collection = %name, dimension = self.dimension, "creating vector collection");
            let vector_params = VectorParamsBuilder::new(self.dimension as u64, Distance::Cosine);
            let created = self
                .client
                .create_collection(
                    CreateCollectionBuilder::new(&name).vectors_config(vector_params),
                )
                .await;
            if let Err(e) = created {
                // A concurrent writer may have won the create race.
                if !self.collection_exists(&name).await? {
                    return Err(Error::unavailable("vector", e));
                }
            }
        }

        self.known_collections.write().await.insert(name);
        Ok(())
    }

    async fn index(&self, record: &Record) -> Result<bool> {
        if record.importance < self.min_importance {
            debug!(
                record_id = %record.id,
                importance = record.importance,
                floor = self.min_importance,
                "record below importance floor, not indexed"
            );
            return Ok(false);
        }

        let model = self.router.select(&record.content, record.document_type());
        let vector = self.embedder.embed_one(model, &record.content).await?;
        let point = Self::build_point(record, model, vector);

        self.client
            .upsert_points(
                UpsertPointsBuilder::new(self.collection_name(&record.project_id), vec![point])
                    .wait(true),
            )
            .await
            .map_err(|e| Error::unavailable("vector", e))?;

        debug!(record_id = %record.id, model, "indexed record");
        Ok(true)
    }

    async fn search(&self, query: &VectorQuery) -> Result<Vec<SearchHit>> {
        // A project that has never indexed anything still gets an empty
        // result set, not an error.
        self.ensure_collection(&query.project_id).await?;

        let model = self
            .router
            .select(&query.query_text, query.document_type.as_deref());
        let vector = self.embedder.embed_one(model, &query.query_text).await?;

        let mut conditions = vec![Condition::matches(
            "project_id",
            query.project_id.clone(),
        )];
        for (field, value) in &query.filters {
            conditions.push(Condition::matches(field.as_str(), value.clone()));
        }

        let request = SearchPointsBuilder::new(
            self.collection_name(&query.project_id),
            vector,
            query.limit as u64,
        )
        .filter(Filter::must(conditions))
        .score_threshold(query.score_threshold.unwrap_or(self.score_threshold))
        .with_payload(true);

        let results = self
            .client
            .search_points(request)
            .await
            .map_err(|e| Error::unavailable("vector", e))?;

        Ok(results
            .result
            .iter()
            .filter_map(|point| {
                let record = record_from_payload(&point.payload)?;
                Some(SearchHit {
                    record,
                    score: point.score,
                    source: HitSource::Semantic,
                })
            })
            .collect())
    }

    async fn delete_collection(&self, project_id: &str) -> Result<()> {
        let name = self.collection_name(project_id);
        // Drop the cache entry first so a failed delete is retried later.
        self.known_collections.write().await.remove(&name);

        if self.collection_exists(&name).await? {
            self.client
                .delete_collection(&name)
                .await
                .map_err(|e| Error::unavailable("vector", e))?;
            info!(collection = %name, "dropped vector collection");
        }
        Ok(())
    }

    async fn health_check(&self) -> bool {
        self.client.health_check().await.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::NoopEmbedding;
    use crate::types::NewRecord;
    use async_trait::async_trait;

    /// Deterministic embeddings derived from character codes, normalized.
    struct MockEmbedding {
        dims: usize,
    }

    impl MockEmbedding {
        fn new(dims: usize) -> Self {
            Self { dims }
        }
    }

    #[async_trait]
    impl EmbeddingProvider for MockEmbedding {
        fn name(&self) -> &str {
            "mock"
        }

        fn dimensions(&self) -> usize {
            self.dims
        }

        async fn embed(&self, _model: &str, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
            Ok(texts
                .iter()
                .map(|text| {
                    let mut vec = vec![0.0f32; self.dims];
                    for (j, c) in text.chars().enumerate() {
                        vec[j % self.dims] += (c as u32 as f32) / 1000.0;
                    }
                    let norm: f32 = vec.iter().map(|x| x * x).sum::<f32>().sqrt();
                    if norm > 0.0 {
                        vec.iter_mut().for_each(|x| *x /= norm);
                    }
                    vec
                })
                .collect())
        }
    }

    fn sample_record() -> Record {
        NewRecord::new("proj-1", "architect", RecordKind::Decision, "Use PostgreSQL")
            .recipient("pm")
            .importance(0.9)
            .tags(["postgresql", "database"])
            .build()
            .unwrap()
    }

    fn test_config() -> (VectorConfig, EmbeddingConfig) {
        let vector = VectorConfig {
            collection_prefix: "strata-test".to_string(),
            score_threshold: 0.0,
            ..Default::default()
        };
        (vector, EmbeddingConfig::default())
    }

    #[test]
    fn point_id_is_deterministic() {
        let a = QdrantVector::point_id("rec-123");
        let b = QdrantVector::point_id("rec-123");
        let c = QdrantVector::point_id("rec-456");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn payload_roundtrips_through_point() {
        let record = sample_record();
        let point = QdrantVector::build_point(&record, "model-x", vec![0.0; 4]);

        let restored = record_from_payload(&point.payload).unwrap();
        assert_eq!(restored.id, record.id);
        assert_eq!(restored.project_id, record.project_id);
        assert_eq!(restored.sender, record.sender);
        assert_eq!(restored.recipient, record.recipient);
        assert_eq!(restored.kind, RecordKind::Decision);
        assert_eq!(restored.content, record.content);
        assert_eq!(restored.tags, record.tags);
        assert!((restored.importance - 0.9).abs() < 1e-6);
        assert_eq!(restored.timestamp, record.timestamp);
        assert!(restored.context.is_none());
        assert!(restored.response_to.is_none());

        let model = point.payload.get("model_id").and_then(|v| v.as_str());
        assert_eq!(model.map(|s| s.to_string()), Some("model-x".to_string()));
    }

    #[test]
    fn payload_without_recipient_restores_broadcast() {
        let mut record = sample_record();
        record.recipient = None;
        let point = QdrantVector::build_point(&record, "model-x", vec![0.0; 4]);
        let restored = record_from_payload(&point.payload).unwrap();
        assert!(restored.recipient.is_none());
    }

    #[test]
    fn incomplete_payload_is_dropped() {
        let mut payload = HashMap::new();
        payload.insert(
            "record_id".to_string(),
            qdrant_value(serde_json::json!("rec-1")),
        );
        assert!(record_from_payload(&payload).is_none());
    }

    #[test]
    fn qdrant_value_covers_json_kinds() {
        assert!(matches!(
            qdrant_value(serde_json::json!("hello")).kind,
            Some(Kind::StringValue(s)) if s == "hello"
        ));
        assert!(matches!(
            qdrant_value(serde_json::json!(42)).kind,
            Some(Kind::IntegerValue(42))
        ));
        assert!(matches!(
            qdrant_value(serde_json::json!(0.25)).kind,
            Some(Kind::DoubleValue(f)) if (f - 0.25).abs() < f64::EPSILON
        ));
        assert!(matches!(
            qdrant_value(serde_json::json!(true)).kind,
            Some(Kind::BoolValue(true))
        ));
        assert!(matches!(
            qdrant_value(serde_json::json!(null)).kind,
            Some(Kind::NullValue(_))
        ));

        match qdrant_value(serde_json::json!(["a", "b"])).kind {
            Some(Kind::ListValue(list)) => assert_eq!(list.values.len(), 2),
            other => panic!("expected list, got {other:?}"),
        }
        match qdrant_value(serde_json::json!({ "k": 1 })).kind {
            Some(Kind::StructValue(s)) => assert!(s.fields.contains_key("k")),
            other => panic!("expected struct, got {other:?}"),
        }
    }

    #[test]
    fn zero_dimension_provider_is_rejected() {
        let (vector, embedding) = test_config();
        let result = QdrantVector::connect(&vector, &embedding, Arc::new(NoopEmbedding));
        let err = result.err().unwrap();
        assert!(err.to_string().contains("non-zero dimensions"));
    }

    #[tokio::test]
    #[ignore = "requires Qdrant"]
    async fn index_and_search_roundtrip() {
        let (vector_cfg, embedding) = test_config();
        let tier = QdrantVector::connect(&vector_cfg, &embedding, Arc::new(MockEmbedding::new(64)))
            .expect("connect");

        let record = sample_record();
        tier.ensure_collection(&record.project_id).await.expect("ensure");
        assert!(tier.index(&record).await.expect("index"));

        let query = VectorQuery::new(&record.project_id, "PostgreSQL database choice");
        let hits = tier.search(&query).await.expect("search");
        assert!(!hits.is_empty());
        assert_eq!(hits[0].record.id, record.id);
        assert_eq!(hits[0].source, HitSource::Semantic);

        tier.delete_collection(&record.project_id).await.expect("cleanup");
    }

    #[tokio::test]
    #[ignore = "requires Qdrant"]
    async fn importance_floor_skips_indexing() {
        let (mut vector_cfg, embedding) = test_config();
        vector_cfg.min_importance = 0.5;
        let tier = QdrantVector::connect(&vector_cfg, &embedding, Arc::new(MockEmbedding::new(64)))
            .expect("connect");

        let mut record = sample_record();
        record.importance = 0.2;
        tier.ensure_collection(&record.project_id).await.expect("ensure");
        assert!(!tier.index(&record).await.expect("index"));

        tier.delete_collection(&record.project_id).await.expect("cleanup");
    }

    #[tokio::test]
    #[ignore = "requires Qdrant"]
    async fn search_scoped_to_project_collection() {
        let (vector_cfg, embedding) = test_config();
        let tier = QdrantVector::connect(&vector_cfg, &embedding, Arc::new(MockEmbedding::new(64)))
            .expect("connect");

        let record = sample_record();
        tier.ensure_collection(&record.project_id).await.expect("ensure");
        tier.index(&record).await.expect("index");

        // A different project sees nothing, even for the same query.
        let query = VectorQuery::new("proj-other", "PostgreSQL database choice");
        let hits = tier.search(&query).await.expect("search");
        assert!(hits.is_empty());

        tier.delete_collection(&record.project_id).await.expect("cleanup");
        tier.delete_collection("proj-other").await.expect("cleanup");
    }

    #[tokio::test]
    #[ignore = "requires Qdrant"]
    async fn delete_collection_is_idempotent() {
        let (vector_cfg, embedding) = test_config();
        let tier = QdrantVector::connect(&vector_cfg, &embedding, Arc::new(MockEmbedding::new(64)))
            .expect("connect");

        tier.ensure_collection("proj-ephemeral").await.expect("ensure");
        tier.delete_collection("proj-ephemeral").await.expect("first delete");
        tier.delete_collection("proj-ephemeral").await.expect("second delete");
    }

    #[tokio::test]
    #[ignore = "requires Qdrant"]
    async fn qdrant_health_check() {
        let (vector_cfg, embedding) = test_config();
        let tier = QdrantVector::connect(&vector_cfg, &embedding, Arc::new(MockEmbedding::new(64)))
            .expect("connect");
        assert!(tier.health_check().await);
    }
}
