//! Embedding provider abstraction and the dual-model router.
//!
//! The provider is injected wherever vectors are needed, so the tests and
//! any deployment without a live endpoint can substitute their own. The
//! [`ModelRouter`] picks between a general multilingual model and a model
//! tuned for financial/tabular text, from content alone.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashSet;
use std::hash::{Hash, Hasher};
use std::num::NonZeroUsize;
use std::time::Duration;

use aho_corasick::AhoCorasick;
use async_trait::async_trait;
use lru::LruCache;
use serde::{Deserialize, Serialize};
use strata_common::{Error, Result};
use tokio::sync::Mutex;
use tracing::debug;

use crate::config::EmbeddingConfig;

/// Produces embedding vectors for text.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Vector width this provider returns. Zero means "cannot embed".
    fn dimensions(&self) -> usize;

    /// Embed a batch of texts with the given model, preserving order.
    async fn embed(&self, model: &str, texts: &[&str]) -> Result<Vec<Vec<f32>>>;

    async fn embed_one(&self, model: &str, text: &str) -> Result<Vec<f32>> {
        let mut vectors = self.embed(model, &[text]).await?;
        vectors
            .pop()
            .ok_or_else(|| Error::Internal("embedding endpoint returned no vector".into()))
    }
}

/// Keywords whose presence marks financial or accounting content.
const FINANCIAL_KEYWORDS: &[&str] = &[
    "revenue",
    "profit",
    "loss",
    "expense",
    "asset",
    "liability",
    "balance sheet",
    "income statement",
    "cash flow",
    "roi",
    "$",
    "€",
    "£",
    "usd",
    "eur",
    "invoice",
    "payment",
];

/// Document-type hints that force the financial model.
const FINANCIAL_DOCUMENT_TYPES: &[&str] = &["financial", "tabular", "accounting", "invoice"];

/// Deterministic choice between the general and financial embedding models.
///
/// Text with at least two distinct financial keywords, or an explicit
/// financial document-type hint, routes to the financial model. Pure
/// function of its inputs; no network, no state.
#[derive(Debug, Clone)]
pub struct ModelRouter {
    general_model: String,
    financial_model: String,
    matcher: AhoCorasick,
}

impl ModelRouter {
    pub fn new(general_model: impl Into<String>, financial_model: impl Into<String>) -> Result<Self> {
        let matcher = AhoCorasick::builder()
            .ascii_case_insensitive(true)
            .build(FINANCIAL_KEYWORDS)
            .map_err(|e| Error::Internal(format!("building financial keyword matcher: {e}")))?;
        Ok(Self {
            general_model: general_model.into(),
            financial_model: financial_model.into(),
            matcher,
        })
    }

    pub fn from_config(config: &EmbeddingConfig) -> Result<Self> {
        Self::new(&config.general_model, &config.financial_model)
    }

    pub fn general_model(&self) -> &str {
        &self.general_model
    }

    pub fn financial_model(&self) -> &str {
        &self.financial_model
    }

    /// Pick the model for a text and an optional document-type hint.
    pub fn select(&self, text: &str, document_type: Option<&str>) -> &str {
        if let Some(hint) = document_type {
            if FINANCIAL_DOCUMENT_TYPES
                .iter()
                .any(|t| t.eq_ignore_ascii_case(hint))
            {
                return &self.financial_model;
            }
        }

        let mut distinct: HashSet<usize> = HashSet::new();
        for m in self.matcher.find_iter(text) {
            distinct.insert(m.pattern().as_usize());
            if distinct.len() >= 2 {
                return &self.financial_model;
            }
        }
        &self.general_model
    }
}

/// Client for an OpenAI-compatible `/v1/embeddings` endpoint.
///
/// Keeps a small LRU memo keyed on (model, text) so repeated embeds of the
/// same query (cache misses aside) cost one network call.
pub struct HttpEmbeddingProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    dimensions: usize,
    cache: Mutex<LruCache<u64, Vec<f32>>>,
}

#[derive(Serialize)]
struct EmbeddingsRequest<'a> {
    model: &'a str,
    input: Vec<&'a str>,
}

#[derive(Deserialize)]
struct EmbeddingsResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Deserialize)]
struct EmbeddingData {
    #[serde(default)]
    index: usize,
    embedding: Vec<f32>,
}

impl HttpEmbeddingProvider {
    pub fn new(config: &EmbeddingConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        let capacity = NonZeroUsize::new(config.cache_size).unwrap_or(NonZeroUsize::MIN);
        Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            dimensions: config.dimensions,
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    fn cache_key(model: &str, text: &str) -> u64 {
        let mut hasher = DefaultHasher::new();
        model.hash(&mut hasher);
        text.hash(&mut hasher);
        hasher.finish()
    }

    async fn request_embeddings(&self, model: &str, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        let url = format!("{}/v1/embeddings", self.base_url);
        let body = EmbeddingsRequest {
            model,
            input: texts.to_vec(),
        };

        let mut request = self.client.post(&url).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| Error::unavailable("embedding", e))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(Error::unavailable(
                "embedding",
                format!("endpoint returned {status}: {detail}"),
            ));
        }

        let parsed: EmbeddingsResponse = response
            .json()
            .await
            .map_err(|e| Error::Internal(format!("decoding embeddings response: {e}")))?;

        if parsed.data.len() != texts.len() {
            return Err(Error::Internal(format!(
                "embedding endpoint returned {} vectors for {} inputs",
                parsed.data.len(),
                texts.len()
            )));
        }

        let mut data = parsed.data;
        data.sort_by_key(|d| d.index);

        let mut vectors = Vec::with_capacity(data.len());
        for item in data {
            if item.embedding.len() != self.dimensions {
                return Err(Error::Internal(format!(
                    "embedding has {} dimensions, expected {}",
                    item.embedding.len(),
                    self.dimensions
                )));
            }
            vectors.push(item.embedding);
        }
        Ok(vectors)
    }
}

#[async_trait]
impl EmbeddingProvider for HttpEmbeddingProvider {
    fn name(&self) -> &str {
        "http"
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn embed(&self, model: &str, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        let mut results: Vec<Option<Vec<f32>>> = vec![None; texts.len()];
        let mut miss_indexes: Vec<usize> = Vec::new();

        {
            let mut cache = self.cache.lock().await;
            for (i, text) in texts.iter().enumerate() {
                match cache.get(&Self::cache_key(model, text)) {
                    Some(vector) => results[i] = Some(vector.clone()),
                    None => miss_indexes.push(i),
                }
            }
        }

        if !miss_indexes.is_empty() {
            let miss_texts: Vec<&str> = miss_indexes.iter().map(|&i| texts[i]).collect();
            let fetched = self.request_embeddings(model, &miss_texts).await?;

            let mut cache = self.cache.lock().await;
            for (&i, vector) in miss_indexes.iter().zip(fetched) {
                cache.put(Self::cache_key(model, texts[i]), vector.clone());
                results[i] = Some(vector);
            }
        } else {
            debug!(model, count = texts.len(), "embeddings served from cache");
        }

        Ok(results.into_iter().flatten().collect())
    }
}

/// Provider for wiring a system with the vector tier disabled. Reports zero
/// dimensions, which the vector tier refuses at construction.
#[derive(Debug, Default, Clone)]
pub struct NoopEmbedding;

#[async_trait]
impl EmbeddingProvider for NoopEmbedding {
    fn name(&self) -> &str {
        "noop"
    }

    fn dimensions(&self) -> usize {
        0
    }

    async fn embed(&self, _model: &str, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        Ok(vec![Vec::new(); texts.len()])
    }
}
