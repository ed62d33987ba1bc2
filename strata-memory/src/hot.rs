//! Redis-backed hot tier: recent-context lists and the search result cache.
//!
//! Everything here is disposable. The canonical data lives in the
//! structured tier; Redis only buys fast "what just happened" reads and
//! memoized search responses, so every failure maps to
//! [`Error::TierUnavailable`] and callers degrade.

use redis::aio::ConnectionManager;
use strata_common::{Error, Result};
use tracing::{debug, warn};

use crate::config::HotConfig;
use crate::types::{Record, SearchHit};

fn recent_key(prefix: &str, project_id: &str) -> String {
    format!("{prefix}:recent:{project_id}")
}

fn cache_key(prefix: &str, logical: &str) -> String {
    format!("{prefix}:cache:{logical}")
}

fn cache_pattern(prefix: &str, project_id: &str) -> String {
    format!("{prefix}:cache:{project_id}:*")
}

/// Hot tier over a Redis connection manager. Cloning the manager per call
/// is how the driver multiplexes; the struct itself stays cheap to share.
pub struct RedisHot {
    conn: ConnectionManager,
    prefix: String,
    recent_cap: usize,
}

impl RedisHot {
    /// Connect and return a ready tier handle.
    pub async fn connect(config: &HotConfig) -> Result<Self> {
        let client = redis::Client::open(config.url.as_str())
            .map_err(|e| Error::unavailable("hot", e))?;
        let conn = client
            .get_connection_manager()
            .await
            .map_err(|e| Error::unavailable("hot", e))?;
        Ok(Self {
            conn,
            prefix: config.key_prefix.clone(),
            recent_cap: config.recent_cap.max(1),
        })
    }
}

#[async_trait::async_trait]
impl crate::traits::HotTier for RedisHot {
    async fn push(&self, record: &Record) -> Result<()> {
        let payload = serde_json::to_string(record)?;
        let key = recent_key(&self.prefix, &record.project_id);
        let mut conn = self.conn.clone();

        redis::cmd("LPUSH")
            .arg(&key)
            .arg(payload)
            .query_async::<i64>(&mut conn)
            .await
            .map_err(|e| Error::unavailable("hot", e))?;
        redis::cmd("LTRIM")
            .arg(&key)
            .arg(0)
            .arg(self.recent_cap as isize - 1)
            .query_async::<()>(&mut conn)
            .await
            .map_err(|e| Error::unavailable("hot", e))?;
        Ok(())
    }

    async fn recent(&self, project_id: &str) -> Result<Vec<Record>> {
        let key = recent_key(&self.prefix, project_id);
        let mut conn = self.conn.clone();

        let raw: Vec<String> = redis::cmd("LRANGE")
            .arg(&key)
            .arg(0)
            .arg(self.recent_cap as isize - 1)
            .query_async(&mut conn)
            .await
            .map_err(|e| Error::unavailable("hot", e))?;

        let mut records = Vec::with_capacity(raw.len());
        for entry in raw {
            match serde_json::from_str::<Record>(&entry) {
                Ok(record) => records.push(record),
                Err(e) => warn!(project_id, error = %e, "skipping undecodable recent entry"),
            }
        }
        Ok(records)
    }

    async fn cache_result(&self, key: &str, ttl_secs: u64, hits: &[SearchHit]) -> Result<()> {
        let payload = serde_json::to_string(hits)?;
        let full_key = cache_key(&self.prefix, key);
        let mut conn = self.conn.clone();

        redis::cmd("SET")
            .arg(&full_key)
            .arg(payload)
            .arg("EX")
            .arg(ttl_secs)
            .query_async::<()>(&mut conn)
            .await
            .map_err(|e| Error::unavailable("hot", e))?;
        debug!(key, ttl_secs, "cached search result");
        Ok(())
    }

    async fn cached(&self, key: &str) -> Result<Option<Vec<SearchHit>>> {
        let full_key = cache_key(&self.prefix, key);
        let mut conn = self.conn.clone();

        let raw: Option<String> = redis::cmd("GET")
            .arg(&full_key)
            .query_async(&mut conn)
            .await
            .map_err(|e| Error::unavailable("hot", e))?;

        match raw {
            Some(payload) => match serde_json::from_str(&payload) {
                Ok(hits) => Ok(Some(hits)),
                Err(e) => {
                    // Stale serialization format; treat as a miss.
                    warn!(key, error = %e, "dropping undecodable cache entry");
                    Ok(None)
                }
            },
            None => Ok(None),
        }
    }

    async fn clear_project(&self, project_id: &str) -> Result<()> {
        let mut conn = self.conn.clone();

        redis::cmd("DEL")
            .arg(recent_key(&self.prefix, project_id))
            .query_async::<i64>(&mut conn)
            .await
            .map_err(|e| Error::unavailable("hot", e))?;

        let pattern = cache_pattern(&self.prefix, project_id);
        let mut cursor: u64 = 0;
        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(100)
                .query_async(&mut conn)
                .await
                .map_err(|e| Error::unavailable("hot", e))?;

            if !keys.is_empty() {
                let mut del = redis::cmd("DEL");
                for key in &keys {
                    del.arg(key);
                }
                del.query_async::<i64>(&mut conn)
                    .await
                    .map_err(|e| Error::unavailable("hot", e))?;
            }

            cursor = next;
            if cursor == 0 {
                break;
            }
        }
        debug!(project_id, "cleared hot tier for project");
        Ok(())
    }

    async fn health_check(&self) -> bool {
        let mut conn = self.conn.clone();
        redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::HotTier;
    use crate::types::{NewRecord, RecordKind};

    #[test]
    fn test_key_shapes() {
        assert_eq!(recent_key("strata", "proj-1"), "strata:recent:proj-1");
        assert_eq!(cache_key("strata", "proj-1:abc"), "strata:cache:proj-1:abc");
        assert_eq!(cache_pattern("strata", "proj-1"), "strata:cache:proj-1:*");
    }

    fn test_config() -> HotConfig {
        HotConfig {
            key_prefix: "strata-test".to_string(),
            cache_ttl_secs: 60,
            ..Default::default()
        }
    }

    fn unique_project() -> String {
        format!("proj-{}", uuid::Uuid::new_v4())
    }

    fn record_for(project_id: &str, content: &str) -> Record {
        NewRecord::new(project_id, "agent-a", RecordKind::Update, content)
            .build()
            .unwrap()
    }

    #[tokio::test]
    #[ignore = "requires Redis"]
    async fn test_push_and_recent_roundtrip() {
        let hot = RedisHot::connect(&test_config()).await.unwrap();
        let project = unique_project();

        let first = record_for(&project, "first message");
        let second = record_for(&project, "second message");
        hot.push(&first).await.unwrap();
        hot.push(&second).await.unwrap();

        let recent = hot.recent(&project).await.unwrap();
        assert_eq!(recent.len(), 2);
        // Most recent first.
        assert_eq!(recent[0].content, "second message");
        assert_eq!(recent[1].content, "first message");

        hot.clear_project(&project).await.unwrap();
    }

    #[tokio::test]
    #[ignore = "requires Redis"]
    async fn test_recent_list_capped() {
        let hot = RedisHot::connect(&test_config()).await.unwrap();
        let project = unique_project();

        for i in 0..15 {
            hot.push(&record_for(&project, &format!("message {i}")))
                .await
                .unwrap();
        }

        let recent = hot.recent(&project).await.unwrap();
        assert_eq!(recent.len(), 10);
        assert_eq!(recent[0].content, "message 14");
        assert_eq!(recent[9].content, "message 5");

        hot.clear_project(&project).await.unwrap();
    }

    #[tokio::test]
    #[ignore = "requires Redis"]
    async fn test_cache_roundtrip_and_clear() {
        let hot = RedisHot::connect(&test_config()).await.unwrap();
        let project = unique_project();
        let logical = format!("{project}:0123456789abcdef");

        let hits = vec![crate::types::SearchHit {
            record: record_for(&project, "cached"),
            score: 0.5,
            source: crate::types::HitSource::Keyword,
        }];
        hot.cache_result(&logical, 60, &hits).await.unwrap();

        let cached = hot.cached(&logical).await.unwrap().unwrap();
        assert_eq!(cached.len(), 1);
        assert_eq!(cached[0].record.content, "cached");

        hot.clear_project(&project).await.unwrap();
        assert!(hot.cached(&logical).await.unwrap().is_none());
    }

    #[tokio::test]
    #[ignore = "requires Redis"]
    async fn test_health_check() {
        let hot = RedisHot::connect(&test_config()).await.unwrap();
        assert!(hot.health_check().await);
    }
}
