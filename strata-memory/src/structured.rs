//! SQLite-backed structured tier: the system of record.
//!
//! Every other tier is a projection of what lives here. Writes are upserts
//! keyed on record id inside a transaction; reply chains are checked for
//! cycles and depth at write time so reads never have to defend against
//! them. All database work runs on the blocking pool, one connection per
//! call.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::{Path, PathBuf};

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use strata_common::{Error, Result};
use tracing::debug;

use crate::config::{RelevanceWeights, StructuredConfig};
use crate::keywords::extract_keywords;
use crate::traits::StructuredTier;
use crate::types::{
    Decision, HitSource, ProjectStats, Record, RecordKind, RecordPatch, RelevanceQuery, SearchHit,
    WorkItem, WorkStatus,
};

const RECORD_COLUMNS: &str =
    "id, project_id, sender, recipient, kind, content, timestamp, importance, tags, context, response_to";

const QUALIFIED_RECORD_COLUMNS: &str =
    "r.id, r.project_id, r.sender, r.recipient, r.kind, r.content, r.timestamp, r.importance, r.tags, r.context, r.response_to";

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS records (
    id TEXT PRIMARY KEY,
    project_id TEXT NOT NULL,
    sender TEXT NOT NULL,
    recipient TEXT,
    kind TEXT NOT NULL,
    content TEXT NOT NULL,
    timestamp TEXT NOT NULL,
    importance REAL NOT NULL DEFAULT 0.5,
    tags TEXT NOT NULL DEFAULT '[]',
    context TEXT,
    response_to TEXT REFERENCES records(id) ON DELETE SET NULL
);

CREATE INDEX IF NOT EXISTS idx_records_project_time ON records(project_id, timestamp DESC);
CREATE INDEX IF NOT EXISTS idx_records_sender ON records(project_id, sender);
CREATE INDEX IF NOT EXISTS idx_records_kind ON records(project_id, kind);
CREATE INDEX IF NOT EXISTS idx_records_response_to ON records(response_to);

CREATE VIRTUAL TABLE IF NOT EXISTS records_fts USING fts5(
    content,
    tags,
    content='records',
    content_rowid='rowid'
);

CREATE TRIGGER IF NOT EXISTS records_ai AFTER INSERT ON records BEGIN
    INSERT INTO records_fts(rowid, content, tags)
    VALUES (new.rowid, new.content, new.tags);
END;

CREATE TRIGGER IF NOT EXISTS records_ad AFTER DELETE ON records BEGIN
    INSERT INTO records_fts(records_fts, rowid, content, tags)
    VALUES ('delete', old.rowid, old.content, old.tags);
END;

CREATE TRIGGER IF NOT EXISTS records_au AFTER UPDATE ON records BEGIN
    INSERT INTO records_fts(records_fts, rowid, content, tags)
    VALUES ('delete', old.rowid, old.content, old.tags);
    INSERT INTO records_fts(rowid, content, tags)
    VALUES (new.rowid, new.content, new.tags);
END;

CREATE TABLE IF NOT EXISTS projects (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'active',
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS decisions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    record_id TEXT NOT NULL UNIQUE REFERENCES records(id) ON DELETE CASCADE,
    project_id TEXT NOT NULL,
    chosen TEXT NOT NULL,
    rejected TEXT NOT NULL,
    reasoning TEXT NOT NULL,
    decided_by TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_decisions_project ON decisions(project_id);

CREATE TABLE IF NOT EXISTS agent_contexts (
    agent_name TEXT NOT NULL,
    project_id TEXT NOT NULL,
    context_key TEXT NOT NULL,
    context_value TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (agent_name, project_id, context_key)
);

CREATE TABLE IF NOT EXISTS work_items (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    project_id TEXT NOT NULL,
    agent_name TEXT NOT NULL,
    task TEXT NOT NULL,
    priority INTEGER NOT NULL DEFAULT 5,
    status TEXT NOT NULL DEFAULT 'pending',
    created_at TEXT NOT NULL,
    completed_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_work_items_queue ON work_items(project_id, status, priority, id);
"#;

/// Structured tier over a SQLite file.
pub struct SqliteStructured {
    db_path: PathBuf,
    weights: RelevanceWeights,
    min_score: f32,
    candidate_limit: usize,
    max_thread_depth: usize,
}

fn open_connection(path: &Path) -> rusqlite::Result<Connection> {
    let conn = Connection::open(path)?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    Ok(conn)
}

fn sql_err(e: rusqlite::Error) -> Error {
    Error::Internal(format!("sqlite: {e}"))
}

fn format_ts(ts: &DateTime<Utc>) -> String {
    // Fixed-width form so lexicographic ORDER BY matches chronological order.
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

fn conversion_err(
    index: usize,
    source: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(index, rusqlite::types::Type::Text, Box::new(source))
}

/// Decode one `records` row selected with [`RECORD_COLUMNS`].
fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<Record> {
    let kind_str: String = row.get(4)?;
    let kind = kind_str
        .parse::<RecordKind>()
        .map_err(|e| conversion_err(4, e))?;

    let ts_str: String = row.get(6)?;
    let timestamp = DateTime::parse_from_rfc3339(&ts_str)
        .map_err(|e| conversion_err(6, e))?
        .with_timezone(&Utc);

    let tags_str: String = row.get(8)?;
    let tags: BTreeSet<String> = serde_json::from_str(&tags_str).unwrap_or_default();

    let context = row
        .get::<_, Option<String>>(9)?
        .and_then(|s| serde_json::from_str(&s).ok());

    Ok(Record {
        id: row.get(0)?,
        project_id: row.get(1)?,
        sender: row.get(2)?,
        recipient: row.get(3)?,
        kind,
        content: row.get(5)?,
        timestamp,
        importance: row.get::<_, f64>(7)? as f32,
        tags,
        context,
        response_to: row.get(10)?,
    })
}

fn row_to_work_item(row: &rusqlite::Row<'_>) -> rusqlite::Result<WorkItem> {
    let status_str: String = row.get(5)?;
    let status = status_str
        .parse::<WorkStatus>()
        .map_err(|e| conversion_err(5, e))?;

    let created_str: String = row.get(6)?;
    let created_at = DateTime::parse_from_rfc3339(&created_str)
        .map_err(|e| conversion_err(6, e))?
        .with_timezone(&Utc);

    let completed_at = row
        .get::<_, Option<String>>(7)?
        .as_deref()
        .and_then(parse_ts);

    Ok(WorkItem {
        id: row.get(0)?,
        project_id: row.get(1)?,
        agent_name: row.get(2)?,
        task: row.get(3)?,
        priority: row.get(4)?,
        status,
        created_at,
        completed_at,
    })
}

/// Strip FTS5 operators and OR the remaining words.
fn escape_fts5_query(query: &str) -> String {
    query
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c.is_whitespace() {
                c
            } else {
                ' '
            }
        })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" OR ")
}

/// The four-term relevance score. Pure so it can be tested without a
/// database.
fn relevance_score(
    record: &Record,
    keywords: &[String],
    agent_id: &str,
    now: DateTime<Utc>,
    weights: &RelevanceWeights,
) -> f32 {
    let keyword_overlap = if keywords.is_empty() || record.tags.is_empty() {
        0.0
    } else {
        let tag_set: HashSet<String> = record.tags.iter().map(|t| t.to_lowercase()).collect();
        let matched = keywords.iter().filter(|k| tag_set.contains(*k)).count();
        matched as f32 / keywords.len() as f32
    };

    let age = now - record.timestamp;
    let recency = if age < chrono::Duration::hours(1) {
        1.0
    } else if age < chrono::Duration::days(1) {
        0.7
    } else if age < chrono::Duration::weeks(1) {
        0.4
    } else {
        0.2
    };

    let mut involvement = 0.0;
    if record.sender == agent_id {
        involvement += 0.1;
    }
    if record.recipient.as_deref() == Some(agent_id) {
        involvement += 0.1;
    }

    weights.keyword * keyword_overlap
        + weights.recency * recency
        + weights.importance * record.importance
        + weights.involvement * involvement
}

impl SqliteStructured {
    /// Open (creating if needed) the database and apply the schema.
    pub fn new(config: &StructuredConfig) -> Result<Self> {
        if let Some(parent) = config.db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = open_connection(&config.db_path)
            .map_err(|e| Error::unavailable("structured", e))?;
        conn.execute_batch(SCHEMA).map_err(sql_err)?;

        Ok(Self {
            db_path: config.db_path.clone(),
            weights: config.relevance,
            min_score: config.min_score,
            candidate_limit: config.candidate_limit.max(1),
            max_thread_depth: config.max_thread_depth.max(1),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || -> Result<T> {
            let mut conn =
                open_connection(&db_path).map_err(|e| Error::unavailable("structured", e))?;
            f(&mut conn)
        })
        .await
        .map_err(|e| Error::Internal(format!("blocking task join: {e}")))?
    }
}

/// Walk the ancestor chain of `parent_id`, rejecting cycles back to
/// `record_id` and chains deeper than `max_depth`. Fails closed.
fn check_reply_chain(
    conn: &Connection,
    record_id: &str,
    parent_id: &str,
    max_depth: usize,
) -> Result<()> {
    let mut depth = 1usize;
    let mut cursor = Some(parent_id.to_string());

    while let Some(current) = cursor {
        if current == record_id {
            return Err(Error::Validation(format!(
                "reply chain of record '{record_id}' is cyclic"
            )));
        }
        if depth > max_depth {
            return Err(Error::Validation(format!(
                "reply chain of record '{record_id}' exceeds max depth {max_depth}"
            )));
        }

        let next: Option<Option<String>> = conn
            .query_row(
                "SELECT response_to FROM records WHERE id = ?1",
                params![current],
                |row| row.get(0),
            )
            .optional()
            .map_err(sql_err)?;

        match next {
            Some(parent_of_current) => {
                cursor = parent_of_current;
                depth += 1;
            }
            None if depth == 1 => {
                return Err(Error::Validation(format!(
                    "response_to references unknown record '{current}'"
                )));
            }
            None => break,
        }
    }
    Ok(())
}

#[async_trait::async_trait]
impl StructuredTier for SqliteStructured {
    async fn store(&self, record: &Record) -> Result<String> {
        record.validate()?;
        let record = record.clone();
        let max_depth = self.max_thread_depth;

        self.with_conn(move |conn| {
            let tx = conn.transaction().map_err(sql_err)?;

            if let Some(parent_id) = &record.response_to {
                check_reply_chain(&tx, &record.id, parent_id, max_depth)?;
            }

            let existing: Option<String> = tx
                .query_row(
                    "SELECT content FROM records WHERE id = ?1",
                    params![record.id],
                    |row| row.get(0),
                )
                .optional()
                .map_err(sql_err)?;

            let tags_json = serde_json::to_string(&record.tags)?;
            match existing {
                Some(content) if content != record.content => {
                    return Err(Error::Conflict(format!(
                        "record '{}' already stored with different content",
                        record.id
                    )));
                }
                Some(_) => {
                    tx.execute(
                        "UPDATE records SET importance = ?1, tags = ?2 WHERE id = ?3",
                        params![record.importance as f64, tags_json, record.id],
                    )
                    .map_err(sql_err)?;
                }
                None => {
                    let context_json = record
                        .context
                        .as_ref()
                        .map(serde_json::to_string)
                        .transpose()?;
                    tx.execute(
                        "INSERT INTO records (id, project_id, sender, recipient, kind, content, \
                         timestamp, importance, tags, context, response_to) \
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                        params![
                            record.id,
                            record.project_id,
                            record.sender,
                            record.recipient,
                            record.kind.as_str(),
                            record.content,
                            format_ts(&record.timestamp),
                            record.importance as f64,
                            tags_json,
                            context_json,
                            record.response_to,
                        ],
                    )
                    .map_err(sql_err)?;
                }
            }

            tx.commit().map_err(sql_err)?;
            debug!(record_id = %record.id, project_id = %record.project_id, "stored record");
            Ok(record.id.clone())
        })
        .await
    }

    async fn get(&self, record_id: &str) -> Result<Option<Record>> {
        let record_id = record_id.to_string();
        self.with_conn(move |conn| {
            let sql = format!("SELECT {RECORD_COLUMNS} FROM records WHERE id = ?1");
            conn.query_row(&sql, params![record_id], row_to_record)
                .optional()
                .map_err(sql_err)
        })
        .await
    }

    async fn amend(&self, record_id: &str, patch: RecordPatch) -> Result<Record> {
        if let Some(importance) = patch.importance {
            if !importance.is_finite() || !(0.0..=1.0).contains(&importance) {
                return Err(Error::Validation(format!(
                    "importance must be within [0, 1], got {importance}"
                )));
            }
        }
        let record_id = record_id.to_string();

        self.with_conn(move |conn| {
            let tx = conn.transaction().map_err(sql_err)?;

            let sql = format!("SELECT {RECORD_COLUMNS} FROM records WHERE id = ?1");
            let mut record = tx
                .query_row(&sql, params![record_id], row_to_record)
                .optional()
                .map_err(sql_err)?
                .ok_or_else(|| Error::NotFound(format!("record '{record_id}'")))?;

            if let Some(importance) = patch.importance {
                record.importance = importance;
            }
            if let Some(tags) = patch.tags {
                record.tags = tags;
            }

            let tags_json = serde_json::to_string(&record.tags)?;
            tx.execute(
                "UPDATE records SET importance = ?1, tags = ?2 WHERE id = ?3",
                params![record.importance as f64, tags_json, record_id],
            )
            .map_err(sql_err)?;

            tx.commit().map_err(sql_err)?;
            Ok(record)
        })
        .await
    }

    async fn relevant_context(&self, query: &RelevanceQuery) -> Result<Vec<SearchHit>> {
        let keywords = extract_keywords(&query.query_text);
        let weights = self.weights;
        let min_score = self.min_score;
        let candidate_limit = self.candidate_limit;
        let query = query.clone();

        self.with_conn(move |conn| {
            let now = Utc::now();
            let cutoff = query.time_window.map(|w| format_ts(&(now - w)));

            let candidates: Vec<Record> = if let Some(cutoff) = cutoff {
                let sql = format!(
                    "SELECT {RECORD_COLUMNS} FROM records \
                     WHERE project_id = ?1 AND importance >= ?2 AND timestamp >= ?3 \
                     ORDER BY timestamp DESC LIMIT {candidate_limit}"
                );
                let mut stmt = conn.prepare(&sql).map_err(sql_err)?;
                let rows = stmt
                    .query_map(
                        params![query.project_id, query.min_importance as f64, cutoff],
                        row_to_record,
                    )
                    .map_err(sql_err)?;
                rows.flatten().collect()
            } else {
                let sql = format!(
                    "SELECT {RECORD_COLUMNS} FROM records \
                     WHERE project_id = ?1 AND importance >= ?2 \
                     ORDER BY timestamp DESC LIMIT {candidate_limit}"
                );
                let mut stmt = conn.prepare(&sql).map_err(sql_err)?;
                let rows = stmt
                    .query_map(
                        params![query.project_id, query.min_importance as f64],
                        row_to_record,
                    )
                    .map_err(sql_err)?;
                rows.flatten().collect()
            };

            let mut scored: Vec<(Record, f32)> = candidates
                .into_iter()
                .map(|record| {
                    let score =
                        relevance_score(&record, &keywords, &query.agent_id, now, &weights);
                    (record, score)
                })
                .filter(|(_, score)| *score > min_score)
                .collect();

            scored.sort_by(|a, b| {
                b.1.partial_cmp(&a.1)
                    .unwrap_or(Ordering::Equal)
                    .then_with(|| b.0.timestamp.cmp(&a.0.timestamp))
            });
            scored.truncate(query.max_results);

            Ok(scored
                .into_iter()
                .map(|(record, score)| SearchHit {
                    record,
                    score,
                    source: HitSource::Relevance,
                })
                .collect())
        })
        .await
    }

    async fn thread_of(&self, record_id: &str) -> Result<Vec<Record>> {
        let record_id = record_id.to_string();
        let max_depth = self.max_thread_depth;

        self.with_conn(move |conn| {
            let exists: Option<String> = conn
                .query_row(
                    "SELECT id FROM records WHERE id = ?1",
                    params![record_id],
                    |row| row.get(0),
                )
                .optional()
                .map_err(sql_err)?;
            if exists.is_none() {
                return Err(Error::NotFound(format!("record '{record_id}'")));
            }

            let sql = format!(
                "WITH RECURSIVE thread(id, depth) AS ( \
                     SELECT id, 0 FROM records WHERE id = ?1 \
                     UNION ALL \
                     SELECT r.id, t.depth + 1 FROM records r \
                     JOIN thread t ON r.response_to = t.id \
                     WHERE t.depth < ?2 \
                 ) \
                 SELECT {RECORD_COLUMNS} FROM records \
                 WHERE id IN (SELECT id FROM thread) \
                 ORDER BY timestamp ASC"
            );
            let mut stmt = conn.prepare(&sql).map_err(sql_err)?;
            let rows = stmt
                .query_map(params![record_id, max_depth as i64], row_to_record)
                .map_err(sql_err)?;
            Ok(rows.flatten().collect())
        })
        .await
    }

    async fn search_by_keyword(
        &self,
        project_id: &str,
        query: &str,
        limit: usize,
    ) -> Result<Vec<SearchHit>> {
        let trimmed = query.trim().to_string();
        if trimmed.is_empty() {
            return Ok(Vec::new());
        }
        let escaped = escape_fts5_query(&trimmed);
        let project_id = project_id.to_string();
        let limit = limit.max(1);

        self.with_conn(move |conn| {
            let mut hits: Vec<SearchHit> = Vec::new();

            if !escaped.is_empty() {
                let sql = format!(
                    "SELECT {QUALIFIED_RECORD_COLUMNS}, -bm25(records_fts) AS score \
                     FROM records_fts \
                     JOIN records r ON r.rowid = records_fts.rowid \
                     WHERE records_fts MATCH ?1 AND r.project_id = ?2 \
                     ORDER BY r.timestamp DESC LIMIT {limit}"
                );
                let mut stmt = conn.prepare(&sql).map_err(sql_err)?;
                let rows = stmt
                    .query_map(params![escaped, project_id], |row| {
                        let record = row_to_record(row)?;
                        let score: f64 = row.get(11)?;
                        Ok(SearchHit {
                            record,
                            score: score as f32,
                            source: HitSource::Keyword,
                        })
                    })
                    .map_err(sql_err)?;
                hits = rows.flatten().collect();
            }

            if hits.is_empty() {
                // FTS found nothing; substring match catches partial words.
                let sql = format!(
                    "SELECT {RECORD_COLUMNS} FROM records \
                     WHERE project_id = ?1 AND content LIKE ?2 \
                     ORDER BY timestamp DESC LIMIT {limit}"
                );
                let pattern = format!("%{trimmed}%");
                let mut stmt = conn.prepare(&sql).map_err(sql_err)?;
                let rows = stmt
                    .query_map(params![project_id, pattern], row_to_record)
                    .map_err(sql_err)?;
                hits = rows
                    .flatten()
                    .map(|record| SearchHit {
                        record,
                        score: 0.0,
                        source: HitSource::Keyword,
                    })
                    .collect();
            }

            Ok(hits)
        })
        .await
    }

    async fn agent_history(
        &self,
        project_id: &str,
        agent_id: &str,
        limit: usize,
    ) -> Result<Vec<Record>> {
        let project_id = project_id.to_string();
        let agent_id = agent_id.to_string();
        let limit = limit.max(1);

        self.with_conn(move |conn| {
            let sql = format!(
                "SELECT {RECORD_COLUMNS} FROM records \
                 WHERE project_id = ?1 AND (sender = ?2 OR recipient = ?2) \
                 ORDER BY timestamp DESC LIMIT {limit}"
            );
            let mut stmt = conn.prepare(&sql).map_err(sql_err)?;
            let rows = stmt
                .query_map(params![project_id, agent_id], row_to_record)
                .map_err(sql_err)?;
            Ok(rows.flatten().collect())
        })
        .await
    }

    async fn records_by_kind(
        &self,
        project_id: &str,
        kind: RecordKind,
        limit: usize,
    ) -> Result<Vec<Record>> {
        let project_id = project_id.to_string();
        let limit = limit.max(1);

        self.with_conn(move |conn| {
            let sql = format!(
                "SELECT {RECORD_COLUMNS} FROM records \
                 WHERE project_id = ?1 AND kind = ?2 \
                 ORDER BY timestamp DESC LIMIT {limit}"
            );
            let mut stmt = conn.prepare(&sql).map_err(sql_err)?;
            let rows = stmt
                .query_map(params![project_id, kind.as_str()], row_to_record)
                .map_err(sql_err)?;
            Ok(rows.flatten().collect())
        })
        .await
    }

    async fn log_decision(&self, decision: &Decision) -> Result<()> {
        decision.validate()?;
        let record_id = decision.record.id.clone();
        let project_id = decision.record.project_id.clone();
        let chosen = serde_json::to_string(&decision.chosen)?;
        let rejected = serde_json::to_string(&decision.rejected)?;
        let reasoning = serde_json::to_string(&decision.reasoning)?;
        let decided_by = serde_json::to_string(&decision.decided_by)?;

        self.with_conn(move |conn| {
            let exists: Option<String> = conn
                .query_row(
                    "SELECT id FROM records WHERE id = ?1",
                    params![record_id],
                    |row| row.get(0),
                )
                .optional()
                .map_err(sql_err)?;
            if exists.is_none() {
                return Err(Error::NotFound(format!(
                    "decision record '{record_id}' is not stored"
                )));
            }

            // One decision row per record id; re-logging is a no-op.
            conn.execute(
                "INSERT INTO decisions (record_id, project_id, chosen, rejected, reasoning, \
                 decided_by, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7) \
                 ON CONFLICT(record_id) DO NOTHING",
                params![
                    record_id,
                    project_id,
                    chosen,
                    rejected,
                    reasoning,
                    decided_by,
                    format_ts(&Utc::now()),
                ],
            )
            .map_err(sql_err)?;
            Ok(())
        })
        .await
    }

    async fn ensure_project(&self, project_id: &str, name: &str) -> Result<()> {
        let project_id = project_id.to_string();
        let name = name.to_string();

        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO projects (id, name, status, created_at) \
                 VALUES (?1, ?2, 'active', ?3) ON CONFLICT(id) DO NOTHING",
                params![project_id, name, format_ts(&Utc::now())],
            )
            .map_err(sql_err)?;
            Ok(())
        })
        .await
    }

    async fn project_stats(&self, project_id: &str) -> Result<ProjectStats> {
        let project_id = project_id.to_string();

        self.with_conn(move |conn| {
            let (records, first_raw, last_raw): (i64, Option<String>, Option<String>) = conn
                .query_row(
                    "SELECT COUNT(*), MIN(timestamp), MAX(timestamp) \
                     FROM records WHERE project_id = ?1",
                    params![project_id],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                )
                .map_err(sql_err)?;

            let mut by_kind = BTreeMap::new();
            let mut stmt = conn
                .prepare(
                    "SELECT kind, COUNT(*) FROM records WHERE project_id = ?1 GROUP BY kind",
                )
                .map_err(sql_err)?;
            let rows = stmt
                .query_map(params![project_id], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
                })
                .map_err(sql_err)?;
            for row in rows.flatten() {
                by_kind.insert(row.0, row.1 as usize);
            }

            let decisions: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM decisions WHERE project_id = ?1",
                    params![project_id],
                    |row| row.get(0),
                )
                .map_err(sql_err)?;

            let agents: i64 = conn
                .query_row(
                    "SELECT COUNT(DISTINCT sender) FROM records WHERE project_id = ?1",
                    params![project_id],
                    |row| row.get(0),
                )
                .map_err(sql_err)?;

            Ok(ProjectStats {
                project_id,
                records: records as usize,
                by_kind,
                decisions: decisions as usize,
                agents: agents as usize,
                first_activity: first_raw.as_deref().and_then(parse_ts),
                last_activity: last_raw.as_deref().and_then(parse_ts),
            })
        })
        .await
    }

    async fn set_agent_context(
        &self,
        project_id: &str,
        agent_id: &str,
        key: &str,
        value: &serde_json::Value,
    ) -> Result<()> {
        let project_id = project_id.to_string();
        let agent_id = agent_id.to_string();
        let key = key.to_string();
        let value = serde_json::to_string(value)?;

        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO agent_contexts (agent_name, project_id, context_key, context_value, \
                 updated_at) VALUES (?1, ?2, ?3, ?4, ?5) \
                 ON CONFLICT(agent_name, project_id, context_key) DO UPDATE SET \
                 context_value = excluded.context_value, updated_at = excluded.updated_at",
                params![agent_id, project_id, key, value, format_ts(&Utc::now())],
            )
            .map_err(sql_err)?;
            Ok(())
        })
        .await
    }

    async fn get_agent_context(
        &self,
        project_id: &str,
        agent_id: &str,
        key: &str,
    ) -> Result<Option<serde_json::Value>> {
        let project_id = project_id.to_string();
        let agent_id = agent_id.to_string();
        let key = key.to_string();

        self.with_conn(move |conn| {
            let raw: Option<String> = conn
                .query_row(
                    "SELECT context_value FROM agent_contexts \
                     WHERE agent_name = ?1 AND project_id = ?2 AND context_key = ?3",
                    params![agent_id, project_id, key],
                    |row| row.get(0),
                )
                .optional()
                .map_err(sql_err)?;
            match raw {
                Some(s) => Ok(Some(serde_json::from_str(&s)?)),
                None => Ok(None),
            }
        })
        .await
    }

    async fn agent_context_all(
        &self,
        project_id: &str,
        agent_id: &str,
    ) -> Result<BTreeMap<String, serde_json::Value>> {
        let project_id = project_id.to_string();
        let agent_id = agent_id.to_string();

        self.with_conn(move |conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT context_key, context_value FROM agent_contexts \
                     WHERE agent_name = ?1 AND project_id = ?2",
                )
                .map_err(sql_err)?;
            let rows = stmt
                .query_map(params![agent_id, project_id], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
                })
                .map_err(sql_err)?;

            let mut all = BTreeMap::new();
            for (key, raw) in rows.flatten() {
                all.insert(key, serde_json::from_str(&raw)?);
            }
            Ok(all)
        })
        .await
    }

    async fn add_work_item(
        &self,
        project_id: &str,
        agent_id: &str,
        task: &str,
        priority: i64,
    ) -> Result<i64> {
        let project_id = project_id.to_string();
        let agent_id = agent_id.to_string();
        let task = task.to_string();

        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO work_items (project_id, agent_name, task, priority, status, \
                 created_at) VALUES (?1, ?2, ?3, ?4, 'pending', ?5)",
                params![project_id, agent_id, task, priority, format_ts(&Utc::now())],
            )
            .map_err(sql_err)?;
            Ok(conn.last_insert_rowid())
        })
        .await
    }

    async fn next_work_item(&self, project_id: &str) -> Result<Option<WorkItem>> {
        let project_id = project_id.to_string();

        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT id, project_id, agent_name, task, priority, status, created_at, \
                 completed_at FROM work_items \
                 WHERE project_id = ?1 AND status = 'pending' \
                 ORDER BY priority ASC, id ASC LIMIT 1",
                params![project_id],
                row_to_work_item,
            )
            .optional()
            .map_err(sql_err)
        })
        .await
    }

    async fn complete_work_item(&self, item_id: i64) -> Result<bool> {
        self.with_conn(move |conn| {
            let affected = conn
                .execute(
                    "UPDATE work_items SET status = 'done', completed_at = ?1 \
                     WHERE id = ?2 AND status = 'pending'",
                    params![format_ts(&Utc::now()), item_id],
                )
                .map_err(sql_err)?;
            Ok(affected > 0)
        })
        .await
    }

    async fn clear_project(&self, project_id: &str) -> Result<usize> {
        let project_id = project_id.to_string();

        self.with_conn(move |conn| {
            let tx = conn.transaction().map_err(sql_err)?;

            tx.execute(
                "DELETE FROM decisions WHERE project_id = ?1",
                params![project_id],
            )
            .map_err(sql_err)?;
            tx.execute(
                "DELETE FROM work_items WHERE project_id = ?1",
                params![project_id],
            )
            .map_err(sql_err)?;
            tx.execute(
                "DELETE FROM agent_contexts WHERE project_id = ?1",
                params![project_id],
            )
            .map_err(sql_err)?;
            let removed = tx
                .execute(
                    "DELETE FROM records WHERE project_id = ?1",
                    params![project_id],
                )
                .map_err(sql_err)?;
            tx.execute(
                "DELETE FROM projects WHERE id = ?1",
                params![project_id],
            )
            .map_err(sql_err)?;

            tx.commit().map_err(sql_err)?;
            debug!(project_id = %project_id, removed, "cleared structured tier for project");
            Ok(removed)
        })
        .await
    }

    async fn health_check(&self) -> bool {
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || -> bool {
            Connection::open(&db_path)
                .and_then(|conn| conn.execute_batch("SELECT 1"))
                .is_ok()
        })
        .await
        .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::NewRecord;
    use tempfile::TempDir;

    fn setup() -> (TempDir, SqliteStructured) {
        let tmp = TempDir::new().unwrap();
        let config = StructuredConfig {
            db_path: tmp.path().join("memory.db"),
            ..Default::default()
        };
        let tier = SqliteStructured::new(&config).unwrap();
        (tmp, tier)
    }

    fn record(project: &str, sender: &str, kind: RecordKind, content: &str) -> Record {
        NewRecord::new(project, sender, kind, content).build().unwrap()
    }

    #[tokio::test]
    async fn store_and_get_roundtrip() {
        let (_tmp, tier) = setup();

        let mut original = record("proj-1", "architect", RecordKind::Decision, "Use PostgreSQL");
        original.recipient = Some("pm".to_string());
        original.tags = ["postgresql", "database"].iter().map(|s| s.to_string()).collect();
        original.importance = 0.9;
        original.context = Some(serde_json::json!({ "document_type": "general" }));

        let id = tier.store(&original).await.unwrap();
        assert_eq!(id, original.id);

        let fetched = tier.get(&id).await.unwrap().unwrap();
        assert_eq!(fetched.content, original.content);
        assert_eq!(fetched.recipient, original.recipient);
        assert_eq!(fetched.kind, RecordKind::Decision);
        assert_eq!(fetched.tags, original.tags);
        assert_eq!(fetched.importance, 0.9);
        assert_eq!(fetched.context, original.context);
    }

    #[tokio::test]
    async fn get_missing_returns_none() {
        let (_tmp, tier) = setup();
        assert!(tier.get("ghost").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn store_same_content_amends_mutable_fields() {
        let (_tmp, tier) = setup();

        let mut r = record("proj-1", "pm", RecordKind::Update, "sprint status");
        tier.store(&r).await.unwrap();

        r.importance = 0.95;
        r.tags.insert("sprint".to_string());
        tier.store(&r).await.unwrap();

        let fetched = tier.get(&r.id).await.unwrap().unwrap();
        assert_eq!(fetched.importance, 0.95);
        assert!(fetched.tags.contains("sprint"));
        // Creation time never moves on re-store.
        assert_eq!(
            format_ts(&fetched.timestamp),
            format_ts(&r.timestamp)
        );
    }

    #[tokio::test]
    async fn store_divergent_content_is_a_conflict() {
        let (_tmp, tier) = setup();

        let mut r = record("proj-1", "pm", RecordKind::Update, "original text");
        tier.store(&r).await.unwrap();

        r.content = "rewritten text".to_string();
        let err = tier.store(&r).await.unwrap_err();
        assert!(matches!(err, Error::Conflict(_)), "got {err}");
    }

    #[tokio::test]
    async fn store_rejects_unknown_parent() {
        let (_tmp, tier) = setup();

        let mut r = record("proj-1", "pm", RecordKind::Response, "re: nothing");
        r.response_to = Some("ghost".to_string());
        let err = tier.store(&r).await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)), "got {err}");
    }

    #[tokio::test]
    async fn store_rejects_self_reply() {
        let (_tmp, tier) = setup();

        let mut r = record("proj-1", "pm", RecordKind::Response, "talking to myself");
        r.response_to = Some(r.id.clone());
        let err = tier.store(&r).await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test]
    async fn store_rejects_chain_beyond_max_depth() {
        let tmp = TempDir::new().unwrap();
        let config = StructuredConfig {
            db_path: tmp.path().join("memory.db"),
            max_thread_depth: 3,
            ..Default::default()
        };
        let tier = SqliteStructured::new(&config).unwrap();

        // A record may have at most max_thread_depth ancestors.
        let mut parent_id: Option<String> = None;
        for i in 0..4 {
            let mut r = record("proj-1", "pm", RecordKind::Response, &format!("msg {i}"));
            r.response_to = parent_id.clone();
            tier.store(&r).await.unwrap();
            parent_id = Some(r.id);
        }

        let mut overflow = record("proj-1", "pm", RecordKind::Response, "one too many");
        overflow.response_to = parent_id;
        let err = tier.store(&overflow).await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)), "got {err}");
    }

    #[tokio::test]
    async fn thread_of_returns_descendants_chronologically() {
        let (_tmp, tier) = setup();
        let base = Utc::now();

        let mut root = record("proj-1", "pm", RecordKind::Request, "please review");
        root.timestamp = base;
        tier.store(&root).await.unwrap();

        let mut reply_b = record("proj-1", "dev", RecordKind::Response, "looking now");
        reply_b.timestamp = base + chrono::Duration::seconds(1);
        reply_b.response_to = Some(root.id.clone());
        tier.store(&reply_b).await.unwrap();

        let mut reply_c = record("proj-1", "pm", RecordKind::Response, "thanks");
        reply_c.timestamp = base + chrono::Duration::seconds(2);
        reply_c.response_to = Some(reply_b.id.clone());
        tier.store(&reply_c).await.unwrap();

        let mut reply_d = record("proj-1", "qa", RecordKind::Response, "also reviewing");
        reply_d.timestamp = base + chrono::Duration::seconds(3);
        reply_d.response_to = Some(root.id.clone());
        tier.store(&reply_d).await.unwrap();

        let unrelated = record("proj-1", "pm", RecordKind::Update, "different topic");
        tier.store(&unrelated).await.unwrap();

        let thread = tier.thread_of(&root.id).await.unwrap();
        let ids: Vec<&str> = thread.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec![&root.id, &reply_b.id, &reply_c.id, &reply_d.id]);
        for pair in thread.windows(2) {
            assert!(pair[0].timestamp <= pair[1].timestamp);
        }

        // A mid-chain record threads only its own subtree.
        let subtree = tier.thread_of(&reply_b.id).await.unwrap();
        let ids: Vec<&str> = subtree.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec![&reply_b.id, &reply_c.id]);
    }

    #[tokio::test]
    async fn thread_of_missing_root_is_not_found() {
        let (_tmp, tier) = setup();
        let err = tier.thread_of("ghost").await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn keyword_search_finds_tagged_records() {
        let (_tmp, tier) = setup();

        let mut pg = record("proj-1", "architect", RecordKind::Decision, "Chose the main store");
        pg.tags.insert("postgresql".to_string());
        tier.store(&pg).await.unwrap();

        let mut mongo = record("proj-1", "architect", RecordKind::Debate, "Considered document DBs");
        mongo.tags.insert("mongodb".to_string());
        tier.store(&mongo).await.unwrap();

        let mut sec = record("proj-1", "security", RecordKind::Announcement, "Audit scheduled");
        sec.tags.insert("security".to_string());
        tier.store(&sec).await.unwrap();

        let hits = tier.search_by_keyword("proj-1", "postgresql", 10).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].record.id, pg.id);
        assert_eq!(hits[0].source, HitSource::Keyword);
    }

    #[tokio::test]
    async fn keyword_search_matches_content_words() {
        let (_tmp, tier) = setup();

        tier.store(&record("proj-1", "pm", RecordKind::Update, "Deployed the staging cluster"))
            .await
            .unwrap();
        tier.store(&record("proj-1", "pm", RecordKind::Update, "Lunch menu updated"))
            .await
            .unwrap();

        let hits = tier.search_by_keyword("proj-1", "staging cluster", 10).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert!(hits[0].record.content.contains("staging"));
        assert!(hits[0].score > 0.0);
    }

    #[tokio::test]
    async fn keyword_search_falls_back_to_substring() {
        let (_tmp, tier) = setup();

        tier.store(&record("proj-1", "dev", RecordKind::Update, "refactor the embeddings module"))
            .await
            .unwrap();

        // "bedding" is not a token FTS can match, only a substring.
        let hits = tier.search_by_keyword("proj-1", "bedding", 10).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].score, 0.0);
    }

    #[tokio::test]
    async fn keyword_search_scoped_to_project() {
        let (_tmp, tier) = setup();

        tier.store(&record("proj-1", "pm", RecordKind::Update, "postgresql tuning"))
            .await
            .unwrap();
        tier.store(&record("proj-2", "pm", RecordKind::Update, "postgresql upgrade"))
            .await
            .unwrap();

        let hits = tier.search_by_keyword("proj-1", "postgresql", 10).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].record.project_id, "proj-1");
    }

    #[tokio::test]
    async fn keyword_search_empty_query() {
        let (_tmp, tier) = setup();
        assert!(tier.search_by_keyword("proj-1", "   ", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn relevant_context_ranks_matching_record_top() {
        let (_tmp, tier) = setup();

        let mut relevant = record("proj-1", "architect", RecordKind::Decision, "Database selection");
        relevant.tags = ["postgresql", "database"].iter().map(|s| s.to_string()).collect();
        relevant.importance = 0.9;
        tier.store(&relevant).await.unwrap();

        let mut noise = record("proj-1", "pm", RecordKind::Update, "Standup notes");
        noise.importance = 0.3;
        noise.timestamp = Utc::now() - chrono::Duration::days(3);
        tier.store(&noise).await.unwrap();

        let query = RelevanceQuery::new("proj-1", "architect", "postgresql database tuning");
        let hits = tier.relevant_context(&query).await.unwrap();

        assert!(!hits.is_empty());
        assert_eq!(hits[0].record.id, relevant.id);
        assert_eq!(hits[0].source, HitSource::Relevance);
        for hit in &hits {
            assert!(hit.score > 0.1 && hit.score <= 1.0);
        }
    }

    #[tokio::test]
    async fn relevant_context_drops_low_scores() {
        let (_tmp, tier) = setup();

        // Old, unimportant, untagged, uninvolved: 0.2*0.2 + 0.3*0.1 = 0.07.
        let mut weak = record("proj-1", "someone", RecordKind::Update, "ancient trivia");
        weak.importance = 0.1;
        weak.timestamp = Utc::now() - chrono::Duration::days(30);
        tier.store(&weak).await.unwrap();

        let query = RelevanceQuery::new("proj-1", "architect", "completely unrelated topic");
        let hits = tier.relevant_context(&query).await.unwrap();
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn relevant_context_involvement_breaks_ties() {
        let (_tmp, tier) = setup();
        let base = Utc::now() - chrono::Duration::minutes(5);

        let mut mine = record("proj-1", "architect", RecordKind::Update, "my note");
        mine.timestamp = base;
        tier.store(&mine).await.unwrap();

        let mut theirs = record("proj-1", "pm", RecordKind::Update, "their note");
        theirs.timestamp = base;
        tier.store(&theirs).await.unwrap();

        let query = RelevanceQuery::new("proj-1", "architect", "note");
        let hits = tier.relevant_context(&query).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].record.id, mine.id);
        assert!(hits[0].score > hits[1].score);
    }

    #[tokio::test]
    async fn relevant_context_honors_time_window() {
        let (_tmp, tier) = setup();

        let mut old = record("proj-1", "architect", RecordKind::Decision, "old but important");
        old.importance = 1.0;
        old.timestamp = Utc::now() - chrono::Duration::days(10);
        tier.store(&old).await.unwrap();

        let mut query = RelevanceQuery::new("proj-1", "architect", "important");
        query.time_window = Some(chrono::Duration::days(7));
        assert!(tier.relevant_context(&query).await.unwrap().is_empty());

        query.time_window = None;
        assert_eq!(tier.relevant_context(&query).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn amend_updates_mutable_fields() {
        let (_tmp, tier) = setup();

        let r = record("proj-1", "pm", RecordKind::Update, "status");
        tier.store(&r).await.unwrap();

        let patch = RecordPatch {
            importance: Some(0.99),
            tags: Some(["urgent"].iter().map(|s| s.to_string()).collect()),
        };
        let amended = tier.amend(&r.id, patch).await.unwrap();
        assert_eq!(amended.importance, 0.99);
        assert!(amended.tags.contains("urgent"));
        assert_eq!(amended.content, "status");

        let fetched = tier.get(&r.id).await.unwrap().unwrap();
        assert_eq!(fetched.importance, 0.99);
    }

    #[tokio::test]
    async fn amend_missing_record_is_not_found() {
        let (_tmp, tier) = setup();
        let err = tier.amend("ghost", RecordPatch::default()).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn amend_rejects_bad_importance() {
        let (_tmp, tier) = setup();
        let patch = RecordPatch {
            importance: Some(1.5),
            tags: None,
        };
        let err = tier.amend("whatever", patch).await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test]
    async fn agent_history_covers_sent_and_received() {
        let (_tmp, tier) = setup();

        let sent = record("proj-1", "dev", RecordKind::Update, "sent by dev");
        tier.store(&sent).await.unwrap();

        let mut received = record("proj-1", "pm", RecordKind::Request, "sent to dev");
        received.recipient = Some("dev".to_string());
        tier.store(&received).await.unwrap();

        let neither = record("proj-1", "qa", RecordKind::Update, "unrelated");
        tier.store(&neither).await.unwrap();

        let history = tier.agent_history("proj-1", "dev", 10).await.unwrap();
        let ids: Vec<&str> = history.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(history.len(), 2);
        assert!(ids.contains(&sent.id.as_str()));
        assert!(ids.contains(&received.id.as_str()));
    }

    #[tokio::test]
    async fn records_by_kind_filters() {
        let (_tmp, tier) = setup();

        tier.store(&record("proj-1", "a", RecordKind::Decision, "d1")).await.unwrap();
        tier.store(&record("proj-1", "a", RecordKind::Update, "u1")).await.unwrap();
        tier.store(&record("proj-1", "a", RecordKind::Decision, "d2")).await.unwrap();

        let decisions = tier.records_by_kind("proj-1", RecordKind::Decision, 10).await.unwrap();
        assert_eq!(decisions.len(), 2);
        assert!(decisions.iter().all(|r| r.kind == RecordKind::Decision));
    }

    fn decision_for(record: Record) -> Decision {
        Decision {
            record,
            chosen: vec!["PostgreSQL".to_string()],
            rejected: vec!["MongoDB".to_string()],
            reasoning: vec!["ACID compliance required".to_string()],
            decided_by: vec!["architect".to_string()],
        }
    }

    #[tokio::test]
    async fn log_decision_requires_stored_record() {
        let (_tmp, tier) = setup();
        let decision = decision_for(record("proj-1", "architect", RecordKind::Decision, "db"));
        let err = tier.log_decision(&decision).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn log_decision_is_idempotent() {
        let (_tmp, tier) = setup();

        let r = record("proj-1", "architect", RecordKind::Decision, "db choice");
        tier.store(&r).await.unwrap();
        let decision = decision_for(r);

        tier.log_decision(&decision).await.unwrap();
        tier.log_decision(&decision).await.unwrap();

        let stats = tier.project_stats("proj-1").await.unwrap();
        assert_eq!(stats.decisions, 1);
    }

    #[tokio::test]
    async fn ensure_project_is_idempotent() {
        let (_tmp, tier) = setup();
        tier.ensure_project("proj-1", "Checkout rewrite").await.unwrap();
        tier.ensure_project("proj-1", "Renamed later").await.unwrap();
    }

    #[tokio::test]
    async fn project_stats_aggregates() {
        let (_tmp, tier) = setup();

        let mut early = record("proj-1", "pm", RecordKind::Update, "kickoff");
        early.timestamp = Utc::now() - chrono::Duration::days(2);
        tier.store(&early).await.unwrap();

        let d = record("proj-1", "architect", RecordKind::Decision, "db choice");
        tier.store(&d).await.unwrap();
        tier.log_decision(&decision_for(d)).await.unwrap();

        let stats = tier.project_stats("proj-1").await.unwrap();
        assert_eq!(stats.records, 2);
        assert_eq!(stats.decisions, 1);
        assert_eq!(stats.agents, 2);
        assert_eq!(stats.by_kind.get("UPDATE"), Some(&1));
        assert_eq!(stats.by_kind.get("DECISION"), Some(&1));
        assert!(stats.first_activity.unwrap() < stats.last_activity.unwrap());
    }

    #[tokio::test]
    async fn agent_context_roundtrip() {
        let (_tmp, tier) = setup();

        tier.set_agent_context("proj-1", "dev", "current_task", &serde_json::json!("auth module"))
            .await
            .unwrap();
        tier.set_agent_context("proj-1", "dev", "branch", &serde_json::json!({ "name": "feat/auth" }))
            .await
            .unwrap();

        let task = tier.get_agent_context("proj-1", "dev", "current_task").await.unwrap();
        assert_eq!(task, Some(serde_json::json!("auth module")));

        // Overwrite wins.
        tier.set_agent_context("proj-1", "dev", "current_task", &serde_json::json!("payments"))
            .await
            .unwrap();
        let task = tier.get_agent_context("proj-1", "dev", "current_task").await.unwrap();
        assert_eq!(task, Some(serde_json::json!("payments")));

        let all = tier.agent_context_all("proj-1", "dev").await.unwrap();
        assert_eq!(all.len(), 2);
        assert!(all.contains_key("branch"));

        assert!(tier
            .get_agent_context("proj-1", "dev", "missing")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn work_queue_orders_by_priority_then_fifo() {
        let (_tmp, tier) = setup();

        let low = tier.add_work_item("proj-1", "dev", "cleanup", 5).await.unwrap();
        let urgent_first = tier.add_work_item("proj-1", "dev", "fix prod", 1).await.unwrap();
        let urgent_second = tier.add_work_item("proj-1", "qa", "verify fix", 1).await.unwrap();

        let next = tier.next_work_item("proj-1").await.unwrap().unwrap();
        assert_eq!(next.id, urgent_first);
        assert!(tier.complete_work_item(next.id).await.unwrap());

        let next = tier.next_work_item("proj-1").await.unwrap().unwrap();
        assert_eq!(next.id, urgent_second);
        assert!(tier.complete_work_item(next.id).await.unwrap());

        let next = tier.next_work_item("proj-1").await.unwrap().unwrap();
        assert_eq!(next.id, low);
        assert_eq!(next.status, WorkStatus::Pending);
        assert!(tier.complete_work_item(next.id).await.unwrap());

        assert!(tier.next_work_item("proj-1").await.unwrap().is_none());
        // Completing twice reports false.
        assert!(!tier.complete_work_item(low).await.unwrap());
    }

    #[tokio::test]
    async fn clear_project_cascades_and_counts() {
        let (_tmp, tier) = setup();

        tier.ensure_project("proj-1", "Doomed").await.unwrap();
        let r1 = record("proj-1", "pm", RecordKind::Update, "one");
        let d = record("proj-1", "architect", RecordKind::Decision, "two");
        tier.store(&r1).await.unwrap();
        tier.store(&d).await.unwrap();
        tier.log_decision(&decision_for(d)).await.unwrap();
        tier.add_work_item("proj-1", "dev", "task", 3).await.unwrap();
        tier.set_agent_context("proj-1", "dev", "k", &serde_json::json!(1)).await.unwrap();

        let survivor = record("proj-2", "pm", RecordKind::Update, "keep me");
        tier.store(&survivor).await.unwrap();

        let removed = tier.clear_project("proj-1").await.unwrap();
        assert_eq!(removed, 2);

        assert!(tier.get(&r1.id).await.unwrap().is_none());
        assert!(tier.next_work_item("proj-1").await.unwrap().is_none());
        assert!(tier.agent_context_all("proj-1", "dev").await.unwrap().is_empty());
        let stats = tier.project_stats("proj-1").await.unwrap();
        assert_eq!(stats.records, 0);
        assert_eq!(stats.decisions, 0);

        assert!(tier.get(&survivor.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn health_check_reports_true() {
        let (_tmp, tier) = setup();
        assert!(tier.health_check().await);
    }

    #[test]
    fn escape_fts5_strips_operators() {
        let escaped = escape_fts5_query("hello \"world\" (test) AND bad:stuff");
        assert!(!escaped.contains('"'));
        assert!(!escaped.contains('('));
        assert!(!escaped.contains(':'));
        assert!(escaped.contains("hello OR world"));
    }

    #[test]
    fn relevance_score_matches_formula() {
        let weights = RelevanceWeights::default();
        let now = Utc::now();

        let mut r = NewRecord::new("p", "alice", RecordKind::Update, "db work")
            .tags(["postgresql", "database"])
            .importance(0.8)
            .build()
            .unwrap();
        r.recipient = Some("bob".to_string());
        r.timestamp = now - chrono::Duration::minutes(10);

        let keywords = vec!["postgresql".to_string(), "migration".to_string()];
        // overlap 1/2, recency 1.0, importance 0.8, involvement 0.1 (sender).
        let score = relevance_score(&r, &keywords, "alice", now, &weights);
        let expected = 0.3 * 0.5 + 0.2 * 1.0 + 0.3 * 0.8 + 0.2 * 0.1;
        assert!((score - expected).abs() < f32::EPSILON);

        // Sender and recipient both matching doubles the involvement term.
        r.recipient = Some("alice".to_string());
        let score_both = relevance_score(&r, &keywords, "alice", now, &weights);
        let expected_both = 0.3 * 0.5 + 0.2 * 1.0 + 0.3 * 0.8 + 0.2 * 0.2;
        assert!((score_both - expected_both).abs() < f32::EPSILON);

        // No tags means zero overlap regardless of keywords.
        r.tags.clear();
        let score = relevance_score(&r, &keywords, "nobody", now, &weights);
        let expected = 0.2 * 1.0 + 0.3 * 0.8;
        assert!((score - expected).abs() < f32::EPSILON);
    }

    #[test]
    fn relevance_recency_buckets() {
        let weights = RelevanceWeights {
            keyword: 0.0,
            recency: 1.0,
            importance: 0.0,
            involvement: 0.0,
        };
        let now = Utc::now();
        let mut r = NewRecord::new("p", "a", RecordKind::Update, "x").build().unwrap();

        for (age, expected) in [
            (chrono::Duration::minutes(30), 1.0f32),
            (chrono::Duration::hours(5), 0.7),
            (chrono::Duration::days(3), 0.4),
            (chrono::Duration::days(30), 0.2),
        ] {
            r.timestamp = now - age;
            let score = relevance_score(&r, &[], "a", now, &weights);
            // Weight involvement is zero, so sender match adds nothing.
            assert!((score - expected).abs() < f32::EPSILON, "age {age}");
        }
    }
}
