//! Knowledge store: ingested documents, their chunks, and hybrid search
//!
//! Items are persisted as a JSON `{text, metadata}` document plus mirrored
//! scalar columns for the search predicates. Retrieval combines a vector
//! similarity term with keyword scoring; partitions without the vector
//! function transparently run the same logical query ordered by keyword
//! priority, type weight, and recency.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::registry::{PartitionHandle, TenantRegistry};
use crate::embedding;
use crate::{Error, Result};

/// Column list for all knowledge SELECT queries
const KNOWLEDGE_COLUMNS: &str = "id, owner_id, content, embedding, created_at";

/// Typed metadata over the known keys, with a free-form escape hatch
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct KnowledgeMetadata {
    /// Source path for file-backed items
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    /// Declared document type (md, txt, pdf, ...)
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub doc_type: Option<String>,
    /// Visible to every tenant regardless of owner
    pub is_shared: bool,
    /// Full ingested document
    pub is_main: bool,
    /// Overlapping sub-window of a main item
    pub is_chunk: bool,
    /// Main item this chunk belongs to
    #[serde(skip_serializing_if = "Option::is_none")]
    pub original_id: Option<String>,
    /// Position of this chunk within its document
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chunk_index: Option<u32>,
    /// Forward-compatible free-form keys
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// A knowledge item (main document or chunk) in one partition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeItem {
    /// Content-derived identifier, unique within a partition
    pub id: String,
    /// Owning tenant/agent; `None` for shared items
    pub owner_id: Option<String>,
    pub text: String,
    pub metadata: KnowledgeMetadata,
    /// Not persisted into the result cache
    #[serde(skip)]
    pub embedding: Option<Vec<f32>>,
    pub created_at: DateTime<Utc>,
}

/// A retrieval candidate with its score components
#[derive(Debug, Clone)]
pub struct ScoredKnowledge {
    pub item: KnowledgeItem,
    /// `1 / (1 + distance)`; neutral 1.0 on the degraded path
    pub similarity: f32,
    /// Substring factor times chunk/main type weight
    pub keyword_score: f32,
}

/// Stored JSON document shape for the content column
#[derive(Serialize, Deserialize)]
struct StoredDoc {
    text: String,
    #[serde(default)]
    metadata: KnowledgeMetadata,
}

/// Knowledge store scoped over tenant partitions
#[derive(Clone)]
pub struct KnowledgeStore {
    registry: Arc<TenantRegistry>,
}

impl KnowledgeStore {
    /// Create a new knowledge store over a registry
    #[must_use]
    pub fn new(registry: Arc<TenantRegistry>) -> Self {
        Self { registry }
    }

    /// Whether this partition serves vector-scored search
    ///
    /// # Errors
    ///
    /// Returns error if the partition cannot be resolved.
    pub fn vector_search_available(&self, tenant: Option<&str>) -> Result<bool> {
        Ok(self.registry.handle(tenant)?.vector_search())
    }

    /// Insert a knowledge item.
    ///
    /// Ids are content-derived, so a duplicate key means the same source was
    /// ingested again: the violation is swallowed and logged, not raised.
    /// Shared items collide across tenants by design (info); private
    /// collisions are the idempotent re-ingest case (debug).
    ///
    /// # Errors
    ///
    /// Returns error if the partition cannot be resolved or the write fails
    /// for any reason other than a duplicate key.
    pub fn create(&self, item: &KnowledgeItem, tenant: Option<&str>) -> Result<()> {
        let conn = self.registry.handle(tenant)?.conn()?;

        let content = serde_json::to_string(&StoredDoc {
            text: item.text.clone(),
            metadata: item.metadata.clone(),
        })?;
        let embedding_bytes = item.embedding.as_ref().map(|e| embedding::to_bytes(e));

        let result = conn.execute(
            r"INSERT INTO knowledge (id, owner_id, content, embedding, is_main, is_chunk, is_shared, original_id, chunk_index, created_at)
              VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            rusqlite::params![
                item.id,
                item.owner_id,
                content,
                embedding_bytes,
                i32::from(item.metadata.is_main),
                i32::from(item.metadata.is_chunk),
                i32::from(item.metadata.is_shared),
                item.metadata.original_id,
                item.metadata.chunk_index,
                item.created_at.to_rfc3339(),
            ],
        );

        match result {
            Ok(_) => Ok(()),
            Err(e) => {
                let err = Error::from(e);
                if err.is_unique_violation() {
                    if item.metadata.is_shared {
                        tracing::info!(id = %item.id, "shared knowledge item already present, skipping");
                    } else {
                        tracing::debug!(id = %item.id, "knowledge item already present, skipping");
                    }
                    Ok(())
                } else {
                    Err(err)
                }
            }
        }
    }

    /// Get a knowledge item by id
    ///
    /// # Errors
    ///
    /// Returns error if the partition cannot be resolved or the read fails.
    pub fn get(&self, id: &str, tenant: Option<&str>) -> Result<Option<KnowledgeItem>> {
        let conn = self.registry.handle(tenant)?.conn()?;

        let result = conn.query_row(
            &format!("SELECT {KNOWLEDGE_COLUMNS} FROM knowledge WHERE id = ?1"),
            [id],
            row_to_item,
        );

        match result {
            Ok(item) => Ok(Some(item)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Hybrid vector + keyword search.
    ///
    /// Candidates must either clear the similarity threshold or land a
    /// keyword hit (score > 1.0) combined with similarity >= 0.3; they come
    /// back ordered by `similarity * keyword_score`. Visibility is the
    /// owner's items plus shared ones. On partitions without the vector
    /// function the same logical query runs keyword-only, ordered by keyword
    /// hit, type weight, then recency, with a neutral similarity of 1.0.
    ///
    /// # Errors
    ///
    /// Returns error if the partition cannot be resolved or the query fails.
    pub fn search(
        &self,
        query_embedding: &[f32],
        query_text: &str,
        owner: Option<&str>,
        match_threshold: f32,
        limit: usize,
        tenant: Option<&str>,
    ) -> Result<Vec<ScoredKnowledge>> {
        let handle = self.registry.handle(tenant)?;

        if handle.vector_search() {
            search_vector(&handle, query_embedding, query_text, owner, match_threshold, limit)
        } else {
            search_fallback(&handle, query_text, owner, limit)
        }
    }

    /// Delete an item and every chunk that references it, atomically.
    ///
    /// Deleting a chunk directly never removes its parent: the cascade only
    /// follows `original_id` downward.
    ///
    /// # Errors
    ///
    /// Returns error if the partition cannot be resolved or the write fails.
    pub fn remove(&self, id: &str, tenant: Option<&str>) -> Result<usize> {
        let conn = self.registry.handle(tenant)?.conn()?;
        let deleted = conn.execute(
            "DELETE FROM knowledge WHERE id = ?1 OR original_id = ?1",
            [id],
        )?;

        if deleted > 0 {
            tracing::debug!(id, count = deleted, "removed knowledge item and chunks");
        }
        Ok(deleted)
    }

    /// Delete every item whose id starts with a prefix (wildcard delete)
    ///
    /// # Errors
    ///
    /// Returns error if the partition cannot be resolved or the write fails.
    pub fn remove_prefix(&self, prefix: &str, tenant: Option<&str>) -> Result<usize> {
        let conn = self.registry.handle(tenant)?.conn()?;
        let pattern = format!("{prefix}%");
        let deleted = conn.execute("DELETE FROM knowledge WHERE id LIKE ?1", [pattern])?;

        if deleted > 0 {
            tracing::debug!(prefix, count = deleted, "removed knowledge items by prefix");
        }
        Ok(deleted)
    }

    /// Delete all items owned by `owner`, plus shared items if requested
    ///
    /// # Errors
    ///
    /// Returns error if the partition cannot be resolved or the write fails.
    pub fn clear(
        &self,
        owner: &str,
        include_shared: bool,
        tenant: Option<&str>,
    ) -> Result<usize> {
        let conn = self.registry.handle(tenant)?.conn()?;

        let deleted = if include_shared {
            conn.execute(
                "DELETE FROM knowledge WHERE owner_id = ?1 OR is_shared = 1",
                [owner],
            )?
        } else {
            conn.execute("DELETE FROM knowledge WHERE owner_id = ?1", [owner])?
        };

        tracing::info!(owner, include_shared, count = deleted, "cleared knowledge");
        Ok(deleted)
    }

    /// List `(id, source)` for main items that carry a source path.
    ///
    /// Used by the cleanup sweeper to reconcile against the filesystem.
    ///
    /// # Errors
    ///
    /// Returns error if the partition cannot be resolved or the read fails.
    pub fn list_file_backed(&self, tenant: Option<&str>) -> Result<Vec<(String, String)>> {
        let conn = self.registry.handle(tenant)?.conn()?;

        let mut stmt = conn.prepare(
            r"SELECT id, json_extract(content, '$.metadata.source')
              FROM knowledge
              WHERE is_main = 1
                AND json_extract(content, '$.metadata.source') IS NOT NULL",
        )?;
        let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;

        Ok(rows.flatten().collect())
    }

    /// Number of chunks referencing a main item
    ///
    /// # Errors
    ///
    /// Returns error if the partition cannot be resolved or the read fails.
    pub fn chunk_count(&self, main_id: &str, tenant: Option<&str>) -> Result<u64> {
        let conn = self.registry.handle(tenant)?.conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM knowledge WHERE original_id = ?1",
            [main_id],
            |row| row.get(0),
        )?;
        Ok(u64::try_from(count).unwrap_or(0))
    }
}

impl std::fmt::Debug for KnowledgeStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KnowledgeStore").finish_non_exhaustive()
    }
}

fn search_vector(
    handle: &PartitionHandle,
    query_embedding: &[f32],
    query_text: &str,
    owner: Option<&str>,
    match_threshold: f32,
    limit: usize,
) -> Result<Vec<ScoredKnowledge>> {
    let conn = handle.conn()?;
    let embedding_bytes = embedding::to_bytes(query_embedding);
    let like_pattern = format!("%{}%", query_text.to_lowercase());

    let sql = format!(
        r"WITH scored AS (
              SELECT id,
                     1.0 / (1.0 + vec_distance_l2(embedding, ?1)) AS vector_score,
                     (CASE WHEN lower(json_extract(content, '$.text')) LIKE ?2 THEN 3.0 ELSE 1.0 END)
                     * (CASE WHEN is_chunk = 1 THEN 1.5
                             WHEN is_main = 1 THEN 1.2
                             ELSE 1.0 END) AS keyword_score
              FROM knowledge
              WHERE embedding IS NOT NULL
                AND (is_shared = 1 OR owner_id IS ?3)
          )
          SELECT {prefixed}, s.vector_score, s.keyword_score
          FROM knowledge k
          JOIN scored s ON k.id = s.id
          WHERE s.vector_score >= ?4
             OR (s.keyword_score > 1.0 AND s.vector_score >= 0.3)
          ORDER BY s.vector_score * s.keyword_score DESC
          LIMIT ?5",
        prefixed = prefixed_columns(),
    );

    let mut stmt = conn.prepare(&sql)?;

    #[allow(clippy::cast_possible_wrap)]
    let rows = stmt.query_map(
        rusqlite::params![
            embedding_bytes,
            like_pattern,
            owner,
            f64::from(match_threshold),
            limit as i64
        ],
        |row| {
            let item = row_to_item(row)?;
            let vector_score: f64 = row.get(5)?;
            let keyword_score: f64 = row.get(6)?;
            Ok((item, vector_score, keyword_score))
        },
    )?;

    #[allow(clippy::cast_possible_truncation)]
    let results = rows
        .flatten()
        .map(|(item, vector_score, keyword_score)| ScoredKnowledge {
            item,
            similarity: vector_score as f32,
            keyword_score: keyword_score as f32,
        })
        .collect();
    Ok(results)
}

/// Keyword-only path for partitions without the vector function.
///
/// Same visibility and scoring shape; ordering falls back to keyword hit,
/// type weight, then recency, and similarity reports a neutral 1.0.
pub(crate) fn search_fallback(
    handle: &PartitionHandle,
    query_text: &str,
    owner: Option<&str>,
    limit: usize,
) -> Result<Vec<ScoredKnowledge>> {
    let conn = handle.conn()?;
    let like_pattern = format!("%{}%", query_text.to_lowercase());

    let sql = format!(
        r"SELECT {prefixed},
                 1.0 AS vector_score,
                 (CASE WHEN lower(json_extract(k.content, '$.text')) LIKE ?1 THEN 3.0 ELSE 1.0 END)
                 * (CASE WHEN k.is_chunk = 1 THEN 1.5
                         WHEN k.is_main = 1 THEN 1.2
                         ELSE 1.0 END) AS keyword_score
          FROM knowledge k
          WHERE k.is_shared = 1 OR k.owner_id IS ?2
          ORDER BY (CASE WHEN lower(json_extract(k.content, '$.text')) LIKE ?1 THEN 0 ELSE 1 END),
                   (CASE WHEN k.is_chunk = 1 THEN 0 WHEN k.is_main = 1 THEN 1 ELSE 2 END),
                   k.created_at DESC
          LIMIT ?3",
        prefixed = prefixed_columns(),
    );

    let mut stmt = conn.prepare(&sql)?;

    #[allow(clippy::cast_possible_wrap)]
    let rows = stmt.query_map(
        rusqlite::params![like_pattern, owner, limit as i64],
        |row| {
            let item = row_to_item(row)?;
            let keyword_score: f64 = row.get(6)?;
            Ok((item, keyword_score))
        },
    )?;

    #[allow(clippy::cast_possible_truncation)]
    let results = rows
        .flatten()
        .map(|(item, keyword_score)| ScoredKnowledge {
            item,
            similarity: 1.0,
            keyword_score: keyword_score as f32,
        })
        .collect();
    Ok(results)
}

fn prefixed_columns() -> String {
    KNOWLEDGE_COLUMNS
        .split(", ")
        .map(|c| format!("k.{c}"))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Map a database row to a `KnowledgeItem`
fn row_to_item(row: &rusqlite::Row<'_>) -> rusqlite::Result<KnowledgeItem> {
    let content_json: String = row.get(2)?;
    let embedding_bytes: Option<Vec<u8>> = row.get(3)?;
    let created_at: String = row.get(4)?;

    let doc: StoredDoc = serde_json::from_str(&content_json).unwrap_or(StoredDoc {
        text: content_json,
        metadata: KnowledgeMetadata::default(),
    });

    Ok(KnowledgeItem {
        id: row.get(0)?,
        owner_id: row.get(1)?,
        text: doc.text,
        metadata: doc.metadata,
        embedding: embedding_bytes.map(|b| embedding::from_bytes(&b)),
        created_at: DateTime::parse_from_rfc3339(&created_at)
            .map_or_else(|_| Utc::now(), |dt| dt.with_timezone(&Utc)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::EMBEDDING_DIM;

    fn setup() -> (Arc<TenantRegistry>, KnowledgeStore) {
        let registry = Arc::new(TenantRegistry::open_in_memory().unwrap());
        let store = KnowledgeStore::new(registry.clone());
        (registry, store)
    }

    fn unit_embedding(axis: usize) -> Vec<f32> {
        let mut v = vec![0.0_f32; EMBEDDING_DIM];
        v[axis] = 1.0;
        v
    }

    fn item(id: &str, text: &str, metadata: KnowledgeMetadata) -> KnowledgeItem {
        KnowledgeItem {
            id: id.to_string(),
            owner_id: Some("agent".to_string()),
            text: text.to_string(),
            metadata,
            embedding: Some(unit_embedding(0)),
            created_at: Utc::now(),
        }
    }

    fn main_meta(shared: bool) -> KnowledgeMetadata {
        KnowledgeMetadata {
            is_main: true,
            is_shared: shared,
            source: Some("docs/a.md".to_string()),
            ..KnowledgeMetadata::default()
        }
    }

    fn chunk_meta(original: &str, index: u32) -> KnowledgeMetadata {
        KnowledgeMetadata {
            is_chunk: true,
            original_id: Some(original.to_string()),
            chunk_index: Some(index),
            ..KnowledgeMetadata::default()
        }
    }

    #[test]
    fn test_create_and_get_roundtrip() {
        let (_r, store) = setup();

        let it = item("k1", "rust borrow checker", main_meta(false));
        store.create(&it, None).unwrap();

        let fetched = store.get("k1", None).unwrap().unwrap();
        assert_eq!(fetched.text, "rust borrow checker");
        assert!(fetched.metadata.is_main);
        assert_eq!(fetched.metadata.source.as_deref(), Some("docs/a.md"));
        assert_eq!(fetched.embedding.as_ref().unwrap().len(), EMBEDDING_DIM);
    }

    #[test]
    fn test_duplicate_shared_insert_swallowed() {
        let (_r, store) = setup();

        let it = item("k1", "shared doc", main_meta(true));
        store.create(&it, None).unwrap();
        // Expected collision: must not raise, must not duplicate
        store.create(&it, None).unwrap();

        let conn = store.registry.shared().conn().unwrap();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM knowledge", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_duplicate_private_insert_idempotent() {
        let (_r, store) = setup();

        let it = item("k1", "private doc", main_meta(false));
        store.create(&it, None).unwrap();
        store.create(&it, None).unwrap();
        assert!(store.get("k1", None).unwrap().is_some());
    }

    #[test]
    fn test_cascade_delete() {
        let (_r, store) = setup();

        store.create(&item("main1", "doc", main_meta(false)), None).unwrap();
        store
            .create(&item("main1c0", "doc part", chunk_meta("main1", 0)), None)
            .unwrap();
        store
            .create(&item("main1c1", "part two", chunk_meta("main1", 1)), None)
            .unwrap();
        store.create(&item("other", "unrelated", main_meta(false)), None).unwrap();

        let deleted = store.remove("main1", None).unwrap();
        assert_eq!(deleted, 3);
        assert!(store.get("main1c0", None).unwrap().is_none());
        assert!(store.get("other", None).unwrap().is_some());
    }

    #[test]
    fn test_deleting_chunk_keeps_parent() {
        let (_r, store) = setup();

        store.create(&item("main1", "doc", main_meta(false)), None).unwrap();
        store
            .create(&item("c0", "doc part", chunk_meta("main1", 0)), None)
            .unwrap();

        let deleted = store.remove("c0", None).unwrap();
        assert_eq!(deleted, 1);
        assert!(store.get("main1", None).unwrap().is_some());
    }

    #[test]
    fn test_prefix_delete() {
        let (_r, store) = setup();

        store.create(&item("abc1", "one", main_meta(false)), None).unwrap();
        store.create(&item("abc2", "two", main_meta(false)), None).unwrap();
        store.create(&item("xyz1", "three", main_meta(false)), None).unwrap();

        let deleted = store.remove_prefix("abc", None).unwrap();
        assert_eq!(deleted, 2);
        assert!(store.get("xyz1", None).unwrap().is_some());
    }

    #[test]
    fn test_clear_with_and_without_shared() {
        let (_r, store) = setup();

        store.create(&item("mine", "owned", main_meta(false)), None).unwrap();
        let mut shared = item("pub", "shared", main_meta(true));
        shared.owner_id = None;
        store.create(&shared, None).unwrap();

        assert_eq!(store.clear("agent", false, None).unwrap(), 1);
        assert!(store.get("pub", None).unwrap().is_some());

        store.create(&item("mine2", "owned", main_meta(false)), None).unwrap();
        assert_eq!(store.clear("agent", true, None).unwrap(), 2);
    }

    #[test]
    fn test_search_visibility_and_order() {
        let (_r, store) = setup();

        // Owned chunk with keyword hit, shared main without, foreign item invisible
        let mut mine = item("c0", "rust ownership rules", chunk_meta("m", 0));
        mine.embedding = Some(unit_embedding(0));
        store.create(&mine, None).unwrap();

        let mut shared = item("pub", "unrelated text", main_meta(true));
        shared.owner_id = None;
        shared.embedding = Some(unit_embedding(1));
        store.create(&shared, None).unwrap();

        let mut foreign = item("theirs", "rust ownership rules", main_meta(false));
        foreign.owner_id = Some("someone-else".to_string());
        store.create(&foreign, None).unwrap();

        let results = store
            .search(&unit_embedding(0), "ownership", Some("agent"), 0.85, 10, None)
            .unwrap();

        let ids: Vec<&str> = results.iter().map(|r| r.item.id.as_str()).collect();
        assert!(ids.contains(&"c0"));
        assert!(!ids.contains(&"theirs"));
        // Chunk keyword hit: 3.0 * 1.5
        let c0 = results.iter().find(|r| r.item.id == "c0").unwrap();
        assert!((c0.keyword_score - 4.5).abs() < 0.001);
        assert!((c0.similarity - 1.0).abs() < 0.001);
    }

    #[test]
    fn test_fallback_search_never_errors() {
        let (registry, store) = setup();

        store.create(&item("k1", "alpha beta", main_meta(false)), None).unwrap();
        let mut chunk = item("k2", "alpha gamma", chunk_meta("k1", 0));
        chunk.embedding = None;
        store.create(&chunk, None).unwrap();

        let handle = registry.shared().with_vector_search(false);
        let results = search_fallback(&handle, "alpha", Some("agent"), 10).unwrap();

        assert_eq!(results.len(), 2);
        // Keyword hit + chunk weight wins the ordering
        assert_eq!(results[0].item.id, "k2");
        assert!((results[0].similarity - 1.0).abs() < f32::EPSILON);
    }

    #[test]
    fn test_list_file_backed() {
        let (_r, store) = setup();

        store.create(&item("m1", "doc", main_meta(false)), None).unwrap();
        let mut no_source = item("m2", "doc", main_meta(false));
        no_source.metadata.source = None;
        store.create(&no_source, None).unwrap();
        store.create(&item("c0", "part", chunk_meta("m1", 0)), None).unwrap();

        let backed = store.list_file_backed(None).unwrap();
        assert_eq!(backed.len(), 1);
        assert_eq!(backed[0], ("m1".to_string(), "docs/a.md".to_string()));
    }
}
