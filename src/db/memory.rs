//! Memory store: per-conversation long-term memories
//!
//! All operations take an optional tenant identifier. `None` operates on the
//! shared partition; `Some(tenant)` routes through the registry to that
//! tenant's partition. Statement text is identical either way.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::registry::{PartitionHandle, TenantRegistry};
use crate::config::DEFAULT_DEDUP_THRESHOLD;
use crate::embedding::{self, cosine_similarity};
use crate::Result;

/// Column list for all memory SELECT queries
const MEMORY_COLUMNS: &str =
    "id, kind, content, embedding, owner_id, room_id, agent_id, is_unique, created_at";

/// Structured memory payload: text plus a free-form remainder
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemoryContent {
    /// The memory text
    pub text: String,
    /// Anything else the runtime attached (actions, attachments, ...)
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl MemoryContent {
    /// Content holding just a text payload
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            extra: serde_json::Map::new(),
        }
    }
}

/// A memory item stored in one partition
#[derive(Debug, Clone)]
pub struct Memory {
    pub id: String,
    /// Logical table / category this memory belongs to
    pub kind: String,
    pub content: MemoryContent,
    /// Embedding; the zero vector is stored when absent
    pub embedding: Option<Vec<f32>>,
    pub owner_id: Option<String>,
    pub room_id: Option<String>,
    pub agent_id: Option<String>,
    /// False when a near-duplicate embedding existed at write time.
    /// Computed once at creation, never re-validated.
    pub is_unique: bool,
    pub created_at: DateTime<Utc>,
}

impl Memory {
    /// Create a new memory item
    #[must_use]
    pub fn new(kind: impl Into<String>, content: MemoryContent) -> Self {
        Self {
            id: format!("mem_{}", Uuid::new_v4()),
            kind: kind.into(),
            content,
            embedding: None,
            owner_id: None,
            room_id: None,
            agent_id: None,
            is_unique: true,
            created_at: Utc::now(),
        }
    }

    /// Set the owner of this memory
    #[must_use]
    pub fn with_owner(mut self, owner_id: impl Into<String>) -> Self {
        self.owner_id = Some(owner_id.into());
        self
    }

    /// Set the room this memory belongs to
    #[must_use]
    pub fn in_room(mut self, room_id: impl Into<String>) -> Self {
        self.room_id = Some(room_id.into());
        self
    }

    /// Set the agent that produced this memory
    #[must_use]
    pub fn with_agent(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = Some(agent_id.into());
        self
    }

    /// Set the embedding for this memory
    #[must_use]
    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = Some(embedding);
        self
    }
}

/// Memory store scoped over tenant partitions
#[derive(Clone)]
pub struct MemoryStore {
    registry: Arc<TenantRegistry>,
    dedup_threshold: f32,
}

impl MemoryStore {
    /// Create a new memory store over a registry
    #[must_use]
    pub fn new(registry: Arc<TenantRegistry>) -> Self {
        Self {
            registry,
            dedup_threshold: DEFAULT_DEDUP_THRESHOLD,
        }
    }

    /// Override the near-duplicate similarity bound
    #[must_use]
    pub const fn with_dedup_threshold(mut self, threshold: f32) -> Self {
        self.dedup_threshold = threshold;
        self
    }

    /// Store a memory.
    ///
    /// A missing embedding is written as the zero vector. The uniqueness
    /// check runs here, once: when a memory of the same kind (and room, if
    /// set) already sits above the dedup threshold, the stored row is marked
    /// `is_unique = 0`.
    ///
    /// # Errors
    ///
    /// Returns error if the partition cannot be resolved or the write fails.
    pub fn create(&self, mut memory: Memory, tenant: Option<&str>) -> Result<Memory> {
        let handle = self.registry.handle(tenant)?;

        if let Some(ref emb) = memory.embedding {
            if emb.iter().any(|f| *f != 0.0) {
                let near = self.nearest_similarity(&handle, &memory.kind, memory.room_id.as_deref(), emb)?;
                if near >= self.dedup_threshold {
                    memory.is_unique = false;
                }
            }
        }

        let content_json = serde_json::to_string(&memory.content)?;
        let embedding_bytes = memory
            .embedding
            .clone()
            .map_or_else(|| embedding::to_bytes(&embedding::zero_vector()), |e| embedding::to_bytes(&e));

        let conn = handle.conn()?;
        conn.execute(
            r"INSERT INTO memories (id, kind, content, embedding, owner_id, room_id, agent_id, is_unique, created_at)
              VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            rusqlite::params![
                memory.id,
                memory.kind,
                content_json,
                embedding_bytes,
                memory.owner_id,
                memory.room_id,
                memory.agent_id,
                i32::from(memory.is_unique),
                memory.created_at.to_rfc3339(),
            ],
        )?;

        Ok(memory)
    }

    /// Get a memory by id
    ///
    /// # Errors
    ///
    /// Returns error if the partition cannot be resolved or the read fails.
    pub fn get(&self, id: &str, tenant: Option<&str>) -> Result<Option<Memory>> {
        let conn = self.registry.handle(tenant)?.conn()?;

        let result = conn.query_row(
            &format!("SELECT {MEMORY_COLUMNS} FROM memories WHERE id = ?1"),
            [id],
            row_to_memory,
        );

        match result {
            Ok(memory) => Ok(Some(memory)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// List memories of a kind, newest first, optionally filtered by room
    ///
    /// # Errors
    ///
    /// Returns error if the partition cannot be resolved or the read fails.
    pub fn list(
        &self,
        kind: &str,
        room_id: Option<&str>,
        limit: Option<usize>,
        tenant: Option<&str>,
    ) -> Result<Vec<Memory>> {
        let conn = self.registry.handle(tenant)?.conn()?;

        #[allow(clippy::cast_possible_wrap)]
        let limit = limit.map_or(i64::MAX, |l| l as i64);

        let memories = room_id.map_or_else(
            || -> Result<Vec<Memory>> {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {MEMORY_COLUMNS} FROM memories WHERE kind = ?1 ORDER BY created_at DESC LIMIT ?2"
                ))?;
                let rows = stmt.query_map(rusqlite::params![kind, limit], row_to_memory)?;
                Ok(rows.flatten().collect())
            },
            |room| -> Result<Vec<Memory>> {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {MEMORY_COLUMNS} FROM memories WHERE kind = ?1 AND room_id = ?2 ORDER BY created_at DESC LIMIT ?3"
                ))?;
                let rows = stmt.query_map(rusqlite::params![kind, room, limit], row_to_memory)?;
                Ok(rows.flatten().collect())
            },
        )?;

        Ok(memories)
    }

    /// Search memories of a kind by embedding similarity.
    ///
    /// Returns `(memory, similarity)` pairs above the threshold, best first.
    /// On partitions without the vector function this degrades to an
    /// in-process cosine scan; callers see the same shape either way.
    ///
    /// # Errors
    ///
    /// Returns error if the partition cannot be resolved or the read fails.
    pub fn search_by_embedding(
        &self,
        query: &[f32],
        kind: &str,
        threshold: f32,
        limit: usize,
        tenant: Option<&str>,
    ) -> Result<Vec<(Memory, f32)>> {
        let handle = self.registry.handle(tenant)?;

        let mut scored = if handle.vector_search() {
            self.search_vector(&handle, query, kind, limit)?
        } else {
            self.search_cosine(&handle, query, kind)?
        };

        scored.retain(|(_, sim)| *sim >= threshold);
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(limit);
        Ok(scored)
    }

    fn search_vector(
        &self,
        handle: &PartitionHandle,
        query: &[f32],
        kind: &str,
        limit: usize,
    ) -> Result<Vec<(Memory, f32)>> {
        let conn = handle.conn()?;
        let query_bytes = embedding::to_bytes(query);

        let mut stmt = conn.prepare(&format!(
            r"SELECT {MEMORY_COLUMNS}, vec_distance_l2(embedding, ?1) AS distance
              FROM memories
              WHERE kind = ?2
              ORDER BY distance
              LIMIT ?3"
        ))?;

        #[allow(clippy::cast_possible_wrap)]
        let rows = stmt.query_map(
            rusqlite::params![query_bytes, kind, limit as i64],
            |row| {
                let memory = row_to_memory(row)?;
                let distance: f64 = row.get(9)?;
                Ok((memory, distance))
            },
        )?;

        #[allow(clippy::cast_possible_truncation)]
        let scored = rows
            .flatten()
            .map(|(memory, distance)| {
                let similarity = (1.0 / (1.0 + distance)) as f32;
                (memory, similarity)
            })
            .collect();
        Ok(scored)
    }

    /// Keyword-free fallback: full scan with in-process cosine similarity
    fn search_cosine(
        &self,
        handle: &PartitionHandle,
        query: &[f32],
        kind: &str,
    ) -> Result<Vec<(Memory, f32)>> {
        let conn = handle.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {MEMORY_COLUMNS} FROM memories WHERE kind = ?1 ORDER BY created_at DESC"
        ))?;
        let rows = stmt.query_map([kind], row_to_memory)?;

        let scored = rows
            .flatten()
            .map(|memory| {
                let sim = memory
                    .embedding
                    .as_ref()
                    .map_or(0.0, |emb| cosine_similarity(emb, query));
                (memory, sim)
            })
            .collect();
        Ok(scored)
    }

    /// Highest similarity among stored memories of a kind, scoped to the
    /// room when one is set (dedup probe).
    ///
    /// The room filter belongs inside the query: a closer memory in another
    /// room must not shadow a genuine same-room near-duplicate.
    fn nearest_similarity(
        &self,
        handle: &PartitionHandle,
        kind: &str,
        room_id: Option<&str>,
        query: &[f32],
    ) -> Result<f32> {
        if handle.vector_search() {
            let conn = handle.conn()?;
            let query_bytes = embedding::to_bytes(query);

            let distance: Option<f64> = match room_id {
                Some(room) => conn.query_row(
                    r"SELECT MIN(vec_distance_l2(embedding, ?1))
                      FROM memories WHERE kind = ?2 AND room_id = ?3",
                    rusqlite::params![query_bytes, kind, room],
                    |row| row.get(0),
                )?,
                None => conn.query_row(
                    "SELECT MIN(vec_distance_l2(embedding, ?1)) FROM memories WHERE kind = ?2",
                    rusqlite::params![query_bytes, kind],
                    |row| row.get(0),
                )?,
            };

            #[allow(clippy::cast_possible_truncation)]
            Ok(distance.map_or(0.0, |d| (1.0 / (1.0 + d)) as f32))
        } else {
            let candidates = self.search_cosine(handle, query, kind)?;
            Ok(candidates
                .into_iter()
                .filter(|(m, _)| room_id.is_none() || m.room_id.as_deref() == room_id)
                .map(|(_, sim)| sim)
                .fold(0.0_f32, f32::max))
        }
    }

    /// Delete a memory by id
    ///
    /// # Errors
    ///
    /// Returns error if the partition cannot be resolved or the write fails.
    pub fn remove(&self, id: &str, tenant: Option<&str>) -> Result<bool> {
        let conn = self.registry.handle(tenant)?.conn()?;
        let deleted = conn.execute("DELETE FROM memories WHERE id = ?1", [id])?;
        Ok(deleted > 0)
    }

    /// Delete all memories of a kind in a room
    ///
    /// # Errors
    ///
    /// Returns error if the partition cannot be resolved or the write fails.
    pub fn remove_all(&self, room_id: &str, kind: &str, tenant: Option<&str>) -> Result<usize> {
        let conn = self.registry.handle(tenant)?.conn()?;
        let deleted = conn.execute(
            "DELETE FROM memories WHERE room_id = ?1 AND kind = ?2",
            [room_id, kind],
        )?;

        if deleted > 0 {
            tracing::debug!(room_id, kind, count = deleted, "removed memories");
        }
        Ok(deleted)
    }

    /// Count memories of a kind, optionally unique ones only
    ///
    /// # Errors
    ///
    /// Returns error if the partition cannot be resolved or the read fails.
    pub fn count(
        &self,
        kind: &str,
        room_id: Option<&str>,
        unique_only: bool,
        tenant: Option<&str>,
    ) -> Result<u64> {
        let conn = self.registry.handle(tenant)?.conn()?;

        let mut sql = String::from("SELECT COUNT(*) FROM memories WHERE kind = ?1");
        if room_id.is_some() {
            sql.push_str(" AND room_id = ?2");
        }
        if unique_only {
            sql.push_str(" AND is_unique = 1");
        }

        let count: i64 = room_id.map_or_else(
            || conn.query_row(&sql, [kind], |row| row.get(0)),
            |room| conn.query_row(&sql, [kind, room], |row| row.get(0)),
        )?;

        Ok(u64::try_from(count).unwrap_or(0))
    }
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("dedup_threshold", &self.dedup_threshold)
            .finish_non_exhaustive()
    }
}

/// Map a database row to a `Memory`
fn row_to_memory(row: &rusqlite::Row<'_>) -> rusqlite::Result<Memory> {
    let content_json: String = row.get(2)?;
    let embedding_bytes: Vec<u8> = row.get(3)?;
    let created_at: String = row.get(8)?;

    Ok(Memory {
        id: row.get(0)?,
        kind: row.get(1)?,
        content: serde_json::from_str(&content_json).unwrap_or_default(),
        embedding: Some(embedding::from_bytes(&embedding_bytes)),
        owner_id: row.get(4)?,
        room_id: row.get(5)?,
        agent_id: row.get(6)?,
        is_unique: row.get::<_, i32>(7)? != 0,
        created_at: DateTime::parse_from_rfc3339(&created_at)
            .map_or_else(|_| Utc::now(), |dt| dt.with_timezone(&Utc)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::EMBEDDING_DIM;

    fn setup() -> MemoryStore {
        let registry = Arc::new(TenantRegistry::open_in_memory().unwrap());
        MemoryStore::new(registry)
    }

    fn unit_embedding(axis: usize) -> Vec<f32> {
        let mut v = vec![0.0_f32; EMBEDDING_DIM];
        v[axis] = 1.0;
        v
    }

    #[test]
    fn test_memory_crud() {
        let store = setup();

        let memory = Memory::new("messages", MemoryContent::text("hello world"))
            .with_owner("u1")
            .in_room("r1");
        let stored = store.create(memory, None).unwrap();
        assert!(stored.is_unique);

        let fetched = store.get(&stored.id, None).unwrap().unwrap();
        assert_eq!(fetched.content.text, "hello world");
        assert_eq!(fetched.room_id.as_deref(), Some("r1"));
        // Zero-vector default
        assert_eq!(fetched.embedding.as_ref().unwrap().len(), EMBEDDING_DIM);

        assert!(store.remove(&stored.id, None).unwrap());
        assert!(store.get(&stored.id, None).unwrap().is_none());
    }

    #[test]
    fn test_near_duplicate_marked_not_unique() {
        let store = setup();

        let first = Memory::new("facts", MemoryContent::text("likes rust"))
            .in_room("r1")
            .with_embedding(unit_embedding(0));
        let first = store.create(first, None).unwrap();
        assert!(first.is_unique);

        // Identical embedding: similarity 1.0 >= 0.95
        let dup = Memory::new("facts", MemoryContent::text("likes rust a lot"))
            .in_room("r1")
            .with_embedding(unit_embedding(0));
        let dup = store.create(dup, None).unwrap();
        assert!(!dup.is_unique);

        // Orthogonal embedding stays unique
        let other = Memory::new("facts", MemoryContent::text("dislikes mondays"))
            .in_room("r1")
            .with_embedding(unit_embedding(1));
        let other = store.create(other, None).unwrap();
        assert!(other.is_unique);
    }

    #[test]
    fn test_dedup_not_shadowed_by_other_room_decoy() {
        let store = setup();

        // Near-duplicate in r1: small perturbation off axis 0, L2 distance
        // 0.03 from the incoming vector, similarity ~0.97
        let mut near = vec![0.0_f32; EMBEDDING_DIM];
        near[0] = 1.0;
        near[1] = 0.03;
        let first = Memory::new("facts", MemoryContent::text("likes rust"))
            .in_room("r1")
            .with_embedding(near);
        store.create(first, None).unwrap();

        // Exact-match decoy in a different room: globally nearest, but it
        // must not mask the r1 near-duplicate
        let decoy = Memory::new("facts", MemoryContent::text("likes rust"))
            .in_room("r2")
            .with_embedding(unit_embedding(0));
        assert!(store.create(decoy, None).unwrap().is_unique);

        let incoming = Memory::new("facts", MemoryContent::text("really likes rust"))
            .in_room("r1")
            .with_embedding(unit_embedding(0));
        let stored = store.create(incoming, None).unwrap();
        assert!(!stored.is_unique);
    }

    #[test]
    fn test_search_by_embedding() {
        let store = setup();

        let a = Memory::new("facts", MemoryContent::text("a")).with_embedding(unit_embedding(0));
        let b = Memory::new("facts", MemoryContent::text("b")).with_embedding(unit_embedding(1));
        store.create(a, None).unwrap();
        store.create(b, None).unwrap();

        let hits = store
            .search_by_embedding(&unit_embedding(0), "facts", 0.5, 10, None)
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0.content.text, "a");
        assert!((hits[0].1 - 1.0).abs() < 0.001);
    }

    #[test]
    fn test_cosine_fallback_matches_vector_path() {
        let registry = Arc::new(TenantRegistry::open_in_memory().unwrap());
        let store = MemoryStore::new(registry.clone());

        let a = Memory::new("facts", MemoryContent::text("a")).with_embedding(unit_embedding(0));
        store.create(a, None).unwrap();

        let handle = registry.shared().with_vector_search(false);
        let scored = store.search_cosine(&handle, &unit_embedding(0), "facts").unwrap();
        assert_eq!(scored.len(), 1);
        assert!((scored[0].1 - 1.0).abs() < 0.001);
    }

    #[test]
    fn test_list_and_count_scoped_by_room() {
        let store = setup();

        for i in 0..3 {
            let m = Memory::new("messages", MemoryContent::text(format!("m{i}"))).in_room("r1");
            store.create(m, None).unwrap();
        }
        let other = Memory::new("messages", MemoryContent::text("elsewhere")).in_room("r2");
        store.create(other, None).unwrap();

        assert_eq!(store.list("messages", Some("r1"), None, None).unwrap().len(), 3);
        assert_eq!(store.count("messages", Some("r1"), false, None).unwrap(), 3);
        assert_eq!(store.remove_all("r1", "messages", None).unwrap(), 3);
        assert_eq!(store.count("messages", None, false, None).unwrap(), 1);
    }

    #[test]
    fn test_tenant_scoping() {
        let store = setup();

        let m = Memory::new("messages", MemoryContent::text("private"));
        store.create(m, Some("alice")).unwrap();

        assert_eq!(store.list("messages", None, None, None).unwrap().len(), 0);
        assert_eq!(store.list("messages", None, None, Some("alice")).unwrap().len(), 1);
        assert_eq!(store.list("messages", None, None, Some("bob")).unwrap().len(), 0);
    }
}
