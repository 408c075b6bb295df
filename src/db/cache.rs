//! Write-through cache table keyed by `(key, owner)`
//!
//! Used by retrieval to memoize search results per owner and normalized
//! query. Entries have no explicit invalidation; they are overwritten on the
//! next write for the same key.

use std::sync::Arc;

use super::registry::TenantRegistry;
use crate::Result;

/// Cache store scoped over tenant partitions
#[derive(Clone)]
pub struct CacheStore {
    registry: Arc<TenantRegistry>,
}

impl CacheStore {
    /// Create a new cache store over a registry
    #[must_use]
    pub fn new(registry: Arc<TenantRegistry>) -> Self {
        Self { registry }
    }

    /// Read a cached value
    ///
    /// # Errors
    ///
    /// Returns error if the partition cannot be resolved or the read fails.
    pub fn get(
        &self,
        key: &str,
        owner: Option<&str>,
        tenant: Option<&str>,
    ) -> Result<Option<String>> {
        let conn = self.registry.handle(tenant)?.conn()?;

        let result = conn.query_row(
            "SELECT value FROM cache WHERE key = ?1 AND owner_id = ?2",
            [key, owner.unwrap_or("")],
            |row| row.get(0),
        );

        match result {
            Ok(value) => Ok(Some(value)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Write a value, replacing any previous entry for the same key
    ///
    /// # Errors
    ///
    /// Returns error if the partition cannot be resolved or the write fails.
    pub fn set(
        &self,
        key: &str,
        owner: Option<&str>,
        value: &str,
        tenant: Option<&str>,
    ) -> Result<()> {
        let conn = self.registry.handle(tenant)?.conn()?;

        conn.execute(
            r"INSERT INTO cache (key, owner_id, value, created_at)
              VALUES (?1, ?2, ?3, datetime('now'))
              ON CONFLICT(key, owner_id) DO UPDATE SET
                  value = excluded.value,
                  created_at = excluded.created_at",
            [key, owner.unwrap_or(""), value],
        )?;
        Ok(())
    }

    /// Delete a cached value
    ///
    /// # Errors
    ///
    /// Returns error if the partition cannot be resolved or the write fails.
    pub fn delete(&self, key: &str, owner: Option<&str>, tenant: Option<&str>) -> Result<bool> {
        let conn = self.registry.handle(tenant)?.conn()?;
        let deleted = conn.execute(
            "DELETE FROM cache WHERE key = ?1 AND owner_id = ?2",
            [key, owner.unwrap_or("")],
        )?;
        Ok(deleted > 0)
    }
}

impl std::fmt::Debug for CacheStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheStore").finish_non_exhaustive()
    }
}
