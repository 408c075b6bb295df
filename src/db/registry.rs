//! Tenant partition registry
//!
//! Maps tenant identifiers to initialized, schema-migrated partitions. Each
//! partition is one SQLite file (plus `shared.db` for the cross-tenant pool)
//! with its own connection pool. First resolution creates and migrates the
//! file; later resolutions return the cached handle without touching the
//! filesystem. Opening a partition mutates the shared registry state, so it
//! is serialized behind a single mutex; reads and writes on already-resolved
//! handles interleave freely.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use sha2::{Digest, Sha256};

use super::{DbConn, DbPool};
use crate::{Error, Result};

/// File name of the shared, cross-tenant partition
const SHARED_PARTITION: &str = "shared";

/// An opened, migrated partition
#[derive(Clone)]
pub struct PartitionHandle {
    name: String,
    pool: DbPool,
    vector_search: bool,
}

impl PartitionHandle {
    /// Partition name (derived from the tenant id, or `shared`)
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the vector-distance function is available on this partition
    #[must_use]
    pub const fn vector_search(&self) -> bool {
        self.vector_search
    }

    /// Connection pool for this partition
    #[must_use]
    pub const fn pool(&self) -> &DbPool {
        &self.pool
    }

    /// Check out a pooled connection
    ///
    /// # Errors
    ///
    /// Returns error if the pool is exhausted or the connection is broken
    pub fn conn(&self) -> Result<DbConn> {
        self.pool.get().map_err(|e| Error::Database(e.to_string()))
    }

    #[cfg(test)]
    pub(crate) fn with_vector_search(mut self, enabled: bool) -> Self {
        self.vector_search = enabled;
        self
    }
}

impl std::fmt::Debug for PartitionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PartitionHandle")
            .field("name", &self.name)
            .field("vector_search", &self.vector_search)
            .finish_non_exhaustive()
    }
}

/// Where partition files live
enum Storage {
    /// One file per partition under a root directory
    Disk(PathBuf),
    /// In-memory partitions (tests)
    Memory,
}

/// Registry of open tenant partitions
pub struct TenantRegistry {
    storage: Storage,
    shared: PartitionHandle,
    partitions: Mutex<HashMap<String, PartitionHandle>>,
}

impl TenantRegistry {
    /// Open a registry rooted at a data directory.
    ///
    /// Creates the directory and the shared partition if absent.
    ///
    /// # Errors
    ///
    /// Returns error if the directory cannot be created or the shared
    /// partition cannot be opened and migrated.
    pub fn open<P: AsRef<Path>>(data_dir: P) -> Result<Self> {
        let dir = data_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;

        let shared = open_partition_at(&dir, SHARED_PARTITION)?;
        tracing::info!(
            version = super::SCHEMA_VERSION,
            vector_search = shared.vector_search,
            "shared partition initialized"
        );

        Ok(Self {
            storage: Storage::Disk(dir),
            shared,
            partitions: Mutex::new(HashMap::new()),
        })
    }

    /// Open a registry with in-memory partitions (for testing)
    ///
    /// # Errors
    ///
    /// Returns error if the shared partition cannot be initialized.
    pub fn open_in_memory() -> Result<Self> {
        let shared = open_memory_partition(SHARED_PARTITION)?;
        Ok(Self {
            storage: Storage::Memory,
            shared,
            partitions: Mutex::new(HashMap::new()),
        })
    }

    /// Handle for the shared, cross-tenant partition
    #[must_use]
    pub fn shared(&self) -> PartitionHandle {
        self.shared.clone()
    }

    /// Resolve a tenant's partition, opening and migrating it on first use.
    ///
    /// Idempotent and cached: after the first resolution the handle comes
    /// straight from the registry map.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TenantResolution`] if the partition file cannot be
    /// opened or migrated. The failure is scoped to this tenant; other
    /// partitions are unaffected.
    pub fn resolve(&self, tenant: &str) -> Result<PartitionHandle> {
        // Single guard serializes partition opens against each other
        let mut partitions = self
            .partitions
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        if let Some(handle) = partitions.get(tenant) {
            return Ok(handle.clone());
        }

        let name = partition_name(tenant);
        let handle = match &self.storage {
            Storage::Disk(dir) => open_partition_at(dir, &name),
            Storage::Memory => open_memory_partition(&name),
        }
        .map_err(|e| Error::TenantResolution {
            tenant: tenant.to_string(),
            reason: e.to_string(),
        })?;

        tracing::info!(
            tenant,
            partition = %name,
            vector_search = handle.vector_search,
            "tenant partition attached"
        );

        partitions.insert(tenant.to_string(), handle.clone());
        Ok(handle)
    }

    /// Resolve a handle for an optional tenant: `None` means shared.
    ///
    /// # Errors
    ///
    /// Returns error if tenant resolution fails.
    pub fn handle(&self, tenant: Option<&str>) -> Result<PartitionHandle> {
        tenant.map_or_else(|| Ok(self.shared()), |t| self.resolve(t))
    }

    /// Run an operation against the resolved partition.
    ///
    /// # Errors
    ///
    /// Returns error if resolution fails or the operation itself fails.
    pub fn with_partition<T>(
        &self,
        tenant: Option<&str>,
        f: impl FnOnce(&PartitionHandle) -> Result<T>,
    ) -> Result<T> {
        let handle = self.handle(tenant)?;
        f(&handle)
    }

    /// Number of tenant partitions currently attached (excludes shared)
    #[must_use]
    pub fn attached_count(&self) -> usize {
        self.partitions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Tenant ids with a currently attached partition (excludes shared)
    #[must_use]
    pub fn attached_tenants(&self) -> Vec<String> {
        self.partitions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }
}

impl std::fmt::Debug for TenantRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TenantRegistry")
            .field("attached", &self.attached_count())
            .finish_non_exhaustive()
    }
}

/// Derive a filesystem-safe partition name from a tenant identifier.
///
/// The readable part maps anything outside `[A-Za-z0-9_-]` to `_` and is
/// capped for filename limits. Sanitization alone is not injective
/// (`alice.smith` and `alice_smith` both read `alice_smith`), so a short
/// hash of the raw id is appended: only identical tenant ids share a file.
/// The suffix also keeps a tenant literally named `shared` away from the
/// shared pool's file.
#[must_use]
pub fn partition_name(tenant: &str) -> String {
    let safe: String = tenant
        .chars()
        .take(64)
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect();

    let digest = Sha256::digest(tenant.as_bytes());
    let tag = hex::encode(&digest[..4]);

    if safe.is_empty() {
        format!("t-{tag}")
    } else {
        format!("{safe}-{tag}")
    }
}

fn open_partition_at(dir: &Path, name: &str) -> Result<PartitionHandle> {
    let path = dir.join(format!("{name}.db"));
    let pool = super::open_pool(path)?;
    let vector_search = super::probe_vector_support(&pool);
    Ok(PartitionHandle {
        name: name.to_string(),
        pool,
        vector_search,
    })
}

fn open_memory_partition(name: &str) -> Result<PartitionHandle> {
    let pool = super::open_memory_pool()?;
    let vector_search = super::probe_vector_support(&pool);
    Ok(PartitionHandle {
        name: name.to_string(),
        pool,
        vector_search,
    })
}
