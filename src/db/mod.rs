//! Database layer: tenant partition registry, schema, and record stores

pub mod cache;
pub mod knowledge;
pub mod memory;
pub mod registry;
mod schema;
pub mod world;

use std::path::Path;
use std::sync::Once;

use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;

use crate::{Error, Result};

static SQLITE_VEC_INIT: Once = Once::new();

/// Register sqlite-vec extension for all new connections
///
/// This must be called before creating any database connections.
/// Safe to call multiple times; only the first call has any effect.
#[allow(unsafe_code)]
pub(crate) fn register_sqlite_vec() {
    SQLITE_VEC_INIT.call_once(|| {
        // SAFETY: `sqlite3_vec_init` is the initialization function provided by the
        // sqlite-vec crate. It is designed to be passed to `sqlite3_auto_extension`.
        // The transmute converts the function pointer to the correct signature
        // expected by `SQLite`'s auto_extension registration API.
        unsafe {
            rusqlite::ffi::sqlite3_auto_extension(Some(std::mem::transmute::<
                *const (),
                unsafe extern "C" fn(
                    *mut rusqlite::ffi::sqlite3,
                    *mut *mut i8,
                    *const rusqlite::ffi::sqlite3_api_routines,
                ) -> i32,
            >(
                sqlite_vec::sqlite3_vec_init as *const (),
            )));
        }
    });
}

pub use cache::CacheStore;
pub use knowledge::{KnowledgeItem, KnowledgeMetadata, KnowledgeStore, ScoredKnowledge};
pub use memory::{Memory, MemoryContent, MemoryStore};
pub use registry::{PartitionHandle, TenantRegistry};
pub use schema::SCHEMA_VERSION;
pub use world::{Goal, GoalStatus, Participant, Relationship, Room, WorldStore};

/// Database connection pool for one partition
pub type DbPool = Pool<SqliteConnectionManager>;

/// Pooled database connection
pub type DbConn = PooledConnection<SqliteConnectionManager>;

/// Open a pool over a partition file and bring its schema up to date.
///
/// # Errors
///
/// Returns error if the file cannot be opened or a migration fails.
pub(crate) fn open_pool<P: AsRef<Path>>(path: P) -> Result<DbPool> {
    // Register sqlite-vec before creating any connections
    register_sqlite_vec();

    let manager = SqliteConnectionManager::file(path);
    let pool = Pool::builder()
        .max_size(4)
        .build(manager)
        .map_err(|e| Error::Database(e.to_string()))?;

    migrate_pool(&pool)?;
    Ok(pool)
}

/// Open an in-memory pool with the full schema (for testing)
///
/// # Errors
///
/// Returns error if the schema cannot be initialized.
pub(crate) fn open_memory_pool() -> Result<DbPool> {
    register_sqlite_vec();

    let manager = SqliteConnectionManager::memory();
    let pool = Pool::builder()
        .max_size(1)
        .build(manager)
        .map_err(|e| Error::Database(e.to_string()))?;

    migrate_pool(&pool)?;
    Ok(pool)
}

fn migrate_pool(pool: &DbPool) -> Result<()> {
    let conn = pool.get().map_err(|e| Error::Database(e.to_string()))?;
    schema::init(&conn)?;
    Ok(())
}

/// Probe whether the vector-distance function is available on this partition.
///
/// The result is cached on the partition handle; stores branch on it instead
/// of guessing from runtime errors.
pub(crate) fn probe_vector_support(pool: &DbPool) -> bool {
    let Ok(conn) = pool.get() else {
        return false;
    };
    conn.query_row("SELECT vec_version()", [], |row| row.get::<_, String>(0))
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_memory_pool() {
        let pool = open_memory_pool().unwrap();
        let _conn = pool.get().unwrap();
    }

    #[test]
    fn test_vector_support_probe() {
        let pool = open_memory_pool().unwrap();
        assert!(probe_vector_support(&pool));
    }
}
