//! Ember Store - Tenant-partitioned memory and knowledge store for AI assistants
//!
//! This library provides the persistence and retrieval layer for a
//! conversational agent:
//! - Per-tenant data partitions, lazily created and schema-migrated
//! - Long-term memories with embedding-based dedup
//! - A retrieval-augmented knowledge base with hybrid vector+keyword search
//! - Cascading deletion and orphan cleanup for file-backed knowledge
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │              Conversation runtime (external)         │
//! └────────────────────┬────────────────────────────────┘
//!                      │
//! ┌────────────────────▼────────────────────────────────┐
//! │               Knowledge Manager                      │
//! │  preprocess │ chunk │ embed │ rerank │ sweep        │
//! └────────────────────┬────────────────────────────────┘
//!                      │
//! ┌────────────────────▼────────────────────────────────┐
//! │      Record stores (memories │ knowledge │ cache    │
//! │                     goals │ rooms │ relationships)  │
//! └────────────────────┬────────────────────────────────┘
//!                      │
//! ┌────────────────────▼────────────────────────────────┐
//! │   Tenant Registry (shared.db │ one file per tenant) │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! Every store method takes an optional tenant identifier: `None` operates on
//! the shared partition, `Some(tenant)` routes through the registry to that
//! tenant's isolated partition.

pub mod config;
pub mod db;
pub mod embedding;
pub mod error;
pub mod knowledge;

pub use config::Config;
pub use db::registry::{PartitionHandle, TenantRegistry};
pub use db::{DbConn, DbPool};
pub use embedding::{EmbeddingProvider, HttpEmbedder, EMBEDDING_DIM};
pub use error::{Error, Result};
pub use knowledge::chunk::chunk_text;
pub use knowledge::preprocess::preprocess;
pub use knowledge::sweeper::{CleanupSweeper, SweepReport};
pub use knowledge::{IngestSource, KnowledgeManager, KnowledgeQuery};
