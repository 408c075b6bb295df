//! Knowledge ingestion and retrieval pipeline
//!
//! [`KnowledgeManager`] sits above the partitioned stores and owns the full
//! document lifecycle: normalize, derive a content-stable id, embed, chunk,
//! store; then retrieve with hybrid search, rerank lexically, and memoize
//! results per owner and normalized query. Queries degrade instead of
//! failing: any error surfaces as an empty result set plus a log line.

pub mod chunk;
pub mod preprocess;
pub mod rerank;
pub mod sweeper;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use sha2::{Digest, Sha256};

use crate::config::Config;
use crate::db::{CacheStore, KnowledgeItem, KnowledgeMetadata, KnowledgeStore, TenantRegistry};
use crate::embedding::EmbeddingProvider;
use crate::Result;

use chunk::chunk_text;
use preprocess::preprocess;

/// Default number of results a query returns
pub const DEFAULT_QUERY_LIMIT: usize = 10;

/// A document handed to [`KnowledgeManager::ingest`]
#[derive(Debug, Clone)]
pub struct IngestSource {
    /// Source path, also the identity of the document within its scope
    pub path: String,
    /// Raw document text
    pub text: String,
    /// Declared document type (md, txt, pdf, ...)
    pub doc_type: Option<String>,
    /// Visible to every tenant
    pub shared: bool,
    /// Owning agent/tenant for private documents
    pub owner: Option<String>,
}

impl IngestSource {
    /// A document visible to every tenant
    #[must_use]
    pub fn shared(path: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            text: text.into(),
            doc_type: None,
            shared: true,
            owner: None,
        }
    }

    /// A document scoped to one owner
    #[must_use]
    pub fn private(
        path: impl Into<String>,
        text: impl Into<String>,
        owner: impl Into<String>,
    ) -> Self {
        Self {
            path: path.into(),
            text: text.into(),
            doc_type: None,
            shared: false,
            owner: Some(owner.into()),
        }
    }

    /// Set the declared document type
    #[must_use]
    pub fn with_type(mut self, doc_type: impl Into<String>) -> Self {
        self.doc_type = Some(doc_type.into());
        self
    }
}

/// A retrieval request
#[derive(Debug, Clone)]
pub struct KnowledgeQuery {
    /// Exact-id lookup; when present and found, search is skipped
    pub id: Option<String>,
    /// Free-text query
    pub text: String,
    /// Recent conversation lines prepended to the query before embedding
    pub conversation_context: Option<String>,
    /// Maximum results to return
    pub limit: usize,
    /// Requesting owner; sees own items plus shared ones
    pub owner: Option<String>,
    /// Partition to search
    pub tenant: Option<String>,
}

impl KnowledgeQuery {
    /// A query over the shared partition with the default limit
    #[must_use]
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            id: None,
            text: text.into(),
            conversation_context: None,
            limit: DEFAULT_QUERY_LIMIT,
            owner: None,
            tenant: None,
        }
    }

    /// Target a specific item id
    #[must_use]
    pub fn by_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Prepend conversation context to the embedded query
    #[must_use]
    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.conversation_context = Some(context.into());
        self
    }

    /// Scope results to an owner
    #[must_use]
    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }

    /// Cap the number of results
    #[must_use]
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    /// Search a tenant partition instead of the shared one
    #[must_use]
    pub fn for_tenant(mut self, tenant: impl Into<String>) -> Self {
        self.tenant = Some(tenant.into());
        self
    }
}

/// Orchestrates ingestion, retrieval, and deletion of knowledge documents
pub struct KnowledgeManager {
    registry: Arc<TenantRegistry>,
    store: KnowledgeStore,
    cache: CacheStore,
    embedder: Arc<dyn EmbeddingProvider>,
    config: Config,
}

impl KnowledgeManager {
    /// Create a manager over a tenant registry
    ///
    /// # Errors
    ///
    /// Returns error if the chunking configuration is invalid.
    pub fn new(
        registry: Arc<TenantRegistry>,
        embedder: Arc<dyn EmbeddingProvider>,
        config: Config,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            store: KnowledgeStore::new(registry.clone()),
            cache: CacheStore::new(registry.clone()),
            registry,
            embedder,
            config,
        })
    }

    /// Derive the content-stable id for a document.
    ///
    /// Shared documents hash the same everywhere, so re-ingesting the same
    /// source from any tenant collides on purpose. Private documents fold
    /// the owner in, so two owners ingesting the same path stay distinct.
    #[must_use]
    pub fn knowledge_id(shared: bool, owner: Option<&str>, path: &str) -> String {
        let scope = if shared {
            "shared".to_string()
        } else {
            format!("private:{}", owner.unwrap_or(""))
        };
        let digest = Sha256::digest(format!("{scope}:{}", path.trim()));
        hex::encode(digest)
    }

    /// Derive the id for chunk `index` of a main document.
    ///
    /// Chunk ids extend the main id, so a wildcard delete on the main id's
    /// prefix takes the whole lineage with it.
    fn chunk_id(main_id: &str, index: usize) -> String {
        format!("{main_id}:chunk:{index}")
    }

    /// Ingest a document: preprocess, embed, chunk, store.
    ///
    /// Re-ingesting a path that is already present is a cheap no-op that
    /// returns the existing id without calling the embedder. Returns the
    /// main document id.
    ///
    /// # Errors
    ///
    /// Returns error if an embedding call or a store write fails; a document
    /// is never stored half-embedded.
    pub async fn ingest(&self, source: IngestSource, tenant: Option<&str>) -> Result<String> {
        let owner = if source.shared { None } else { source.owner.clone() };
        let main_id = Self::knowledge_id(source.shared, owner.as_deref(), &source.path);

        let processed = preprocess(&source.text);
        let main_meta = KnowledgeMetadata {
            source: Some(source.path.clone()),
            doc_type: source.doc_type.clone(),
            is_shared: source.shared,
            is_main: true,
            ..KnowledgeMetadata::default()
        };

        if processed.is_empty() {
            if self.store.get(&main_id, tenant)?.is_some() {
                tracing::debug!(id = %main_id, path = %source.path, "document already ingested, skipping");
                return Ok(main_id);
            }
            tracing::warn!(path = %source.path, "document empty after preprocessing, storing without chunks");
            self.store.create(
                &KnowledgeItem {
                    id: main_id.clone(),
                    owner_id: owner,
                    text: source.text,
                    metadata: main_meta,
                    embedding: None,
                    created_at: Utc::now(),
                },
                tenant,
            )?;
            return Ok(main_id);
        }

        let chunks = chunk_text(&processed, self.config.chunk_size, self.config.chunk_overlap);

        // Skip only when the whole lineage is present. A main row with
        // missing chunks is the partial-write state a retry must repair;
        // duplicate inserts are swallowed, so re-running the writes is safe.
        if self.store.get(&main_id, tenant)?.is_some()
            && self.store.chunk_count(&main_id, tenant)? == chunks.len() as u64
        {
            tracing::debug!(id = %main_id, path = %source.path, "document already ingested, skipping");
            return Ok(main_id);
        }

        // Main documents can exceed provider limits; embed a leading window
        let window: String = processed.chars().take(self.config.embedding_window).collect();
        let main_embedding = self.embedder.embed(&window).await?;

        let chunk_embeddings =
            futures::future::try_join_all(chunks.iter().map(|c| self.embedder.embed(c))).await?;

        self.store.create(
            &KnowledgeItem {
                id: main_id.clone(),
                owner_id: owner.clone(),
                text: source.text,
                metadata: main_meta,
                embedding: Some(main_embedding),
                created_at: Utc::now(),
            },
            tenant,
        )?;

        for (index, (text, embedding)) in chunks.into_iter().zip(chunk_embeddings).enumerate() {
            self.store.create(
                &KnowledgeItem {
                    id: Self::chunk_id(&main_id, index),
                    owner_id: owner.clone(),
                    text,
                    metadata: KnowledgeMetadata {
                        is_shared: source.shared,
                        is_chunk: true,
                        original_id: Some(main_id.clone()),
                        chunk_index: u32::try_from(index).ok(),
                        ..KnowledgeMetadata::default()
                    },
                    embedding: Some(embedding),
                    created_at: Utc::now(),
                },
                tenant,
            )?;
        }

        tracing::info!(
            id = %main_id,
            path = %source.path,
            shared = source.shared,
            chunks = self.store.chunk_count(&main_id, tenant)?,
            "ingested knowledge document"
        );
        Ok(main_id)
    }

    /// Retrieve knowledge for a query.
    ///
    /// Never raises: any failure is logged and reported as no results, so a
    /// degraded store can't take the caller down with it.
    pub async fn query(&self, request: &KnowledgeQuery) -> Vec<KnowledgeItem> {
        match self.run_query(request).await {
            Ok(items) => items,
            Err(e) => {
                tracing::error!(error = %e, query = %request.text, "knowledge query failed, returning no results");
                Vec::new()
            }
        }
    }

    async fn run_query(&self, request: &KnowledgeQuery) -> Result<Vec<KnowledgeItem>> {
        let tenant = request.tenant.as_deref();
        let owner = request.owner.as_deref();

        if let Some(id) = &request.id {
            if let Some(item) = self.store.get(id, tenant)? {
                return Ok(vec![item]);
            }
        }

        let combined = match &request.conversation_context {
            Some(context) => format!("{context}\n{}", request.text),
            None => request.text.clone(),
        };
        let processed = preprocess(&combined);
        if processed.is_empty() {
            return Ok(Vec::new());
        }

        let cache_key = format!("knowledge:{processed}");
        if let Some(raw) = self.cache.get(&cache_key, owner, tenant)? {
            if let Ok(items) = serde_json::from_str::<Vec<KnowledgeItem>>(&raw) {
                tracing::debug!(query = %request.text, "knowledge cache hit");
                return Ok(items);
            }
        }

        let degraded = !self.store.vector_search_available(tenant)?;
        let query_embedding = self.embedder.embed(&processed).await?;

        // Over-fetch so reranking has candidates to demote
        let candidates = self.store.search(
            &query_embedding,
            &processed,
            owner,
            self.config.match_threshold,
            request.limit * 2,
            tenant,
        )?;

        let terms = rerank::query_terms(&request.text);
        let has_context = request.conversation_context.is_some();

        let mut scored: Vec<(KnowledgeItem, f32)> = candidates
            .into_iter()
            .map(|c| {
                let score = rerank::rerank_score(c.similarity, &c.item.text, &terms, has_context);
                (c.item, score)
            })
            .collect();
        scored.sort_by(|a, b| b.1.total_cmp(&a.1));

        // Keyword-only partitions report a neutral similarity; dropping on
        // the vector threshold there would empty every result set.
        if !degraded {
            scored.retain(|(_, score)| *score >= self.config.match_threshold);
        }
        scored.truncate(request.limit);

        let items: Vec<KnowledgeItem> = scored.into_iter().map(|(item, _)| item).collect();

        match serde_json::to_string(&items) {
            Ok(raw) => {
                if let Err(e) = self.cache.set(&cache_key, owner, &raw, tenant) {
                    tracing::warn!(error = %e, "failed to cache knowledge results");
                }
            }
            Err(e) => tracing::warn!(error = %e, "failed to serialize knowledge results for cache"),
        }

        Ok(items)
    }

    /// Remove a document and its chunks, or every id under a `prefix*`
    /// wildcard.
    ///
    /// # Errors
    ///
    /// Returns error if the partition cannot be resolved or the delete fails.
    pub fn remove(&self, target: &str, tenant: Option<&str>) -> Result<usize> {
        if let Some(prefix) = target.strip_suffix('*') {
            self.store.remove_prefix(prefix, tenant)
        } else {
            self.store.remove(target, tenant)
        }
    }

    /// Delete all knowledge owned by `owner`, plus shared items if requested
    ///
    /// # Errors
    ///
    /// Returns error if the partition cannot be resolved or the delete fails.
    pub fn clear(&self, owner: &str, include_shared: bool, tenant: Option<&str>) -> Result<usize> {
        self.store.clear(owner, include_shared, tenant)
    }

    /// `(id, source path)` for every file-backed main document
    ///
    /// # Errors
    ///
    /// Returns error if the partition cannot be resolved or the read fails.
    pub fn file_backed_sources(&self, tenant: Option<&str>) -> Result<Vec<(String, String)>> {
        self.store.list_file_backed(tenant)
    }

    /// Tenant ids whose partitions are currently attached
    #[must_use]
    pub fn attached_tenants(&self) -> Vec<String> {
        self.registry.attached_tenants()
    }

    /// Root directory file-backed sources are resolved against
    #[must_use]
    pub fn knowledge_root(&self) -> &Path {
        &self.config.knowledge_dir
    }

    /// Configured interval between cleanup sweeps
    #[must_use]
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.config.sweep_interval_secs)
    }
}

impl std::fmt::Debug for KnowledgeManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KnowledgeManager").finish_non_exhaustive()
    }
}
