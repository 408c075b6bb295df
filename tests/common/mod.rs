//! Shared helpers for integration tests

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use ember_store::{Config, EmbeddingProvider, KnowledgeManager, Result, TenantRegistry, EMBEDDING_DIM};

/// Deterministic embedder: the same text always produces the same unit
/// vector, so exact-text matches score a similarity of 1.0 without any
/// network dependency.
#[derive(Default)]
pub struct MockEmbedder {
    pub calls: AtomicUsize,
}

#[async_trait]
impl EmbeddingProvider for MockEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        let digest = Sha256::digest(text.as_bytes());
        let mut v = vec![0.0_f32; EMBEDDING_DIM];
        for (i, b) in digest.iter().enumerate() {
            v[i] = f32::from(*b) / 255.0;
        }
        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in &mut v {
                *x /= norm;
            }
        }
        Ok(v)
    }
}

/// In-memory registry plus a knowledge manager with default configuration
pub fn manager() -> (Arc<MockEmbedder>, Arc<TenantRegistry>, KnowledgeManager) {
    let registry = Arc::new(TenantRegistry::open_in_memory().unwrap());
    let embedder = Arc::new(MockEmbedder::default());
    let manager = KnowledgeManager::new(
        registry.clone(),
        embedder.clone() as Arc<dyn EmbeddingProvider>,
        Config::default(),
    )
    .unwrap();
    (embedder, registry, manager)
}

/// One-hot embedding along an axis
#[must_use]
pub fn unit_embedding(axis: usize) -> Vec<f32> {
    let mut v = vec![0.0_f32; EMBEDDING_DIM];
    v[axis] = 1.0;
    v
}
