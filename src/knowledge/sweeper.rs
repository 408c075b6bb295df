//! Background reconciliation of file-backed knowledge
//!
//! Documents ingested from files carry their source path in metadata. When
//! the file disappears from the knowledge directory, the document and its
//! chunks are stale; the sweeper removes them on a fixed interval. One bad
//! item never aborts a sweep.

use std::path::PathBuf;
use std::sync::Arc;

use super::KnowledgeManager;

/// Outcome of one sweep over a partition
#[derive(Debug, Clone, Copy, Default)]
pub struct SweepReport {
    /// File-backed main documents examined
    pub scanned: usize,
    /// Documents removed because their source file is gone
    pub removed: usize,
    /// Documents whose removal failed
    pub failed: usize,
}

impl SweepReport {
    /// Fold another partition's counts into this report
    pub fn merge(&mut self, other: Self) {
        self.scanned += other.scanned;
        self.removed += other.removed;
        self.failed += other.failed;
    }
}

/// Periodically removes knowledge whose backing file no longer exists
pub struct CleanupSweeper {
    manager: Arc<KnowledgeManager>,
}

impl CleanupSweeper {
    /// Create a sweeper over a knowledge manager
    #[must_use]
    pub fn new(manager: Arc<KnowledgeManager>) -> Self {
        Self { manager }
    }

    /// Sweep one partition now.
    ///
    /// Relative source paths resolve against the knowledge root; absolute
    /// paths are checked as-is. Errors are logged and counted, never raised.
    #[must_use]
    pub fn sweep(&self, tenant: Option<&str>) -> SweepReport {
        let mut report = SweepReport::default();

        let sources = match self.manager.file_backed_sources(tenant) {
            Ok(sources) => sources,
            Err(e) => {
                tracing::error!(error = %e, tenant, "failed to list file-backed knowledge");
                return report;
            }
        };

        for (id, source) in sources {
            report.scanned += 1;

            let path = PathBuf::from(&source);
            let resolved = if path.is_absolute() {
                path
            } else {
                self.manager.knowledge_root().join(path)
            };
            if resolved.exists() {
                continue;
            }

            match self.manager.remove(&id, tenant) {
                Ok(count) => {
                    report.removed += 1;
                    tracing::info!(id, source, count, "removed knowledge for deleted file");
                }
                Err(e) => {
                    report.failed += 1;
                    tracing::error!(error = %e, id, source, "failed to remove stale knowledge");
                }
            }
        }

        report
    }

    /// Sweep the shared partition and every attached tenant partition
    #[must_use]
    pub fn sweep_all(&self) -> SweepReport {
        let mut report = self.sweep(None);
        for tenant in self.manager.attached_tenants() {
            report.merge(self.sweep(Some(&tenant)));
        }
        report
    }

    /// Run sweeps on the configured interval until the task is dropped.
    ///
    /// Each tick covers the shared partition plus every tenant partition
    /// attached at that moment.
    pub async fn run(self) {
        let mut interval = tokio::time::interval(self.manager.sweep_interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            interval.tick().await;
            let report = self.sweep_all();
            if report.removed > 0 || report.failed > 0 {
                tracing::info!(
                    scanned = report.scanned,
                    removed = report.removed,
                    failed = report.failed,
                    "cleanup sweep finished"
                );
            } else {
                tracing::trace!(scanned = report.scanned, "cleanup sweep found nothing stale");
            }
        }
    }
}

impl std::fmt::Debug for CleanupSweeper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CleanupSweeper").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::config::Config;
    use crate::db::TenantRegistry;
    use crate::embedding::{EmbeddingProvider, EMBEDDING_DIM};
    use crate::knowledge::IngestSource;
    use crate::Result;

    struct FlatEmbedder;

    #[async_trait]
    impl EmbeddingProvider for FlatEmbedder {
        async fn embed(&self, _text: &str) -> Result<Vec<f32>> {
            Ok(vec![0.1; EMBEDDING_DIM])
        }
    }

    fn manager_with_root(root: &std::path::Path) -> Arc<KnowledgeManager> {
        let registry = Arc::new(TenantRegistry::open_in_memory().unwrap());
        let config = Config {
            knowledge_dir: root.to_path_buf(),
            ..Config::default()
        };
        Arc::new(KnowledgeManager::new(registry, Arc::new(FlatEmbedder), config).unwrap())
    }

    #[tokio::test]
    async fn test_sweep_removes_orphans_keeps_backed() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("kept.md"), "still here").unwrap();

        let manager = manager_with_root(dir.path());
        let kept = manager
            .ingest(IngestSource::shared("kept.md", "document that stays"), None)
            .await
            .unwrap();
        let orphan = manager
            .ingest(IngestSource::shared("gone.md", "document whose file vanished"), None)
            .await
            .unwrap();

        let sweeper = CleanupSweeper::new(manager.clone());
        let report = sweeper.sweep(None);

        assert_eq!(report.scanned, 2);
        assert_eq!(report.removed, 1);
        assert_eq!(report.failed, 0);
        let remaining = manager.file_backed_sources(None).unwrap();
        assert!(remaining.iter().any(|(id, _)| id == &kept));
        assert!(!remaining.iter().any(|(id, _)| id == &orphan));
        // Chunks went with the main document
        assert_eq!(manager.store.chunk_count(&orphan, None).unwrap(), 0);
    }

    #[tokio::test]
    async fn test_sweep_all_covers_tenant_partitions() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager_with_root(dir.path());

        manager
            .ingest(
                IngestSource::private("gone.md", "tenant document, file deleted", "agent-1"),
                Some("acme"),
            )
            .await
            .unwrap();
        assert_eq!(manager.attached_tenants(), vec!["acme".to_string()]);

        let report = CleanupSweeper::new(manager.clone()).sweep_all();
        assert_eq!(report.scanned, 1);
        assert_eq!(report.removed, 1);
        assert!(manager.file_backed_sources(Some("acme")).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_sweep_empty_partition() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager_with_root(dir.path());

        let report = CleanupSweeper::new(manager).sweep(None);
        assert_eq!(report.scanned, 0);
        assert_eq!(report.removed, 0);
    }
}
