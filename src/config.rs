//! Configuration for the ember store

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::Result;

/// Default chunk size for knowledge ingestion (characters)
pub const DEFAULT_CHUNK_SIZE: usize = 512;

/// Default overlap between adjacent chunks (characters)
pub const DEFAULT_CHUNK_OVERLAP: usize = 20;

/// Default minimum combined score for a retrieval candidate
pub const DEFAULT_MATCH_THRESHOLD: f32 = 0.85;

/// Similarity above which a new memory is considered a near-duplicate
pub const DEFAULT_DEDUP_THRESHOLD: f32 = 0.95;

/// Maximum characters sent to the embedding provider for a main document
pub const DEFAULT_EMBEDDING_WINDOW: usize = 4000;

/// Default interval between cleanup sweeps (seconds)
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 600;

/// Store configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Directory holding partition files (shared.db plus one per tenant)
    pub data_dir: PathBuf,

    /// Root directory for file-backed knowledge sources
    pub knowledge_dir: PathBuf,

    /// Chunk window size in characters
    pub chunk_size: usize,

    /// Overlap between adjacent chunks in characters
    pub chunk_overlap: usize,

    /// Minimum combined score for retrieval results
    pub match_threshold: f32,

    /// Similarity bound for the memory near-duplicate check
    pub dedup_threshold: f32,

    /// Character window for main-document embedding calls
    pub embedding_window: usize,

    /// Seconds between orphan-cleanup sweeps
    pub sweep_interval_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            knowledge_dir: PathBuf::from("knowledge"),
            chunk_size: DEFAULT_CHUNK_SIZE,
            chunk_overlap: DEFAULT_CHUNK_OVERLAP,
            match_threshold: DEFAULT_MATCH_THRESHOLD,
            dedup_threshold: DEFAULT_DEDUP_THRESHOLD,
            embedding_window: DEFAULT_EMBEDDING_WINDOW,
            sweep_interval_secs: DEFAULT_SWEEP_INTERVAL_SECS,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    ///
    /// Missing keys fall back to defaults.
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read or parsed.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Build a configuration rooted at a data directory, defaults elsewhere.
    #[must_use]
    pub fn rooted_at<P: AsRef<Path>>(data_dir: P) -> Self {
        Self {
            data_dir: data_dir.as_ref().to_path_buf(),
            knowledge_dir: data_dir.as_ref().join("knowledge"),
            ..Self::default()
        }
    }

    /// Check invariants between chunking parameters.
    ///
    /// # Errors
    ///
    /// Returns error if the overlap is not strictly smaller than the chunk size.
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 || self.chunk_overlap >= self.chunk_size {
            return Err(crate::Error::Config(format!(
                "chunk_overlap ({}) must be smaller than chunk_size ({})",
                self.chunk_overlap, self.chunk_size
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.chunk_size, DEFAULT_CHUNK_SIZE);
        assert_eq!(config.chunk_overlap, DEFAULT_CHUNK_OVERLAP);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_partial_toml() {
        let config: Config = toml::from_str("chunk_size = 256\n").unwrap();
        assert_eq!(config.chunk_size, 256);
        assert_eq!(config.chunk_overlap, DEFAULT_CHUNK_OVERLAP);
    }

    #[test]
    fn test_invalid_overlap_rejected() {
        let config = Config {
            chunk_size: 10,
            chunk_overlap: 10,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }
}
