//! Text-to-vector embedding pipeline.
//!
//! Provides the [`EmbeddingProvider`] trait with two implementations: local ONNX inference
//! of all-MiniLM-L6-v2 (384 dimensions, L2-normalized) and an external embedding process
//! spoken to over JSON lines. The provider is created via [`create_provider`] from
//! configuration.

pub mod command;
pub mod local;

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;

use crate::config::VectorConfig;
use crate::lifecycle::process::ProcessRegistry;

/// Number of dimensions in the embedding vectors (all-MiniLM-L6-v2).
pub const EMBEDDING_DIM: usize = 384;

/// Embeds text into L2-normalized vectors of exactly [`EMBEDDING_DIM`] dimensions.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut out = self.embed_batch(&[text.to_string()]).await?;
        out.pop()
            .ok_or_else(|| anyhow::anyhow!("embedding provider returned no vector"))
    }

    fn dimensions(&self) -> usize {
        EMBEDDING_DIM
    }

    /// Release external resources (child processes). Default: nothing to release.
    async fn close(&self) {}
}

/// Create an embedding provider from config.
///
/// `"local"` needs the model files (`hindsight model download`); `"command"` spawns
/// `vector.command` lazily on first use.
pub fn create_provider(
    config: &VectorConfig,
    processes: Arc<ProcessRegistry>,
) -> Result<Arc<dyn EmbeddingProvider>> {
    match config.embedding.as_str() {
        "local" => Ok(Arc::new(local::LocalEmbeddingProvider::new(config)?)),
        "command" => Ok(Arc::new(command::CommandEmbeddingProvider::new(
            config, processes,
        )?)),
        other => anyhow::bail!("unknown embedding provider: {other}. Supported: local, command"),
    }
}

/// L2-normalize a vector. Returns the input unchanged if its norm is zero.
pub fn l2_normalize(v: &[f32]) -> Vec<f32> {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        v.iter().map(|x| x / norm).collect()
    } else {
        v.to_vec()
    }
}
