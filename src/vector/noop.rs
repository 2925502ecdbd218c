use async_trait::async_trait;

use super::{BackfillReport, VectorError, VectorIndex, VectorMatch};
use crate::memory::types::{DocType, Observation, SessionSummary, UserPrompt};

/// Index used when `vector.backend = "none"`: accepts every sync and finds nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopVectorIndex;

#[async_trait]
impl VectorIndex for NoopVectorIndex {
    fn backend_name(&self) -> &'static str {
        "none"
    }

    fn is_enabled(&self) -> bool {
        false
    }

    async fn sync_observation(&self, _observation: &Observation) {}

    async fn sync_summary(&self, _summary: &SessionSummary) {}

    async fn sync_prompt(&self, _prompt: &UserPrompt) {}

    async fn query(
        &self,
        _text: &str,
        _doc_type: Option<DocType>,
        _limit: usize,
    ) -> Result<Vec<VectorMatch>, VectorError> {
        Ok(Vec::new())
    }

    async fn ensure_backfilled(&self) -> Result<BackfillReport, VectorError> {
        Ok(BackfillReport::default())
    }

    async fn document_count(&self) -> Result<u64, VectorError> {
        Ok(0)
    }

    async fn close(&self) {}
}
