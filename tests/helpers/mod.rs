#![allow(dead_code)]

use anyhow::Result;
use async_trait::async_trait;
use hindsight::config::{HindsightConfig, SessionConfig};
use hindsight::db::manager::DatabaseManager;
use hindsight::db::Database;
use hindsight::embedding::{l2_normalize, EmbeddingProvider, EMBEDDING_DIM};
use hindsight::memory::store::BatchWrite;
use hindsight::memory::types::{DocType, Observation, ParsedObservation, SessionSummary, UserPrompt};
use hindsight::session::provider::{
    GenerationProvider, GenerationRequest, GenerationResponse, ProviderError,
};
use hindsight::session::{RestartPolicy, SessionManager};
use hindsight::vector::sqlite_vec::SqliteVecIndex;
use hindsight::vector::{BackfillReport, VectorError, VectorIndex, VectorMatch};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

/// Fresh, fully migrated in-memory store.
pub fn test_db() -> Database {
    Database::in_memory().unwrap()
}

/// Store with the sqlite-vec index fed by [`FakeEmbedder`].
pub fn vector_store() -> DatabaseManager {
    let db = test_db();
    let index = SqliteVecIndex::new(db.clone(), Arc::new(FakeEmbedder));
    DatabaseManager::from_parts(db, Arc::new(index))
}

/// Store without a vector backend.
pub fn plain_store() -> DatabaseManager {
    DatabaseManager::from_parts(test_db(), Arc::new(hindsight::vector::noop::NoopVectorIndex))
}

/// Bag-of-words embedding: each lowercase word lights one dimension. Texts sharing words are
/// close, disjoint texts are orthogonal.
pub struct FakeEmbedder;

pub fn word_embedding(text: &str) -> Vec<f32> {
    let mut v = vec![0.0f32; EMBEDDING_DIM];
    for word in text.split(|c: char| !c.is_alphanumeric()).filter(|w| !w.is_empty()) {
        let hash = blake3::hash(word.to_lowercase().as_bytes());
        let slot =
            u16::from_le_bytes([hash.as_bytes()[0], hash.as_bytes()[1]]) as usize % EMBEDDING_DIM;
        v[slot] += 1.0;
    }
    if v.iter().all(|x| *x == 0.0) {
        v[0] = 1.0;
    }
    l2_normalize(&v)
}

#[async_trait]
impl EmbeddingProvider for FakeEmbedder {
    fn name(&self) -> &str {
        "fake"
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| word_embedding(t)).collect())
    }
}

/// Enabled index whose queries always fail.
pub struct FailingVectorIndex;

#[async_trait]
impl VectorIndex for FailingVectorIndex {
    fn backend_name(&self) -> &'static str {
        "failing"
    }

    fn is_enabled(&self) -> bool {
        true
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
        Err(VectorError::Storage("backend process exited".into()))
    }

    async fn ensure_backfilled(&self) -> Result<BackfillReport, VectorError> {
        Err(VectorError::Storage("backend process exited".into()))
    }

    async fn document_count(&self) -> Result<u64, VectorError> {
        Ok(0)
    }

    async fn close(&self) {}
}

pub fn observation_xml(obs_type: &str, title: &str) -> String {
    format!(
        "<observation><type>{obs_type}</type><title>{title}</title>\
         <narrative>{title} narrative</narrative></observation>"
    )
}

pub fn summary_xml(request: &str) -> String {
    format!("<summary><request>{request}</request><completed>done</completed></summary>")
}

/// Scripted provider. Queued results are returned in order, then `default_text` forever.
/// With a gate, each call waits for a permit from [`FakeProvider::release`].
pub struct FakeProvider {
    name: String,
    script: Mutex<VecDeque<Result<String, ProviderError>>>,
    default_text: String,
    gate: Option<Semaphore>,
    calls: AtomicUsize,
    pub requests: Mutex<Vec<GenerationRequest>>,
}

impl FakeProvider {
    pub fn new(default_text: impl Into<String>) -> Self {
        Self {
            name: "fake".into(),
            script: Mutex::new(VecDeque::new()),
            default_text: default_text.into(),
            gate: None,
            calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn named(mut self, name: &str) -> Self {
        self.name = name.into();
        self
    }

    pub fn gated(mut self) -> Self {
        self.gate = Some(Semaphore::new(0));
        self
    }

    pub fn then(self, result: Result<String, ProviderError>) -> Self {
        self.script.lock().push_back(result);
        self
    }

    pub fn release(&self, n: usize) {
        if let Some(gate) = &self.gate {
            gate.add_permits(n);
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl GenerationProvider for FakeProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn generate(
        &self,
        request: &GenerationRequest,
    ) -> Result<GenerationResponse, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().push(request.clone());
        if let Some(gate) = &self.gate {
            gate.acquire()
                .await
                .map_err(|_| ProviderError::Cancelled)?
                .forget();
        }
        let next = self.script.lock().pop_front();
        let text = match next {
            Some(result) => result?,
            None => self.default_text.clone(),
        };
        Ok(GenerationResponse {
            text,
            model: "fake-model".into(),
            input_tokens: 10,
            output_tokens: 5,
        })
    }
}

pub fn fast_policy() -> RestartPolicy {
    RestartPolicy {
        max_consecutive: 3,
        initial: Duration::from_millis(1),
        max: Duration::from_millis(5),
    }
}

pub fn session_manager(
    store: DatabaseManager,
    primary: Arc<FakeProvider>,
    fallback: Option<Arc<FakeProvider>>,
) -> SessionManager {
    SessionManager::new(
        store,
        primary,
        fallback.map(|f| f as Arc<dyn GenerationProvider>),
        SessionConfig::default(),
        fast_policy(),
    )
}

/// Poll `check` every 10ms until it holds, panicking after 5s.
pub async fn wait_until(mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check() {
        assert!(tokio::time::Instant::now() < deadline, "condition not met within 5s");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Write one batch of observations directly, bypassing sessions.
pub async fn seed_observations(
    store: &DatabaseManager,
    project: &str,
    observations: Vec<ParsedObservation>,
) -> Vec<Observation> {
    store
        .store_batch(BatchWrite {
            memory_session_id: format!("mem-{project}"),
            project: project.into(),
            observations,
            prompt_number: Some(1),
            ..Default::default()
        })
        .await
        .unwrap()
        .observations
}

pub fn parsed(obs_type: &str, title: &str) -> ParsedObservation {
    ParsedObservation {
        obs_type: obs_type.into(),
        title: Some(title.into()),
        narrative: Some(format!("{title} narrative")),
        ..Default::default()
    }
}

/// Config for an in-process worker: loopback, ephemeral port, data under `dir`.
pub fn worker_config(dir: &std::path::Path) -> HindsightConfig {
    let mut config = HindsightConfig::default();
    config.server.port = 0;
    config.server.auth_token = Some("test-token-123".into());
    config.storage.data_dir = dir.to_string_lossy().into_owned();
    config.vector.backend = "none".into();
    config.lifecycle.step_timeout_ms = 2_000;
    config.lifecycle.session_stop_timeout_ms = 1_000;
    config.lifecycle.child_exit_timeout_ms = 500;
    config
}
