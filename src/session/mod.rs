//! Per-session queueing and generation.
//!
//! Every session owns a FIFO queue and at most one in-flight generation. Enqueueing persists
//! the item, appends it in memory and triggers a drain; a drain takes the whole queue as one
//! batch, sends it to the provider under the session's cancellation token and persists the
//! parsed output in one transaction. Items that arrive while a batch is in flight wait for
//! the next drain, which runs as soon as the current one finishes.
//!
//! The registry lock is only held for synchronous bookkeeping, never across an await.

pub mod anthropic;
pub mod openai;
pub mod parser;
pub mod prompt;
pub mod provider;

use anyhow::Result;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::config::{ProviderConfig, SessionConfig};
use crate::db::manager::DatabaseManager;
use crate::memory::privacy::{is_entirely_private, strip_private, strip_private_json};
use crate::memory::store::{now_epoch_ms, BatchWrite};
use crate::memory::types::{
    Observation, ObservationPayload, PendingMessage, PendingPayload, SessionRecord, SessionSummary,
    SummarizePayload, UserPrompt,
};
use crate::memory::{queue, sessions};
use provider::{
    ChatMessage, GenerationProvider, GenerationRequest, GenerationResponse, ProviderError,
};

pub const SKIP_PRIVATE: &str = "private";
pub const SKIP_TOOL: &str = "skipped_tool";

const EVENT_CAPACITY: usize = 256;

/// Broadcast to `/stream` subscribers.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerEvent {
    NewObservation { observation: Observation },
    NewSummary { summary: SessionSummary },
    NewPrompt { prompt: UserPrompt },
    ProcessingStatus { is_processing: bool, queue_depth: usize },
    SessionCompleted { session_db_id: i64 },
}

/// Bounded exponential restart policy for transient provider failures.
#[derive(Debug, Clone, Copy)]
pub struct RestartPolicy {
    pub max_consecutive: u32,
    pub initial: Duration,
    pub max: Duration,
}

impl RestartPolicy {
    pub fn from_config(config: &ProviderConfig) -> Self {
        Self {
            max_consecutive: config.max_consecutive_restarts,
            initial: Duration::from_millis(config.backoff_initial_ms),
            max: Duration::from_millis(config.backoff_max_ms),
        }
    }

    /// Delay before restart number `attempt` (1-based): `min(initial * 2^(attempt-1), max)`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(20);
        self.initial.saturating_mul(1u32 << shift).min(self.max)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderSlot {
    Primary,
    Fallback,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ProviderUsage {
    pub calls: u64,
    pub failures: u64,
    pub restarts: u64,
    pub fallbacks: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

#[derive(Default)]
struct UsageCounters {
    calls: AtomicU64,
    failures: AtomicU64,
    restarts: AtomicU64,
    fallbacks: AtomicU64,
    input_tokens: AtomicU64,
    output_tokens: AtomicU64,
}

/// Outcome of [`SessionManager::init_session`].
#[derive(Debug, Clone, Serialize)]
pub struct InitOutcome {
    pub session_db_id: i64,
    pub prompt_number: i64,
    pub skipped: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<&'static str>,
}

/// Outcome of queueing an observation or summarize request.
#[derive(Debug, Clone, Serialize)]
pub struct QueueOutcome {
    pub queued: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_db_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<&'static str>,
}

impl QueueOutcome {
    fn skipped(reason: &'static str) -> Self {
        Self {
            queued: false,
            session_db_id: None,
            message_id: None,
            reason: Some(reason),
        }
    }
}

/// Read-only view of one registry entry.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub session_db_id: i64,
    pub content_session_id: String,
    pub memory_session_id: Option<String>,
    pub project: String,
    pub queue_depth: usize,
    pub generating: bool,
    pub provider: ProviderSlot,
    pub consecutive_restarts: u32,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub earliest_pending_epoch: Option<i64>,
    pub started_at_epoch: i64,
    pub last_activity_epoch: i64,
}

struct ActiveSession {
    session_db_id: i64,
    content_session_id: String,
    memory_session_id: Option<String>,
    project: String,
    user_prompt: Option<String>,
    queue: VecDeque<PendingMessage>,
    /// Token of the in-flight generation; `Some` exactly while one runs.
    generation: Option<CancellationToken>,
    /// Message ids of the in-flight batch.
    in_flight: Vec<i64>,
    last_prompt_number: i64,
    started_at_epoch: i64,
    last_activity_epoch: i64,
    input_tokens: u64,
    output_tokens: u64,
    earliest_pending_epoch: Option<i64>,
    history: Vec<ChatMessage>,
    provider: ProviderSlot,
    consecutive_restarts: u32,
    complete_requested: bool,
}

impl ActiveSession {
    fn from_record(record: &SessionRecord) -> Self {
        let now = now_epoch_ms();
        Self {
            session_db_id: record.id,
            content_session_id: record.content_session_id.clone(),
            memory_session_id: record.memory_session_id.clone(),
            project: record.project.clone(),
            user_prompt: record.user_prompt.clone(),
            queue: VecDeque::new(),
            generation: None,
            in_flight: Vec::new(),
            last_prompt_number: record.prompt_counter,
            started_at_epoch: now,
            last_activity_epoch: now,
            input_tokens: 0,
            output_tokens: 0,
            earliest_pending_epoch: None,
            history: Vec::new(),
            provider: ProviderSlot::Primary,
            consecutive_restarts: 0,
            complete_requested: false,
        }
    }

    fn is_idle(&self) -> bool {
        self.generation.is_none() && self.queue.is_empty()
    }

    fn owns_message(&self, message_id: i64) -> bool {
        self.in_flight.contains(&message_id) || self.queue.iter().any(|m| m.id == message_id)
    }

    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            session_db_id: self.session_db_id,
            content_session_id: self.content_session_id.clone(),
            memory_session_id: self.memory_session_id.clone(),
            project: self.project.clone(),
            queue_depth: self.queue.len(),
            generating: self.generation.is_some(),
            provider: self.provider,
            consecutive_restarts: self.consecutive_restarts,
            input_tokens: self.input_tokens,
            output_tokens: self.output_tokens,
            earliest_pending_epoch: self.earliest_pending_epoch,
            started_at_epoch: self.started_at_epoch,
            last_activity_epoch: self.last_activity_epoch,
        }
    }
}

#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

struct Inner {
    store: DatabaseManager,
    primary: Arc<dyn GenerationProvider>,
    fallback: Option<Arc<dyn GenerationProvider>>,
    config: SessionConfig,
    policy: RestartPolicy,
    sessions: Mutex<HashMap<i64, ActiveSession>>,
    shutdown: CancellationToken,
    events: broadcast::Sender<WorkerEvent>,
    usage: UsageCounters,
    queued: AtomicUsize,
    active_generations: AtomicUsize,
}

impl SessionManager {
    pub fn new(
        store: DatabaseManager,
        primary: Arc<dyn GenerationProvider>,
        fallback: Option<Arc<dyn GenerationProvider>>,
        config: SessionConfig,
        policy: RestartPolicy,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                store,
                primary,
                fallback,
                config,
                policy,
                sessions: Mutex::new(HashMap::new()),
                shutdown: CancellationToken::new(),
                events,
                usage: UsageCounters::default(),
                queued: AtomicUsize::new(0),
                active_generations: AtomicUsize::new(0),
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WorkerEvent> {
        self.inner.events.subscribe()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Create or continue a session and record its prompt.
    ///
    /// A prompt that is entirely `<private>` still advances the prompt counter but is not
    /// stored; the outcome carries reason [`SKIP_PRIVATE`].
    pub async fn init_session(
        &self,
        content_session_id: &str,
        project: &str,
        prompt: Option<&str>,
    ) -> Result<InitOutcome> {
        let private = prompt.is_some_and(is_entirely_private);
        let cleaned = prompt
            .filter(|_| !private)
            .map(strip_private)
            .filter(|p| !p.is_empty());

        let (cid, proj, stored) = (
            content_session_id.to_string(),
            project.to_string(),
            cleaned.clone(),
        );
        let init = self
            .inner
            .store
            .db()
            .call(move |conn| sessions::init_session(conn, &cid, &proj, stored.as_deref()))
            .await?;
        self.inner.ensure_loaded(&init.session);

        tracing::info!(
            session_db_id = init.session.id,
            prompt_number = init.prompt_number,
            created = init.created,
            "session initialised"
        );

        if private {
            return Ok(InitOutcome {
                session_db_id: init.session.id,
                prompt_number: init.prompt_number,
                skipped: true,
                reason: Some(SKIP_PRIVATE),
            });
        }

        if let Some(text) = cleaned {
            let prompt = self
                .inner
                .store
                .store_user_prompt(
                    content_session_id.to_string(),
                    init.session.project.clone(),
                    init.prompt_number,
                    text,
                )
                .await?;
            self.inner.emit(WorkerEvent::NewPrompt { prompt });
        }

        Ok(InitOutcome {
            session_db_id: init.session.id,
            prompt_number: init.prompt_number,
            skipped: false,
            reason: None,
        })
    }

    /// Queue a tool-use event. Tools in `skip_tools` are acknowledged but not queued.
    pub async fn queue_observation(
        &self,
        content_session_id: &str,
        project: Option<&str>,
        mut payload: ObservationPayload,
    ) -> Result<QueueOutcome> {
        if self.inner.config.skip_tools.iter().any(|t| *t == payload.tool_name) {
            tracing::debug!(tool = %payload.tool_name, "tool skipped");
            return Ok(QueueOutcome::skipped(SKIP_TOOL));
        }
        payload.tool_input = strip_private_json(&payload.tool_input);
        payload.tool_response = strip_private_json(&payload.tool_response);
        self.enqueue(content_session_id, project, PendingPayload::Observation(payload))
            .await
    }

    pub async fn queue_summarize(
        &self,
        content_session_id: &str,
        project: Option<&str>,
        mut payload: SummarizePayload,
    ) -> Result<QueueOutcome> {
        payload.last_user_message = payload.last_user_message.as_deref().map(strip_private);
        payload.last_assistant_message = payload
            .last_assistant_message
            .as_deref()
            .map(strip_private);
        self.enqueue(content_session_id, project, PendingPayload::Summarize(payload))
            .await
    }

    async fn enqueue(
        &self,
        content_session_id: &str,
        project: Option<&str>,
        mut payload: PendingPayload,
    ) -> Result<QueueOutcome> {
        let cid = content_session_id.to_string();
        let project = project.unwrap_or("unknown").to_string();
        let (record, message) = self
            .inner
            .store
            .db()
            .call(move |conn| {
                let record = match sessions::get_by_content_id(conn, &cid)? {
                    Some(record) => record,
                    None => sessions::init_session(conn, &cid, &project, None)?.session,
                };
                fill_prompt_number(&mut payload, record.prompt_counter);
                let message = queue::enqueue(conn, record.id, &cid, &payload)?;
                Ok((record, message))
            })
            .await?;

        let message_id = message.id;
        let kind = message.payload.kind();
        let depth = self.inner.push(&record, message).unwrap_or_default();
        tracing::info!(
            session_db_id = record.id,
            message_id,
            kind,
            queued = depth,
            "work enqueued"
        );
        self.inner.drain(record.id);

        Ok(QueueOutcome {
            queued: true,
            session_db_id: Some(record.id),
            message_id: Some(message_id),
            reason: None,
        })
    }

    /// Mark a session completed. It leaves the registry once its queue has drained.
    pub async fn complete_session(&self, content_session_id: &str) -> Result<Option<i64>> {
        let cid = content_session_id.to_string();
        let id = self
            .inner
            .store
            .db()
            .call(move |conn| {
                let Some(record) = sessions::get_by_content_id(conn, &cid)? else {
                    return Ok(None);
                };
                sessions::complete_session(conn, record.id)?;
                Ok(Some(record.id))
            })
            .await?;

        if let Some(id) = id {
            {
                let mut registry = self.inner.sessions.lock();
                if let Some(session) = registry.get_mut(&id) {
                    session.complete_requested = true;
                    if session.is_idle() {
                        registry.remove(&id);
                    }
                }
            }
            tracing::info!(session_db_id = id, "session completed");
            self.inner.emit(WorkerEvent::SessionCompleted { session_db_id: id });
        }
        Ok(id)
    }

    /// True while any session has queued work or a generation in flight. Lock-free.
    pub fn is_any_session_processing(&self) -> bool {
        self.total_active_work() > 0
    }

    /// Queued items plus in-flight generations across all sessions. Lock-free.
    pub fn total_active_work(&self) -> usize {
        self.inner.queued.load(Ordering::Acquire)
            + self.inner.active_generations.load(Ordering::Acquire)
    }

    pub fn queue_depth(&self) -> usize {
        self.inner.queued.load(Ordering::Acquire)
    }

    pub fn active_generations(&self) -> usize {
        self.inner.active_generations.load(Ordering::Acquire)
    }

    pub fn active_sessions(&self) -> usize {
        self.inner.sessions.lock().len()
    }

    pub fn snapshot(&self, session_db_id: i64) -> Option<SessionSnapshot> {
        self.inner.sessions.lock().get(&session_db_id).map(ActiveSession::snapshot)
    }

    pub fn snapshots(&self) -> Vec<SessionSnapshot> {
        let mut all: Vec<_> = self
            .inner
            .sessions
            .lock()
            .values()
            .map(ActiveSession::snapshot)
            .collect();
        all.sort_by_key(|s| s.session_db_id);
        all
    }

    pub fn provider_usage(&self) -> ProviderUsage {
        let u = &self.inner.usage;
        ProviderUsage {
            calls: u.calls.load(Ordering::Relaxed),
            failures: u.failures.load(Ordering::Relaxed),
            restarts: u.restarts.load(Ordering::Relaxed),
            fallbacks: u.fallbacks.load(Ordering::Relaxed),
            input_tokens: u.input_tokens.load(Ordering::Relaxed),
            output_tokens: u.output_tokens.load(Ordering::Relaxed),
        }
    }

    /// Re-enqueue durable work left behind by a previous run.
    ///
    /// Rows already queued or generating in this process are left to their owner, so work
    /// that arrived before recovery is never processed twice.
    pub async fn recover_pending(&self) -> Result<usize> {
        let inner = Arc::clone(&self.inner);
        let (reset, pending, records) = self
            .inner
            .store
            .db()
            .call(move |conn| {
                let in_flight = inner.in_flight_ids();
                let reset = queue::reset_stuck_except(conn, &in_flight)?;
                let pending = queue::load_pending(conn)?;
                let mut records = HashMap::new();
                for item in &pending {
                    if !records.contains_key(&item.session_db_id) {
                        if let Some(record) = sessions::get_by_id(conn, item.session_db_id)? {
                            records.insert(item.session_db_id, record);
                        }
                    }
                }
                Ok((reset, pending, records))
            })
            .await?;

        let mut recovered = 0;
        for item in pending {
            if let Some(record) = records.get(&item.session_db_id) {
                if self.inner.push(record, item.message).is_some() {
                    recovered += 1;
                }
            }
        }
        for id in records.keys() {
            self.inner.drain(*id);
        }
        if recovered > 0 || reset > 0 {
            tracing::info!(
                recovered,
                reset_stuck = reset,
                sessions = records.len(),
                "pending work recovered"
            );
        }
        Ok(recovered)
    }

    /// Drop idle sessions whose last activity is older than `stale_after_mins`.
    pub fn reap_stale(&self) -> Vec<i64> {
        let cutoff = now_epoch_ms() - (self.inner.config.stale_after_mins as i64) * 60_000;
        let mut reaped = Vec::new();
        self.inner.sessions.lock().retain(|id, s| {
            let stale = s.is_idle() && s.last_activity_epoch < cutoff;
            if stale {
                reaped.push(*id);
            }
            !stale
        });
        if !reaped.is_empty() {
            tracing::info!(count = reaped.len(), "stale sessions reaped");
        }
        reaped
    }

    /// Cancel every session's generation and wait, bounded, until all have returned.
    ///
    /// Returns `true` when every generation acknowledged within `timeout`.
    pub async fn shutdown_all(&self, timeout: Duration) -> bool {
        self.inner.shutdown.cancel();
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let active = self.inner.active_generations.load(Ordering::Acquire);
            if active == 0 {
                tracing::info!("all sessions stopped");
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                tracing::warn!(active, "sessions still generating after shutdown timeout");
                return false;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}

fn fill_prompt_number(payload: &mut PendingPayload, counter: i64) {
    let slot = match payload {
        PendingPayload::Observation(o) => &mut o.prompt_number,
        PendingPayload::Summarize(s) => &mut s.prompt_number,
    };
    if *slot <= 0 {
        *slot = counter;
    }
}

enum BatchOutcome {
    Stored { observations: usize, summary: bool },
    Cancelled,
    Failed(String),
}

impl Inner {
    fn emit(&self, event: WorkerEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn emit_status(&self) {
        let queue_depth = self.queued.load(Ordering::Acquire);
        let active = self.active_generations.load(Ordering::Acquire);
        self.emit(WorkerEvent::ProcessingStatus {
            is_processing: queue_depth + active > 0,
            queue_depth,
        });
    }

    fn ensure_loaded(&self, record: &SessionRecord) {
        let mut registry = self.sessions.lock();
        let session = registry
            .entry(record.id)
            .or_insert_with(|| ActiveSession::from_record(record));
        session.last_prompt_number = session.last_prompt_number.max(record.prompt_counter);
        session.last_activity_epoch = now_epoch_ms();
        session.complete_requested = false;
        if session.user_prompt.is_none() {
            session.user_prompt = record.user_prompt.clone();
        }
    }

    fn in_flight_ids(&self) -> Vec<i64> {
        self.sessions
            .lock()
            .values()
            .flat_map(|s| s.in_flight.iter().copied())
            .collect()
    }

    /// Append to the session's queue. Returns the new depth, or `None` when the message is
    /// already queued or generating.
    fn push(&self, record: &SessionRecord, message: PendingMessage) -> Option<usize> {
        let mut registry = self.sessions.lock();
        let session = registry
            .entry(record.id)
            .or_insert_with(|| ActiveSession::from_record(record));
        if session.owns_message(message.id) {
            return None;
        }
        session.last_activity_epoch = now_epoch_ms();
        session.last_prompt_number = session
            .last_prompt_number
            .max(message.payload.prompt_number());
        session
            .earliest_pending_epoch
            .get_or_insert(message.enqueued_at_epoch);
        session.queue.push_back(message);
        self.queued.fetch_add(1, Ordering::AcqRel);
        Some(session.queue.len())
    }

    /// Start a generation for the session's whole queue unless one is already running.
    fn drain(self: &Arc<Self>, session_db_id: i64) {
        let (batch, token) = {
            let mut registry = self.sessions.lock();
            let Some(session) = registry.get_mut(&session_db_id) else {
                return;
            };
            if session.generation.is_some() {
                return;
            }
            if session.queue.is_empty() {
                if session.complete_requested {
                    registry.remove(&session_db_id);
                }
                return;
            }
            if self.shutdown.is_cancelled() {
                return;
            }
            let batch: Vec<PendingMessage> = session.queue.drain(..).collect();
            let token = self.shutdown.child_token();
            session.generation = Some(token.clone());
            session.in_flight = batch.iter().map(|m| m.id).collect();
            session.earliest_pending_epoch = None;
            self.queued.fetch_sub(batch.len(), Ordering::AcqRel);
            self.active_generations.fetch_add(1, Ordering::AcqRel);
            (batch, token)
        };

        tracing::info!(session_db_id, batch = batch.len(), "drain started");
        self.emit_status();
        let inner = Arc::clone(self);
        tokio::spawn(async move { inner.run_generation(session_db_id, batch, token).await });
    }

    async fn run_generation(
        self: Arc<Self>,
        session_db_id: i64,
        batch: Vec<PendingMessage>,
        token: CancellationToken,
    ) {
        let ids: Vec<i64> = batch.iter().map(|m| m.id).collect();
        let outcome = match self.process_batch(session_db_id, &batch, &token).await {
            Ok(outcome) => outcome,
            Err(e) => BatchOutcome::Failed(format!("{e:#}")),
        };

        match &outcome {
            BatchOutcome::Stored { observations, summary } => {
                tracing::info!(session_db_id, observations, summary, "drain finished");
            }
            BatchOutcome::Cancelled => {
                tracing::info!(
                    session_db_id,
                    batch = ids.len(),
                    "generation cancelled, work returned to pending"
                );
                self.settle(move |conn| queue::reset_to_pending(conn, &ids)).await;
            }
            BatchOutcome::Failed(error) => {
                tracing::error!(
                    session_db_id,
                    batch = ids.len(),
                    error = %error,
                    "generation batch failed"
                );
                let error = error.clone();
                self.settle(move |conn| queue::mark_failed(conn, &ids, &error)).await;
            }
        }

        {
            let mut registry = self.sessions.lock();
            if let Some(session) = registry.get_mut(&session_db_id) {
                session.generation = None;
                session.in_flight.clear();
                session.earliest_pending_epoch = session.queue.front().map(|m| m.enqueued_at_epoch);
            }
        }
        self.active_generations.fetch_sub(1, Ordering::AcqRel);
        self.emit_status();

        if !token.is_cancelled() {
            self.drain(session_db_id);
        }
    }

    async fn settle<F>(&self, f: F)
    where
        F: FnOnce(&mut rusqlite::Connection) -> Result<usize> + Send + 'static,
    {
        if let Err(e) = self.store.db().call(f).await {
            tracing::warn!(error = %e, "failed to update pending message status");
        }
    }

    async fn process_batch(
        &self,
        session_db_id: i64,
        batch: &[PendingMessage],
        token: &CancellationToken,
    ) -> Result<BatchOutcome> {
        let ids: Vec<i64> = batch.iter().map(|m| m.id).collect();
        let claim = ids.clone();
        self.store
            .db()
            .call(move |conn| queue::mark_processing(conn, &claim))
            .await?;

        let turn = prompt::batch_turn(batch);
        let Some((request, project, memory_session_id)) = self.build_request(session_db_id, &turn)
        else {
            return Ok(BatchOutcome::Failed("session left the registry".into()));
        };

        let response = match self.generate_with_restarts(session_db_id, &request, token).await {
            Ok(response) => response,
            Err(ProviderError::Cancelled) => return Ok(BatchOutcome::Cancelled),
            Err(e) => return Ok(BatchOutcome::Failed(e.to_string())),
        };
        // Resumed after a suspension point: a shutdown may have started meanwhile.
        if token.is_cancelled() {
            return Ok(BatchOutcome::Cancelled);
        }

        let parsed = parser::parse_output(&response.text, &self.config.observation_types);

        let memory_session_id = match memory_session_id {
            Some(id) => id,
            None => {
                let id = uuid::Uuid::now_v7().to_string();
                let assigned = id.clone();
                self.store
                    .db()
                    .call(move |conn| {
                        sessions::set_memory_session_id(conn, session_db_id, &assigned)
                    })
                    .await?;
                id
            }
        };

        let stored = self
            .store
            .store_batch(BatchWrite {
                memory_session_id: memory_session_id.clone(),
                project,
                observations: parsed.observations,
                summary: parsed.summary,
                prompt_number: batch.iter().map(|m| m.payload.prompt_number()).max(),
                discovery_tokens: (response.input_tokens + response.output_tokens) as i64,
                override_epoch: batch.iter().map(|m| m.enqueued_at_epoch).min(),
                processed_message_ids: ids,
            })
            .await?;

        {
            let mut registry = self.sessions.lock();
            if let Some(session) = registry.get_mut(&session_db_id) {
                session.memory_session_id.get_or_insert(memory_session_id);
                session.input_tokens += response.input_tokens;
                session.output_tokens += response.output_tokens;
                session.last_activity_epoch = now_epoch_ms();
                let reply = if response.text.trim().is_empty() {
                    "(nothing recorded)".to_string()
                } else {
                    response.text.clone()
                };
                session.history.push(ChatMessage::user(turn));
                session.history.push(ChatMessage::assistant(reply));
                let limit = self.config.history_limit.max(2);
                while session.history.len() > limit {
                    session.history.drain(..2);
                }
            }
        }

        let outcome = BatchOutcome::Stored {
            observations: stored.observations.len(),
            summary: stored.summary.is_some(),
        };
        for observation in stored.observations {
            self.emit(WorkerEvent::NewObservation { observation });
        }
        if let Some(summary) = stored.summary {
            self.emit(WorkerEvent::NewSummary { summary });
        }
        Ok(outcome)
    }

    /// History plus the new turn; the session header leads the first message sent.
    fn build_request(
        &self,
        session_db_id: i64,
        turn: &str,
    ) -> Option<(GenerationRequest, String, Option<String>)> {
        let registry = self.sessions.lock();
        let session = registry.get(&session_db_id)?;
        let header = prompt::session_header(
            &session.project,
            session.user_prompt.as_deref(),
            session.last_prompt_number,
        );
        let mut messages = session.history.clone();
        messages.push(ChatMessage::user(turn));
        if let Some(first) = messages.first_mut() {
            first.content = format!("{header}\n{}", first.content);
        }
        Some((
            GenerationRequest {
                system: prompt::system_prompt(&self.config.observation_types),
                messages,
                max_tokens: None,
            },
            session.project.clone(),
            session.memory_session_id.clone(),
        ))
    }

    fn current_slot(&self, session_db_id: i64) -> ProviderSlot {
        self.sessions
            .lock()
            .get(&session_db_id)
            .map(|s| s.provider)
            .unwrap_or(ProviderSlot::Primary)
    }

    /// Call the session's provider; on a transient failure restart on the fallback (or the
    /// same provider when none is configured) after a backoff, at most
    /// `max_consecutive` times in a row.
    async fn generate_with_restarts(
        &self,
        session_db_id: i64,
        request: &GenerationRequest,
        token: &CancellationToken,
    ) -> Result<GenerationResponse, ProviderError> {
        let mut slot = self.current_slot(session_db_id);
        loop {
            let provider = match (slot, &self.fallback) {
                (ProviderSlot::Fallback, Some(fallback)) => Arc::clone(fallback),
                _ => Arc::clone(&self.primary),
            };
            self.usage.calls.fetch_add(1, Ordering::Relaxed);

            let result = tokio::select! {
                biased;
                _ = token.cancelled() => Err(ProviderError::Cancelled),
                r = provider.generate(request) => r,
            };

            let error = match result {
                Ok(response) => {
                    self.usage.input_tokens.fetch_add(response.input_tokens, Ordering::Relaxed);
                    self.usage.output_tokens.fetch_add(response.output_tokens, Ordering::Relaxed);
                    if let Some(s) = self.sessions.lock().get_mut(&session_db_id) {
                        s.consecutive_restarts = 0;
                    }
                    return Ok(response);
                }
                Err(ProviderError::Cancelled) => return Err(ProviderError::Cancelled),
                Err(e) => e,
            };

            self.usage.failures.fetch_add(1, Ordering::Relaxed);
            if !error.is_transient() {
                tracing::warn!(
                    session_db_id,
                    provider = provider.name(),
                    error = %error,
                    "provider error is not retryable"
                );
                return Err(error);
            }

            let attempt = {
                let mut registry = self.sessions.lock();
                match registry.get_mut(&session_db_id) {
                    Some(s) => {
                        s.consecutive_restarts += 1;
                        s.consecutive_restarts
                    }
                    None => return Err(error),
                }
            };
            if attempt > self.policy.max_consecutive {
                tracing::error!(
                    session_db_id,
                    attempts = attempt - 1,
                    error = %error,
                    "consecutive restart limit reached"
                );
                if let Some(s) = self.sessions.lock().get_mut(&session_db_id) {
                    s.consecutive_restarts = 0;
                }
                return Err(error);
            }

            if self.fallback.is_some() && slot == ProviderSlot::Primary {
                slot = ProviderSlot::Fallback;
                self.usage.fallbacks.fetch_add(1, Ordering::Relaxed);
                if let Some(s) = self.sessions.lock().get_mut(&session_db_id) {
                    s.provider = ProviderSlot::Fallback;
                }
            }
            self.usage.restarts.fetch_add(1, Ordering::Relaxed);

            let delay = self.policy.delay(attempt);
            tracing::warn!(
                session_db_id,
                attempt,
                delay_ms = delay.as_millis() as u64,
                provider = ?slot,
                error = %error,
                "transient provider error, restarting"
            );
            tokio::select! {
                biased;
                _ = token.cancelled() => return Err(ProviderError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_then_caps() {
        let policy = RestartPolicy {
            max_consecutive: 3,
            initial: Duration::from_millis(1_000),
            max: Duration::from_millis(30_000),
        };
        assert_eq!(policy.delay(1), Duration::from_millis(1_000));
        assert_eq!(policy.delay(2), Duration::from_millis(2_000));
        assert_eq!(policy.delay(3), Duration::from_millis(4_000));
        assert_eq!(policy.delay(6), Duration::from_millis(30_000));
        assert_eq!(policy.delay(60), Duration::from_millis(30_000));
    }

    #[test]
    fn missing_prompt_number_takes_session_counter() {
        let mut payload = PendingPayload::Summarize(SummarizePayload::default());
        fill_prompt_number(&mut payload, 4);
        assert_eq!(payload.prompt_number(), 4);

        let mut payload = PendingPayload::Summarize(SummarizePayload {
            prompt_number: 2,
            ..Default::default()
        });
        fill_prompt_number(&mut payload, 4);
        assert_eq!(payload.prompt_number(), 2);
    }
}
