//! Rolling-window worker metrics, exposed as JSON and in the Prometheus text format.

use anyhow::Result;
use parking_lot::Mutex;
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts,
    Registry, TextEncoder,
};
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use sysinfo::System;

use crate::db::manager::DatabaseManager;
use crate::memory::stats::{store_stats, StoreStats};
use crate::session::{ProviderUsage, SessionManager, WorkerEvent};

const WINDOWS: [(&str, Duration); 3] = [
    ("1m", Duration::from_secs(60)),
    ("5m", Duration::from_secs(300)),
    ("15m", Duration::from_secs(900)),
];
const RETAIN: Duration = Duration::from_secs(900);
/// Upper bound on samples kept per series.
const MAX_SAMPLES: usize = 50_000;

#[derive(Default)]
struct Rolling {
    requests: VecDeque<(Instant, f64)>,
    errors: VecDeque<Instant>,
    observations: VecDeque<(Instant, u64)>,
}

impl Rolling {
    fn trim(&mut self, now: Instant) {
        let keep = |t: &Instant| now.duration_since(*t) <= RETAIN;
        while self.requests.front().is_some_and(|(t, _)| !keep(t))
            || self.requests.len() > MAX_SAMPLES
        {
            self.requests.pop_front();
        }
        while self.errors.front().is_some_and(|t| !keep(t)) || self.errors.len() > MAX_SAMPLES {
            self.errors.pop_front();
        }
        while self.observations.front().is_some_and(|(t, _)| !keep(t))
            || self.observations.len() > MAX_SAMPLES
        {
            self.observations.pop_front();
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct WindowRates {
    pub requests: u64,
    pub errors: u64,
    pub observations: u64,
    pub requests_per_min: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct LatencyStats {
    pub samples: usize,
    pub avg_ms: f64,
    pub p95_ms: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MemoryStats {
    pub process_rss_bytes: u64,
    pub system_total_bytes: u64,
    pub system_used_bytes: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProcessingStats {
    pub is_processing: bool,
    pub queue_depth: usize,
    pub active_generations: usize,
    pub active_sessions: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub uptime_secs: u64,
    pub memory: MemoryStats,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database: Option<StoreStats>,
    pub processing: ProcessingStats,
    pub requests_total: u64,
    pub errors_total: u64,
    pub latency: LatencyStats,
    pub provider: ProviderUsage,
    pub windows: BTreeMap<&'static str, WindowRates>,
}

pub struct MetricsService {
    started: Instant,
    sessions: SessionManager,
    store: DatabaseManager,
    rolling: Mutex<Rolling>,
    system: Mutex<System>,
    registry: Registry,
    requests_total: IntCounter,
    errors_total: IntCounter,
    request_latency: Histogram,
    observations_stored: IntCounter,
    uptime: IntGauge,
    memory_bytes: IntGauge,
    processing: IntGaugeVec,
    database_rows: IntGaugeVec,
    provider: IntGaugeVec,
}

impl MetricsService {
    pub fn new(sessions: SessionManager, store: DatabaseManager) -> Result<Self> {
        let registry = Registry::new_custom(Some("hindsight".into()), None)?;

        let requests_total = IntCounter::new("http_requests_total", "HTTP requests served")?;
        let errors_total =
            IntCounter::new("http_errors_total", "HTTP responses with status >= 400")?;
        let request_latency = Histogram::with_opts(HistogramOpts::new(
            "http_request_duration_seconds",
            "HTTP request latency",
        ))?;
        let observations_stored =
            IntCounter::new("observations_stored_total", "Observations persisted")?;
        let uptime = IntGauge::new("uptime_seconds", "Seconds since worker start")?;
        let memory_bytes =
            IntGauge::new("process_resident_memory_bytes", "Worker resident memory")?;
        let processing =
            IntGaugeVec::new(Opts::new("processing", "Session processing state"), &["kind"])?;
        let database_rows =
            IntGaugeVec::new(Opts::new("database_rows", "Rows per store table"), &["table"])?;
        let provider = IntGaugeVec::new(
            Opts::new("provider_usage", "Generation provider usage"),
            &["kind"],
        )?;

        registry.register(Box::new(requests_total.clone()))?;
        registry.register(Box::new(errors_total.clone()))?;
        registry.register(Box::new(request_latency.clone()))?;
        registry.register(Box::new(observations_stored.clone()))?;
        registry.register(Box::new(uptime.clone()))?;
        registry.register(Box::new(memory_bytes.clone()))?;
        registry.register(Box::new(processing.clone()))?;
        registry.register(Box::new(database_rows.clone()))?;
        registry.register(Box::new(provider.clone()))?;

        Ok(Self {
            started: Instant::now(),
            sessions,
            store,
            rolling: Mutex::new(Rolling::default()),
            system: Mutex::new(System::new()),
            registry,
            requests_total,
            errors_total,
            request_latency,
            observations_stored,
            uptime,
            memory_bytes,
            processing,
            database_rows,
            provider,
        })
    }

    pub fn record_request(&self, latency: Duration, is_error: bool) {
        let now = Instant::now();
        let ms = latency.as_secs_f64() * 1000.0;
        self.requests_total.inc();
        self.request_latency.observe(latency.as_secs_f64());
        if is_error {
            self.errors_total.inc();
        }
        let mut rolling = self.rolling.lock();
        rolling.requests.push_back((now, ms));
        if is_error {
            rolling.errors.push_back(now);
        }
        rolling.trim(now);
    }

    pub fn record_observations(&self, count: u64) {
        if count == 0 {
            return;
        }
        self.observations_stored.inc_by(count);
        let now = Instant::now();
        let mut rolling = self.rolling.lock();
        rolling.observations.push_back((now, count));
        rolling.trim(now);
    }

    /// Count stored observations from the session event stream until it closes.
    pub fn spawn_event_listener(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let mut events = self.sessions.subscribe();
        let service = Arc::clone(self);
        tokio::spawn(async move {
            use tokio::sync::broadcast::error::RecvError;
            loop {
                match events.recv().await {
                    Ok(WorkerEvent::NewObservation { .. }) => service.record_observations(1),
                    Ok(_) => {}
                    Err(RecvError::Lagged(missed)) => {
                        tracing::debug!(missed, "metrics listener lagged");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }

    fn windows(&self) -> (BTreeMap<&'static str, WindowRates>, LatencyStats) {
        let now = Instant::now();
        let mut rolling = self.rolling.lock();
        rolling.trim(now);

        let mut out = BTreeMap::new();
        for (name, span) in WINDOWS {
            let within = |t: &Instant| now.duration_since(*t) <= span;
            let requests = rolling.requests.iter().filter(|(t, _)| within(t)).count() as u64;
            let errors = rolling.errors.iter().filter(|t| within(t)).count() as u64;
            let observations = rolling
                .observations
                .iter()
                .filter(|(t, _)| within(t))
                .map(|(_, n)| n)
                .sum();
            out.insert(
                name,
                WindowRates {
                    requests,
                    errors,
                    observations,
                    requests_per_min: requests as f64 / (span.as_secs_f64() / 60.0),
                },
            );
        }

        let mut latencies: Vec<f64> = rolling.requests.iter().map(|(_, ms)| *ms).collect();
        (out, latency_stats(&mut latencies))
    }

    fn memory(&self) -> MemoryStats {
        let mut sys = self.system.lock();
        sys.refresh_memory();
        let process_rss_bytes = match sysinfo::get_current_pid() {
            Ok(pid) if sys.refresh_process(pid) => {
                sys.process(pid).map(|p| p.memory()).unwrap_or(0)
            }
            _ => 0,
        };
        MemoryStats {
            process_rss_bytes,
            system_total_bytes: sys.total_memory(),
            system_used_bytes: sys.used_memory(),
        }
    }

    pub async fn snapshot(&self) -> MetricsSnapshot {
        let path = self.store.db().path().map(|p| p.to_path_buf());
        let database = match self
            .store
            .db()
            .call(move |conn| store_stats(conn, path.as_deref()))
            .await
        {
            Ok(stats) => Some(stats),
            Err(e) => {
                tracing::debug!(error = %e, "database stats unavailable");
                None
            }
        };
        let (windows, latency) = self.windows();

        MetricsSnapshot {
            uptime_secs: self.started.elapsed().as_secs(),
            memory: self.memory(),
            database,
            processing: ProcessingStats {
                is_processing: self.sessions.is_any_session_processing(),
                queue_depth: self.sessions.queue_depth(),
                active_generations: self.sessions.active_generations(),
                active_sessions: self.sessions.active_sessions(),
            },
            requests_total: self.requests_total.get(),
            errors_total: self.errors_total.get(),
            latency,
            provider: self.sessions.provider_usage(),
            windows,
        }
    }

    /// Refresh gauges from a fresh snapshot and render the text exposition format.
    pub async fn render_prometheus(&self) -> Result<String> {
        let snap = self.snapshot().await;

        self.uptime.set(snap.uptime_secs as i64);
        self.memory_bytes.set(snap.memory.process_rss_bytes as i64);
        self.processing.with_label_values(&["queue_depth"]).set(snap.processing.queue_depth as i64);
        self.processing
            .with_label_values(&["active_generations"])
            .set(snap.processing.active_generations as i64);
        self.processing
            .with_label_values(&["active_sessions"])
            .set(snap.processing.active_sessions as i64);
        if let Some(db) = &snap.database {
            for (table, n) in [
                ("sessions", db.sessions),
                ("observations", db.observations),
                ("summaries", db.summaries),
                ("prompts", db.prompts),
                ("vector_documents", db.vector_documents),
            ] {
                self.database_rows.with_label_values(&[table]).set(n as i64);
            }
        }
        for (kind, n) in [
            ("calls", snap.provider.calls),
            ("failures", snap.provider.failures),
            ("restarts", snap.provider.restarts),
            ("fallbacks", snap.provider.fallbacks),
            ("input_tokens", snap.provider.input_tokens),
            ("output_tokens", snap.provider.output_tokens),
        ] {
            self.provider.with_label_values(&[kind]).set(n as i64);
        }

        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}

fn latency_stats(samples: &mut [f64]) -> LatencyStats {
    if samples.is_empty() {
        return LatencyStats {
            samples: 0,
            avg_ms: 0.0,
            p95_ms: 0.0,
        };
    }
    samples.sort_by(|a, b| a.total_cmp(b));
    let avg_ms = samples.iter().sum::<f64>() / samples.len() as f64;
    let rank = ((samples.len() as f64) * 0.95).ceil() as usize;
    let p95_ms = samples[rank.clamp(1, samples.len()) - 1];
    LatencyStats {
        samples: samples.len(),
        avg_ms,
        p95_ms,
    }
}
