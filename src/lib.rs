//! Local memory worker for coding assistants.
//!
//! hindsight runs as a background daemon next to a coding assistant. Hook scripts post each
//! tool use to it; the worker batches them per session, asks a generation provider to
//! compress them into structured observations and session summaries, and stores the result
//! in SQLite for later search and context injection.
//!
//! # Architecture
//!
//! - **Storage**: one SQLite file holding sessions, observations, summaries, prompts and a
//!   durable pending queue ([`memory`], [`db`])
//! - **Vectors**: optional [sqlite-vec](https://github.com/asg017/sqlite-vec) index over the
//!   same file, fed by local ONNX or external-process embeddings ([`vector`], [`embedding`])
//! - **Sessions**: per-session FIFO queues with one in-flight generation each, bounded restart
//!   and provider fallback ([`session`])
//! - **Search**: relational filters, vector ranking, or both ([`search`])
//! - **Surface**: HTTP API with auth and rate limiting ([`api`]), MCP over stdio ([`tools`])
//! - **Lifecycle**: readiness states, pid marker, ordered shutdown and an outer supervisor
//!   process ([`lifecycle`])

pub mod api;
pub mod cli;
pub mod config;
pub mod db;
pub mod embedding;
pub mod error;
pub mod lifecycle;
pub mod memory;
pub mod metrics;
pub mod search;
pub mod server;
pub mod session;
pub mod tools;
pub mod vector;

/// Version reported by `/api/version` and compared by `hindsight start`.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
