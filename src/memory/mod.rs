//! Authoritative relational store: sessions, observations, summaries, prompts and the
//! durable pending queue.

pub mod context;
pub mod privacy;
pub mod query;
pub mod queue;
pub mod retention;
pub mod sessions;
pub mod stats;
pub mod store;
pub mod types;
