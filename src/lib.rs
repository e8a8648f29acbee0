//! # surge-rs
//!
//! Ingestion core for a bursty event source such as a chat bot.
//!
//! Events are fanned into per-kind bounded queues and handled by one worker
//! per kind ([`engine`]). Handlers share a [`context::Context`]: an atomic
//! JSON document [`store`] with a read cache, a TTL [`cache`] for memoized
//! results, a rayon-backed [`batch`] pool, and a memory [`reclaim`]er. A
//! periodic loop persists throughput stats and triggers reclamation.

pub mod batch;
pub mod cache;
pub mod config;
pub mod context;
pub mod egress;
pub mod engine;
pub mod error;
pub mod media;
pub mod model;
pub mod reclaim;
pub mod store;
pub mod telemetry;
