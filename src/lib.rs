//! # harvest-rs
//!
//! Ingestion pipeline for a rate-limited game API.
//!
//! Interval triggers discover entities that are due for a refresh and
//! enqueue work on a priority queue in Postgres. Fetch workers call the
//! API through a rate-limit-aware transport and publish results on a
//! pgmq-backed bus. Persistence workers upsert those results
//! idempotently.

pub mod bus;
pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod esi;
pub mod memory;
pub mod model;
pub mod queue;
pub mod services;
pub mod shutdown;
pub mod store;
pub mod telemetry;
pub mod transport;
