//! AstroView dataset job coordination
//!
//! Batched, idempotent dataset mutations guarded by persisted lock leases, a
//! durable at-least-once job queue on Postgres, and a watcher that reconciles
//! jobs running in the external processing pipeline.

pub mod app_state;
pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod routes;
pub mod services;
