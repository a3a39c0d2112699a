//! Postgres-backed task store for the transcoding cluster orchestrator.
//!
//! This crate owns the `tasks` table and nothing else: the agent registry is
//! in-memory and lives in `transcast-core`, and checkpoints are agent-local
//! files owned by `transcast-agent`. See [`models::Task`] for the row shape
//! and [`queries::tasks`] for the state-machine-respecting operations.

pub mod config;
pub mod models;
pub mod pool;
pub mod queries;
