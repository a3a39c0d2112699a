//! Shared coordination-plane logic for the transcoding cluster.
//!
//! This crate holds everything that is neither Postgres-specific
//! (`transcast-db`) nor tied to one side of the wire (orchestrator vs.
//! agent binaries): the message codec, the in-memory agent registry, the
//! scheduling policy, the agent-local checkpoint format, the storage-path
//! resolver, and the transcoder harness that wraps `ffmpeg`/`ffprobe`.

pub mod backoff;
pub mod checkpoint;
pub mod message;
pub mod registry;
pub mod scheduler;
pub mod state;
pub mod storage;
pub mod transcoder;
