//! # tracking_pipeline
//!
//! Batches sensor events persisted on a device and delivers them to an HTTP
//! ingestion endpoint under an adaptive control policy.
//!
//! ## Flow
//! - **Producer** persists events through `EventStore`.
//! - **Resolver** picks the current `ControlPolicy` (server push, forced,
//!   or a device-state preset) and publishes it on a watch channel and the bus.
//! - **Scheduler** ticks at the policy interval, claims pending events via the
//!   in-flight tracker and spawns one worker per batch.
//! - **Worker** builds the gzip JSON payload, sends it with bounded
//!   exponential backoff, and deletes what the server acknowledged or rejected.
//!
//! `runtime::Pipeline` owns one instance of each and exposes the lifecycle hooks.

pub mod config;
pub mod controls;
pub mod error;
pub mod host;
pub mod pipeline;
pub mod runtime;
pub mod utils;

pub use config::PipelineConfig;
pub use controls::policy::{ControlPolicy, PolicyOrigin};
pub use error::PipelineError;
pub use pipeline::event::{Event, EventKind, RelatedKind};
pub use runtime::{Pipeline, PipelineDeps};
