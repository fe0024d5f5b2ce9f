//! Shared domain types for the sitescope audit client.
//!
//! Everything in this crate is synchronous and side-effect free: the
//! stage pipeline, the progress reducer that folds audit events into
//! per-stage state, and the deterministic schedule used when no live
//! event channel is available.

pub mod job_events;
pub mod progress;
pub mod simulation;
pub mod stages;
pub mod types;
