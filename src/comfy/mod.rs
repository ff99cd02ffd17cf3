//! Queue-and-poll backend family (ComfyUI-style node-graph servers).

pub mod client;
pub mod workflow;

pub use client::{ComfyClient, HistoryEntry, QueueEntry, QueueInfo};
pub use workflow::build_workflow;
