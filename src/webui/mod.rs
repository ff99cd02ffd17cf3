//! Synchronous-result backend family (A1111/WebUI-compatible REST servers).

pub mod client;

pub use client::{GenerationResults, ProgressCheck, WebUiClient};
