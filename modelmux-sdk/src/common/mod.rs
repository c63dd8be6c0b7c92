//! Shared helpers used across the SDK and the gateway crate.

pub mod duration_serde;
