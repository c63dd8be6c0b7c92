//! # Modelmux Gateway
//!
//! The HTTP facade over the modelmux routing plane: an axum server exposing
//! the OpenAI-compatible completion surface, provider and cache
//! administration, health probes and metrics, with hot-reloadable
//! configuration. The routing, caching and resilience logic lives in the
//! `modelmux-sdk` crate; this crate translates HTTP to normalized requests
//! and back.

pub mod auth;
pub mod config;
pub mod gateway_error;
pub mod handlers;
pub mod metrics;
pub mod middleware;
pub mod server;
