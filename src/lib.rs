//! Client SDK for the charging-station scheduling service.
//!
//! The crate is organized by transport surface:
//! - `channel`: reconnecting realtime websocket channel with typed topics.
//! - `auth_api`: HTTP client resolving the identity the channel connects as.
//! - `retry`: shared retry, reconnect and timeout policies.

/// Identity API client and response types.
pub mod auth_api;
/// Realtime channel client, protocol types, and session identity.
pub mod channel;
/// Retry and timeout helpers used across the SDK.
pub mod retry;
