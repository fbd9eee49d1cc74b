//! Realtime channel modules.
//!
//! - `client`: reconnect controller, outbound send path and public handle.
//! - `dispatch`: subscriber registry and per-tag event delivery.
//! - `proto`: frame type, reserved topics and known server events.
//! - `queue`: FIFO buffer for frames submitted while offline.
//! - `session`: client token, roles and connection target paths.
//! - `transport`: websocket session and connector seam.

/// Reconnecting channel client.
pub mod client;
/// Subscriber registry and dispatch.
pub mod dispatch;
/// Channel wire protocol.
pub mod proto;
/// Outbound frame buffer.
pub mod queue;
/// Session identity and connection targets.
pub mod session;
/// Socket transport sessions.
pub mod transport;
