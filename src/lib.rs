//! Cloud relay: a WebSocket connection/session/signaling engine brokering
//! robot-device and mobile-app traffic (spec.md §1).
//!
//! [`manager`] owns the shared connection/session/rate-limit state,
//! [`router`] is the actix-web/actix-web-actors front door that drives it,
//! and [`auth`]/[`store`]/[`turn`] are the narrow collaborators both lean
//! on.

pub mod auth;
pub mod config;
pub mod error;
pub mod ids;
pub mod logging;
pub mod manager;
pub mod protocol;
pub mod router;
pub mod store;
pub mod turn;
