//! Session orchestration.
//!
//! Covers the shared session state, the heartbeat, transport monitoring,
//! frame instrumentation, reconnection and the lifecycle controller that
//! ties them together.

pub mod controller;
pub mod frame_injector;
pub mod heartbeat;
pub mod reconnect;
pub mod session;
pub mod transport_monitor;
