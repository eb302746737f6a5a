//! interceptor-relay: the fault-injecting TCP relay engine.
//!
//! A [`Bridge`] listens on one address, accepts one client at a time,
//! connects to its target, and pumps bytes in both directions through a
//! per-direction [`Plan`].
//!
//! # Architecture
//!
//! ```text
//! Bridge (listen socket, phase counter)
//!   ├── accept loop: accept → connect target (retry) → commit phase
//!   ├── ForwardingWorker client→target  ── Plan A ──▶ target socket
//!   ├── ForwardingWorker target→client  ── Plan B ──▶ client socket
//!   └── teardown (once per phase) → accept loop again
//!
//! Plan::ConstantDelay / Plan::RandomDelay
//!   └── DelayQueue + background sender loop (one per plan, outlives phases)
//! ```
//!
//! Every connection-lifecycle failure (EOF, reset, send failure, a plan
//! asking to sever) ends in exactly one teardown of the current phase
//! followed by a fresh accept on the same listen socket.

pub mod bridge;
pub mod error;
pub mod plan;
pub mod socket;
pub mod worker;

pub use bridge::{Bridge, BridgeSettings, BridgeStats};
pub use error::{BridgeError, BridgeResult};
pub use plan::{DelayQueue, DelaySchedule, Plan};
pub use socket::PeerSocket;
pub use worker::{ConnectionOwner, Direction};
