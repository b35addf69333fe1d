//! # parley-relay
//!
//! Core of the Parley group chat relay: admission, the connection registry,
//! broadcast and the per-connection lifecycle.
//!
//! This crate knows nothing about HTTP, WebSockets or token formats. The
//! hosting server supplies an [`IdentityVerifier`], feeds each upgraded
//! transport's inbound frames into [`Relay::run_session`] and writes whatever
//! the connection's [`OutboundReceiver`] yields back to the socket.
//!
//! ## Architecture
//!
//! ```text
//!   upgrade request --> Relay::admit --> IdentityVerifier
//!                          |
//!                          v
//!   inbound frames --> Relay::run_session --> Broadcaster --> ConnectionRegistry::snapshot
//!                          |                       |
//!                          +--> register/unregister +--> Connection::try_deliver (per recipient)
//! ```
//!
//! One task per connection runs its receive loop. The registry's mutex is the
//! only shared lock and is never held during I/O.

pub mod broadcast;
pub mod connection;
pub mod lifecycle;
pub mod registry;
pub mod verifier;

mod error;
mod types;

pub use broadcast::{BroadcastReport, Broadcaster};
pub use connection::{Connection, OutboundReceiver};
pub use error::{AdmissionError, AuthFailure, DeliveryError, ReceiveError};
pub use lifecycle::{Relay, RelayConfig, SessionEnd, SessionState, SessionSummary};
pub use registry::ConnectionRegistry;
pub use types::*;
pub use verifier::{IdentityVerifier, StaticVerifier};
