//! # hammer-presence: Rich presence client for the local chat companion
//!
//! Publishes "what the user is doing" to a companion app running on the same
//! machine and receives join/spectate invitations back.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐  post / push   ┌─────────────┐  frames   ┌─────────────┐
//! │ DiscordRpc  │ ─────────────► │  IoWorker   │ ◄───────► │  Companion  │
//! │ (app thread)│ ◄───────────── │ (IO thread) │ Connection│  (local IPC)│
//! └─────────────┘  take / pop    └──────┬──────┘           └─────────────┘
//!        │                              │
//!        ▼                              ▼
//!  run_callbacks()               RpcConnection
//!  (user handlers)               (handshake, ping/pong, framing)
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: Frame header and opcodes
//! - [`serialization`]: JSON commands and tolerant readers
//! - [`connection`]: Transport trait and the framed connection state machine
//! - [`backoff`]: Reconnect delay
//! - [`queue`]: Thread hand-off primitives
//! - [`worker`]: IO thread
//! - [`client`]: Application-facing façade
//! - [`config`]: Tunables

pub mod backoff;
pub mod client;
pub mod config;
pub mod connection;
pub mod protocol;
pub mod queue;
pub mod serialization;
pub mod worker;

#[cfg(any(test, feature = "test-support"))]
pub mod fake;

// Re-exports for convenience
pub use client::{DiscordRpc, EventHandlers};
pub use config::RpcConfig;
pub use connection::{Connection, ConnectionState, ErrorCode, RpcConnection, RpcError};
pub use protocol::{FrameError, FrameHeader, Opcode, MAX_FRAME_SIZE, MAX_MESSAGE_SIZE};
pub use serialization::{Reply, RichPresence, User};
pub use worker::{ErrorReport, LinkEvents, SubscribedEvent};
