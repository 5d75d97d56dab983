//! LAN lighting client
//!
//! This library discovers and controls smart lights that speak the LAN protocol over UDP.
//! Messages are a fixed 36-byte header followed by an opaque payload; replies are matched to
//! requests by the 32-bit source identifier chosen for every outbound message.
//!
//! - [`protocol`]: header layout, message types and the codec
//! - [`network`]: the [`Router`] correlating replies and the [`UdpTransport`] feeding it
//! - [`client`]: broadcast and unicast operations with deadlines and cancellation
pub mod client;
pub mod core;
pub mod network;
pub mod protocol;

// Re-export commonly used items
pub use crate::client::{BroadcastRequest, Canceller, Client, PendingReply};
pub use crate::core::{Command, Config, Device, Error, Expect, Result, RetryPolicy, Target};
pub use crate::network::{ReplyHandler, Router, UdpTransport};
pub use crate::protocol::{Header, Message, Reply};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
