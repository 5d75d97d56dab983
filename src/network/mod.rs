//! Network management and reply correlation module
//!
//! The [`Router`] matches inbound datagrams to outstanding requests by source identifier
//! and hands outbound bytes to an injected sender. [`UdpTransport`] owns a real socket and
//! connects it to a router; anything else that can move bytes (a test harness, a relay) can
//! drive a router just as well.

mod router;
mod transport;

pub use self::router::{ReplyHandler, Router, SendFn};
pub use self::transport::UdpTransport;
