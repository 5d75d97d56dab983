//! Core types for the LAN lighting client
//!
//! This module contains the error type, configuration and the value objects (devices,
//! targets, commands) that the protocol and client layers exchange.

pub mod error;
pub mod serde;
pub mod types;

pub use self::error::{Error, Result};
pub use self::types::{Command, Config, Device, Expect, RetryPolicy, Target};

/// Default UDP port devices listen on
pub const DEFAULT_PORT: u16 = 56700;
