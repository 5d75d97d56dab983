use bytes::Bytes;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::error::{Error, Result};

/// 48-bit device address carried in every header
///
/// The all-zero target addresses every device on the network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Target(pub [u8; 6]);

impl Target {
    /// The "any device" address used for discovery
    pub const BROADCAST: Target = Target([0; 6]);

    /// Builds a target from raw bytes
    ///
    /// Shorter input is zero-padded on the right; anything longer than six bytes cannot be a
    /// device address.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        if bytes.len() > 6 {
            return Err(Error::invalid_target(format!(
                "expected at most 6 bytes, got {}",
                bytes.len()
            )));
        }
        let mut target = [0u8; 6];
        target[..bytes.len()].copy_from_slice(bytes);
        Ok(Target(target))
    }

    /// Returns whether this is the broadcast address
    pub fn is_broadcast(&self) -> bool {
        self.0 == [0; 6]
    }

    /// Raw address bytes
    pub fn as_bytes(&self) -> &[u8; 6] {
        &self.0
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl FromStr for Target {
    type Err = Error;

    /// Parses a device serial such as `d073d5001122` or `d0:73:d5:00:11:22`
    fn from_str(s: &str) -> Result<Self> {
        let digits: String = s.chars().filter(|c| *c != ':').collect();
        if digits.len() != 12 {
            return Err(Error::invalid_target(format!(
                "serial {:?} must have 12 hex digits",
                s
            )));
        }

        let mut target = [0u8; 6];
        for (idx, slot) in target.iter_mut().enumerate() {
            let pair = digits
                .get(idx * 2..idx * 2 + 2)
                .ok_or_else(|| Error::invalid_target(format!("serial {:?} is not ASCII", s)))?;
            *slot = u8::from_str_radix(pair, 16)
                .map_err(|e| Error::invalid_target(format!("serial {:?}: {}", s, e)))?;
        }
        Ok(Target(target))
    }
}

/// A device reachable on the LAN
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    /// Device IP address
    pub address: IpAddr,
    /// Device UDP port
    pub port: u16,
    /// Device hardware address
    pub target: Target,
    /// Last sequence number used for this device
    pub sequence: u8,
}

impl Device {
    /// Creates a device record with a fresh sequence counter
    pub fn new(target: Target, addr: SocketAddr) -> Self {
        Device {
            address: addr.ip(),
            port: addr.port(),
            target,
            sequence: 0,
        }
    }

    /// The endpoint commands for this device are sent to
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }

    /// Advances the per-device sequence counter, wrapping after 255
    pub fn next_sequence(&mut self) -> u8 {
        self.sequence = self.sequence.wrapping_add(1);
        self.sequence
    }
}

/// What a command asks the device to send back
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Expect {
    /// Fire-and-forget: nothing is awaited
    Nothing,
    /// A bare acknowledgement (`ack_required`)
    Ack,
    /// A state message (`res_required`)
    Response,
}

/// An outbound command: message type plus an already-encoded payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    /// Message type code
    pub message_type: u16,
    /// Encoded payload
    pub payload: Bytes,
    /// Reply the device is asked for
    pub expect: Expect,
}

impl Command {
    /// Creates a command
    pub fn new(message_type: u16, payload: impl Into<Bytes>, expect: Expect) -> Self {
        Command {
            message_type,
            payload: payload.into(),
            expect,
        }
    }

    /// A command with no payload that asks for a state response
    pub fn query(message_type: u16) -> Self {
        Command::new(message_type, Bytes::new(), Expect::Response)
    }

    /// Whether any reply is awaited
    pub fn expects_reply(&self) -> bool {
        self.expect != Expect::Nothing
    }

    /// Value of the header `ack_required` bit
    pub fn ack_required(&self) -> bool {
        self.expect == Expect::Ack
    }

    /// Value of the header `res_required` bit
    pub fn res_required(&self) -> bool {
        self.expect == Expect::Response
    }
}

/// Resend policy for unicast commands that time out
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first one
    pub attempts: u32,
    /// Pause between a timeout and the next attempt
    #[serde(serialize_with = "super::serde::serialize_duration")]
    #[serde(deserialize_with = "super::serde::deserialize_duration")]
    pub backoff: Duration,
}

impl RetryPolicy {
    /// A single attempt, no resend
    pub fn none() -> Self {
        RetryPolicy {
            attempts: 1,
            backoff: Duration::ZERO,
        }
    }

    /// Resend up to `attempts` times in total
    pub fn new(attempts: u32, backoff: Duration) -> Self {
        RetryPolicy {
            attempts: attempts.max(1),
            backoff,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::none()
    }
}

/// Configuration for a client session
///
/// Fields missing from a serialized config take their [`Default`] values.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Local address to bind to
    pub bind_addr: SocketAddr,
    /// Address discovery broadcasts are sent to
    pub broadcast_addr: IpAddr,
    /// Device service port
    pub port: u16,
    /// Deadline for unicast replies
    #[serde(serialize_with = "super::serde::serialize_duration")]
    #[serde(deserialize_with = "super::serde::deserialize_duration")]
    pub reply_timeout: Duration,
    /// How long a broadcast collects replies
    #[serde(serialize_with = "super::serde::serialize_duration")]
    #[serde(deserialize_with = "super::serde::deserialize_duration")]
    pub broadcast_window: Duration,
    /// First source identifier handed out; random when unset
    pub initial_source: Option<u32>,
    /// Resend policy used by `Client::send_with_retry`
    pub retry: RetryPolicy,
}

impl Config {
    /// Checks the configuration for values that can never work
    pub fn validate(&self) -> Result<()> {
        if self.port == 0 {
            return Err(Error::config("device port must be non-zero"));
        }
        if self.reply_timeout.is_zero() {
            return Err(Error::config("reply_timeout must be non-zero"));
        }
        if self.broadcast_window.is_zero() {
            return Err(Error::config("broadcast_window must be non-zero"));
        }
        if self.retry.attempts == 0 {
            return Err(Error::config("retry policy needs at least one attempt"));
        }
        Ok(())
    }

    /// Destination of discovery broadcasts
    pub fn broadcast_endpoint(&self) -> SocketAddr {
        SocketAddr::new(self.broadcast_addr, self.port)
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            bind_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
            broadcast_addr: IpAddr::V4(Ipv4Addr::BROADCAST),
            port: super::DEFAULT_PORT,
            reply_timeout: Duration::from_secs(5),
            broadcast_window: Duration::from_secs(2),
            initial_source: None,
            retry: RetryPolicy::none(),
        }
    }
}
