//! Client session layer
//!
//! A [`Client`] builds messages with the codec, correlates them through a [`Router`] and
//! hands back awaitable operations:
//!
//! - [`Client::broadcast`] returns a [`BroadcastRequest`] that collects replies from any
//!   number of devices until its window closes.
//! - [`Client::unicast`] returns a [`PendingReply`] that resolves with at most one reply or
//!   fails once the reply deadline passes.
//!
//! There is no implicit resend. [`Client::send_with_retry`] layers an explicit
//! [`RetryPolicy`] on top of [`Client::send`].
//!
//! # Examples
//!
//! ```no_run
//! use lifx_lan::{Client, Config};
//!
//! #[tokio::main]
//! async fn main() -> lifx_lan::Result<()> {
//!     let client = Client::connect(Config::default()).await?;
//!     for mut device in client.discover().await? {
//!         let label = client.label(&mut device).await?;
//!         println!("{} at {}: {}", device.target, device.socket_addr(), label);
//!     }
//!     Ok(())
//! }
//! ```

mod pending;
mod retry;

pub use self::pending::{BroadcastRequest, Canceller, PendingReply};

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::debug;

use crate::core::{Command, Config, Device, Error, Result, Target};
use crate::network::{Router, UdpTransport};
use crate::protocol::{
    decode_state_label, encode, message_type, FieldCursor, Header, Reply, SERVICE_UDP,
};

/// A session with the devices on one network
pub struct Client {
    router: Arc<Router>,
    config: Config,
    transport: Option<UdpTransport>,
}

impl Client {
    /// Binds a UDP transport per `config` and starts a session on it
    pub async fn connect(config: Config) -> Result<Self> {
        config.validate()?;
        let transport = UdpTransport::bind(config.bind_addr, config.initial_source).await?;
        Ok(Client {
            router: transport.router(),
            config,
            transport: Some(transport),
        })
    }

    /// Starts a session on an existing router
    pub fn new(router: Arc<Router>, config: Config) -> Self {
        Client {
            router,
            config,
            transport: None,
        }
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Local address of the owned transport, if any
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.transport.as_ref().map(UdpTransport::local_addr)
    }

    /// Sends `command` to every device and collects replies for the broadcast window
    pub fn broadcast(&self, command: &Command) -> Result<BroadcastRequest> {
        let source = self.router.next_source();
        let header = Header::new(source, Target::BROADCAST, command.message_type)
            .with_tagged(true)
            .with_flags(command.ack_required(), command.res_required());
        let bytes = encode(&header, &command.payload)?;

        let request = BroadcastRequest::new(self.router.clone(), source, self.config.broadcast_window);
        let destination = self.config.broadcast_endpoint();
        debug!(
            source,
            message_type = command.message_type,
            %destination,
            "broadcasting"
        );
        self.router.send(bytes, destination)?;
        Ok(request)
    }

    /// Sends `command` to one device
    ///
    /// Advances the device's sequence counter. Commands expecting nothing resolve as soon
    /// as they are handed to the transport.
    pub fn unicast(&self, command: &Command, device: &mut Device) -> Result<PendingReply> {
        let source = self.router.next_source();
        let sequence = device.next_sequence();
        let header = Header::new(source, device.target, command.message_type)
            .with_flags(command.ack_required(), command.res_required())
            .with_sequence(sequence);
        let bytes = encode(&header, &command.payload)?;
        let destination = device.socket_addr();

        debug!(
            source,
            sequence,
            message_type = command.message_type,
            %destination,
            "sending"
        );

        if !command.expects_reply() {
            self.router.send(bytes, destination)?;
            return Ok(PendingReply::resolved(source));
        }

        // Dropping `pending` on a failed send releases its handler.
        let pending = PendingReply::waiting(self.router.clone(), source, self.config.reply_timeout);
        self.router.send(bytes, destination)?;
        Ok(pending)
    }

    /// Sends `command` to one device and waits for the outcome
    pub async fn send(&self, command: &Command, device: &mut Device) -> Result<Option<Reply>> {
        self.unicast(command, device)?.await
    }

    /// Finds devices answering a service probe within the broadcast window
    ///
    /// Devices are returned in reply order, once per target.
    pub async fn discover(&self) -> Result<Vec<Device>> {
        let replies = self
            .broadcast(&Command::query(message_type::GET_SERVICE))?
            .await?;

        let mut seen = HashSet::new();
        let mut devices = Vec::new();
        for reply in replies {
            match device_from_service(&reply) {
                Ok(Some(device)) => {
                    if seen.insert(device.target) {
                        debug!(serial = %device.target, addr = %device.socket_addr(), "discovered device");
                        devices.push(device);
                    }
                }
                Ok(None) => {}
                Err(e) => debug!(peer = ?reply.peer, "ignoring service reply: {}", e),
            }
        }
        Ok(devices)
    }

    /// Reads a device's label
    pub async fn label(&self, device: &mut Device) -> Result<String> {
        let reply = self
            .send(&Command::query(message_type::GET_LABEL), device)
            .await?
            .ok_or_else(|| Error::decode("label query produced no reply"))?;

        if reply.message_type() != message_type::STATE_LABEL {
            return Err(Error::decode(format!(
                "expected label reply, got message type {}",
                reply.message_type()
            )));
        }
        decode_state_label(reply.payload(), &mut FieldCursor::new())
    }
}

/// Builds a device from a StateService reply; non-UDP services yield `None`
fn device_from_service(reply: &Reply) -> Result<Option<Device>> {
    if reply.message_type() != message_type::STATE_SERVICE {
        return Ok(None);
    }
    let Some(peer) = reply.peer else {
        return Err(Error::decode("service reply without a sender address"));
    };

    let payload = reply.payload();
    let mut cursor = FieldCursor::new();
    let service = cursor.read_u8(payload)?;
    let port = cursor.read_u32(payload)?;
    if service != SERVICE_UDP {
        return Ok(None);
    }
    let port = u16::try_from(port)
        .ok()
        .filter(|port| *port != 0)
        .ok_or_else(|| Error::decode(format!("service port {} is unusable", port)))?;

    Ok(Some(Device::new(reply.target(), SocketAddr::new(peer.ip(), port))))
}
