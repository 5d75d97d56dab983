use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::core::Result;
use crate::protocol::{Message, Reply};

/// Receives replies correlated to a source identifier
pub trait ReplyHandler: Send + Sync {
    /// Called once per matching inbound message
    fn handle(&self, reply: &Reply);

    /// Stream handlers stay registered after a delivery; one-shot handlers are removed by the
    /// router as their first reply is delivered.
    fn is_stream(&self) -> bool {
        true
    }

    /// Instant from which the handler no longer accepts replies. An expired handler is
    /// removed by the router instead of being invoked.
    fn deadline(&self) -> Option<Instant> {
        None
    }
}

/// Outbound transmission hook: fully encoded bytes and their destination
pub type SendFn = Box<dyn Fn(Bytes, SocketAddr) -> Result<()> + Send + Sync>;

/// Inner mutable state
struct Inner {
    /// Next candidate source identifier
    next_source: u32,
    /// Registered handlers, in registration order per source
    handlers: HashMap<u32, Vec<Arc<dyn ReplyHandler>>>,
}

impl Inner {
    fn allocate(&mut self) -> u32 {
        loop {
            let candidate = self.next_source;
            self.next_source = self.next_source.wrapping_add(1);
            if candidate != 0 && !self.handlers.contains_key(&candidate) {
                return candidate;
            }
        }
    }
}

/// Correlates inbound datagrams with outstanding requests
///
/// Each instance owns its own source counter and handler map, so independent sessions never
/// observe each other's traffic.
pub struct Router {
    inner: Mutex<Inner>,
    sender: SendFn,
}

impl Router {
    /// Creates a router whose source counter starts at a random non-zero value
    pub fn new<F>(sender: F) -> Self
    where
        F: Fn(Bytes, SocketAddr) -> Result<()> + Send + Sync + 'static,
    {
        Self::with_initial_source(rand::random(), sender)
    }

    /// Creates a router whose first allocated source is `start` (or 1 when `start` is 0)
    pub fn with_initial_source<F>(start: u32, sender: F) -> Self
    where
        F: Fn(Bytes, SocketAddr) -> Result<()> + Send + Sync + 'static,
    {
        Router {
            inner: Mutex::new(Inner {
                next_source: start,
                handlers: HashMap::new(),
            }),
            sender: Box::new(sender),
        }
    }

    /// Returns the next free source identifier; never 0, never one with live handlers
    pub fn next_source(&self) -> u32 {
        self.inner.lock().allocate()
    }

    /// Adds a handler for `source`
    pub fn register(&self, source: u32, handler: Arc<dyn ReplyHandler>) {
        self.inner
            .lock()
            .handlers
            .entry(source)
            .or_default()
            .push(handler);
    }

    /// Removes a handler; removing one that is not registered does nothing
    pub fn deregister(&self, source: u32, handler: &Arc<dyn ReplyHandler>) {
        let mut inner = self.inner.lock();
        if let Some(handlers) = inner.handlers.get_mut(&source) {
            handlers.retain(|h| !same_handler(h, handler));
            if handlers.is_empty() {
                inner.handlers.remove(&source);
            }
        }
    }

    /// Whether any handler is registered for `source`
    pub fn is_registered(&self, source: u32) -> bool {
        self.inner.lock().handlers.contains_key(&source)
    }

    /// Number of registered handlers across all sources
    pub fn handler_count(&self) -> usize {
        self.inner.lock().handlers.values().map(Vec::len).sum()
    }

    /// Hands encoded bytes to the injected sender
    pub fn send(&self, bytes: Bytes, destination: SocketAddr) -> Result<()> {
        (self.sender)(bytes, destination)
    }

    /// Dispatches an inbound datagram whose sender is unknown
    pub fn receive(&self, datagram: &[u8]) -> usize {
        self.dispatch(datagram, None)
    }

    /// Dispatches an inbound datagram received from `peer`
    pub fn receive_from(&self, datagram: &[u8], peer: SocketAddr) -> usize {
        self.dispatch(datagram, Some(peer))
    }

    /// Decodes the datagram and invokes every handler for its source in registration order.
    ///
    /// Malformed and unmatched datagrams are dropped, as are replies to handlers whose
    /// deadline has passed. Returns how many handlers ran.
    fn dispatch(&self, datagram: &[u8], peer: Option<SocketAddr>) -> usize {
        let message = match Message::decode(datagram) {
            Ok(message) => message,
            Err(e) => {
                trace!(?peer, len = datagram.len(), "dropping malformed datagram: {}", e);
                return 0;
            }
        };

        let source = message.header.source;
        let handlers = match self.inner.lock().handlers.get(&source) {
            Some(handlers) => handlers.clone(),
            None => {
                trace!(source, ?peer, "dropping datagram with no registered handler");
                return 0;
            }
        };

        debug!(
            source,
            message_type = message.header.message_type,
            ?peer,
            handlers = handlers.len(),
            "dispatching reply"
        );

        // Lock is released: handlers may call back into the router.
        let reply = Reply { message, peer };
        let mut delivered = 0;
        for handler in &handlers {
            if self.claim(source, handler) {
                handler.handle(&reply);
                delivered += 1;
            }
        }
        if delivered == 0 {
            trace!(source, ?peer, "dropping reply: no live handler");
        }
        delivered
    }

    /// Whether `handler` may take a reply now.
    ///
    /// A handler deregistered since the snapshot is skipped. Expired handlers are removed
    /// and skipped; one-shot handlers are removed before they run.
    fn claim(&self, source: u32, handler: &Arc<dyn ReplyHandler>) -> bool {
        let mut inner = self.inner.lock();
        let Some(handlers) = inner.handlers.get_mut(&source) else {
            return false;
        };
        let Some(index) = handlers.iter().position(|h| same_handler(h, handler)) else {
            return false;
        };

        let expired = handler
            .deadline()
            .is_some_and(|deadline| Instant::now() >= deadline);
        if expired || !handler.is_stream() {
            handlers.remove(index);
            if handlers.is_empty() {
                inner.handlers.remove(&source);
            }
        }
        !expired
    }
}

impl fmt::Debug for Router {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Router")
            .field("next_source", &inner.next_source)
            .field("sources", &inner.handlers.len())
            .finish()
    }
}

fn same_handler(a: &Arc<dyn ReplyHandler>, b: &Arc<dyn ReplyHandler>) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}
