//! In-flight requests
//!
//! Every request owns a [`Registration`]: the router entry for its handler. Whichever way a
//! request ends (reply, deadline, cancellation, or simply being dropped) the registration
//! is released exactly once, so the router never keeps handlers for finished requests.

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use std::future::IntoFuture;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::core::{Error, Result};
use crate::network::{ReplyHandler, Router};
use crate::protocol::Reply;

/// Resolves a single waiter with the first matching reply received before `deadline`
pub(crate) struct OneShot {
    tx: Mutex<Option<oneshot::Sender<Reply>>>,
    deadline: Instant,
}

impl OneShot {
    pub(crate) fn new(deadline: Instant) -> (Self, oneshot::Receiver<Reply>) {
        let (tx, rx) = oneshot::channel();
        (
            OneShot {
                tx: Mutex::new(Some(tx)),
                deadline,
            },
            rx,
        )
    }
}

impl ReplyHandler for OneShot {
    fn handle(&self, reply: &Reply) {
        if let Some(tx) = self.tx.lock().take() {
            let _ = tx.send(reply.clone());
        }
    }

    fn is_stream(&self) -> bool {
        false
    }

    fn deadline(&self) -> Option<Instant> {
        Some(self.deadline)
    }
}

/// Forwards every reply received before `deadline` to a broadcast collector
pub(crate) struct Collector {
    tx: mpsc::UnboundedSender<Reply>,
    deadline: Instant,
}

impl Collector {
    pub(crate) fn new(deadline: Instant) -> (Self, mpsc::UnboundedReceiver<Reply>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Collector { tx, deadline }, rx)
    }
}

impl ReplyHandler for Collector {
    fn handle(&self, reply: &Reply) {
        let _ = self.tx.send(reply.clone());
    }

    fn deadline(&self) -> Option<Instant> {
        Some(self.deadline)
    }
}

/// A handler registered with a router, released at most once
pub(crate) struct Registration {
    router: Arc<Router>,
    source: u32,
    handler: Arc<dyn ReplyHandler>,
    released: AtomicBool,
}

impl Registration {
    /// Registers `handler` under `source`
    pub(crate) fn new(router: Arc<Router>, source: u32, handler: Arc<dyn ReplyHandler>) -> Arc<Self> {
        router.register(source, handler.clone());
        Arc::new(Registration {
            router,
            source,
            handler,
            released: AtomicBool::new(false),
        })
    }

    pub(crate) fn release(&self) {
        if !self.released.swap(true, Ordering::AcqRel) {
            self.router.deregister(self.source, &self.handler);
        }
    }
}

/// Cancels an in-flight request from anywhere
///
/// The handler is deregistered before `cancel` returns, so a reply arriving afterwards is
/// dropped by the router as unmatched.
#[derive(Clone)]
pub struct Canceller {
    token: CancellationToken,
    registration: Option<Arc<Registration>>,
}

impl Canceller {
    pub fn cancel(&self) {
        if let Some(registration) = &self.registration {
            registration.release();
        }
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

struct Waiting {
    rx: oneshot::Receiver<Reply>,
    registration: Arc<Registration>,
}

/// Deferred result of a unicast command
///
/// Await it for the outcome: `Ok(Some(reply))` when the device answered, `Ok(None)` for a
/// fire-and-forget command, `Err(Timeout)` when the deadline passed first and
/// `Err(Cancelled)` after [`Canceller::cancel`].
#[must_use = "dropping a pending reply abandons the request"]
pub struct PendingReply {
    source: u32,
    timeout: Duration,
    deadline: Instant,
    token: CancellationToken,
    waiting: Option<Waiting>,
}

impl PendingReply {
    pub(crate) fn waiting(router: Arc<Router>, source: u32, timeout: Duration) -> Self {
        let deadline = Instant::now() + timeout;
        let (handler, rx) = OneShot::new(deadline);
        PendingReply {
            source,
            timeout,
            deadline,
            token: CancellationToken::new(),
            waiting: Some(Waiting {
                rx,
                registration: Registration::new(router, source, Arc::new(handler)),
            }),
        }
    }

    pub(crate) fn resolved(source: u32) -> Self {
        PendingReply {
            source,
            timeout: Duration::ZERO,
            deadline: Instant::now(),
            token: CancellationToken::new(),
            waiting: None,
        }
    }

    /// Source identifier the reply is correlated by
    pub fn source(&self) -> u32 {
        self.source
    }

    /// Handle for cancelling this request from another task
    pub fn canceller(&self) -> Canceller {
        Canceller {
            token: self.token.clone(),
            registration: self
                .waiting
                .as_ref()
                .map(|waiting| waiting.registration.clone()),
        }
    }

    /// Waits for the reply, the deadline or cancellation, whichever comes first
    pub async fn wait(mut self) -> Result<Option<Reply>> {
        let source = self.source;
        let Some(waiting) = self.waiting.as_mut() else {
            return if self.token.is_cancelled() {
                Err(Error::Cancelled(source))
            } else {
                Ok(None)
            };
        };

        let outcome = tokio::select! {
            biased;

            _ = self.token.cancelled() => Err(Error::Cancelled(source)),

            reply = &mut waiting.rx => reply
                .map(Some)
                .map_err(|_| Error::Cancelled(source)),

            _ = sleep_until(self.deadline) => Err(Error::timeout(source, self.timeout)),
        };
        waiting.registration.release();

        match &outcome {
            Err(Error::Timeout { .. }) => debug!(source, "unicast request timed out"),
            Err(Error::Cancelled(_)) => debug!(source, "unicast request cancelled"),
            _ => {}
        }
        outcome
    }
}

impl IntoFuture for PendingReply {
    type Output = Result<Option<Reply>>;
    type IntoFuture = BoxFuture<'static, Self::Output>;

    fn into_future(self) -> Self::IntoFuture {
        self.wait().boxed()
    }
}

impl Drop for PendingReply {
    fn drop(&mut self) {
        if let Some(waiting) = &self.waiting {
            waiting.registration.release();
        }
    }
}

/// Replies to a broadcast, collected until its window closes
///
/// The window closing is the normal end of a broadcast: awaiting yields every reply that
/// arrived, possibly none. Only cancellation is an error.
#[must_use = "dropping a broadcast request stops collecting replies"]
pub struct BroadcastRequest {
    source: u32,
    deadline: Instant,
    rx: mpsc::UnboundedReceiver<Reply>,
    token: CancellationToken,
    registration: Arc<Registration>,
}

impl BroadcastRequest {
    pub(crate) fn new(router: Arc<Router>, source: u32, window: Duration) -> Self {
        let deadline = Instant::now() + window;
        let (handler, rx) = Collector::new(deadline);
        BroadcastRequest {
            source,
            deadline,
            rx,
            token: CancellationToken::new(),
            registration: Registration::new(router, source, Arc::new(handler)),
        }
    }

    pub fn source(&self) -> u32 {
        self.source
    }

    /// Handle for cancelling this broadcast from another task
    pub fn canceller(&self) -> Canceller {
        Canceller {
            token: self.token.clone(),
            registration: Some(self.registration.clone()),
        }
    }

    /// Next reply, or `None` once the window has closed or the broadcast was cancelled
    pub async fn next(&mut self) -> Option<Reply> {
        let next = tokio::select! {
            biased;

            _ = self.token.cancelled() => None,
            reply = self.rx.recv() => reply,
            _ = sleep_until(self.deadline) => None,
        };
        if next.is_none() {
            self.registration.release();
        }
        next
    }

    /// Waits for the window to close and returns every reply received
    pub async fn collect(mut self) -> Result<Vec<Reply>> {
        let mut replies = Vec::new();
        while let Some(reply) = self.next().await {
            replies.push(reply);
        }

        if self.token.is_cancelled() {
            debug!(source = self.source, "broadcast cancelled");
            return Err(Error::Cancelled(self.source));
        }
        debug!(source = self.source, replies = replies.len(), "broadcast window closed");
        Ok(replies)
    }
}

impl IntoFuture for BroadcastRequest {
    type Output = Result<Vec<Reply>>;
    type IntoFuture = BoxFuture<'static, Self::Output>;

    fn into_future(self) -> Self::IntoFuture {
        self.collect().boxed()
    }
}

impl Drop for BroadcastRequest {
    fn drop(&mut self) {
        self.registration.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Target;
    use crate::protocol::{encode, Header};
    use tokio_test::{assert_err, assert_ok};

    fn router() -> Arc<Router> {
        Arc::new(Router::with_initial_source(1, |_, _| Ok(())))
    }

    fn reply(source: u32) -> bytes::Bytes {
        encode(&Header::new(source, Target([3; 6]), 45), &[]).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_reply_resolves_pending() {
        let router = router();
        let pending = PendingReply::waiting(router.clone(), 11, Duration::from_secs(1));

        assert_eq!(router.receive(&reply(11)), 1);
        let reply = assert_ok!(pending.await).unwrap();
        assert_eq!(reply.source(), 11);
        assert_eq!(router.handler_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_rejects_and_cleans_up() {
        let router = router();
        let pending = PendingReply::waiting(router.clone(), 12, Duration::from_millis(300));

        let err = assert_err!(pending.await);
        assert!(matches!(
            err,
            Error::Timeout { correlation: 12, after } if after == Duration::from_millis(300)
        ));
        assert!(!router.is_registered(12));
        assert_eq!(router.receive(&reply(12)), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_deregisters_before_returning() {
        let router = router();
        let pending = PendingReply::waiting(router.clone(), 13, Duration::from_secs(10));
        let canceller = pending.canceller();

        canceller.cancel();
        assert!(!router.is_registered(13));
        assert_eq!(router.receive(&reply(13)), 0);

        assert!(matches!(pending.await, Err(Error::Cancelled(13))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_from_another_task() {
        let router = router();
        let pending = PendingReply::waiting(router.clone(), 14, Duration::from_secs(10));
        let canceller = pending.canceller();

        let waiter = tokio::spawn(pending.wait());
        tokio::time::sleep(Duration::from_millis(50)).await;
        canceller.cancel();

        let outcome = waiter.await.unwrap();
        assert!(matches!(outcome, Err(Error::Cancelled(14))));
        assert_eq!(router.handler_count(), 0);
    }

    #[tokio::test]
    async fn test_drop_releases_registration() {
        let router = router();
        let pending = PendingReply::waiting(router.clone(), 15, Duration::from_secs(10));
        assert!(router.is_registered(15));

        drop(pending);
        assert!(!router.is_registered(15));
    }

    #[tokio::test]
    async fn test_resolved_pending_yields_none() {
        let pending = PendingReply::resolved(16);
        assert_eq!(pending.source(), 16);
        assert!(assert_ok!(pending.await).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_broadcast_with_no_replies_resolves_empty() {
        let router = router();
        let broadcast = BroadcastRequest::new(router.clone(), 20, Duration::from_secs(1));

        let replies = assert_ok!(broadcast.await);
        assert!(replies.is_empty());
        assert_eq!(router.handler_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_broadcast_collects_every_reply() {
        let router = router();
        let broadcast = BroadcastRequest::new(router.clone(), 21, Duration::from_secs(1));

        for _ in 0..3 {
            assert_eq!(router.receive(&reply(21)), 1);
        }
        assert_eq!(router.receive(&reply(22)), 0);

        let replies = assert_ok!(broadcast.await);
        assert_eq!(replies.len(), 3);
        assert!(!router.is_registered(21));
    }

    #[tokio::test(start_paused = true)]
    async fn test_broadcast_next_streams_until_window_closes() {
        let router = router();
        let mut broadcast = BroadcastRequest::new(router.clone(), 23, Duration::from_secs(1));

        router.receive(&reply(23));
        assert_eq!(broadcast.next().await.unwrap().source(), 23);
        assert!(broadcast.next().await.is_none());
        assert!(!router.is_registered(23));
    }

    #[tokio::test(start_paused = true)]
    async fn test_broadcast_cancel_is_an_error() {
        let router = router();
        let broadcast = BroadcastRequest::new(router.clone(), 24, Duration::from_secs(5));
        broadcast.canceller().cancel();

        assert!(matches!(broadcast.await, Err(Error::Cancelled(24))));
        assert_eq!(router.handler_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_until_deadline_then_timeout() {
        let router = router();
        let pending = PendingReply::waiting(router.clone(), 17, Duration::from_millis(100));
        let waiter = tokio::spawn(pending.wait());

        tokio::time::sleep(Duration::from_millis(99)).await;
        assert!(!waiter.is_finished());
        assert!(router.is_registered(17));

        tokio::time::sleep(Duration::from_millis(2)).await;
        assert!(waiter.is_finished());
        let err = assert_err!(waiter.await.unwrap());
        assert!(err.is_timeout());
        assert!(!router.is_registered(17));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reply_after_deadline_dropped_while_unpolled() {
        let router = router();
        let pending = PendingReply::waiting(router.clone(), 40, Duration::from_millis(100));

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(router.receive(&reply(40)), 0);
        assert!(!router.is_registered(40));

        let err = assert_err!(pending.await);
        assert!(matches!(err, Error::Timeout { correlation: 40, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_broadcast_open_until_window_closes() {
        let router = router();
        let broadcast = BroadcastRequest::new(router.clone(), 25, Duration::from_millis(100));
        let collector = tokio::spawn(broadcast.collect());

        tokio::time::sleep(Duration::from_millis(99)).await;
        assert!(!collector.is_finished());
        assert_eq!(router.receive(&reply(25)), 1);

        tokio::time::sleep(Duration::from_millis(2)).await;
        assert!(collector.is_finished());
        let replies = assert_ok!(collector.await.unwrap());
        assert_eq!(replies.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_broadcast_ignores_replies_after_window_while_unpolled() {
        let router = router();
        let broadcast = BroadcastRequest::new(router.clone(), 26, Duration::from_millis(100));

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(router.receive(&reply(26)), 0);

        let replies = assert_ok!(broadcast.await);
        assert!(replies.is_empty());
        assert_eq!(router.handler_count(), 0);
    }
}
