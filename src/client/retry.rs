use tracing::debug;

use super::Client;
use crate::core::{Command, Device, Result, RetryPolicy};
use crate::protocol::Reply;

impl Client {
    /// [`Client::send`] with the session's configured [`RetryPolicy`]
    pub async fn send_with_retry(
        &self,
        command: &Command,
        device: &mut Device,
    ) -> Result<Option<Reply>> {
        let policy = self.config().retry;
        self.send_with_policy(command, device, policy).await
    }

    /// Re-issues `command` after each timeout until `policy.attempts` is used up
    ///
    /// Every attempt is a new request with its own source and sequence number. Errors other
    /// than a timeout are returned immediately.
    pub async fn send_with_policy(
        &self,
        command: &Command,
        device: &mut Device,
        policy: RetryPolicy,
    ) -> Result<Option<Reply>> {
        let attempts = policy.attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.send(command, device).await {
                Err(e) if e.is_timeout() && attempt < attempts => {
                    debug!(
                        attempt,
                        attempts,
                        message_type = command.message_type,
                        "no reply, resending"
                    );
                    attempt += 1;
                    if !policy.backoff.is_zero() {
                        tokio::time::sleep(policy.backoff).await;
                    }
                }
                outcome => return outcome,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Config, Error, Expect};
    use crate::network::Router;
    use crate::protocol::{decode_header, Header, Message};
    use bytes::Bytes;
    use parking_lot::Mutex;
    use std::net::SocketAddr;
    use std::sync::Arc;
    use std::time::Duration;

    type Outbox = Arc<Mutex<Vec<(Bytes, SocketAddr)>>>;

    fn client(retry: RetryPolicy) -> (Client, Outbox) {
        let outbox: Outbox = Arc::default();
        let log = outbox.clone();
        let router = Arc::new(Router::with_initial_source(1, move |bytes, dest| {
            log.lock().push((bytes, dest));
            Ok(())
        }));
        let config = Config {
            reply_timeout: Duration::from_millis(200),
            retry,
            ..Default::default()
        };
        (Client::new(router, config), outbox)
    }

    fn device() -> Device {
        Device::new(
            "d073d5000001".parse().unwrap(),
            "10.0.0.7:56700".parse().unwrap(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_attempt_by_default() {
        let (client, outbox) = client(RetryPolicy::default());
        let mut device = device();

        let result = client.send_with_retry(&Command::query(23), &mut device).await;
        assert!(matches!(result, Err(Error::Timeout { .. })));
        assert_eq!(outbox.lock().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_each_attempt_is_a_new_request() {
        let (client, outbox) = client(RetryPolicy::new(3, Duration::from_millis(50)));
        let mut device = device();

        let result = client
            .send_with_retry(&Command::new(21, vec![1, 0], Expect::Ack), &mut device)
            .await;
        assert!(result.unwrap_err().is_timeout());

        let headers: Vec<_> = outbox
            .lock()
            .iter()
            .map(|(bytes, _)| decode_header(bytes).unwrap())
            .collect();
        assert_eq!(headers.len(), 3);
        assert_eq!(
            headers.iter().map(|h| h.sequence).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
        assert_ne!(headers[0].source, headers[1].source);
        assert_ne!(headers[1].source, headers[2].source);
        assert_eq!(client.router().handler_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reply_on_second_attempt() {
        let (client, outbox) = client(RetryPolicy::new(3, Duration::ZERO));
        let router = client.router().clone();
        let mut device = device();

        let watcher = outbox.clone();
        let responder = tokio::spawn(async move {
            // let the first attempt time out, then answer the second
            loop {
                tokio::time::sleep(Duration::from_millis(10)).await;
                let request = watcher.lock().get(1).map(|(bytes, _)| bytes.clone());
                if let Some(request) = request {
                    let header = decode_header(&request).unwrap();
                    let reply = Message::new(Header::new(header.source, header.target, 25), vec![0u8; 32]);
                    router.receive(&reply.encode().unwrap());
                    break;
                }
            }
        });

        let reply = client
            .send_with_retry(&Command::query(23), &mut device)
            .await
            .unwrap()
            .unwrap();
        responder.await.unwrap();
        assert_eq!(reply.message_type(), 25);
        assert_eq!(outbox.lock().len(), 2);
    }
}
