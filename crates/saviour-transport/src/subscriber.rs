//! Connect-side subscriber: a module's view of the command channel.
//!
//! Holds a live TCP connection to the controller's publisher and a
//! local subscription set. Filtering is entirely receiver-side, so
//! changing group membership re-points the set without any controller
//! coordination.

use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tracing::{debug, info};

use crate::frame::{Frame, MAX_FRAME_BYTES};
use crate::{close_no_linger, tune_stream, TransportError};

pub struct Subscriber {
    stream: TcpStream,
    addr: SocketAddr,
    topics: Arc<RwLock<BTreeSet<String>>>,
    /// Receive buffer; frames are parsed out of it so that a timed-out
    /// receive never loses a partially-read frame.
    buf: Vec<u8>,
}

impl Subscriber {
    pub async fn connect(
        addr: SocketAddr,
        topics: impl IntoIterator<Item = String>,
    ) -> Result<Self, TransportError> {
        let stream = TcpStream::connect(addr).await?;
        tune_stream(&stream);
        let topics: BTreeSet<String> = topics.into_iter().collect();
        info!(%addr, subscriptions = ?topics, "command subscriber connected");
        Ok(Self {
            stream,
            addr,
            topics: Arc::new(RwLock::new(topics)),
            buf: Vec::new(),
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// The current subscription set, for resubscription after reconnect.
    pub fn topics(&self) -> BTreeSet<String> {
        self.topics.read().unwrap().clone()
    }

    pub fn subscribe(&self, topic: impl Into<String>) {
        let topic = topic.into();
        debug!(topic = %topic, "subscribe");
        self.topics.write().unwrap().insert(topic);
    }

    pub fn unsubscribe(&self, topic: &str) {
        debug!(topic = %topic, "unsubscribe");
        self.topics.write().unwrap().remove(topic);
    }

    /// Swap one subscription for another in a single step; used when a
    /// module's group label changes.
    pub fn resubscribe(&self, old_topic: &str, new_topic: impl Into<String>) {
        let mut topics = self.topics.write().unwrap();
        topics.remove(old_topic);
        topics.insert(new_topic.into());
    }

    /// Receive the next frame matching the subscription set, waiting at
    /// most `timeout`. `Ok(None)` means the timeout elapsed; the caller
    /// checks its shutdown flag and calls again. A timeout mid-frame is
    /// harmless: partial bytes stay in the buffer.
    pub async fn recv_timeout(&mut self, timeout: Duration) -> Result<Option<Frame>, TransportError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(frame) = self.pop_buffered_frame()? {
                let matched = {
                    let topics = self.topics.read().unwrap();
                    frame.matches(topics.iter())
                };
                if matched {
                    return Ok(Some(frame));
                }
                // Not ours; keep draining until the deadline.
                continue;
            }

            let mut chunk = [0u8; 4096];
            // `read` is cancellation safe: an expired timeout consumes
            // nothing from the stream.
            match tokio::time::timeout_at(deadline, self.stream.read(&mut chunk)).await {
                Ok(Ok(0)) => return Err(TransportError::Closed),
                Ok(Ok(n)) => self.buf.extend_from_slice(&chunk[..n]),
                Ok(Err(e)) => return Err(e.into()),
                Err(_) => return Ok(None),
            }
        }
    }

    /// Take one complete frame out of the receive buffer, if present.
    fn pop_buffered_frame(&mut self) -> Result<Option<Frame>, TransportError> {
        if self.buf.len() < 4 {
            return Ok(None);
        }
        let len = u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]) as usize;
        if len > MAX_FRAME_BYTES {
            return Err(TransportError::Oversize(len));
        }
        if self.buf.len() < 4 + len {
            return Ok(None);
        }
        let body: Vec<u8> = self.buf.drain(..4 + len).skip(4).collect();
        let text = String::from_utf8(body)
            .map_err(|_| TransportError::Malformed("invalid UTF-8".to_string()))?;
        Frame::decode(&text).map(Some)
    }

    /// Tear down without lingering; used when the controller endpoint
    /// changes and the connection must be rebuilt immediately.
    pub fn close(self) {
        close_no_linger(&self.stream);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::publisher::Publisher;

    async fn pair(topics: &[&str]) -> (Publisher, Subscriber) {
        let publisher = Publisher::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let subscriber = Subscriber::connect(
            publisher.local_addr(),
            topics.iter().map(|t| t.to_string()),
        )
        .await
        .unwrap();
        while publisher.peer_count() < 1 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        (publisher, subscriber)
    }

    #[tokio::test]
    async fn test_receives_only_matching_topics() {
        let (publisher, mut subscriber) = pair(&["cmd/camera_dc67", "cmd/all"]).await;

        publisher.publish(Frame::new("cmd/other_module", "get_status"));
        publisher.publish(Frame::new("cmd/all", "get_status"));

        let frame = subscriber
            .recv_timeout(Duration::from_secs(2))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(frame.topic, "cmd/all");
    }

    #[tokio::test]
    async fn test_timeout_returns_none() {
        let (_publisher, mut subscriber) = pair(&["cmd/x"]).await;
        let got = subscriber
            .recv_timeout(Duration::from_millis(50))
            .await
            .unwrap();
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn test_unsubscribe_then_subscribe_restores_delivery() {
        let (publisher, mut subscriber) = pair(&["cmd/group_a"]).await;

        subscriber.unsubscribe("cmd/group_a");
        publisher.publish(Frame::new("cmd/group_a", "dropped"));
        assert!(subscriber
            .recv_timeout(Duration::from_millis(100))
            .await
            .unwrap()
            .is_none());

        subscriber.subscribe("cmd/group_a");
        publisher.publish(Frame::new("cmd/group_a", "delivered"));
        let frame = subscriber
            .recv_timeout(Duration::from_secs(2))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(frame.payload, "delivered");
    }

    #[tokio::test]
    async fn test_group_resubscribe_is_atomic() {
        let (publisher, mut subscriber) = pair(&["cmd/group_a", "cmd/self"]).await;
        subscriber.resubscribe("cmd/group_a", "cmd/group_b");

        publisher.publish(Frame::new("cmd/group_a", "old-group"));
        publisher.publish(Frame::new("cmd/group_b", "new-group"));

        let frame = subscriber
            .recv_timeout(Duration::from_secs(2))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(frame.payload, "new-group");
    }
}
