//! Connect-side publisher: a module's status channel. Other tasks
//! enqueue outbound frames without blocking; one writer task owns the
//! socket.

use std::net::SocketAddr;

use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

use crate::frame::{write_frame, Frame};
use crate::{tune_stream, TransportError};

const OUTBOUND_QUEUE: usize = 256;

/// Cloneable sending half handed to the heartbeat, recording and
/// command tasks.
#[derive(Clone)]
pub struct PushHandle {
    tx: mpsc::Sender<Frame>,
}

impl PushHandle {
    /// Non-blocking enqueue. A full queue or a dead writer drops the
    /// frame; delivery is at-most-once and callers never stall on the
    /// network.
    pub fn send(&self, frame: Frame) -> bool {
        match self.tx.try_send(frame) {
            Ok(()) => true,
            Err(e) => {
                debug!(error = %e, "outbound status frame dropped");
                false
            }
        }
    }
}

pub struct Pusher {
    handle: PushHandle,
    /// Flips to true when the writer task exits (connection lost).
    closed_rx: watch::Receiver<bool>,
    addr: SocketAddr,
}

impl Pusher {
    pub async fn connect(addr: SocketAddr) -> Result<Self, TransportError> {
        let stream = TcpStream::connect(addr).await?;
        tune_stream(&stream);
        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE);
        let (closed_tx, closed_rx) = watch::channel(false);
        tokio::spawn(writer(stream, rx, closed_tx, addr));
        info!(%addr, "status pusher connected");
        Ok(Self {
            handle: PushHandle { tx },
            closed_rx,
            addr,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn handle(&self) -> PushHandle {
        self.handle.clone()
    }

    pub fn is_closed(&self) -> bool {
        *self.closed_rx.borrow()
    }

    /// Resolves when the underlying connection is lost; drives the
    /// agent's reconnect loop.
    pub async fn closed(&mut self) {
        while !*self.closed_rx.borrow() {
            if self.closed_rx.changed().await.is_err() {
                return;
            }
        }
    }
}

async fn writer(
    mut stream: TcpStream,
    mut rx: mpsc::Receiver<Frame>,
    closed_tx: watch::Sender<bool>,
    addr: SocketAddr,
) {
    while let Some(frame) = rx.recv().await {
        if let Err(e) = write_frame(&mut stream, &frame).await {
            debug!(%addr, error = %e, "status write failed");
            break;
        }
    }
    let _ = closed_tx.send(true);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::Collector;

    #[tokio::test]
    async fn test_push_to_collector() {
        let mut collector = Collector::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let pusher = Pusher::connect(collector.local_addr()).await.unwrap();

        let handle = pusher.handle();
        assert!(handle.send(Frame::new("status/m1", r#"{"type":"heartbeat"}"#)));

        let frame = collector.recv().await.unwrap();
        assert_eq!(frame.topic, "status/m1");
    }

    #[tokio::test]
    async fn test_closed_signal_after_collector_drop() {
        let collector = Collector::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let addr = collector.local_addr();
        let mut pusher = Pusher::connect(addr).await.unwrap();
        drop(collector);

        // Writes eventually fail once the far side is gone.
        let handle = pusher.handle();
        tokio::spawn(async move {
            loop {
                handle.send(Frame::new("status/m1", "x"));
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            }
        });

        tokio::time::timeout(std::time::Duration::from_secs(5), pusher.closed())
            .await
            .expect("pusher should observe the closed connection");
    }
}
