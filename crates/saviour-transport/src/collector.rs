//! Bind-side intake: the controller's status channel. Modules connect
//! and push frames; the collector merges them into one ordered-per-peer
//! stream for the status dispatch loop.

use std::net::SocketAddr;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::frame::{read_frame, Frame};
use crate::{tune_stream, TransportError};

/// Shared intake queue depth. Heartbeats from a large fleet arrive in
/// bursts; the dispatch loop drains quickly.
const INTAKE_QUEUE: usize = 1024;

pub struct Collector {
    local_addr: SocketAddr,
    rx: mpsc::Receiver<Frame>,
}

impl Collector {
    pub async fn bind(addr: SocketAddr) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let (tx, rx) = mpsc::channel(INTAKE_QUEUE);

        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer_addr)) => {
                        tune_stream(&stream);
                        debug!(peer = %peer_addr, "status publisher connected");
                        tokio::spawn(peer_reader(stream, tx.clone(), peer_addr));
                    }
                    Err(e) => {
                        warn!(error = %e, "accept failed on status channel");
                        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                    }
                }
            }
        });

        info!(%local_addr, "status collector listening");
        Ok(Self { local_addr, rx })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Next frame from any connected module. Frames from one module
    /// arrive in the order it published them; frames from different
    /// modules are not mutually ordered.
    pub async fn recv(&mut self) -> Option<Frame> {
        self.rx.recv().await
    }
}

async fn peer_reader(mut stream: TcpStream, tx: mpsc::Sender<Frame>, addr: SocketAddr) {
    loop {
        match read_frame(&mut stream).await {
            Ok(frame) => {
                // Sequential await preserves per-peer publication order.
                if tx.send(frame).await.is_err() {
                    return;
                }
            }
            Err(TransportError::Closed) => {
                debug!(peer = %addr, "status publisher disconnected");
                return;
            }
            Err(e) => {
                warn!(peer = %addr, error = %e, "status read failed, closing peer");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::write_frame;

    #[tokio::test]
    async fn test_per_peer_order_preserved() {
        let mut collector = Collector::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let addr = collector.local_addr();

        let mut peer = TcpStream::connect(addr).await.unwrap();
        for i in 0..10 {
            write_frame(&mut peer, &Frame::new("status/m1", format!("msg-{i}")))
                .await
                .unwrap();
        }

        for i in 0..10 {
            let frame = collector.recv().await.unwrap();
            assert_eq!(frame.payload, format!("msg-{i}"));
        }
    }

    #[tokio::test]
    async fn test_merges_multiple_peers() {
        let mut collector = Collector::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let addr = collector.local_addr();

        let mut a = TcpStream::connect(addr).await.unwrap();
        let mut b = TcpStream::connect(addr).await.unwrap();
        write_frame(&mut a, &Frame::new("status/a", "x")).await.unwrap();
        write_frame(&mut b, &Frame::new("status/b", "y")).await.unwrap();

        let mut topics = vec![
            collector.recv().await.unwrap().topic,
            collector.recv().await.unwrap().topic,
        ];
        topics.sort();
        assert_eq!(topics, vec!["status/a", "status/b"]);
    }
}
