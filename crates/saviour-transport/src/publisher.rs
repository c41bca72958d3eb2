//! Bind-side fan-out publisher: the controller's command channel.
//!
//! Every connected peer receives every published frame; subscription
//! filtering happens on the receiving side. A peer that cannot keep up
//! (full queue) or has disconnected is dropped: at-most-once delivery,
//! the publisher never blocks on a slow module.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::frame::{write_frame, Frame};
use crate::{tune_stream, TransportError};

/// Per-peer outbound queue depth. Commands are rare; depth matters only
/// when a peer's socket has stalled.
const PEER_QUEUE: usize = 64;

struct Peer {
    addr: SocketAddr,
    tx: mpsc::Sender<Frame>,
}

pub struct Publisher {
    local_addr: SocketAddr,
    peers: Arc<Mutex<Vec<Peer>>>,
}

impl Publisher {
    /// Bind and start accepting subscriber connections.
    pub async fn bind(addr: SocketAddr) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let peers: Arc<Mutex<Vec<Peer>>> = Arc::new(Mutex::new(Vec::new()));

        let accept_peers = Arc::clone(&peers);
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer_addr)) => {
                        tune_stream(&stream);
                        let (tx, rx) = mpsc::channel(PEER_QUEUE);
                        accept_peers.lock().unwrap().push(Peer {
                            addr: peer_addr,
                            tx,
                        });
                        debug!(peer = %peer_addr, "command subscriber connected");
                        tokio::spawn(peer_writer(stream, rx, peer_addr));
                    }
                    Err(e) => {
                        warn!(error = %e, "accept failed on command channel");
                        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                    }
                }
            }
        });

        info!(%local_addr, "command publisher listening");
        Ok(Self { local_addr, peers })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn peer_count(&self) -> usize {
        self.peers.lock().unwrap().len()
    }

    /// Publish one frame to every connected peer. Peers whose queue is
    /// full or whose writer has exited are dropped here.
    pub fn publish(&self, frame: Frame) {
        let mut peers = self.peers.lock().unwrap();
        peers.retain(|peer| match peer.tx.try_send(frame.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(peer = %peer.addr, "peer queue full, dropping subscriber");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(peer = %peer.addr, "peer gone, dropping subscriber");
                false
            }
        });
    }
}

async fn peer_writer(mut stream: TcpStream, mut rx: mpsc::Receiver<Frame>, addr: SocketAddr) {
    while let Some(frame) = rx.recv().await {
        if let Err(e) = write_frame(&mut stream, &frame).await {
            debug!(peer = %addr, error = %e, "peer write failed, closing");
            return;
        }
    }
}
