//! Topic-addressed pub/sub over TCP.
//!
//! The controller binds two channels: a command channel it publishes on
//! (fan-out to every connected module) and a status channel it collects
//! from. Modules connect to both. Topic filtering is receiver-side: a
//! publisher sends every frame to every peer, and subscribers drop
//! frames whose topic no prefix in their subscription set matches.
//! Delivery is at-most-once; slow or dead peers lose frames rather than
//! stalling the publisher.

pub mod collector;
pub mod frame;
pub mod publisher;
pub mod pusher;
pub mod subscriber;

use std::time::Duration;

use thiserror::Error;
use tokio::net::TcpStream;
use tracing::warn;

pub use collector::Collector;
pub use frame::Frame;
pub use publisher::Publisher;
pub use pusher::Pusher;
pub use subscriber::Subscriber;

/// Receive timeout used by command listeners so a shutdown flag is
/// observed regularly.
pub const RECV_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("frame exceeds maximum size ({0} bytes)")]
    Oversize(usize),
    #[error("malformed frame: {0}")]
    Malformed(String),
    #[error("connection closed")]
    Closed,
}

/// Keepalive and latency tuning applied to every transport stream.
pub fn tune_stream(stream: &TcpStream) {
    let sock = socket2::SockRef::from(stream);
    let keepalive = socket2::TcpKeepalive::new()
        .with_time(Duration::from_secs(30))
        .with_interval(Duration::from_secs(10));
    if let Err(e) = sock.set_tcp_keepalive(&keepalive) {
        warn!(error = %e, "failed to set TCP keepalive");
    }
    let _ = sock.set_nodelay(true);
}

/// Drop a stream without lingering in TIME_WAIT; used when tearing down
/// a connection to a controller that has moved.
pub fn close_no_linger(stream: &TcpStream) {
    let sock = socket2::SockRef::from(stream);
    let _ = sock.set_linger(Some(Duration::ZERO));
}
