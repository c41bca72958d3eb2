//! Module-side transport: the command subscription and status
//! publication to whichever controller discovery currently points at.
//!
//! The connection manager owns both sockets. It reconnects with linear
//! backoff on loss, rebuilds with zero linger when the controller
//! endpoint changes, and re-points the group subscription when the
//! module's group label changes, with no controller coordination involved.

use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use saviour_config::ConfigStore;
use saviour_protocol::envelope::CommandEnvelope;
use saviour_protocol::status::{StatusBody, StatusMessage};
use saviour_transport::pusher::PushHandle;
use saviour_transport::{Frame, Pusher, Subscriber, RECV_TIMEOUT};

use crate::ModuleState;

/// Shared outbound side: any task publishes a status body; the frame
/// goes out on `status/<module_id>` through the current connection, or
/// is dropped when the transport is down.
pub struct StatusPublisher {
    module_id: String,
    config: Arc<ConfigStore>,
    handle: RwLock<Option<PushHandle>>,
}

impl StatusPublisher {
    pub fn new(module_id: impl Into<String>, config: Arc<ConfigStore>) -> Self {
        Self {
            module_id: module_id.into(),
            config,
            handle: RwLock::new(None),
        }
    }

    pub fn module_id(&self) -> &str {
        &self.module_id
    }

    pub fn module_name(&self) -> String {
        self.config
            .get_str("module.name")
            .unwrap_or_else(|| self.module_id.clone())
    }

    pub fn set_handle(&self, handle: Option<PushHandle>) {
        *self.handle.write().unwrap() = handle;
    }

    pub fn publish(&self, body: StatusBody) -> bool {
        let message = StatusMessage::new(self.module_id.clone(), self.module_name(), body);
        let frame = Frame::new(
            saviour_protocol::status_topic(&self.module_id),
            message.to_json(),
        );
        match self.handle.read().unwrap().as_ref() {
            Some(handle) => handle.send(frame),
            None => false,
        }
    }
}

fn command_port(config: &ConfigStore) -> u16 {
    config
        .get_u64("communication.command_socket_port")
        .map(|p| p as u16)
        .unwrap_or(saviour_protocol::DEFAULT_COMMAND_PORT)
}

fn status_port(config: &ConfigStore) -> u16 {
    config
        .get_u64("communication.status_socket_port")
        .map(|p| p as u16)
        .unwrap_or(saviour_protocol::DEFAULT_STATUS_PORT)
}

fn base_topics(state: &ModuleState) -> Vec<String> {
    let mut topics = vec![
        saviour_protocol::command_topic(&state.module_id),
        saviour_protocol::command_topic("all"),
    ];
    if let Some(group) = state.config.get_str("module.group").filter(|g| !g.is_empty()) {
        topics.push(saviour_protocol::command_topic(&group));
    }
    topics
}

/// Connection manager. `endpoint_rx` carries the controller address
/// from discovery; `commands` receives parsed envelopes for the
/// dispatch worker.
pub async fn run(
    state: Arc<ModuleState>,
    mut endpoint_rx: watch::Receiver<Option<IpAddr>>,
    commands: mpsc::Sender<CommandEnvelope>,
    cancel: CancellationToken,
) {
    let reconnect_attempts = state
        .config
        .get_u64("network.reconnect_attempts")
        .unwrap_or(5) as u32;
    let reconnect_delay =
        Duration::from_secs(state.config.get_u64("network.reconnect_delay").unwrap_or(5));

    'outer: loop {
        // Wait for a controller endpoint.
        let ip = loop {
            if let Some(ip) = *endpoint_rx.borrow() {
                break ip;
            }
            tokio::select! {
                changed = endpoint_rx.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
                _ = cancel.cancelled() => return,
            }
        };

        let command_addr = SocketAddr::new(ip, command_port(&state.config));
        let status_addr = SocketAddr::new(ip, status_port(&state.config));

        // Linear backoff, bounded attempts; exhaustion never kills the
        // agent, we just go back to waiting on discovery.
        let mut subscriber =
            match connect_subscriber(&state, command_addr, reconnect_delay, reconnect_attempts)
                .await
            {
                Some(subscriber) => subscriber,
                None => {
                    tokio::time::sleep(reconnect_delay).await;
                    continue;
                }
            };
        let mut pusher = match connect_pusher(status_addr, reconnect_delay, reconnect_attempts)
            .await
        {
            Some(pusher) => pusher,
            None => {
                tokio::time::sleep(reconnect_delay).await;
                continue;
            }
        };
        state.status.set_handle(Some(pusher.handle()));
        info!(%ip, "transport connected to controller");

        let mut current_group = state
            .config
            .get_str("module.group")
            .filter(|g| !g.is_empty());
        let mut config_rx = state.config.subscribe();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    state.status.set_handle(None);
                    return;
                }

                result = subscriber.recv_timeout(RECV_TIMEOUT) => match result {
                    // Timeout: loop around, shutdown flag gets checked.
                    Ok(None) => {}
                    Ok(Some(frame)) => {
                        match CommandEnvelope::parse(&frame.payload) {
                            Ok(envelope) => {
                                if commands.send(envelope).await.is_err() {
                                    return;
                                }
                            }
                            Err(e) => {
                                warn!(error = %e, "malformed command envelope");
                                state.status.publish(StatusBody::Error {
                                    error: format!("malformed command: {e}"),
                                });
                            }
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "command channel lost, reconnecting");
                        state.status.set_handle(None);
                        continue 'outer;
                    }
                },

                _ = pusher.closed() => {
                    warn!("status channel lost, reconnecting");
                    state.status.set_handle(None);
                    continue 'outer;
                }

                changed = endpoint_rx.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    let new_ip = *endpoint_rx.borrow();
                    if new_ip != Some(ip) {
                        info!(?new_ip, "controller endpoint changed, rebuilding sockets");
                        state.status.set_handle(None);
                        subscriber.close();
                        continue 'outer;
                    }
                }

                delta = config_rx.recv() => {
                    if let Ok(delta) = delta {
                        if delta.changed.iter().any(|p| p == "module.group") {
                            let new_group = state
                                .config
                                .get_str("module.group")
                                .filter(|g| !g.is_empty());
                            swap_group(&subscriber, &current_group, &new_group);
                            current_group = new_group;
                        }
                    }
                }
            }
        }
    }
}

fn swap_group(subscriber: &Subscriber, old: &Option<String>, new: &Option<String>) {
    match (old, new) {
        (Some(old), Some(new)) if old != new => {
            info!(old = %old, new = %new, "group changed, re-pointing subscription");
            subscriber.resubscribe(
                &saviour_protocol::command_topic(old),
                saviour_protocol::command_topic(new),
            );
        }
        (Some(old), None) => {
            info!(old = %old, "left group");
            subscriber.unsubscribe(&saviour_protocol::command_topic(old));
        }
        (None, Some(new)) => {
            info!(new = %new, "joined group");
            subscriber.subscribe(saviour_protocol::command_topic(new));
        }
        _ => {}
    }
}

async fn connect_subscriber(
    state: &ModuleState,
    addr: SocketAddr,
    base_delay: Duration,
    attempts: u32,
) -> Option<Subscriber> {
    for attempt in 1..=attempts {
        match Subscriber::connect(addr, base_topics(state)).await {
            Ok(subscriber) => return Some(subscriber),
            Err(e) => {
                warn!(%addr, attempt, error = %e, "command channel connect failed");
                if attempt < attempts {
                    // Linear backoff: the wait grows by base_delay with
                    // each failed attempt.
                    tokio::time::sleep(base_delay * attempt).await;
                }
            }
        }
    }
    None
}

async fn connect_pusher(addr: SocketAddr, base_delay: Duration, attempts: u32) -> Option<Pusher> {
    for attempt in 1..=attempts {
        match Pusher::connect(addr).await {
            Ok(pusher) => return Some(pusher),
            Err(e) => {
                warn!(%addr, attempt, error = %e, "status channel connect failed");
                if attempt < attempts {
                    tokio::time::sleep(base_delay * attempt).await;
                }
            }
        }
    }
    None
}
