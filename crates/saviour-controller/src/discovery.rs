//! mDNS service advertisement and module browsing.
//!
//! The controller advertises `_controller._tcp.local.` with a stable
//! instance name and browses `_module._tcp.local.`. Resolved module
//! advertisements feed the registry; id and address collisions are
//! reconciled there and surface as typed events.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use saviour_protocol::{CONTROLLER_SERVICE_TYPE, MODULE_SERVICE_TYPE};

use crate::events::ControllerEvent;
use crate::registry::RegistryChange;
use crate::ControllerState;

/// Block until this host holds an address in a configured private
/// range. Retries forever with backoff; an agent with no usable address
/// cannot participate.
pub async fn wait_for_private_ip(prefixes: &[String]) -> IpAddr {
    let mut delay = Duration::from_secs(1);
    loop {
        if let Some(ip) = saviour_protocol::net::find_private_ip(prefixes) {
            info!(%ip, "using private-range address");
            return ip;
        }
        warn!(?prefixes, retry_in = ?delay, "no private-range address yet");
        tokio::time::sleep(delay).await;
        delay = (delay * 2).min(Duration::from_secs(30));
    }
}

pub async fn run(state: Arc<ControllerState>, ip: IpAddr, cancel: CancellationToken) -> anyhow::Result<()> {
    let mdns = ServiceDaemon::new()?;

    // -- Advertise ourselves --
    let instance_name = state.controller_id.clone();
    let mut properties = HashMap::new();
    properties.insert("type".to_string(), "controller".to_string());
    properties.insert("id".to_string(), state.controller_id.clone());

    let service_info = ServiceInfo::new(
        CONTROLLER_SERVICE_TYPE,
        &instance_name,
        &format!("{}.local.", state.controller_id),
        ip,
        state.config.network.service_port,
        properties,
    )?;
    mdns.register(service_info)?;
    info!(
        instance = %instance_name,
        service_type = CONTROLLER_SERVICE_TYPE,
        "mDNS service registered"
    );

    // -- Browse for modules --
    let receiver = mdns.browse(MODULE_SERVICE_TYPE)?;
    info!(service_type = MODULE_SERVICE_TYPE, "browsing for modules");

    loop {
        let event = tokio::select! {
            event = receiver.recv_async() => match event {
                Ok(event) => event,
                Err(e) => {
                    error!("mDNS browse channel closed: {}", e);
                    anyhow::bail!("mDNS browse channel closed unexpectedly");
                }
            },
            _ = cancel.cancelled() => break,
        };

        match event {
            ServiceEvent::ServiceResolved(info) => handle_resolved(&state, &info),
            ServiceEvent::ServiceRemoved(_service_type, fullname) => {
                handle_removed(&state, &fullname);
            }
            ServiceEvent::SearchStarted(st) => debug!(service_type = %st, "mDNS search started"),
            ServiceEvent::SearchStopped(st) => debug!(service_type = %st, "mDNS search stopped"),
            ServiceEvent::ServiceFound(st, name) => {
                debug!(service_type = %st, name = %name, "module found, awaiting resolution");
            }
        }
    }

    if let Err(e) = mdns.unregister(&format!("{instance_name}.{CONTROLLER_SERVICE_TYPE}")) {
        warn!("failed to unregister mDNS service: {}", e);
    }
    mdns.shutdown()?;
    Ok(())
}

fn handle_resolved(state: &ControllerState, info: &ServiceInfo) {
    let properties = info.get_properties();

    let Some(module_id) = properties.get_property_val_str("id").map(str::to_string) else {
        warn!(name = %info.get_fullname(), "module advertisement without id ignored");
        return;
    };
    let module_type = properties
        .get_property_val_str("type")
        .unwrap_or("unknown")
        .to_string();
    let module_name = properties
        .get_property_val_str("name")
        .unwrap_or(module_id.as_str())
        .to_string();

    let Some(ip) = info.get_addresses().iter().next().copied() else {
        warn!(module = %module_id, "advertisement resolved without an address");
        return;
    };
    let port = info.get_port();

    if let Some(ver) = properties
        .get_property_val_str("ver")
        .and_then(|v| v.parse::<u8>().ok())
    {
        if ver != saviour_protocol::PROTOCOL_VERSION {
            warn!(
                module = %module_id,
                module_version = ver,
                our_version = saviour_protocol::PROTOCOL_VERSION,
                "module protocol version mismatch"
            );
        }
    }

    info!(
        module = %module_id,
        module_type = %module_type,
        name = %module_name,
        %ip,
        port,
        "module advertisement resolved"
    );

    let changes =
        state
            .registry
            .reconcile_advertisement(&module_id, &module_name, &module_type, ip, port);
    for change in changes {
        let event = match change {
            RegistryChange::Added(id) => ControllerEvent::ModuleAdded { id },
            RegistryChange::Updated(id) => ControllerEvent::ModuleUpdated { id },
            RegistryChange::IdChanged { old, new } => ControllerEvent::IdChanged { old, new },
            RegistryChange::IpChanged { id, ip } => ControllerEvent::IpChanged { id, ip },
        };
        let _ = state.events.send(event);
    }
}

/// Graceful withdrawal only. The record stays; health decides
/// reachability.
fn handle_removed(state: &ControllerState, fullname: &str) {
    let Some(instance) = fullname.split('.').next() else {
        return;
    };
    if state.registry.contains(instance) {
        info!(module = %instance, "module withdrew its advertisement");
        let _ = state.events.send(ControllerEvent::ModuleWithdrawn {
            id: instance.to_string(),
        });
    } else {
        debug!(name = %fullname, "withdrawal for unknown service");
    }
}
