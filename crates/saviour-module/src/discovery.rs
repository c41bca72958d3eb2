//! Module-side discovery: advertise this module, browse for the
//! controller, and feed its address to the transport manager.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use saviour_protocol::{CONTROLLER_SERVICE_TYPE, MODULE_SERVICE_TYPE};

use crate::ModuleState;

/// Block until this host holds an address in a configured private
/// range; loopback is never advertised.
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

pub async fn run(
    state: Arc<ModuleState>,
    ip: IpAddr,
    endpoint_tx: watch::Sender<Option<IpAddr>>,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let mdns = ServiceDaemon::new()?;

    // -- Advertise this module --
    let instance_name = saviour_protocol::identity::module_instance_name(&state.module_id);
    let mut properties = HashMap::new();
    properties.insert("type".to_string(), state.module_type.clone());
    properties.insert("id".to_string(), state.module_id.clone());
    properties.insert("name".to_string(), state.status.module_name());
    properties.insert(
        "ver".to_string(),
        saviour_protocol::PROTOCOL_VERSION.to_string(),
    );

    let service_port = state
        .config
        .get_u64("network._zeroconf_port")
        .map(|p| p as u16)
        .unwrap_or(saviour_protocol::DEFAULT_SERVICE_PORT);

    let service_info = ServiceInfo::new(
        MODULE_SERVICE_TYPE,
        &instance_name,
        &format!("{}.local.", state.module_id),
        ip,
        service_port,
        properties,
    )?;
    mdns.register(service_info)?;
    info!(
        instance = %instance_name,
        service_type = MODULE_SERVICE_TYPE,
        "mDNS service registered"
    );

    // -- Browse for the controller --
    let receiver = mdns.browse(CONTROLLER_SERVICE_TYPE)?;
    info!(service_type = CONTROLLER_SERVICE_TYPE, "browsing for controller");

    // Fullname of the controller we are currently pointed at.
    let mut current_controller: Option<String> = None;

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
            ServiceEvent::ServiceResolved(info) => {
                let properties = info.get_properties();
                if properties.get_property_val_str("type") != Some("controller") {
                    debug!(name = %info.get_fullname(), "non-controller service ignored");
                    continue;
                }
                let Some(controller_ip) = info.get_addresses().iter().next().copied() else {
                    warn!("controller advertisement without an address");
                    continue;
                };

                // Only re-point transport when the endpoint actually
                // differs from the connected one.
                let changed = *endpoint_tx.borrow() != Some(controller_ip);
                if changed {
                    info!(
                        controller = %info.get_fullname(),
                        %controller_ip,
                        "controller discovered"
                    );
                    let _ = endpoint_tx.send(Some(controller_ip));
                } else {
                    debug!(%controller_ip, "controller re-advertised at same endpoint");
                }
                current_controller = Some(info.get_fullname().to_string());
            }

            ServiceEvent::ServiceRemoved(_service_type, fullname) => {
                if current_controller.as_deref() == Some(fullname.as_str()) {
                    warn!(controller = %fullname, "controller withdrew, waiting for discovery");
                    current_controller = None;
                    let _ = endpoint_tx.send(None);
                }
            }

            ServiceEvent::SearchStarted(st) => debug!(service_type = %st, "mDNS search started"),
            ServiceEvent::SearchStopped(st) => debug!(service_type = %st, "mDNS search stopped"),
            ServiceEvent::ServiceFound(st, name) => {
                debug!(service_type = %st, name = %name, "service found, awaiting resolution");
            }
        }
    }

    if let Err(e) = mdns.unregister(&format!("{instance_name}.{MODULE_SERVICE_TYPE}")) {
        warn!("failed to unregister mDNS service: {}", e);
    }
    mdns.shutdown()?;
    Ok(())
}
