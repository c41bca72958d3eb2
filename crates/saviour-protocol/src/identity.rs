//! Module identity.
//!
//! A module id is stable across reboots and address changes: it is the
//! module type tag joined with the last four hex digits of the primary
//! interface's MAC address, e.g. `camera_dc67`. A changed MAC (board
//! swap, firmware rewrite) therefore produces a *new* id; the controller
//! reconciles that through the id-rename path, keyed on the advertised
//! IP address.

use std::path::Path;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("interface {0} has no readable MAC address")]
    NoMac(String),
    #[error("malformed MAC address: {0}")]
    BadMac(String),
}

/// Last four hex digits of a colon-separated MAC string, lowercased.
pub fn mac_suffix(mac: &str) -> Result<String, IdentityError> {
    let hex: String = mac
        .chars()
        .filter(|c| c.is_ascii_hexdigit())
        .collect::<String>()
        .to_ascii_lowercase();
    if hex.len() < 4 {
        return Err(IdentityError::BadMac(mac.to_string()));
    }
    Ok(hex[hex.len() - 4..].to_string())
}

/// Build the module id `<type>_<mac4>` from a MAC string.
pub fn module_id_from_mac(module_type: &str, mac: &str) -> Result<String, IdentityError> {
    Ok(format!("{}_{}", module_type, mac_suffix(mac)?))
}

/// Derive the module id by reading the MAC of `interface` from sysfs.
pub fn derive_module_id(module_type: &str, interface: &str) -> Result<String, IdentityError> {
    let path = format!("/sys/class/net/{interface}/address");
    let mac = std::fs::read_to_string(Path::new(&path))
        .map_err(|_| IdentityError::NoMac(interface.to_string()))?;
    module_id_from_mac(module_type, mac.trim())
}

/// mDNS instance name for a module service. The id already embeds the
/// type tag (`<type>_<mac4>`), so the instance name is the id itself.
pub fn module_instance_name(module_id: &str) -> String {
    module_id.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mac_suffix() {
        assert_eq!(mac_suffix("b8:27:eb:4f:dc:67").unwrap(), "dc67");
        assert_eq!(mac_suffix("B8:27:EB:4F:DC:67").unwrap(), "dc67");
        assert_eq!(mac_suffix("b827eb4fdc67").unwrap(), "dc67");
    }

    #[test]
    fn test_module_id_from_mac() {
        assert_eq!(
            module_id_from_mac("camera", "b8:27:eb:4f:dc:67").unwrap(),
            "camera_dc67"
        );
    }

    #[test]
    fn test_short_mac_rejected() {
        assert!(matches!(
            mac_suffix("ab"),
            Err(IdentityError::BadMac(_))
        ));
    }

    #[test]
    fn test_instance_name() {
        assert_eq!(module_instance_name("camera_dc67"), "camera_dc67");
    }
}
