//! The authoritative table of known modules.
//!
//! One record per module id, at most one record per live IP. Mutators
//! return the changes they made as data; callers emit the matching
//! events. Critical sections are short and never span I/O.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::RwLock;
use std::time::Instant;

use serde_json::Value;
use thiserror::Error;
use tracing::{info, warn};

use saviour_protocol::status::ModuleStatus;

#[derive(Debug, Error, PartialEq)]
pub enum RegistryError {
    #[error("unknown module: {0}")]
    UnknownModule(String),
    #[error("illegal status transition {from} -> {to} for {id}")]
    IllegalTransition {
        id: String,
        from: ModuleStatus,
        to: ModuleStatus,
    },
}

#[derive(Debug, Clone)]
pub struct ModuleRecord {
    pub module_id: String,
    pub name: String,
    pub module_type: String,
    pub ip: IpAddr,
    pub port: u16,
    /// Group label; empty when the module belongs to no group.
    pub group: String,
    pub online: bool,
    pub status: ModuleStatus,
    /// Last editable config the module reported.
    pub config: Option<Value>,
    /// Wall-clock of the last heartbeat; 0 until the first arrives.
    pub last_heartbeat: f64,
    pub ready: Option<bool>,
    pub ready_message: String,
    /// READY decays to NOT_READY once this deadline passes.
    pub ready_expiry: Option<Instant>,
}

impl ModuleRecord {
    fn new(module_id: String, name: String, module_type: String, ip: IpAddr, port: u16) -> Self {
        Self {
            module_id,
            name,
            module_type,
            ip,
            port,
            group: String::new(),
            online: true,
            status: ModuleStatus::NotReady,
            config: None,
            last_heartbeat: 0.0,
            ready: None,
            ready_message: String::new(),
            ready_expiry: None,
        }
    }
}

/// What a single advertisement did to the table.
#[derive(Debug, Clone, PartialEq)]
pub enum RegistryChange {
    Added(String),
    Updated(String),
    IdChanged { old: String, new: String },
    IpChanged { id: String, ip: IpAddr },
}

#[derive(Default)]
pub struct Registry {
    inner: RwLock<HashMap<String, ModuleRecord>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reconcile one resolved advertisement. Handles the two collision
    /// cases: a known IP advertising a new id means the module's
    /// identity changed (firmware rewrite, board swap) and the record
    /// is renamed in place, preserving its history; a known id from a
    /// new address is an address move.
    pub fn reconcile_advertisement(
        &self,
        id: &str,
        name: &str,
        module_type: &str,
        ip: IpAddr,
        port: u16,
    ) -> Vec<RegistryChange> {
        let mut changes = Vec::new();
        let mut map = self.inner.write().unwrap();

        // Same-IP collision: rewrite the record's id, old -> new.
        let colliding = map
            .values()
            .find(|r| r.ip == ip && r.module_id != id)
            .map(|r| r.module_id.clone());
        if let Some(old_id) = colliding {
            let mut record = map.remove(&old_id).expect("collision candidate present");
            warn!(old = %old_id, new = %id, %ip, "advertisement collides on IP, renaming module");
            record.module_id = id.to_string();
            record.name = name.to_string();
            record.module_type = module_type.to_string();
            record.port = port;
            map.insert(id.to_string(), record);
            changes.push(RegistryChange::IdChanged {
                old: old_id,
                new: id.to_string(),
            });
            check_invariants(&map);
            return changes;
        }

        match map.get_mut(id) {
            Some(record) => {
                if record.ip != ip {
                    info!(%id, old_ip = %record.ip, new_ip = %ip, "module address changed");
                    record.ip = ip;
                    changes.push(RegistryChange::IpChanged {
                        id: id.to_string(),
                        ip,
                    });
                }
                record.name = name.to_string();
                record.module_type = module_type.to_string();
                record.port = port;
                changes.push(RegistryChange::Updated(id.to_string()));
            }
            None => {
                map.insert(
                    id.to_string(),
                    ModuleRecord::new(
                        id.to_string(),
                        name.to_string(),
                        module_type.to_string(),
                        ip,
                        port,
                    ),
                );
                changes.push(RegistryChange::Added(id.to_string()));
            }
        }
        check_invariants(&map);
        changes
    }

    /// Atomic rename across the table; the record keeps everything but
    /// its key.
    pub fn rename(&self, old_id: &str, new_id: &str) -> Result<(), RegistryError> {
        let mut map = self.inner.write().unwrap();
        let mut record = map
            .remove(old_id)
            .ok_or_else(|| RegistryError::UnknownModule(old_id.to_string()))?;
        record.module_id = new_id.to_string();
        map.insert(new_id.to_string(), record);
        check_invariants(&map);
        Ok(())
    }

    /// Online transitions. Going offline forces status OFFLINE; coming
    /// back online from OFFLINE resets to NOT_READY. Returns true when
    /// the flag actually flipped.
    pub fn mark_online(&self, id: &str, online: bool) -> Result<bool, RegistryError> {
        let mut map = self.inner.write().unwrap();
        let record = map
            .get_mut(id)
            .ok_or_else(|| RegistryError::UnknownModule(id.to_string()))?;
        let changed = record.online != online;
        record.online = online;
        if !online {
            record.status = ModuleStatus::Offline;
            record.ready = None;
            record.ready_expiry = None;
        } else if changed && record.status == ModuleStatus::Offline {
            record.status = ModuleStatus::NotReady;
        }
        check_invariants(&map);
        Ok(changed)
    }

    pub fn set_status(&self, id: &str, status: ModuleStatus) -> Result<(), RegistryError> {
        let mut map = self.inner.write().unwrap();
        let record = map
            .get_mut(id)
            .ok_or_else(|| RegistryError::UnknownModule(id.to_string()))?;
        if !ModuleStatus::can_transition(record.status, status) {
            return Err(RegistryError::IllegalTransition {
                id: id.to_string(),
                from: record.status,
                to: status,
            });
        }
        record.status = status;
        if status == ModuleStatus::Offline {
            record.online = false;
        }
        if status != ModuleStatus::Ready {
            record.ready_expiry = None;
        }
        check_invariants(&map);
        Ok(())
    }

    /// Record a readiness verdict. A passing verdict moves the module
    /// to READY with the given expiry; a failing one to NOT_READY.
    pub fn set_ready(
        &self,
        id: &str,
        ready: bool,
        message: &str,
        expiry: Option<Instant>,
    ) -> Result<(), RegistryError> {
        let mut map = self.inner.write().unwrap();
        let record = map
            .get_mut(id)
            .ok_or_else(|| RegistryError::UnknownModule(id.to_string()))?;
        record.ready = Some(ready);
        record.ready_message = message.to_string();
        if ready && ModuleStatus::can_transition(record.status, ModuleStatus::Ready) {
            record.status = ModuleStatus::Ready;
            record.ready_expiry = expiry;
        } else if !ready && record.status == ModuleStatus::Ready {
            record.status = ModuleStatus::NotReady;
            record.ready_expiry = None;
        }
        check_invariants(&map);
        Ok(())
    }

    /// Decay READY records whose expiry has passed. Returns the ids
    /// that decayed.
    pub fn expire_ready(&self, now: Instant) -> Vec<String> {
        let mut map = self.inner.write().unwrap();
        let mut expired = Vec::new();
        for record in map.values_mut() {
            if record.status == ModuleStatus::Ready {
                if let Some(expiry) = record.ready_expiry {
                    if now >= expiry {
                        record.status = ModuleStatus::NotReady;
                        record.ready_expiry = None;
                        expired.push(record.module_id.clone());
                    }
                }
            }
        }
        check_invariants(&map);
        expired
    }

    pub fn record_heartbeat(&self, id: &str, timestamp: f64) -> Result<(), RegistryError> {
        let mut map = self.inner.write().unwrap();
        let record = map
            .get_mut(id)
            .ok_or_else(|| RegistryError::UnknownModule(id.to_string()))?;
        record.last_heartbeat = timestamp;
        Ok(())
    }

    pub fn set_config(&self, id: &str, config: Value) -> Result<(), RegistryError> {
        let mut map = self.inner.write().unwrap();
        let record = map
            .get_mut(id)
            .ok_or_else(|| RegistryError::UnknownModule(id.to_string()))?;
        // Track the group label for selector resolution.
        if let Some(group) = config.pointer("/module/group").and_then(Value::as_str) {
            record.group = group.to_string();
        }
        record.config = Some(config);
        Ok(())
    }

    /// Resolve a selector to the set of currently online module ids.
    pub fn members(&self, selector: &str) -> Vec<String> {
        let map = self.inner.read().unwrap();
        let mut members: Vec<String> = map
            .values()
            .filter(|r| r.online)
            .filter(|r| selector == "all" || r.module_id == selector || r.group == selector)
            .map(|r| r.module_id.clone())
            .collect();
        members.sort();
        members
    }

    pub fn get(&self, id: &str) -> Option<ModuleRecord> {
        self.inner.read().unwrap().get(id).cloned()
    }

    pub fn all(&self) -> Vec<ModuleRecord> {
        let mut records: Vec<ModuleRecord> = self.inner.read().unwrap().values().cloned().collect();
        records.sort_by(|a, b| a.module_id.cmp(&b.module_id));
        records
    }

    pub fn contains(&self, id: &str) -> bool {
        self.inner.read().unwrap().contains_key(id)
    }

    /// Explicit removal is the only way a record is destroyed.
    pub fn remove(&self, id: &str) -> bool {
        self.inner.write().unwrap().remove(id).is_some()
    }
}

/// Registry invariants hold after every mutation; a violation is a bug.
fn check_invariants(map: &HashMap<String, ModuleRecord>) {
    if cfg!(debug_assertions) {
        let mut ips = std::collections::HashSet::new();
        for (key, record) in map {
            debug_assert_eq!(key, &record.module_id, "key/id mismatch");
            debug_assert!(
                ips.insert(record.ip),
                "two records share IP {}",
                record.ip
            );
            if record.status == ModuleStatus::Offline {
                debug_assert!(!record.online, "OFFLINE record marked online");
            }
        }
    }
}
