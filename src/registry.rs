//! # Device Registry
//!
//! Shared IMEI -> device map. Readers receive [`DeviceSnapshot`] copies;
//! writers hold the lock only for the map update.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, info};

use crate::imei::Imei;
use crate::session::{SessionHandle, SessionId};

/// Persistent device metadata (operator labels, last-seen bookkeeping)
#[cfg_attr(test, mockall::automock)]
pub trait DeviceDirectory: Send + Sync {
    /// Operator label for a device
    fn lookup_name(&self, imei: &Imei) -> Option<String>;

    /// Note that a device authenticated at `at`
    fn record_seen(&self, imei: &Imei, at: DateTime<Utc>);
}

/// In-memory directory seeded from `[devices.names]`
#[derive(Debug, Default)]
pub struct MemoryDirectory {
    names: RwLock<HashMap<Imei, String>>,
    seen: RwLock<HashMap<Imei, DateTime<Utc>>>,
}

impl MemoryDirectory {
    /// Seed from configuration; keys that are not IMEIs are skipped
    pub fn from_names(names: &HashMap<String, String>) -> Self {
        let names = names
            .iter()
            .filter_map(|(imei, name)| Imei::parse(imei).ok().map(|imei| (imei, name.clone())))
            .collect();

        Self {
            names: RwLock::new(names),
            seen: RwLock::new(HashMap::new()),
        }
    }

    pub fn last_seen(&self, imei: &Imei) -> Option<DateTime<Utc>> {
        self.seen.read().get(imei).copied()
    }
}

impl DeviceDirectory for MemoryDirectory {
    fn lookup_name(&self, imei: &Imei) -> Option<String> {
        self.names.read().get(imei).cloned()
    }

    fn record_seen(&self, imei: &Imei, at: DateTime<Utc>) {
        self.seen.write().insert(*imei, at);
    }
}

/// Point-in-time copy of one registry entry
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceSnapshot {
    pub imei: Imei,
    pub name: Option<String>,
    pub peer: SocketAddr,
    pub online: bool,
    pub session_id: SessionId,
    pub connected_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

#[derive(Debug)]
struct DeviceEntry {
    handle: SessionHandle,
    online: bool,
    connected_at: DateTime<Utc>,
    last_seen: DateTime<Utc>,
}

/// IMEI -> device map with at most one live session per device
pub struct DeviceRegistry {
    devices: RwLock<HashMap<Imei, DeviceEntry>>,
    directory: Arc<dyn DeviceDirectory>,
}

impl DeviceRegistry {
    pub fn new(directory: Arc<dyn DeviceDirectory>) -> Self {
        Self {
            devices: RwLock::new(HashMap::new()),
            directory,
        }
    }

    /// Upsert the device for an authenticated session
    ///
    /// # Returns
    ///
    /// * `Option<SessionHandle>` - Previous live session for the same IMEI;
    ///   the caller must close it
    pub fn register(&self, handle: SessionHandle) -> Option<SessionHandle> {
        let now = Utc::now();
        let imei = handle.imei();
        self.directory.record_seen(&imei, now);

        let entry = DeviceEntry {
            handle,
            online: true,
            connected_at: now,
            last_seen: now,
        };

        let previous = self.devices.write().insert(imei, entry);
        match previous {
            Some(prev) if prev.online => {
                info!("Device {} reconnected, replacing session {}", imei, prev.handle.id());
                Some(prev.handle)
            }
            _ => None,
        }
    }

    /// Refresh the last-activity time of a device
    pub fn touch(&self, imei: &Imei) {
        if let Some(entry) = self.devices.write().get_mut(imei) {
            entry.last_seen = Utc::now();
        }
    }

    /// Mark a device offline if `session_id` still owns the entry
    ///
    /// # Returns
    ///
    /// * `bool` - The entry was owned by `session_id` and is now offline
    pub fn mark_offline(&self, imei: &Imei, session_id: SessionId) -> bool {
        let mut devices = self.devices.write();
        match devices.get_mut(imei) {
            Some(entry) if entry.handle.id() == session_id => {
                entry.online = false;
                debug!("Device {} offline (session {})", imei, session_id);
                true
            }
            _ => false,
        }
    }

    /// Live session for a device
    pub fn handle(&self, imei: &Imei) -> Option<SessionHandle> {
        self.devices
            .read()
            .get(imei)
            .filter(|entry| entry.online)
            .map(|entry| entry.handle.clone())
    }

    pub fn get(&self, imei: &Imei) -> Option<DeviceSnapshot> {
        let devices = self.devices.read();
        devices.get(imei).map(|entry| self.snapshot_of(imei, entry))
    }

    /// Copies of every known device, ordered by IMEI
    pub fn snapshot(&self) -> Vec<DeviceSnapshot> {
        let devices = self.devices.read();
        let mut snapshots: Vec<_> = devices
            .iter()
            .map(|(imei, entry)| self.snapshot_of(imei, entry))
            .collect();
        snapshots.sort_by_key(|s| s.imei);
        snapshots
    }

    pub fn online_count(&self) -> usize {
        self.devices.read().values().filter(|e| e.online).count()
    }

    fn snapshot_of(&self, imei: &Imei, entry: &DeviceEntry) -> DeviceSnapshot {
        DeviceSnapshot {
            imei: *imei,
            name: self.directory.lookup_name(imei),
            peer: entry.handle.peer(),
            online: entry.online,
            session_id: entry.handle.id(),
            connected_at: entry.connected_at,
            last_seen: entry.last_seen,
        }
    }
}
