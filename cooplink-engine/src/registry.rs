//! The set of known peers and their reachability.
//!
//! Two writers feed the registry: discovery (presence: `Connectable` /
//! `Offline` / gone) and the session manager (`Connected`). They are kept
//! apart so a beacon or an aging tick never downgrades a device that has a
//! live session; the reachability a reader sees is `Connected` while a
//! session holds the device, and the discovery view otherwise.
//!
//! Updates are serialized per device id by the map's entry locking.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry as MapEntry;

use cooplink_core::device::{Device, DeviceEvent, DeviceId, Reachability};

#[derive(Debug, Clone)]
struct Entry {
    /// Identity and last discovery view (`reachability` is the presence).
    device: Device,
    connected: bool,
}

impl Entry {
    fn view(&self) -> Device {
        let mut device = self.device.clone();
        if self.connected {
            device.reachability = Reachability::Connected;
        }
        device
    }
}

#[derive(Debug, Default)]
pub struct DeviceRegistry {
    entries: DashMap<DeviceId, Entry>,
}

impl DeviceRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies a discovery event and returns the change as readers observe
    /// it, or `None` if nothing visible changed.
    pub fn apply(&self, event: &DeviceEvent) -> Option<DeviceEvent> {
        match event {
            DeviceEvent::Appeared(device) | DeviceEvent::Updated(device) => self.upsert(device.clone()),
            DeviceEvent::Disappeared(id) => self.remove_discovered(id),
        }
    }

    /// Inserts or refreshes a device known outside discovery (typed
    /// address, inbound request).
    pub fn register(&self, device: Device) -> Option<DeviceEvent> {
        self.upsert(device)
    }

    fn upsert(&self, device: Device) -> Option<DeviceEvent> {
        match self.entries.entry(device.id.clone()) {
            MapEntry::Vacant(slot) => {
                let entry = Entry {
                    device,
                    connected: false,
                };
                let view = entry.view();
                slot.insert(entry);
                Some(DeviceEvent::Appeared(view))
            }
            MapEntry::Occupied(mut slot) => {
                let entry = slot.get_mut();
                let before = entry.view();
                entry.device = device;
                let after = entry.view();
                (before != after).then_some(DeviceEvent::Updated(after))
            }
        }
    }

    fn remove_discovered(&self, id: &DeviceId) -> Option<DeviceEvent> {
        match self.entries.entry(id.clone()) {
            MapEntry::Vacant(_) => None,
            MapEntry::Occupied(mut slot) => {
                if slot.get().connected {
                    // Keep it while the session lives; it reads as Offline
                    // once the session ends.
                    slot.get_mut().device.reachability = Reachability::Offline;
                    None
                } else {
                    slot.remove();
                    Some(DeviceEvent::Disappeared(id.clone()))
                }
            }
        }
    }

    /// Marks a device as held by a connected session.
    pub fn mark_connected(&self, id: &DeviceId) -> Option<DeviceEvent> {
        let mut entry = self.entries.get_mut(id)?;
        if entry.connected {
            return None;
        }
        entry.connected = true;
        Some(DeviceEvent::Updated(entry.view()))
    }

    /// Releases the session's hold; the discovery view becomes visible again.
    pub fn mark_disconnected(&self, id: &DeviceId) -> Option<DeviceEvent> {
        let mut entry = self.entries.get_mut(id)?;
        if !entry.connected {
            return None;
        }
        entry.connected = false;
        Some(DeviceEvent::Updated(entry.view()))
    }

    #[must_use]
    pub fn get(&self, id: &DeviceId) -> Option<Device> {
        self.entries.get(id).map(|e| e.view())
    }

    /// All known devices, ordered by name then id.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Device> {
        let mut devices: Vec<Device> = self.entries.iter().map(|e| e.view()).collect();
        devices.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));
        devices
    }

    /// Devices whose name contains `query` (case-insensitive) or whose IP
    /// address contains it.
    #[must_use]
    pub fn search(&self, query: &str) -> Vec<Device> {
        let needle = query.trim().to_lowercase();
        if needle.is_empty() {
            return self.snapshot();
        }
        self.snapshot()
            .into_iter()
            .filter(|d| {
                d.name.to_lowercase().contains(&needle)
                    || d.address.ip().to_string().contains(&needle)
            })
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
