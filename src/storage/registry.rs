// Copyright 2026 Daniel Pelikan
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Persisted catalogue of known devices, groups and connection history.
//!
//! Each collection lives under its own storage key and is written back
//! after every change to it. Changes are made on a copy that replaces the
//! in-memory collection only once it is stored, so a failed write leaves
//! memory as it was. An update touching devices and groups writes two keys,
//! so it is not atomic.

use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::kv::KeyValueStore;
use crate::bluetooth::DeviceProfile;
use crate::error::RegistryError;

pub const DEVICES_KEY: &str = "devices";
pub const GROUPS_KEY: &str = "groups";
pub const HISTORY_KEY: &str = "connection_history";

/// Maximum number of history entries kept.
pub const HISTORY_LIMIT: usize = 100;

type Result<T> = std::result::Result<T, RegistryError>;

/// A known LED device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceRecord {
    /// Platform identifier, stable across sessions.
    pub id: String,
    /// User-facing name.
    pub name: String,
    /// Name the device advertised when first discovered.
    pub original_name: String,
    pub profile: DeviceProfile,
    pub auto_connect: bool,
    pub favorite: bool,
    pub group_id: Option<String>,
    pub last_connected: Option<DateTime<Utc>>,
    pub connection_count: u32,
    pub notes: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DeviceRecord {
    pub fn new(id: impl Into<String>, name: impl Into<String>, profile: DeviceProfile) -> Self {
        let name = name.into();
        let now = Utc::now();
        Self {
            id: id.into(),
            original_name: name.clone(),
            name,
            profile,
            auto_connect: true,
            favorite: false,
            group_id: None,
            last_connected: None,
            connection_count: 0,
            notes: String::new(),
            created_at: now,
            updated_at: now,
        }
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// A named set of devices, nested in a tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Group {
    pub id: String,
    pub name: String,
    pub parent_id: Option<String>,
    /// Depth in the tree; 0 for root groups. Derived from `parent_id`.
    pub level: u32,
    pub device_ids: Vec<String>,
    pub child_ids: Vec<String>,
    pub created_at: DateTime<Utc>,
}

/// How a connection attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HistoryOutcome {
    Connected,
    Disconnected,
    Failed,
}

impl HistoryOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Failed => "failed",
        }
    }
}

/// One line of connection history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionHistoryEntry {
    pub device_id: String,
    /// Device name at the time of the event.
    pub device_name: String,
    pub outcome: HistoryOutcome,
    pub timestamp: DateTime<Utc>,
}

/// Device, group and history bookkeeping over a [`KeyValueStore`].
pub struct DeviceRegistry {
    store: Arc<dyn KeyValueStore>,
    devices: RwLock<Vec<DeviceRecord>>,
    groups: RwLock<Vec<Group>>,
    history: RwLock<Vec<ConnectionHistoryEntry>>,
}

impl DeviceRegistry {
    /// Load all collections from the store. Missing keys start empty.
    pub fn load(store: Arc<dyn KeyValueStore>) -> Result<Self> {
        let devices: Vec<DeviceRecord> = load_key(store.as_ref(), DEVICES_KEY)?;
        let groups: Vec<Group> = load_key(store.as_ref(), GROUPS_KEY)?;
        let mut history: Vec<ConnectionHistoryEntry> = load_key(store.as_ref(), HISTORY_KEY)?;
        history.truncate(HISTORY_LIMIT);

        info!(
            "Loaded {} devices, {} groups, {} history entries",
            devices.len(),
            groups.len(),
            history.len()
        );

        Ok(Self {
            store,
            devices: RwLock::new(devices),
            groups: RwLock::new(groups),
            history: RwLock::new(history),
        })
    }

    fn persist<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let value = serde_json::to_value(value)
            .with_context(|| format!("Failed to serialize '{}'", key))?;
        self.store.set(key, &value)?;
        Ok(())
    }

    /// Apply `edit` to a copy of `slot` and keep the copy once it is stored.
    ///
    /// On any error `slot` is left as it was.
    fn commit<T, R>(
        &self,
        key: &str,
        slot: &mut Vec<T>,
        edit: impl FnOnce(&mut Vec<T>) -> Result<R>,
    ) -> Result<R>
    where
        T: Clone + Serialize,
    {
        let mut draft = slot.clone();
        let result = edit(&mut draft)?;
        self.persist(key, &draft)?;
        *slot = draft;
        Ok(result)
    }

    // Devices

    pub fn devices(&self) -> Vec<DeviceRecord> {
        self.devices.read().clone()
    }

    pub fn device(&self, id: &str) -> Option<DeviceRecord> {
        self.devices.read().iter().find(|d| d.id == id).cloned()
    }

    /// Add a new device. Returns `false` if the id is already known.
    pub fn add_device(&self, record: DeviceRecord) -> Result<bool> {
        let mut devices = self.devices.write();
        if devices.iter().any(|d| d.id == record.id) {
            warn!("Device {} already registered, not adding", record.id);
            return Ok(false);
        }

        let label = format!("{} ({})", record.name, record.id);
        self.commit(DEVICES_KEY, &mut *devices, |devices| {
            devices.push(record);
            Ok(())
        })?;
        info!("Registered device {}", label);
        Ok(true)
    }

    fn update_device<R>(&self, id: &str, f: impl FnOnce(&mut DeviceRecord) -> R) -> Result<R> {
        let mut devices = self.devices.write();
        self.commit(DEVICES_KEY, &mut *devices, |devices| {
            let device = devices
                .iter_mut()
                .find(|d| d.id == id)
                .ok_or_else(|| RegistryError::UnknownDevice(id.to_string()))?;
            let result = f(device);
            device.touch();
            Ok(result)
        })
    }

    pub fn rename_device(&self, id: &str, name: &str) -> Result<()> {
        let name = validate_name(name)?;
        self.update_device(id, |device| device.name = name)
    }

    pub fn set_protocol(&self, id: &str, profile: DeviceProfile) -> Result<()> {
        self.update_device(id, |device| device.profile = profile)
    }

    pub fn set_auto_connect(&self, id: &str, enabled: bool) -> Result<()> {
        self.update_device(id, |device| device.auto_connect = enabled)
    }

    /// Flip the favorite flag and return its new value.
    pub fn toggle_favorite(&self, id: &str) -> Result<bool> {
        self.update_device(id, |device| {
            device.favorite = !device.favorite;
            device.favorite
        })
    }

    pub fn set_notes(&self, id: &str, notes: &str) -> Result<()> {
        let notes = notes.to_string();
        self.update_device(id, |device| device.notes = notes)
    }

    /// Count a successful connection.
    pub fn record_connection(&self, id: &str) -> Result<()> {
        self.update_device(id, |device| {
            device.last_connected = Some(Utc::now());
            device.connection_count += 1;
        })
    }

    /// Remove a device once the user has confirmed.
    ///
    /// Without confirmation nothing changes and `false` is returned.
    pub fn delete_device(&self, id: &str, confirmed: bool) -> Result<bool> {
        if !confirmed {
            debug!("Delete of {} not confirmed", id);
            return Ok(false);
        }

        {
            let mut devices = self.devices.write();
            self.commit(DEVICES_KEY, &mut *devices, |devices| {
                let before = devices.len();
                devices.retain(|d| d.id != id);
                if devices.len() == before {
                    return Err(RegistryError::UnknownDevice(id.to_string()));
                }
                Ok(())
            })?;
        }

        let mut groups = self.groups.write();
        let grouped = groups
            .iter()
            .any(|group| group.device_ids.iter().any(|d| d == id));
        if grouped {
            self.commit(GROUPS_KEY, &mut *groups, |groups| {
                for group in groups.iter_mut() {
                    group.device_ids.retain(|d| d != id);
                }
                Ok(())
            })?;
        }

        info!("Deleted device {}", id);
        Ok(true)
    }

    pub fn favorites(&self) -> Vec<DeviceRecord> {
        self.devices.read().iter().filter(|d| d.favorite).cloned().collect()
    }

    /// Device to connect to at startup: auto-connect devices only,
    /// favorites first, then the most recently connected.
    pub fn auto_connect_candidate(&self) -> Option<DeviceRecord> {
        self.devices
            .read()
            .iter()
            .filter(|d| d.auto_connect)
            .max_by_key(|d| (d.favorite, d.last_connected))
            .cloned()
    }

    // Groups

    pub fn groups(&self) -> Vec<Group> {
        self.groups.read().clone()
    }

    pub fn group(&self, id: &str) -> Option<Group> {
        self.groups.read().iter().find(|g| g.id == id).cloned()
    }

    /// Create a group, optionally nested under `parent_id`.
    pub fn create_group(&self, name: &str, parent_id: Option<&str>) -> Result<Group> {
        let name = validate_name(name)?;
        let mut groups = self.groups.write();

        let level = match parent_id {
            Some(parent_id) => {
                let parent = groups
                    .iter()
                    .find(|g| g.id == parent_id)
                    .ok_or_else(|| RegistryError::UnknownGroup(parent_id.to_string()))?;
                parent.level + 1
            }
            None => 0,
        };

        let group = Group {
            id: Uuid::new_v4().to_string(),
            name,
            parent_id: parent_id.map(str::to_string),
            level,
            device_ids: Vec::new(),
            child_ids: Vec::new(),
            created_at: Utc::now(),
        };

        self.commit(GROUPS_KEY, &mut *groups, |groups| {
            if let Some(parent_id) = parent_id {
                if let Some(parent) = groups.iter_mut().find(|g| g.id == parent_id) {
                    parent.child_ids.push(group.id.clone());
                }
            }
            groups.push(group.clone());
            Ok(())
        })?;

        info!("Created group {} at level {}", group.name, group.level);
        Ok(group)
    }

    pub fn rename_group(&self, id: &str, name: &str) -> Result<()> {
        let name = validate_name(name)?;
        let mut groups = self.groups.write();
        self.commit(GROUPS_KEY, &mut *groups, |groups| {
            let group = groups
                .iter_mut()
                .find(|g| g.id == id)
                .ok_or_else(|| RegistryError::UnknownGroup(id.to_string()))?;
            group.name = name;
            Ok(())
        })
    }

    /// Re-parent a group. `None` makes it a root group.
    pub fn move_group(&self, id: &str, parent_id: Option<&str>) -> Result<()> {
        let mut groups = self.groups.write();
        if !groups.iter().any(|g| g.id == id) {
            return Err(RegistryError::UnknownGroup(id.to_string()));
        }
        if let Some(parent_id) = parent_id {
            if !groups.iter().any(|g| g.id == parent_id) {
                return Err(RegistryError::UnknownGroup(parent_id.to_string()));
            }
            if parent_id == id || is_descendant(&groups, parent_id, id) {
                return Err(RegistryError::GroupCycle(id.to_string()));
            }
        }

        self.commit(GROUPS_KEY, &mut *groups, |groups| {
            for group in groups.iter_mut() {
                group.child_ids.retain(|child| child != id);
                if Some(group.id.as_str()) == parent_id {
                    group.child_ids.push(id.to_string());
                }
                if group.id == id {
                    group.parent_id = parent_id.map(str::to_string);
                }
            }
            recompute_levels(groups);
            Ok(())
        })
    }

    /// Delete a group. Its devices become ungrouped and its child groups
    /// move up to the deleted group's parent.
    pub fn delete_group(&self, id: &str) -> Result<()> {
        let removed = {
            let mut groups = self.groups.write();
            self.commit(GROUPS_KEY, &mut *groups, |groups| {
                let index = groups
                    .iter()
                    .position(|g| g.id == id)
                    .ok_or_else(|| RegistryError::UnknownGroup(id.to_string()))?;
                let removed = groups.remove(index);

                for group in groups.iter_mut() {
                    if group.parent_id.as_deref() == Some(id) {
                        group.parent_id = removed.parent_id.clone();
                    }
                    if Some(&group.id) == removed.parent_id.as_ref() {
                        group.child_ids.retain(|child| child != id);
                        group.child_ids.extend(removed.child_ids.iter().cloned());
                    }
                }
                recompute_levels(groups);
                Ok(removed)
            })?
        };

        if !removed.device_ids.is_empty() {
            let mut devices = self.devices.write();
            self.commit(DEVICES_KEY, &mut *devices, |devices| {
                for device in devices.iter_mut() {
                    if device.group_id.as_deref() == Some(id) {
                        device.group_id = None;
                        device.touch();
                    }
                }
                Ok(())
            })?;
        }

        info!("Deleted group {}", removed.name);
        Ok(())
    }

    /// Put a device into a group, leaving any group it was in before.
    pub fn add_device_to_group(&self, device_id: &str, group_id: &str) -> Result<()> {
        let mut devices = self.devices.write();
        if !devices.iter().any(|d| d.id == device_id) {
            return Err(RegistryError::UnknownDevice(device_id.to_string()));
        }

        let mut groups = self.groups.write();
        if !groups.iter().any(|g| g.id == group_id) {
            return Err(RegistryError::UnknownGroup(group_id.to_string()));
        }

        self.commit(GROUPS_KEY, &mut *groups, |groups| {
            for group in groups.iter_mut() {
                group.device_ids.retain(|d| d != device_id);
                if group.id == group_id {
                    group.device_ids.push(device_id.to_string());
                }
            }
            Ok(())
        })?;
        self.commit(DEVICES_KEY, &mut *devices, |devices| {
            if let Some(device) = devices.iter_mut().find(|d| d.id == device_id) {
                device.group_id = Some(group_id.to_string());
                device.touch();
            }
            Ok(())
        })
    }

    pub fn remove_device_from_group(&self, device_id: &str) -> Result<()> {
        let mut devices = self.devices.write();
        if !devices.iter().any(|d| d.id == device_id) {
            return Err(RegistryError::UnknownDevice(device_id.to_string()));
        }

        let mut groups = self.groups.write();
        self.commit(GROUPS_KEY, &mut *groups, |groups| {
            for group in groups.iter_mut() {
                group.device_ids.retain(|d| d != device_id);
            }
            Ok(())
        })?;
        self.commit(DEVICES_KEY, &mut *devices, |devices| {
            if let Some(device) = devices.iter_mut().find(|d| d.id == device_id) {
                device.group_id = None;
                device.touch();
            }
            Ok(())
        })
    }

    pub fn devices_in_group(&self, group_id: &str) -> Result<Vec<DeviceRecord>> {
        let group = self
            .group(group_id)
            .ok_or_else(|| RegistryError::UnknownGroup(group_id.to_string()))?;
        let devices = self.devices.read();
        Ok(group
            .device_ids
            .iter()
            .filter_map(|id| devices.iter().find(|d| &d.id == id).cloned())
            .collect())
    }

    // History

    /// Newest first.
    pub fn history(&self) -> Vec<ConnectionHistoryEntry> {
        self.history.read().clone()
    }

    /// Prepend an entry, dropping the oldest beyond the limit.
    pub fn add_to_history(
        &self,
        device_id: &str,
        device_name: &str,
        outcome: HistoryOutcome,
    ) -> Result<()> {
        let entry = ConnectionHistoryEntry {
            device_id: device_id.to_string(),
            device_name: device_name.to_string(),
            outcome,
            timestamp: Utc::now(),
        };
        let mut history = self.history.write();
        self.commit(HISTORY_KEY, &mut *history, |history| {
            history.insert(0, entry);
            history.truncate(HISTORY_LIMIT);
            Ok(())
        })
    }

    pub fn clear_history(&self) -> Result<()> {
        let mut history = self.history.write();
        self.store.delete(HISTORY_KEY)?;
        history.clear();
        Ok(())
    }
}

fn load_key<T: DeserializeOwned + Default>(store: &dyn KeyValueStore, key: &str) -> Result<T> {
    match store.get(key)? {
        Some(value) => {
            let parsed = serde_json::from_value(value)
                .with_context(|| format!("Invalid data under '{}'", key))?;
            Ok(parsed)
        }
        None => Ok(T::default()),
    }
}

fn validate_name(name: &str) -> Result<String> {
    let name = name.trim();
    if name.is_empty() {
        return Err(RegistryError::EmptyName);
    }
    Ok(name.to_string())
}

/// Whether `candidate` sits somewhere below `ancestor`.
fn is_descendant(groups: &[Group], candidate: &str, ancestor: &str) -> bool {
    let mut current = groups
        .iter()
        .find(|g| g.id == candidate)
        .and_then(|g| g.parent_id.clone());
    let mut steps = 0;
    while let Some(id) = current {
        if id == ancestor {
            return true;
        }
        steps += 1;
        if steps > groups.len() {
            return false;
        }
        current = groups
            .iter()
            .find(|g| g.id == id)
            .and_then(|g| g.parent_id.clone());
    }
    false
}

fn recompute_levels(groups: &mut [Group]) {
    let levels: Vec<u32> = groups
        .iter()
        .map(|group| {
            let mut level = 0;
            let mut parent = group.parent_id.clone();
            while let Some(id) = parent {
                if level as usize >= groups.len() {
                    break;
                }
                level += 1;
                parent = groups
                    .iter()
                    .find(|g| g.id == id)
                    .and_then(|g| g.parent_id.clone());
            }
            level
        })
        .collect();

    for (group, level) in groups.iter_mut().zip(levels) {
        group.level = level;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::kv::{MemoryStore, SqliteStore};
    use tempfile::TempDir;

    fn registry() -> DeviceRegistry {
        DeviceRegistry::load(Arc::new(MemoryStore::new())).unwrap()
    }

    fn elk(id: &str) -> DeviceRecord {
        DeviceRecord::new(id, format!("ELK-BLEDOM-{}", id), DeviceProfile::ElkBledom)
    }

    #[test]
    fn test_add_device_rejects_duplicates() {
        let registry = registry();
        assert!(registry.add_device(elk("01")).unwrap());

        let mut renamed = elk("01");
        renamed.name = "Other".into();
        assert!(!registry.add_device(renamed).unwrap());
        assert_eq!(registry.devices().len(), 1);
        assert_eq!(registry.device("01").unwrap().name, "ELK-BLEDOM-01");
    }

    #[test]
    fn test_rename_device() {
        let registry = registry();
        registry.add_device(elk("01")).unwrap();

        registry.rename_device("01", "  Desk strip ").unwrap();
        let device = registry.device("01").unwrap();
        assert_eq!(device.name, "Desk strip");
        assert_eq!(device.original_name, "ELK-BLEDOM-01");

        assert!(matches!(
            registry.rename_device("01", "   "),
            Err(RegistryError::EmptyName)
        ));
        assert!(matches!(
            registry.rename_device("nope", "Name"),
            Err(RegistryError::UnknownDevice(_))
        ));
    }

    #[test]
    fn test_device_flags() {
        let registry = registry();
        registry.add_device(elk("01")).unwrap();

        assert!(registry.toggle_favorite("01").unwrap());
        assert!(!registry.toggle_favorite("01").unwrap());
        registry.set_auto_connect("01", false).unwrap();
        registry.set_protocol("01", DeviceProfile::Generic).unwrap();
        registry.set_notes("01", "behind the TV").unwrap();
        registry.record_connection("01").unwrap();
        registry.record_connection("01").unwrap();

        let device = registry.device("01").unwrap();
        assert!(!device.favorite);
        assert!(!device.auto_connect);
        assert_eq!(device.profile, DeviceProfile::Generic);
        assert_eq!(device.notes, "behind the TV");
        assert_eq!(device.connection_count, 2);
        assert!(device.last_connected.is_some());
    }

    #[test]
    fn test_delete_device_requires_confirmation() {
        let registry = registry();
        registry.add_device(elk("01")).unwrap();
        let group = registry.create_group("Desk", None).unwrap();
        registry.add_device_to_group("01", &group.id).unwrap();

        assert!(!registry.delete_device("01", false).unwrap());
        assert!(registry.device("01").is_some());

        assert!(registry.delete_device("01", true).unwrap());
        assert!(registry.device("01").is_none());
        assert!(registry.group(&group.id).unwrap().device_ids.is_empty());
    }

    #[test]
    fn test_nested_groups() {
        let registry = registry();
        let living = registry.create_group("Living Room", None).unwrap();
        let lamp = registry.create_group("Lamp", Some(&living.id)).unwrap();

        assert_eq!(living.level, 0);
        assert_eq!(lamp.level, 1);
        assert_eq!(registry.group(&living.id).unwrap().child_ids, vec![lamp.id]);
        assert!(matches!(
            registry.create_group("Bad", Some("missing")),
            Err(RegistryError::UnknownGroup(_))
        ));
    }

    #[test]
    fn test_single_group_membership() {
        let registry = registry();
        registry.add_device(elk("01")).unwrap();
        let g1 = registry.create_group("Kitchen", None).unwrap();
        let g2 = registry.create_group("Bedroom", None).unwrap();

        registry.add_device_to_group("01", &g1.id).unwrap();
        registry.add_device_to_group("01", &g2.id).unwrap();

        assert!(registry.group(&g1.id).unwrap().device_ids.is_empty());
        assert_eq!(registry.group(&g2.id).unwrap().device_ids, vec!["01"]);
        assert_eq!(registry.device("01").unwrap().group_id, Some(g2.id.clone()));

        registry.remove_device_from_group("01").unwrap();
        assert!(registry.group(&g2.id).unwrap().device_ids.is_empty());
        assert_eq!(registry.device("01").unwrap().group_id, None);
    }

    #[test]
    fn test_delete_group_orphans_and_reparents() {
        let registry = registry();
        registry.add_device(elk("01")).unwrap();
        let house = registry.create_group("House", None).unwrap();
        let floor = registry.create_group("Ground floor", Some(&house.id)).unwrap();
        let kitchen = registry.create_group("Kitchen", Some(&floor.id)).unwrap();
        registry.add_device_to_group("01", &floor.id).unwrap();

        registry.delete_group(&floor.id).unwrap();

        assert_eq!(registry.device("01").unwrap().group_id, None);
        let kitchen = registry.group(&kitchen.id).unwrap();
        assert_eq!(kitchen.parent_id.as_deref(), Some(house.id.as_str()));
        assert_eq!(kitchen.level, 1);
        assert_eq!(registry.group(&house.id).unwrap().child_ids, vec![kitchen.id]);
    }

    #[test]
    fn test_move_group() {
        let registry = registry();
        let a = registry.create_group("A", None).unwrap();
        let b = registry.create_group("B", Some(&a.id)).unwrap();
        let c = registry.create_group("C", Some(&b.id)).unwrap();

        assert!(matches!(
            registry.move_group(&a.id, Some(&c.id)),
            Err(RegistryError::GroupCycle(_))
        ));

        registry.move_group(&c.id, None).unwrap();
        assert_eq!(registry.group(&c.id).unwrap().level, 0);
        assert!(registry.group(&b.id).unwrap().child_ids.is_empty());

        registry.move_group(&a.id, Some(&c.id)).unwrap();
        assert_eq!(registry.group(&a.id).unwrap().level, 1);
        assert_eq!(registry.group(&b.id).unwrap().level, 2);
    }

    #[test]
    fn test_history_cap() {
        let registry = registry();
        for i in 0..150 {
            registry
                .add_to_history(&format!("{}", i), "ELK-BLEDOM", HistoryOutcome::Connected)
                .unwrap();
        }

        let history = registry.history();
        assert_eq!(history.len(), HISTORY_LIMIT);
        assert_eq!(history[0].device_id, "149");
        assert_eq!(history[99].device_id, "50");

        registry.clear_history().unwrap();
        assert!(registry.history().is_empty());
    }

    #[test]
    fn test_auto_connect_candidate() {
        let registry = registry();
        assert!(registry.auto_connect_candidate().is_none());

        registry.add_device(elk("01")).unwrap();
        registry.add_device(elk("02")).unwrap();
        registry.add_device(elk("03")).unwrap();
        registry.record_connection("01").unwrap();
        registry.record_connection("02").unwrap();
        assert_eq!(registry.auto_connect_candidate().unwrap().id, "02");

        registry.toggle_favorite("01").unwrap();
        assert_eq!(registry.auto_connect_candidate().unwrap().id, "01");

        registry.set_auto_connect("01", false).unwrap();
        assert_eq!(registry.auto_connect_candidate().unwrap().id, "02");
        assert_eq!(registry.favorites().len(), 1);
    }

    #[test]
    fn test_round_trip_through_sqlite() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let store = Arc::new(SqliteStore::new(dir.path())?);

        let registry = DeviceRegistry::load(store.clone())?;
        registry.add_device(elk("01"))?;
        registry.toggle_favorite("01")?;
        registry.set_notes("01", "shelf")?;
        registry.record_connection("01")?;
        let group = registry.create_group("Office", None)?;
        registry.add_device_to_group("01", &group.id)?;
        registry.add_to_history("01", "ELK-BLEDOM-01", HistoryOutcome::Failed)?;
        let saved = registry.device("01").unwrap();
        drop(registry);

        let reloaded = DeviceRegistry::load(store)?;
        assert_eq!(reloaded.device("01"), Some(saved));
        assert_eq!(reloaded.group(&group.id).unwrap().device_ids, vec!["01"]);
        assert_eq!(reloaded.history()[0].outcome, HistoryOutcome::Failed);
        Ok(())
    }

    /// Store whose writes can be switched off.
    #[derive(Default)]
    struct FlakyStore {
        inner: MemoryStore,
        failing: std::sync::atomic::AtomicBool,
    }

    impl FlakyStore {
        fn set_failing(&self, failing: bool) {
            self.failing
                .store(failing, std::sync::atomic::Ordering::SeqCst);
        }

        fn check(&self) -> anyhow::Result<()> {
            if self.failing.load(std::sync::atomic::Ordering::SeqCst) {
                anyhow::bail!("disk full");
            }
            Ok(())
        }
    }

    impl KeyValueStore for FlakyStore {
        fn get(&self, key: &str) -> anyhow::Result<Option<serde_json::Value>> {
            self.inner.get(key)
        }

        fn set(&self, key: &str, value: &serde_json::Value) -> anyhow::Result<()> {
            self.check()?;
            self.inner.set(key, value)
        }

        fn delete(&self, key: &str) -> anyhow::Result<()> {
            self.check()?;
            self.inner.delete(key)
        }
    }

    #[test]
    fn test_failed_write_leaves_memory_unchanged() {
        let store = Arc::new(FlakyStore::default());
        let registry = DeviceRegistry::load(store.clone()).unwrap();
        registry.add_device(elk("01")).unwrap();
        let house = registry.create_group("House", None).unwrap();
        registry
            .add_to_history("01", "ELK-BLEDOM-01", HistoryOutcome::Connected)
            .unwrap();

        store.set_failing(true);
        assert!(matches!(
            registry.rename_device("01", "Shelf"),
            Err(RegistryError::Storage(_))
        ));
        assert!(registry.add_device(elk("02")).is_err());
        assert!(registry.create_group("Garage", Some(&house.id)).is_err());
        assert!(registry.add_device_to_group("01", &house.id).is_err());
        assert!(registry.delete_group(&house.id).is_err());
        assert!(registry
            .add_to_history("01", "ELK-BLEDOM-01", HistoryOutcome::Failed)
            .is_err());
        assert!(registry.clear_history().is_err());

        assert_eq!(registry.device("01").unwrap().name, "ELK-BLEDOM-01");
        assert!(registry.device("01").unwrap().group_id.is_none());
        assert_eq!(registry.devices().len(), 1);
        assert_eq!(registry.groups().len(), 1);
        assert!(registry.group(&house.id).unwrap().child_ids.is_empty());
        assert!(registry.group(&house.id).unwrap().device_ids.is_empty());
        assert_eq!(registry.history().len(), 1);

        store.set_failing(false);
        registry.rename_device("01", "Shelf").unwrap();
        let reloaded = DeviceRegistry::load(store).unwrap();
        assert_eq!(reloaded.device("01").unwrap().name, "Shelf");
        assert_eq!(reloaded.groups().len(), 1);
        assert_eq!(reloaded.history().len(), 1);
    }
}
