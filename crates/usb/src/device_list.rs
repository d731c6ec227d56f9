//! Keeping a displayed device list in step with enumeration
//!
//! Each enumeration pass produces a fresh set of [`DeviceInfo`]. Rather than
//! replacing the whole list, [`DeviceList::update`] reports the individual
//! removals and insertions so a front end can animate or preserve selection.

use crate::id::{DeviceId, DeviceInfo};

/// One change applied by [`DeviceList::update`]
///
/// Indices refer to the list as it was at the moment the change was applied,
/// so replaying the changes in order reproduces the new list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListChange {
    Removed { index: usize, info: DeviceInfo },
    Inserted { index: usize, info: DeviceInfo },
}

/// Devices ordered by product name, case-insensitively
#[derive(Debug, Clone, Default)]
pub struct DeviceList {
    entries: Vec<DeviceInfo>,
}

impl DeviceList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> &[DeviceInfo] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&DeviceInfo> {
        self.entries.get(index)
    }

    pub fn position(&self, id: &DeviceId) -> Option<usize> {
        self.entries.iter().position(|info| &info.id == id)
    }

    /// Bring the list in line with a new enumeration result
    ///
    /// An entry is kept only if an identical [`DeviceInfo`] is still present.
    /// Vanished entries are removed scanning from the end, then new ones are
    /// inserted before the first entry whose product name sorts after theirs.
    /// Entries present in both sets are not touched.
    pub fn update(&mut self, current: &[DeviceInfo]) -> Vec<ListChange> {
        let mut changes = Vec::new();

        for index in (0..self.entries.len()).rev() {
            if !current.contains(&self.entries[index]) {
                let info = self.entries.remove(index);
                changes.push(ListChange::Removed { index, info });
            }
        }

        for info in current {
            if self.entries.contains(info) {
                continue;
            }
            let key = info.product.to_lowercase();
            let index = self
                .entries
                .iter()
                .position(|entry| key < entry.product.to_lowercase())
                .unwrap_or(self.entries.len());
            self.entries.insert(index, info.clone());
            changes.push(ListChange::Inserted {
                index,
                info: info.clone(),
            });
        }

        changes
    }
}
