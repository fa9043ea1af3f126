// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Disk descriptors and the resolver that derives them from declared disks.

use crate::errors::Error;
use crate::types::DiskSpec;
use serde::Deserialize;
use serde::Serialize;
use std::collections::BTreeMap;
use std::collections::btree_map::Entry;
use std::fmt;
use std::str::FromStr;

/// Storage buses a disk may be attached on.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum BusPrefix {
    Efidisk,
    Sata,
    Scsi,
    Virtio,
}

impl BusPrefix {
    /// Highest device index the bus accepts.
    pub fn max_index(&self) -> u8 {
        match self {
            BusPrefix::Efidisk => 0,
            BusPrefix::Sata => 5,
            BusPrefix::Scsi => 30,
            BusPrefix::Virtio => 15,
        }
    }

    /// EFI variable stores have a fixed size and are never resized.
    pub fn is_resizable(&self) -> bool {
        !matches!(self, BusPrefix::Efidisk)
    }
}

/// A validated bus-and-index key such as `scsi0`.
///
/// Keys order lexically on their string form, so `scsi10` sorts before
/// `scsi2`. Everything that iterates disks relies on this order.
#[derive(
    Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(try_from = "String", into = "String")]
pub struct InterfaceKey {
    // Must stay the first field: the derived ordering is the lexical order
    // of the key.
    key: String,
    bus: BusPrefix,
}

impl InterfaceKey {
    pub fn as_str(&self) -> &str {
        &self.key
    }

    pub fn bus(&self) -> BusPrefix {
        self.bus
    }
}

impl FromStr for InterfaceKey {
    type Err = Error;

    fn from_str(key: &str) -> Result<Self, Self::Err> {
        let digits_at = key
            .find(|c: char| c.is_ascii_digit())
            .ok_or_else(|| Error::InvalidInterfaceKey { key: key.to_string() })?;
        let (prefix, index) = key.split_at(digits_at);
        let bus = BusPrefix::from_str(prefix).map_err(|_| {
            Error::UnsupportedBus {
                key: key.to_string(),
                prefix: prefix.to_string(),
            }
        })?;

        // Reject "scsi01" as well as non-numeric suffixes.
        let index = match index.parse::<u8>() {
            Ok(i) if i.to_string() == index => i,
            _ => {
                return Err(Error::InvalidInterfaceKey { key: key.to_string() })
            }
        };
        if index > bus.max_index() {
            return Err(Error::InvalidInterfaceKey { key: key.to_string() });
        }
        Ok(InterfaceKey { key: key.to_string(), bus })
    }
}

impl TryFrom<String> for InterfaceKey {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<InterfaceKey> for String {
    fn from(key: InterfaceKey) -> String {
        key.key
    }
}

impl fmt::Display for InterfaceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key)
    }
}

#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum DiskFormat {
    #[default]
    Raw,
    Qcow2,
    Vmdk,
}

/// Per-disk QoS limits. `None` means unlimited.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IoLimits {
    pub read_mbps: Option<u32>,
    pub write_mbps: Option<u32>,
    pub read_iops: Option<u32>,
    pub write_iops: Option<u32>,
}

/// Where a disk's contents live, or will live.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Volume {
    /// An existing volume, e.g. `local-lvm:vm-100-disk-0`.
    Allocated { path: String },
    /// A new empty volume the hypervisor will allocate on attach.
    ToAllocate,
    /// The volume is only known once the hypervisor has imported the file.
    ImportPending { file_id: String },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskDescriptor {
    pub interface: InterfaceKey,
    pub datastore_id: String,
    pub volume: Volume,
    pub size_gib: u64,
    pub format: DiskFormat,
    pub io_limits: IoLimits,
    /// Observed disks may exist unattached; declared disks are always
    /// attached.
    pub attached: bool,
}

impl DiskDescriptor {
    pub fn is_import_pending(&self) -> bool {
        matches!(self.volume, Volume::ImportPending { .. })
    }
}

/// Descriptors grouped by bus, each group ordered by interface key.
pub type DisksByBus = BTreeMap<BusPrefix, BTreeMap<InterfaceKey, DiskDescriptor>>;

/// Turn declared disks into per-bus storage descriptors.
///
/// Pure; fails only on structurally invalid interface keys.
pub fn resolve(desired: &[DiskSpec]) -> Result<DisksByBus, Error> {
    let mut by_bus = DisksByBus::new();

    for spec in desired {
        let interface: InterfaceKey = spec.interface.parse()?;
        let volume = match &spec.file_source {
            Some(file_id) => Volume::ImportPending { file_id: file_id.clone() },
            None => Volume::ToAllocate,
        };
        let descriptor = DiskDescriptor {
            interface: interface.clone(),
            datastore_id: spec.datastore_id.clone(),
            volume,
            size_gib: spec.size_gib,
            format: spec.format.unwrap_or_default(),
            io_limits: spec.io_limits.clone(),
            attached: true,
        };

        match by_bus.entry(interface.bus()).or_default().entry(interface) {
            Entry::Vacant(slot) => {
                slot.insert(descriptor);
            }
            Entry::Occupied(slot) => {
                return Err(Error::DuplicateInterface {
                    key: slot.key().clone(),
                });
            }
        }
    }

    Ok(by_bus)
}

/// Collapse a per-bus grouping into a single map ordered by interface key.
pub fn flatten(by_bus: &DisksByBus) -> BTreeMap<InterfaceKey, DiskDescriptor> {
    by_bus
        .values()
        .flat_map(|disks| disks.iter())
        .map(|(key, disk)| (key.clone(), disk.clone()))
        .collect()
}
