// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Desired and observed configuration records for a reconciled entity.
//!
//! These are already validated and typed by the configuration store; nothing
//! in this module parses individual field formats.

use crate::disk::DiskDescriptor;
use crate::disk::DiskFormat;
use crate::disk::InterfaceKey;
use crate::disk::IoLimits;
use serde::Deserialize;
use serde::Serialize;
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;

/// Numeric identity of a virtual machine or container within the cluster.
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
)]
#[serde(transparent)]
pub struct EntityId(pub u32);

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
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
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum EntityKind {
    #[default]
    VirtualMachine,
    Container,
}

/// Everything needed to address an entity on the remote side.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityRef {
    pub node: String,
    pub id: EntityId,
    pub kind: EntityKind,
}

impl EntityRef {
    pub fn new(node: impl Into<String>, id: EntityId, kind: EntityKind) -> Self {
        Self { node: node.into(), id, kind }
    }

    /// The same entity, addressed on another node.
    pub fn on_node(&self, node: impl Into<String>) -> Self {
        Self { node: node.into(), ..self.clone() }
    }
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.node, self.id)
    }
}

/// Power status reported by the hypervisor.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum PowerStatus {
    Running,
    Stopped,
    Paused,
}

/// Status snapshot returned by `GetEntityStatus`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityStatus {
    pub status: PowerStatus,
    /// Name of the configuration lock currently held (e.g. "clone",
    /// "migrate"), if any.
    pub lock: Option<String>,
}

// Non-disk attributes.

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpuConfig {
    pub sockets: u16,
    pub cores: u16,
    pub cpu_type: String,
    /// Scheduler weight; hot-applied.
    pub units: u32,
}

impl Default for CpuConfig {
    fn default() -> Self {
        Self { sockets: 1, cores: 1, cpu_type: "qemu64".to_string(), units: 1024 }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryConfig {
    pub dedicated_mib: u64,
    /// Balloon target; hot-applied. Zero disables ballooning.
    pub floating_mib: u64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self { dedicated_mib: 512, floating_mib: 0 }
    }
}

#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Bios {
    #[default]
    Seabios,
    Ovmf,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentConfig {
    pub enabled: bool,
    pub trim: bool,
    pub kind: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self { enabled: false, trim: false, kind: "virtio".to_string() }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkDevice {
    pub bridge: String,
    pub model: String,
    pub mac_address: Option<String>,
    pub vlan_id: Option<u16>,
    pub firewall: bool,
    /// Megabytes per second; `None` means unlimited.
    pub rate_limit_mbps: Option<u32>,
    /// A declared device with `enabled = false` is removed remotely.
    #[serde(default = "default_true")]
    pub enabled: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioDevice {
    pub device: String,
    pub driver: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloudInitConfig {
    /// Datastore holding the generated cloud-init drive.
    pub datastore_id: String,
    /// Interface the drive is attached on, e.g. `ide2`.
    pub interface: String,
    pub user_account: Option<String>,
    pub ip_configs: Vec<String>,
    pub dns_servers: Vec<String>,
    pub user_data_file_id: Option<String>,
}

impl CloudInitConfig {
    /// True if `other` places the cloud-init drive somewhere else.
    pub fn drive_differs(&self, other: &CloudInitConfig) -> bool {
        self.datastore_id != other.datastore_id
            || self.interface != other.interface
    }
}

/// All non-disk attributes, applied in one batched update.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EntityAttributes {
    pub name: Option<String>,
    pub description: Option<String>,
    pub tags: BTreeSet<String>,
    pub on_boot: bool,
    pub cpu: CpuConfig,
    pub memory: MemoryConfig,
    pub bios: Bios,
    pub machine: Option<String>,
    pub boot_order: Vec<String>,
    pub agent: AgentConfig,
    /// Keyed by interface, e.g. `net0`.
    pub network_devices: BTreeMap<String, NetworkDevice>,
    pub serial_devices: Vec<String>,
    pub audio_device: Option<AudioDevice>,
    pub cloud_init: Option<CloudInitConfig>,
}

/// One declared disk.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskSpec {
    /// Bus and index, e.g. `scsi0`. Validated by the resolver.
    pub interface: String,
    pub datastore_id: String,
    pub size_gib: u64,
    #[serde(default)]
    pub format: Option<DiskFormat>,
    #[serde(default)]
    pub io_limits: IoLimits,
    /// File to import the disk contents from at creation time.
    #[serde(default)]
    pub file_source: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloneSpec {
    /// Node hosting the source; defaults to the target node.
    pub source_node: Option<String>,
    pub source_id: EntityId,
    /// Datastore for the clone's disks; defaults to the source's.
    pub datastore_id: Option<String>,
    /// Full copy rather than a linked clone.
    #[serde(default = "default_true")]
    pub full: bool,
}

fn default_true() -> bool {
    true
}

/// Per-phase timeout and retry budgets.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timeouts {
    pub create_secs: u64,
    pub clone_secs: u64,
    pub migrate_secs: u64,
    pub move_disk_secs: u64,
    pub start_secs: u64,
    pub shutdown_secs: u64,
    pub reboot_secs: u64,
    pub status_poll_interval_secs: u64,
    pub lock_wait_attempts: u32,
    pub lock_wait_interval_secs: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            create_secs: 1800,
            clone_secs: 1800,
            migrate_secs: 1800,
            move_disk_secs: 1800,
            start_secs: 1800,
            shutdown_secs: 1800,
            reboot_secs: 1800,
            status_poll_interval_secs: 1,
            lock_wait_attempts: 120,
            lock_wait_interval_secs: 5,
        }
    }
}

impl Timeouts {
    pub fn create(&self) -> Duration {
        Duration::from_secs(self.create_secs)
    }

    pub fn clone_timeout(&self) -> Duration {
        Duration::from_secs(self.clone_secs)
    }

    pub fn migrate(&self) -> Duration {
        Duration::from_secs(self.migrate_secs)
    }

    pub fn move_disk(&self) -> Duration {
        Duration::from_secs(self.move_disk_secs)
    }

    pub fn start(&self) -> Duration {
        Duration::from_secs(self.start_secs)
    }

    pub fn shutdown(&self) -> Duration {
        Duration::from_secs(self.shutdown_secs)
    }

    pub fn reboot(&self) -> Duration {
        Duration::from_secs(self.reboot_secs)
    }

    pub fn status_poll_interval(&self) -> Duration {
        Duration::from_secs(self.status_poll_interval_secs.max(1))
    }

    pub fn lock_wait_interval(&self) -> Duration {
        Duration::from_secs(self.lock_wait_interval_secs)
    }
}

/// The configuration an operator wants to exist remotely.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DesiredConfig {
    /// Assigned by the hypervisor when absent.
    #[serde(default)]
    pub id: Option<EntityId>,
    pub node: String,
    #[serde(default)]
    pub kind: EntityKind,
    #[serde(default)]
    pub attributes: EntityAttributes,
    #[serde(default)]
    pub disks: Vec<DiskSpec>,
    #[serde(default)]
    pub clone: Option<CloneSpec>,
    #[serde(default = "default_true")]
    pub started: bool,
    #[serde(default)]
    pub template: bool,
    /// Allow moving an existing entity to `node`.
    #[serde(default)]
    pub migrate: bool,
    #[serde(default = "default_true")]
    pub reboot_after_update: bool,
    /// Overrides the reconciler's default budgets.
    #[serde(default)]
    pub timeouts: Option<Timeouts>,
}

/// Snapshot of the remote state of an entity.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObservedConfig {
    pub entity: EntityRef,
    pub attributes: EntityAttributes,
    pub disks: BTreeMap<InterfaceKey, DiskDescriptor>,
    pub status: PowerStatus,
    pub lock: Option<String>,
    pub template: bool,
}

impl ObservedConfig {
    pub fn is_running(&self) -> bool {
        self.status == PowerStatus::Running
    }

    /// Running or paused. A paused guest still holds its disks and blocks
    /// deletion.
    pub fn is_powered_on(&self) -> bool {
        self.status != PowerStatus::Stopped
    }

    /// Distinct datastores backing this entity's disks, in sorted order.
    pub fn datastores(&self) -> BTreeSet<String> {
        self.disks.values().map(|d| d.datastore_id.clone()).collect()
    }
}
