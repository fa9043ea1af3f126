// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The remote surface of the hypervisor cluster, as consumed by the
//! reconciler.
//!
//! Implementations own the wire protocol, authentication and retries of
//! transient HTTP failures. Each method is one remote call; long-running
//! operations (clone, migrate, disk moves, power transitions) block until the
//! hypervisor's task completes or `timeout` elapses.

use crate::disk::DiskDescriptor;
use crate::disk::InterfaceKey;
use crate::disk::IoLimits;
use crate::types::AgentConfig;
use crate::types::AudioDevice;
use crate::types::Bios;
use crate::types::CloudInitConfig;
use crate::types::CpuConfig;
use crate::types::EntityAttributes;
use crate::types::EntityId;
use crate::types::EntityKind;
use crate::types::EntityRef;
use crate::types::EntityStatus;
use crate::types::MemoryConfig;
use crate::types::NetworkDevice;
use crate::types::ObservedConfig;
use std::collections::BTreeSet;
use std::future::Future;
use std::time::Duration;

/// Body of a `CreateEntity` call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CreateRequest {
    pub node: String,
    /// Left to the hypervisor when absent.
    pub id: Option<EntityId>,
    pub kind: EntityKind,
    pub attributes: EntityAttributes,
    pub disks: Vec<DiskDescriptor>,
}

/// Body of a `CloneEntity` call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CloneRequest {
    pub new_id: EntityId,
    pub target_node: String,
    pub target_datastore: Option<String>,
    pub full: bool,
    pub name: Option<String>,
}

/// Body of a `MigrateEntity` call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MigrateRequest {
    pub target_node: String,
    /// Live migration of a running entity.
    pub online: bool,
    pub with_local_disks: bool,
    pub target_datastore: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShutdownRequest {
    /// Power off immediately instead of asking the guest to shut down.
    pub force_stop: bool,
    pub timeout: Duration,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RebootRequest {
    pub timeout: Duration,
}

/// A single attribute assignment within an `UpdateEntity` call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AttributeChange {
    Name(Option<String>),
    Description(Option<String>),
    Tags(BTreeSet<String>),
    OnBoot(bool),
    Cpu(CpuConfig),
    Memory(MemoryConfig),
    Bios(Bios),
    Machine(Option<String>),
    BootOrder(Vec<String>),
    Agent(AgentConfig),
    /// `None` removes the device.
    NetworkDevice { key: String, device: Option<NetworkDevice> },
    SerialDevices(Vec<String>),
    Audio(Option<AudioDevice>),
    CloudInit(Option<CloudInitConfig>),
    DiskLimits { interface: InterfaceKey, limits: IoLimits },
    AttachDisk(DiskDescriptor),
}

/// Body of an `UpdateEntity` call: every change is applied at once.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct UpdatePatch {
    pub changes: Vec<AttributeChange>,
}

impl UpdatePatch {
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn push(&mut self, change: AttributeChange) {
        self.changes.push(change);
    }
}

pub trait HypervisorClient: Send + Sync + 'static {
    /// Reserve the next free entity ID in the cluster.
    fn next_entity_id(
        &self,
    ) -> impl Future<Output = anyhow::Result<EntityId>> + Send;

    fn create_entity(
        &self,
        request: &CreateRequest,
        timeout: Duration,
    ) -> impl Future<Output = anyhow::Result<EntityId>> + Send;

    fn clone_entity(
        &self,
        source: &EntityRef,
        request: &CloneRequest,
        timeout: Duration,
    ) -> impl Future<Output = anyhow::Result<()>> + Send;

    fn migrate_entity(
        &self,
        entity: &EntityRef,
        request: &MigrateRequest,
        timeout: Duration,
    ) -> impl Future<Output = anyhow::Result<()>> + Send;

    fn get_entity_config(
        &self,
        entity: &EntityRef,
    ) -> impl Future<Output = anyhow::Result<ObservedConfig>> + Send;

    fn get_entity_status(
        &self,
        entity: &EntityRef,
    ) -> impl Future<Output = anyhow::Result<EntityStatus>> + Send;

    fn update_entity(
        &self,
        entity: &EntityRef,
        patch: &UpdatePatch,
    ) -> impl Future<Output = anyhow::Result<()>> + Send;

    fn move_disk(
        &self,
        entity: &EntityRef,
        interface: &InterfaceKey,
        target_datastore: &str,
        timeout: Duration,
    ) -> impl Future<Output = anyhow::Result<()>> + Send;

    fn resize_disk(
        &self,
        entity: &EntityRef,
        interface: &InterfaceKey,
        size_gib: u64,
    ) -> impl Future<Output = anyhow::Result<()>> + Send;

    fn start_entity(
        &self,
        entity: &EntityRef,
        timeout: Duration,
    ) -> impl Future<Output = anyhow::Result<()>> + Send;

    /// Continue a paused entity.
    fn resume_entity(
        &self,
        entity: &EntityRef,
        timeout: Duration,
    ) -> impl Future<Output = anyhow::Result<()>> + Send;

    fn shutdown_entity(
        &self,
        entity: &EntityRef,
        request: &ShutdownRequest,
        timeout: Duration,
    ) -> impl Future<Output = anyhow::Result<()>> + Send;

    fn reboot_entity(
        &self,
        entity: &EntityRef,
        request: &RebootRequest,
        timeout: Duration,
    ) -> impl Future<Output = anyhow::Result<()>> + Send;

    fn delete_entity(
        &self,
        entity: &EntityRef,
    ) -> impl Future<Output = anyhow::Result<()>> + Send;

    /// Turn a stopped entity into a template. One-way.
    fn convert_to_template(
        &self,
        entity: &EntityRef,
    ) -> impl Future<Output = anyhow::Result<()>> + Send;

    fn get_datastore_shared_flag(
        &self,
        node: &str,
        datastore_id: &str,
    ) -> impl Future<Output = anyhow::Result<bool>> + Send;

    /// Whether a disk of a running entity of this kind can be moved without
    /// powering the entity off.
    fn supports_live_disk_move(&self, kind: EntityKind) -> bool {
        matches!(kind, EntityKind::VirtualMachine)
    }
}
