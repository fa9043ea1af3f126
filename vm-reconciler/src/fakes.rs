// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! An in-memory hypervisor cluster for tests.
//!
//! The fake keeps one [`ObservedConfig`] per entity and applies every
//! mutating call to it, enforcing the constraints a real cluster would
//! (clones onto another node need shared storage, containers cannot move
//! disks while running, disks never shrink). Configuration locks and power
//! transitions take a configurable number of status polls to settle.

use crate::client::AttributeChange;
use crate::client::CloneRequest;
use crate::client::CreateRequest;
use crate::client::HypervisorClient;
use crate::client::MigrateRequest;
use crate::client::RebootRequest;
use crate::client::ShutdownRequest;
use crate::client::UpdatePatch;
use crate::disk::DiskDescriptor;
use crate::disk::DiskFormat;
use crate::disk::InterfaceKey;
use crate::disk::IoLimits;
use crate::disk::Volume;
use crate::types::EntityAttributes;
use crate::types::EntityId;
use crate::types::EntityRef;
use crate::types::EntityStatus;
use crate::types::ObservedConfig;
use crate::types::PowerStatus;
use anyhow::anyhow;
use anyhow::bail;
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::time::Duration;

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, strum::Display,
)]
pub enum Operation {
    NextEntityId,
    CreateEntity,
    CloneEntity,
    MigrateEntity,
    GetEntityConfig,
    GetEntityStatus,
    UpdateEntity,
    MoveDisk,
    ResizeDisk,
    StartEntity,
    ResumeEntity,
    ShutdownEntity,
    RebootEntity,
    DeleteEntity,
    ConvertToTemplate,
    GetDatastoreSharedFlag,
}

impl Operation {
    pub fn is_mutating(&self) -> bool {
        match self {
            Operation::NextEntityId
            | Operation::GetEntityConfig
            | Operation::GetEntityStatus
            | Operation::GetDatastoreSharedFlag => false,
            Operation::CreateEntity
            | Operation::CloneEntity
            | Operation::MigrateEntity
            | Operation::UpdateEntity
            | Operation::MoveDisk
            | Operation::ResizeDisk
            | Operation::StartEntity
            | Operation::ResumeEntity
            | Operation::ShutdownEntity
            | Operation::RebootEntity
            | Operation::DeleteEntity
            | Operation::ConvertToTemplate => true,
        }
    }
}

/// A recorded call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Call {
    NextEntityId,
    CreateEntity(CreateRequest),
    CloneEntity { source: EntityRef, request: CloneRequest },
    MigrateEntity { entity: EntityRef, request: MigrateRequest },
    GetEntityConfig(EntityRef),
    GetEntityStatus(EntityRef),
    UpdateEntity { entity: EntityRef, patch: UpdatePatch },
    MoveDisk { entity: EntityRef, interface: InterfaceKey, datastore: String },
    ResizeDisk { entity: EntityRef, interface: InterfaceKey, size_gib: u64 },
    StartEntity(EntityRef),
    ResumeEntity(EntityRef),
    ShutdownEntity { entity: EntityRef, request: ShutdownRequest },
    RebootEntity(EntityRef),
    DeleteEntity(EntityRef),
    ConvertToTemplate(EntityRef),
    GetDatastoreSharedFlag { node: String, datastore: String },
}

impl Call {
    pub fn operation(&self) -> Operation {
        match self {
            Call::NextEntityId => Operation::NextEntityId,
            Call::CreateEntity(_) => Operation::CreateEntity,
            Call::CloneEntity { .. } => Operation::CloneEntity,
            Call::MigrateEntity { .. } => Operation::MigrateEntity,
            Call::GetEntityConfig(_) => Operation::GetEntityConfig,
            Call::GetEntityStatus(_) => Operation::GetEntityStatus,
            Call::UpdateEntity { .. } => Operation::UpdateEntity,
            Call::MoveDisk { .. } => Operation::MoveDisk,
            Call::ResizeDisk { .. } => Operation::ResizeDisk,
            Call::StartEntity(_) => Operation::StartEntity,
            Call::ResumeEntity(_) => Operation::ResumeEntity,
            Call::ShutdownEntity { .. } => Operation::ShutdownEntity,
            Call::RebootEntity(_) => Operation::RebootEntity,
            Call::DeleteEntity(_) => Operation::DeleteEntity,
            Call::ConvertToTemplate(_) => Operation::ConvertToTemplate,
            Call::GetDatastoreSharedFlag { .. } => {
                Operation::GetDatastoreSharedFlag
            }
        }
    }
}

/// Builder for an [`ObservedConfig`] to seed the fake with.
pub struct ObservedBuilder {
    config: ObservedConfig,
}

impl ObservedBuilder {
    pub fn with_disk(
        mut self,
        interface: &str,
        datastore: &str,
        size_gib: u64,
    ) -> Self {
        let interface: InterfaceKey =
            interface.parse().expect("valid interface key");
        let disk = allocated_disk(
            self.config.entity.id,
            interface.clone(),
            datastore,
            size_gib,
            DiskFormat::Raw,
            IoLimits::default(),
        );
        self.config.disks.insert(interface, disk);
        self
    }

    /// A volume that exists on the entity but is not on any bus.
    pub fn with_detached_disk(
        self,
        interface: &str,
        datastore: &str,
        size_gib: u64,
    ) -> Self {
        let mut builder = self.with_disk(interface, datastore, size_gib);
        let interface: InterfaceKey =
            interface.parse().expect("valid interface key");
        if let Some(disk) = builder.config.disks.get_mut(&interface) {
            disk.attached = false;
        }
        builder
    }

    pub fn status(mut self, status: PowerStatus) -> Self {
        self.config.status = status;
        self
    }

    pub fn attributes(mut self, attributes: EntityAttributes) -> Self {
        self.config.attributes = attributes;
        self
    }

    pub fn build(self) -> ObservedConfig {
        self.config
    }
}

fn volume_path(
    id: EntityId,
    interface: &InterfaceKey,
    datastore: &str,
) -> String {
    format!("{datastore}:vm-{id}-disk-{interface}")
}

fn allocated_disk(
    id: EntityId,
    interface: InterfaceKey,
    datastore: &str,
    size_gib: u64,
    format: DiskFormat,
    io_limits: IoLimits,
) -> DiskDescriptor {
    DiskDescriptor {
        volume: Volume::Allocated {
            path: volume_path(id, &interface, datastore),
        },
        interface,
        datastore_id: datastore.to_string(),
        size_gib,
        format,
        io_limits,
        attached: true,
    }
}

#[derive(Debug)]
struct FakeEntity {
    config: ObservedConfig,
    /// Lock name and the number of status polls that still report it.
    lock: Option<(String, u32)>,
    /// Requested status and the number of status polls before it shows.
    pending_status: Option<(PowerStatus, u32)>,
    status_polls: u32,
    reboots: u32,
}

#[derive(Debug)]
struct Inner {
    entities: BTreeMap<EntityId, FakeEntity>,
    shared: BTreeMap<(String, String), bool>,
    next_id: u32,
    calls: Vec<Call>,
    failing: BTreeSet<Operation>,
    settle_polls: u32,
    lock_polls: u32,
    power_call_delay: Duration,
}

#[derive(Debug)]
pub struct FakeHypervisor {
    inner: Mutex<Inner>,
}

impl Default for FakeHypervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeHypervisor {
    pub fn new() -> FakeHypervisor {
        FakeHypervisor {
            inner: Mutex::new(Inner {
                entities: BTreeMap::new(),
                shared: BTreeMap::new(),
                next_id: 100,
                calls: Vec::new(),
                failing: BTreeSet::new(),
                settle_polls: 0,
                lock_polls: 1,
                power_call_delay: Duration::ZERO,
            }),
        }
    }

    pub fn observed(entity: &EntityRef) -> ObservedBuilder {
        ObservedBuilder {
            config: ObservedConfig {
                entity: entity.clone(),
                attributes: EntityAttributes::default(),
                disks: BTreeMap::new(),
                status: PowerStatus::Stopped,
                lock: None,
                template: false,
            },
        }
    }

    pub fn add_entity(&self, config: ObservedConfig) {
        let mut inner = self.inner.lock().unwrap();
        inner.entities.insert(
            config.entity.id,
            FakeEntity {
                config,
                lock: None,
                pending_status: None,
                status_polls: 0,
                reboots: 0,
            },
        );
    }

    pub fn set_shared(&self, node: &str, datastore: &str, shared: bool) {
        self.inner
            .lock()
            .unwrap()
            .shared
            .insert((node.to_string(), datastore.to_string()), shared);
    }

    /// Make the entity report `lock` for the next `polls` status polls.
    pub fn hold_lock(&self, id: EntityId, lock: &str, polls: u32) {
        let mut inner = self.inner.lock().unwrap();
        let entity = inner.entities.get_mut(&id).expect("entity exists");
        entity.lock = Some((lock.to_string(), polls));
    }

    /// Number of status polls a clone or migration holds the lock for.
    pub fn set_lock_polls(&self, polls: u32) {
        self.inner.lock().unwrap().lock_polls = polls;
    }

    /// Number of status polls before a power transition becomes visible.
    pub fn set_settle_polls(&self, polls: u32) {
        self.inner.lock().unwrap().settle_polls = polls;
    }

    /// Time each power call takes before the hypervisor accepts it.
    pub fn set_power_call_delay(&self, delay: Duration) {
        self.inner.lock().unwrap().power_call_delay = delay;
    }

    pub fn fail_on(&self, operation: Operation) {
        self.inner.lock().unwrap().failing.insert(operation);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.inner.lock().unwrap().calls.clone()
    }

    pub fn mutating_calls(&self) -> Vec<Call> {
        self.calls()
            .into_iter()
            .filter(|call| call.operation().is_mutating())
            .collect()
    }

    pub fn clear_calls(&self) {
        self.inner.lock().unwrap().calls.clear();
    }

    pub fn entity(&self, id: EntityId) -> Option<ObservedConfig> {
        self.inner.lock().unwrap().entities.get(&id).map(|e| e.config.clone())
    }

    pub fn status(&self, id: EntityId) -> PowerStatus {
        self.entity(id).expect("entity exists").status
    }

    pub fn status_polls(&self, id: EntityId) -> u32 {
        self.inner.lock().unwrap().entities[&id].status_polls
    }

    pub fn reboots(&self, id: EntityId) -> u32 {
        self.inner.lock().unwrap().entities[&id].reboots
    }

    pub fn shutdown_requests(&self) -> Vec<ShutdownRequest> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::ShutdownEntity { request, .. } => Some(request),
                _ => None,
            })
            .collect()
    }

    async fn power_call_delay(&self) {
        let delay = self.inner.lock().unwrap().power_call_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }

    fn record(&self, call: Call) -> anyhow::Result<MutexGuard<'_, Inner>> {
        let mut inner = self.inner.lock().unwrap();
        let operation = call.operation();
        inner.calls.push(call);
        if inner.failing.contains(&operation) {
            bail!("injected failure in {operation}");
        }
        Ok(inner)
    }
}

impl Inner {
    fn entity_mut(
        &mut self,
        entity: &EntityRef,
    ) -> anyhow::Result<&mut FakeEntity> {
        let found = self
            .entities
            .get_mut(&entity.id)
            .ok_or_else(|| anyhow!("no such entity {}", entity.id))?;
        if found.config.entity.node != entity.node {
            bail!(
                "entity {} is on node {}, not {}",
                entity.id,
                found.config.entity.node,
                entity.node
            );
        }
        Ok(found)
    }

    fn request_status(
        &mut self,
        entity: &EntityRef,
        status: PowerStatus,
    ) -> anyhow::Result<()> {
        let settle = self.settle_polls;
        let found = self.entity_mut(entity)?;
        if settle == 0 {
            found.config.status = status;
            found.pending_status = None;
        } else {
            found.pending_status = Some((status, settle));
        }
        Ok(())
    }
}

fn apply_change(config: &mut ObservedConfig, change: &AttributeChange) {
    let attrs = &mut config.attributes;
    match change {
        AttributeChange::Name(name) => attrs.name = name.clone(),
        AttributeChange::Description(d) => attrs.description = d.clone(),
        AttributeChange::Tags(tags) => attrs.tags = tags.clone(),
        AttributeChange::OnBoot(on_boot) => attrs.on_boot = *on_boot,
        AttributeChange::Cpu(cpu) => attrs.cpu = cpu.clone(),
        AttributeChange::Memory(memory) => attrs.memory = memory.clone(),
        AttributeChange::Bios(bios) => attrs.bios = *bios,
        AttributeChange::Machine(machine) => attrs.machine = machine.clone(),
        AttributeChange::BootOrder(order) => attrs.boot_order = order.clone(),
        AttributeChange::Agent(agent) => attrs.agent = agent.clone(),
        AttributeChange::NetworkDevice { key, device: Some(device) } => {
            attrs.network_devices.insert(key.clone(), device.clone());
        }
        AttributeChange::NetworkDevice { key, device: None } => {
            attrs.network_devices.remove(key);
        }
        AttributeChange::SerialDevices(serial) => {
            attrs.serial_devices = serial.clone()
        }
        AttributeChange::Audio(audio) => attrs.audio_device = audio.clone(),
        AttributeChange::CloudInit(ci) => attrs.cloud_init = ci.clone(),
        AttributeChange::DiskLimits { interface, limits } => {
            if let Some(disk) = config.disks.get_mut(interface) {
                disk.io_limits = limits.clone();
            }
        }
        AttributeChange::AttachDisk(descriptor) => {
            let disk = allocated_disk(
                config.entity.id,
                descriptor.interface.clone(),
                &descriptor.datastore_id,
                descriptor.size_gib,
                descriptor.format,
                descriptor.io_limits.clone(),
            );
            config.disks.insert(descriptor.interface.clone(), disk);
        }
    }
}

impl HypervisorClient for FakeHypervisor {
    async fn next_entity_id(&self) -> anyhow::Result<EntityId> {
        let mut inner = self.record(Call::NextEntityId)?;
        while inner.entities.contains_key(&EntityId(inner.next_id)) {
            inner.next_id += 1;
        }
        Ok(EntityId(inner.next_id))
    }

    async fn create_entity(
        &self,
        request: &CreateRequest,
        _timeout: Duration,
    ) -> anyhow::Result<EntityId> {
        let mut inner = self.record(Call::CreateEntity(request.clone()))?;
        let id = match request.id {
            Some(id) => id,
            None => {
                while inner.entities.contains_key(&EntityId(inner.next_id)) {
                    inner.next_id += 1;
                }
                EntityId(inner.next_id)
            }
        };
        if inner.entities.contains_key(&id) {
            bail!("entity {id} already exists");
        }

        let entity = EntityRef::new(request.node.clone(), id, request.kind);
        let mut config = FakeHypervisor::observed(&entity)
            .attributes(request.attributes.clone())
            .build();
        for disk in &request.disks {
            let attach = AttributeChange::AttachDisk(disk.clone());
            apply_change(&mut config, &attach);
        }
        inner.entities.insert(
            id,
            FakeEntity {
                config,
                lock: None,
                pending_status: None,
                status_polls: 0,
                reboots: 0,
            },
        );
        Ok(id)
    }

    async fn clone_entity(
        &self,
        source: &EntityRef,
        request: &CloneRequest,
        _timeout: Duration,
    ) -> anyhow::Result<()> {
        let mut inner = self.record(Call::CloneEntity {
            source: source.clone(),
            request: request.clone(),
        })?;
        if inner.entities.contains_key(&request.new_id) {
            bail!("entity {} already exists", request.new_id);
        }
        let source_config = inner.entity_mut(source)?.config.clone();

        if request.target_node != source.node {
            for datastore in source_config.datastores() {
                let key = (source.node.clone(), datastore.clone());
                if !inner.shared.get(&key).copied().unwrap_or(false) {
                    bail!(
                        "cannot clone onto node {}: datastore {} is not shared",
                        request.target_node,
                        datastore
                    );
                }
            }
        }

        let entity = EntityRef::new(
            request.target_node.clone(),
            request.new_id,
            source.kind,
        );
        let mut config = source_config;
        config.entity = entity;
        config.status = PowerStatus::Stopped;
        config.template = false;
        if request.name.is_some() {
            config.attributes.name = request.name.clone();
        }
        for disk in config.disks.values_mut() {
            if let Some(datastore) = &request.target_datastore {
                disk.datastore_id = datastore.clone();
            }
            disk.volume = Volume::Allocated {
                path: volume_path(
                    request.new_id,
                    &disk.interface,
                    &disk.datastore_id,
                ),
            };
        }

        let lock_polls = inner.lock_polls;
        inner.entities.insert(
            request.new_id,
            FakeEntity {
                config,
                lock: Some(("clone".to_string(), lock_polls)),
                pending_status: None,
                status_polls: 0,
                reboots: 0,
            },
        );
        Ok(())
    }

    async fn migrate_entity(
        &self,
        entity: &EntityRef,
        request: &MigrateRequest,
        _timeout: Duration,
    ) -> anyhow::Result<()> {
        let mut inner = self.record(Call::MigrateEntity {
            entity: entity.clone(),
            request: request.clone(),
        })?;
        let lock_polls = inner.lock_polls;
        let found = inner.entity_mut(entity)?;
        if found.config.status == PowerStatus::Running && !request.online {
            bail!("entity {} is running; offline migration refused", entity.id);
        }
        found.config.entity.node = request.target_node.clone();
        for disk in found.config.disks.values_mut() {
            if let Some(datastore) = &request.target_datastore {
                disk.datastore_id = datastore.clone();
                disk.volume = Volume::Allocated {
                    path: volume_path(entity.id, &disk.interface, datastore),
                };
            }
        }
        found.lock = Some(("migrate".to_string(), lock_polls));
        Ok(())
    }

    async fn get_entity_config(
        &self,
        entity: &EntityRef,
    ) -> anyhow::Result<ObservedConfig> {
        let mut inner = self.record(Call::GetEntityConfig(entity.clone()))?;
        let found = inner.entity_mut(entity)?;
        let mut config = found.config.clone();
        config.lock = found.lock.as_ref().map(|(name, _)| name.clone());
        Ok(config)
    }

    async fn get_entity_status(
        &self,
        entity: &EntityRef,
    ) -> anyhow::Result<EntityStatus> {
        let mut inner = self.record(Call::GetEntityStatus(entity.clone()))?;
        let found = inner.entity_mut(entity)?;
        found.status_polls += 1;

        let lock = match found.lock.take() {
            Some((_, 0)) => None,
            Some((name, polls)) => {
                found.lock = Some((name.clone(), polls - 1));
                Some(name)
            }
            None => None,
        };

        match found.pending_status.take() {
            Some((status, 0)) => found.config.status = status,
            Some((status, polls)) => {
                found.pending_status = Some((status, polls - 1))
            }
            None => {}
        }

        Ok(EntityStatus { status: found.config.status, lock })
    }

    async fn update_entity(
        &self,
        entity: &EntityRef,
        patch: &UpdatePatch,
    ) -> anyhow::Result<()> {
        let mut inner = self.record(Call::UpdateEntity {
            entity: entity.clone(),
            patch: patch.clone(),
        })?;
        let found = inner.entity_mut(entity)?;
        if found.lock.is_some() {
            bail!("entity {} configuration is locked", entity.id);
        }
        for change in &patch.changes {
            apply_change(&mut found.config, change);
        }
        Ok(())
    }

    async fn move_disk(
        &self,
        entity: &EntityRef,
        interface: &InterfaceKey,
        target_datastore: &str,
        _timeout: Duration,
    ) -> anyhow::Result<()> {
        let live_move = self.supports_live_disk_move(entity.kind);
        let mut inner = self.record(Call::MoveDisk {
            entity: entity.clone(),
            interface: interface.clone(),
            datastore: target_datastore.to_string(),
        })?;
        let found = inner.entity_mut(entity)?;
        if found.config.status == PowerStatus::Running && !live_move {
            bail!("cannot move disk {interface} of a running {}", entity.kind);
        }
        let disk = found
            .config
            .disks
            .get_mut(interface)
            .ok_or_else(|| anyhow!("no disk {interface}"))?;
        disk.datastore_id = target_datastore.to_string();
        disk.volume = Volume::Allocated {
            path: volume_path(entity.id, interface, target_datastore),
        };
        Ok(())
    }

    async fn resize_disk(
        &self,
        entity: &EntityRef,
        interface: &InterfaceKey,
        size_gib: u64,
    ) -> anyhow::Result<()> {
        let mut inner = self.record(Call::ResizeDisk {
            entity: entity.clone(),
            interface: interface.clone(),
            size_gib,
        })?;
        let found = inner.entity_mut(entity)?;
        let disk = found
            .config
            .disks
            .get_mut(interface)
            .ok_or_else(|| anyhow!("no disk {interface}"))?;
        if size_gib < disk.size_gib {
            bail!("cannot shrink {interface}");
        }
        disk.size_gib = size_gib;
        Ok(())
    }

    async fn start_entity(
        &self,
        entity: &EntityRef,
        _timeout: Duration,
    ) -> anyhow::Result<()> {
        self.power_call_delay().await;
        let mut inner = self.record(Call::StartEntity(entity.clone()))?;
        if inner.entity_mut(entity)?.config.template {
            bail!("cannot start template {}", entity.id);
        }
        inner.request_status(entity, PowerStatus::Running)
    }

    async fn resume_entity(
        &self,
        entity: &EntityRef,
        _timeout: Duration,
    ) -> anyhow::Result<()> {
        self.power_call_delay().await;
        let mut inner = self.record(Call::ResumeEntity(entity.clone()))?;
        if inner.entity_mut(entity)?.config.status != PowerStatus::Paused {
            bail!("entity {} is not paused", entity.id);
        }
        inner.request_status(entity, PowerStatus::Running)
    }

    async fn shutdown_entity(
        &self,
        entity: &EntityRef,
        request: &ShutdownRequest,
        _timeout: Duration,
    ) -> anyhow::Result<()> {
        self.power_call_delay().await;
        let mut inner = self.record(Call::ShutdownEntity {
            entity: entity.clone(),
            request: request.clone(),
        })?;
        inner.request_status(entity, PowerStatus::Stopped)
    }

    async fn reboot_entity(
        &self,
        entity: &EntityRef,
        _request: &RebootRequest,
        _timeout: Duration,
    ) -> anyhow::Result<()> {
        self.power_call_delay().await;
        let mut inner = self.record(Call::RebootEntity(entity.clone()))?;
        let found = inner.entity_mut(entity)?;
        if found.config.status != PowerStatus::Running {
            bail!("cannot reboot entity {} that is not running", entity.id);
        }
        found.reboots += 1;
        Ok(())
    }

    async fn delete_entity(&self, entity: &EntityRef) -> anyhow::Result<()> {
        let mut inner = self.record(Call::DeleteEntity(entity.clone()))?;
        if inner.entity_mut(entity)?.config.status != PowerStatus::Stopped {
            bail!("cannot delete entity {} before it is stopped", entity.id);
        }
        inner.entities.remove(&entity.id);
        Ok(())
    }

    async fn convert_to_template(
        &self,
        entity: &EntityRef,
    ) -> anyhow::Result<()> {
        let mut inner = self.record(Call::ConvertToTemplate(entity.clone()))?;
        let found = inner.entity_mut(entity)?;
        if found.config.status != PowerStatus::Stopped {
            bail!("entity {} must be stopped to become a template", entity.id);
        }
        found.config.template = true;
        Ok(())
    }

    async fn get_datastore_shared_flag(
        &self,
        node: &str,
        datastore_id: &str,
    ) -> anyhow::Result<bool> {
        let inner = self.record(Call::GetDatastoreSharedFlag {
            node: node.to_string(),
            datastore: datastore_id.to_string(),
        })?;
        inner
            .shared
            .get(&(node.to_string(), datastore_id.to_string()))
            .copied()
            .ok_or_else(|| {
                anyhow!("unknown datastore {datastore_id} on {node}")
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::EntityKind;

    #[tokio::test]
    async fn clone_requires_shared_storage_across_nodes() {
        let hypervisor = FakeHypervisor::new();
        let source =
            EntityRef::new("a", EntityId(9000), EntityKind::VirtualMachine);
        hypervisor.add_entity(
            FakeHypervisor::observed(&source)
                .with_disk("scsi0", "local", 8)
                .build(),
        );
        let request = CloneRequest {
            new_id: EntityId(101),
            target_node: "b".to_string(),
            target_datastore: None,
            full: true,
            name: None,
        };
        let timeout = Duration::from_secs(60);

        let refused = hypervisor.clone_entity(&source, &request, timeout).await;
        assert!(refused.is_err());
        hypervisor.set_shared("a", "local", true);
        hypervisor.clone_entity(&source, &request, timeout).await.unwrap();
        let clone = hypervisor.entity(EntityId(101)).unwrap();
        assert_eq!(clone.entity.node, "b");
        assert_eq!(
            clone.disks.values().next().unwrap().volume,
            Volume::Allocated { path: "local:vm-101-disk-scsi0".to_string() }
        );
    }
}
