// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The reconciliation controller.
//!
//! A pass moves through a fixed sequence of states:
//!
//! ```text
//! Start -> {Creating | Cloning [-> Migrating] | Migrating}
//!       -> ConfigLockWait -> Reconfiguring -> DiskPlacement
//!       -> PowerTransition -> Done
//! ```
//!
//! Any state may fail, which ends the pass with a [`ReconcileFailure`] naming
//! the phase. Nothing already applied is rolled back, and nothing is retried:
//! every phase derives its work from freshly observed state, so the caller
//! can always re-invoke [`Reconciler::reconcile`] with the same desired
//! configuration.

use crate::client::AttributeChange;
use crate::client::CloneRequest;
use crate::client::CreateRequest;
use crate::client::HypervisorClient;
use crate::client::MigrateRequest;
use crate::client::UpdatePatch;
use crate::clone;
use crate::clone::CloneRoute;
use crate::config::Config;
use crate::disk;
use crate::disk::DiskDescriptor;
use crate::disk::InterfaceKey;
use crate::errors::Error;
use crate::errors::Phase;
use crate::errors::ReconcileFailure;
use crate::lock::wait_for_config_unlock;
use crate::placement;
use crate::placement::ActionKind;
use crate::placement::MigrationPlan;
use crate::poll::PollBudget;
use crate::power::PowerDriver;
use crate::reconfigure;
use crate::types::CloneSpec;
use crate::types::DesiredConfig;
use crate::types::EntityId;
use crate::types::EntityRef;
use crate::types::ObservedConfig;
use crate::types::PowerStatus;
use crate::types::Timeouts;
use display_error_chain::DisplayErrorChain;
use slog::Logger;
use slog::debug;
use slog::info;
use slog::o;
use slog::warn;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Outcome of [`Reconciler::reconcile`].
pub type ReconciliationResult = Result<Reconciled, ReconcileFailure>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "kebab-case")]
pub enum ReconcileState {
    Start,
    Creating,
    Cloning,
    Migrating,
    ConfigLockWait,
    Reconfiguring,
    DiskPlacement,
    PowerTransition,
    Done,
}

/// Report of a successful pass.
#[derive(Clone, Debug)]
pub struct Reconciled {
    /// Remote state at the end of the pass.
    pub observed: ObservedConfig,
    /// Set when the pass cloned the entity.
    pub clone_route: Option<CloneRoute>,
    /// Disk actions executed by the pass.
    pub plan: MigrationPlan,
    /// Changes that only take effect after a reboot were applied, but the
    /// reboot was left to the operator.
    pub reboot_pending: bool,
    pub states: Vec<ReconcileState>,
}

#[derive(Clone, Debug, Default)]
pub struct DestroyOptions {
    /// Overrides the reconciler's default timeouts for this teardown.
    pub timeouts: Option<Timeouts>,
}

/// Drives entities on a hypervisor cluster towards their desired
/// configuration.
///
/// The reconciler holds no per-entity state; distinct entities can be
/// reconciled concurrently from separate tasks sharing one reconciler.
pub struct Reconciler<C> {
    client: Arc<C>,
    log: Logger,
    defaults: Timeouts,
}

impl<C: HypervisorClient> Reconciler<C> {
    pub fn new(client: Arc<C>, log: &Logger, defaults: Timeouts) -> Self {
        let log = log.new(o!("component" => "Reconciler"));
        Reconciler { client, log, defaults }
    }

    pub fn from_config(client: Arc<C>, log: &Logger, config: &Config) -> Self {
        Self::new(client, log, config.timeouts.clone())
    }

    /// Run one reconciliation pass.
    ///
    /// `observed` is the last known remote state of the entity, or `None`
    /// if it does not exist yet, in which case it is created or cloned.
    pub async fn reconcile(
        &self,
        desired: &DesiredConfig,
        observed: Option<&ObservedConfig>,
        cancel: &CancellationToken,
    ) -> ReconciliationResult {
        let log = self.log.new(o!(
            "node" => desired.node.clone(),
            "desired_id" => desired.id.map(|id| id.0),
        ));
        let timeouts =
            desired.timeouts.clone().unwrap_or_else(|| self.defaults.clone());
        let mut pass = Pass {
            client: &*self.client,
            log,
            desired,
            timeouts,
            cancel,
            phase: Phase::Read,
            states: vec![ReconcileState::Start],
            entity_id: observed.map(|o| o.entity.id),
        };

        match pass.run(observed).await {
            Ok(reconciled) => Ok(reconciled),
            Err(error) => {
                warn!(
                    pass.log, "reconciliation failed";
                    "phase" => %pass.phase,
                    "error" => %DisplayErrorChain::new(&error),
                );
                Err(ReconcileFailure {
                    phase: pass.phase,
                    entity: pass.entity_id,
                    error,
                })
            }
        }
    }

    /// Fetch the current remote state of an entity.
    pub async fn read(
        &self,
        entity: &EntityRef,
    ) -> Result<ObservedConfig, Error> {
        self.client
            .get_entity_config(entity)
            .await
            .map_err(Error::remote(Phase::Read, "get_entity_config"))
    }

    /// Power the entity off if it is running or paused, then delete it.
    ///
    /// The stop is always forced: a guest that ignores shutdown requests
    /// must not stall teardown.
    pub async fn destroy(
        &self,
        entity: &EntityRef,
        options: &DestroyOptions,
        cancel: &CancellationToken,
    ) -> Result<(), ReconcileFailure> {
        let log = self.log.new(o!("entity" => entity.to_string()));
        let timeouts =
            options.timeouts.clone().unwrap_or_else(|| self.defaults.clone());

        let result = async {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let observed = self
                .client
                .get_entity_config(entity)
                .await
                .map_err(Error::remote(Phase::Destroy, "get_entity_config"))?;
            if observed.is_powered_on() && !observed.template {
                PowerDriver::new(
                    &*self.client,
                    &log,
                    entity,
                    Phase::Destroy,
                    timeouts.status_poll_interval(),
                    cancel,
                )
                .shutdown(true, timeouts.shutdown())
                .await?;
            }
            info!(log, "deleting entity");
            self.client
                .delete_entity(entity)
                .await
                .map_err(Error::remote(Phase::Destroy, "delete_entity"))
        }
        .await;

        result.map_err(|error| {
            warn!(
                log, "destroy failed";
                "error" => %DisplayErrorChain::new(&error),
            );
            ReconcileFailure {
                phase: Phase::Destroy,
                entity: Some(entity.id),
                error,
            }
        })
    }
}

/// State of a single reconciliation pass.
struct Pass<'a, C> {
    client: &'a C,
    log: Logger,
    desired: &'a DesiredConfig,
    timeouts: Timeouts,
    cancel: &'a CancellationToken,
    /// Phase reported if the pass fails now.
    phase: Phase,
    states: Vec<ReconcileState>,
    entity_id: Option<EntityId>,
}

impl<'a, C: HypervisorClient> Pass<'a, C> {
    fn enter(&mut self, state: ReconcileState, phase: Phase) {
        let from = self.states.last().copied().unwrap_or(ReconcileState::Start);
        info!(
            self.log, "state transition";
            "from" => %from,
            "to" => %state,
            "phase" => %phase,
        );
        self.states.push(state);
        self.phase = phase;
    }

    fn check_cancelled(&self) -> Result<(), Error> {
        if self.cancel.is_cancelled() { Err(Error::Cancelled) } else { Ok(()) }
    }

    async fn fetch(&self, entity: &EntityRef) -> Result<ObservedConfig, Error> {
        self.client
            .get_entity_config(entity)
            .await
            .map_err(Error::remote(self.phase, "get_entity_config"))
    }

    fn power<'b>(&'b self, entity: &'b EntityRef) -> PowerDriver<'b, C> {
        PowerDriver::new(
            self.client,
            &self.log,
            entity,
            self.phase,
            self.timeouts.status_poll_interval(),
            self.cancel,
        )
    }

    async fn wait_unlock(
        &mut self,
        entity: &EntityRef,
        phase: Phase,
    ) -> Result<(), Error> {
        self.enter(ReconcileState::ConfigLockWait, phase);
        let budget = PollBudget {
            max_attempts: self.timeouts.lock_wait_attempts.max(1),
            interval: self.timeouts.lock_wait_interval(),
        };
        wait_for_config_unlock(
            self.client,
            &self.log,
            entity,
            phase,
            &budget,
            self.cancel,
        )
        .await
    }

    async fn run(
        &mut self,
        observed: Option<&ObservedConfig>,
    ) -> Result<Reconciled, Error> {
        self.check_cancelled()?;

        // Malformed disk declarations are reported before anything remote
        // is touched.
        self.phase = Phase::DiskPlacement;
        let desired_disks = disk::flatten(&disk::resolve(&self.desired.disks)?);

        let mut clone_route = None;
        let (observed, baseline) = match observed {
            Some(observed) => {
                (self.prepare_existing(observed, &desired_disks).await?, false)
            }
            None => {
                let desired = self.desired;
                match &desired.clone {
                    Some(spec) => {
                        let (observed, route) = self.clone_from(spec).await?;
                        clone_route = Some(route);
                        // A clone inherits everything from its source, so
                        // every attribute is written once.
                        (observed, true)
                    }
                    None => (self.create(&desired_disks).await?, false),
                }
            }
        };
        let entity = observed.entity.clone();

        self.enter(ReconcileState::Reconfiguring, Phase::Reconfigure);
        self.check_cancelled()?;
        let reconfiguration = reconfigure::diff(
            &observed.attributes,
            &self.desired.attributes,
            &observed.disks,
            &desired_disks,
            baseline,
        )?;
        if reconfiguration.patch.is_empty() {
            debug!(self.log, "attributes already up to date");
        } else {
            info!(
                self.log, "updating attributes";
                "entity" => %entity,
                "changes" => reconfiguration.patch.changes.len(),
                "reboot_required" => reconfiguration.reboot_required,
            );
            self.client
                .update_entity(&entity, &reconfiguration.patch)
                .await
                .map_err(Error::remote(Phase::Reconfigure, "update_entity"))?;
        }
        let mut reboot_required = reconfiguration.reboot_required;

        self.enter(ReconcileState::DiskPlacement, Phase::DiskPlacement);
        self.check_cancelled()?;
        let plan = placement::plan(&observed.disks, &desired_disks)?;
        if self.place_disks(&entity, &observed, &plan).await? {
            reboot_required = false;
        }

        self.enter(ReconcileState::PowerTransition, Phase::Power);
        self.check_cancelled()?;
        let observed = self.fetch(&entity).await?;
        let reboot_pending =
            self.transition_power(&observed, reboot_required).await?;

        let observed = self.fetch(&entity).await?;
        self.enter(ReconcileState::Done, Phase::Power);
        info!(
            self.log, "reconciled";
            "entity" => %entity,
            "disk_actions" => plan.len(),
            "reboot_pending" => reboot_pending,
        );
        Ok(Reconciled {
            observed,
            clone_route,
            plan,
            reboot_pending,
            states: std::mem::take(&mut self.states),
        })
    }

    /// Refresh an existing entity, refuse desired states that cannot be
    /// reached, and move it to its declared node if allowed.
    async fn prepare_existing(
        &mut self,
        last_known: &ObservedConfig,
        desired_disks: &BTreeMap<InterfaceKey, DiskDescriptor>,
    ) -> Result<ObservedConfig, Error> {
        self.phase = Phase::Read;
        let observed = self.fetch(&last_known.entity).await?;
        let desired = self.desired;

        if observed.template && !desired.template {
            self.phase = Phase::Power;
            return Err(Error::TemplateReversal { entity: observed.entity.id });
        }

        // Both diffs are recomputed later against fresh state; running them
        // here keeps an unreachable desired state from being half applied.
        self.phase = Phase::DiskPlacement;
        placement::plan(&observed.disks, desired_disks)?;
        self.phase = Phase::Reconfigure;
        reconfigure::diff(
            &observed.attributes,
            &desired.attributes,
            &observed.disks,
            desired_disks,
            false,
        )?;

        if observed.entity.node == desired.node {
            return Ok(observed);
        }
        self.phase = Phase::Migrate;
        if !desired.migrate {
            return Err(Error::NodeChangeWithoutMigration {
                entity: observed.entity.id,
                current: observed.entity.node.clone(),
                desired: desired.node.clone(),
            });
        }
        let entity = self
            .migrate(&observed.entity, observed.is_running(), None)
            .await?;
        self.fetch(&entity).await
    }

    async fn create(
        &mut self,
        desired_disks: &BTreeMap<InterfaceKey, DiskDescriptor>,
    ) -> Result<ObservedConfig, Error> {
        self.enter(ReconcileState::Creating, Phase::Create);
        let desired = self.desired;
        // Disabled network devices are declared only to be removed; a new
        // entity never gets them.
        let mut attributes = desired.attributes.clone();
        attributes.network_devices.retain(|_, device| device.enabled);
        let request = CreateRequest {
            node: desired.node.clone(),
            id: desired.id,
            kind: desired.kind,
            attributes,
            disks: desired_disks.values().cloned().collect(),
        };
        let id = self
            .client
            .create_entity(&request, self.timeouts.create())
            .await
            .map_err(Error::remote(Phase::Create, "create_entity"))?;
        self.entity_id = Some(id);
        info!(self.log, "created entity"; "id" => %id);

        let entity = EntityRef::new(desired.node.clone(), id, desired.kind);
        self.wait_unlock(&entity, Phase::Create).await?;
        self.fetch(&entity).await
    }

    async fn clone_from(
        &mut self,
        spec: &CloneSpec,
    ) -> Result<(ObservedConfig, CloneRoute), Error> {
        self.enter(ReconcileState::Cloning, Phase::Clone);
        let desired = self.desired;
        let new_id = match desired.id {
            Some(id) => id,
            None => self
                .client
                .next_entity_id()
                .await
                .map_err(Error::remote(Phase::Clone, "next_entity_id"))?,
        };
        self.entity_id = Some(new_id);

        let source = EntityRef::new(
            spec.source_node.clone().unwrap_or_else(|| desired.node.clone()),
            spec.source_id,
            desired.kind,
        );
        let route =
            clone::choose_route(self.client, &self.log, &source, &desired.node)
                .await?;

        // When the clone has to be migrated, its datastore is chosen by the
        // migration instead.
        let (clone_node, clone_datastore) = match route {
            CloneRoute::CloneThenMigrate => (source.node.clone(), None),
            CloneRoute::Direct | CloneRoute::DirectCrossNode => {
                (desired.node.clone(), spec.datastore_id.clone())
            }
        };
        let request = CloneRequest {
            new_id,
            target_node: clone_node.clone(),
            target_datastore: clone_datastore,
            full: spec.full,
            name: desired.attributes.name.clone(),
        };
        info!(
            self.log, "cloning entity";
            "source" => %source,
            "new_id" => %new_id,
            "target_node" => &clone_node,
            "route" => %route,
        );
        self.client
            .clone_entity(&source, &request, self.timeouts.clone_timeout())
            .await
            .map_err(Error::remote(Phase::Clone, "clone_entity"))?;

        let mut entity = EntityRef::new(clone_node, new_id, desired.kind);
        self.wait_unlock(&entity, Phase::Clone).await?;

        if route == CloneRoute::CloneThenMigrate {
            entity =
                self.migrate(&entity, false, spec.datastore_id.clone()).await?;
        }
        let observed = self.fetch(&entity).await?;
        Ok((observed, route))
    }

    /// Migrate `entity` with its local disks to the declared node and wait
    /// for the migration lock to clear. Returns the entity's new address.
    async fn migrate(
        &mut self,
        entity: &EntityRef,
        online: bool,
        target_datastore: Option<String>,
    ) -> Result<EntityRef, Error> {
        self.enter(ReconcileState::Migrating, Phase::Migrate);
        self.check_cancelled()?;
        let target_node = self.desired.node.clone();
        let request = MigrateRequest {
            target_node: target_node.clone(),
            online,
            with_local_disks: true,
            target_datastore,
        };
        info!(
            self.log, "migrating entity";
            "entity" => %entity,
            "target_node" => &target_node,
            "online" => online,
        );
        self.client
            .migrate_entity(entity, &request, self.timeouts.migrate())
            .await
            .map_err(Error::remote(Phase::Migrate, "migrate_entity"))?;

        let entity = entity.on_node(target_node);
        self.wait_unlock(&entity, Phase::Migrate).await?;
        Ok(entity)
    }

    /// Execute `plan`. Returns true if the entity was stopped for the moves
    /// and started again, which also applies any pending cold changes.
    async fn place_disks(
        &self,
        entity: &EntityRef,
        observed: &ObservedConfig,
        plan: &MigrationPlan,
    ) -> Result<bool, Error> {
        if plan.is_empty() {
            debug!(self.log, "disks already in place");
            return Ok(false);
        }

        let stop_first = plan.has_moves()
            && observed.is_powered_on()
            && !self.client.supports_live_disk_move(entity.kind);
        let power = self.power(entity);
        if stop_first {
            info!(
                self.log, "stopping entity to move disks";
                "entity" => %entity,
                "kind" => %entity.kind,
            );
            power.shutdown(true, self.timeouts.shutdown()).await?;
        }

        for action in plan.actions() {
            self.check_cancelled()?;
            info!(self.log, "applying disk action"; "action" => %action);
            match &action.kind {
                ActionKind::Create { descriptor }
                | ActionKind::Attach { descriptor } => {
                    let mut patch = UpdatePatch::default();
                    patch.push(AttributeChange::AttachDisk(descriptor.clone()));
                    self.client
                        .update_entity(entity, &patch)
                        .await
                        .map_err(Error::remote(
                            Phase::DiskPlacement,
                            "update_entity",
                        ))?;
                }
                ActionKind::Move { target_datastore } => {
                    self.client
                        .move_disk(
                            entity,
                            &action.interface,
                            target_datastore,
                            self.timeouts.move_disk(),
                        )
                        .await
                        .map_err(Error::remote(
                            Phase::DiskPlacement,
                            "move_disk",
                        ))?;
                }
                ActionKind::Resize { target_size_gib } => {
                    self.client
                        .resize_disk(
                            entity,
                            &action.interface,
                            *target_size_gib,
                        )
                        .await
                        .map_err(Error::remote(
                            Phase::DiskPlacement,
                            "resize_disk",
                        ))?;
                }
            }
        }

        if stop_first && !self.desired.template {
            power.start(self.timeouts.start()).await?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Bring the power state and template flag in line. Returns true if a
    /// required reboot was deliberately skipped.
    async fn transition_power(
        &self,
        observed: &ObservedConfig,
        reboot_required: bool,
    ) -> Result<bool, Error> {
        let entity = &observed.entity;
        let desired = self.desired;
        let power = self.power(entity);

        if desired.template {
            if !observed.template {
                match observed.status {
                    PowerStatus::Running => {
                        power.shutdown(false, self.timeouts.shutdown()).await?
                    }
                    // A paused guest cannot act on a shutdown request.
                    PowerStatus::Paused => {
                        power.shutdown(true, self.timeouts.shutdown()).await?
                    }
                    PowerStatus::Stopped => {}
                }
                info!(self.log, "converting to template"; "entity" => %entity);
                self.client
                    .convert_to_template(entity)
                    .await
                    .map_err(Error::remote(
                        Phase::Power,
                        "convert_to_template",
                    ))?;
            }
            return Ok(false);
        }
        if observed.template {
            return Err(Error::TemplateReversal { entity: entity.id });
        }

        match (desired.started, observed.status) {
            (true, PowerStatus::Stopped) => {
                power.start(self.timeouts.start()).await?;
            }
            (true, PowerStatus::Paused) => {
                // Resuming keeps the guest's memory, so cold changes still
                // need the reboot.
                power.resume(self.timeouts.start()).await?;
                if reboot_required {
                    return self.reboot(&power).await;
                }
            }
            (false, PowerStatus::Running) => {
                power.shutdown(false, self.timeouts.shutdown()).await?;
            }
            (false, PowerStatus::Paused) => {
                power.shutdown(true, self.timeouts.shutdown()).await?;
            }
            (true, PowerStatus::Running) if reboot_required => {
                return self.reboot(&power).await;
            }
            _ => {
                debug!(self.log, "power state already as desired");
            }
        }
        Ok(false)
    }

    /// Reboot to apply cold changes unless the policy leaves that to the
    /// operator. Returns true if the reboot was skipped.
    async fn reboot(&self, power: &PowerDriver<'_, C>) -> Result<bool, Error> {
        if !self.desired.reboot_after_update {
            warn!(
                self.log,
                "changes applied that take effect after a reboot; \
                 reboot after update is disabled";
                "entity" => %power.entity(),
            );
            return Ok(true);
        }
        power.reboot(self.timeouts.reboot()).await?;
        Ok(false)
    }
}
