// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Errors produced while reconciling an entity.

use crate::disk::InterfaceKey;
use crate::types::EntityId;
use crate::types::PowerStatus;

/// The phase of a reconciliation pass in which an error occurred.
///
/// Every failure reported to the caller names one of these so that it can
/// decide whether re-invoking the reconciliation is safe (it always is) or
/// whether the desired state must be revised first.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    strum::Display,
    strum::EnumIter,
)]
#[strum(serialize_all = "kebab-case")]
pub enum Phase {
    Read,
    Create,
    Clone,
    Migrate,
    Reconfigure,
    DiskPlacement,
    Power,
    Destroy,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("interface {key:?} uses unsupported bus prefix {prefix:?}")]
    UnsupportedBus { key: String, prefix: String },

    #[error("malformed or out-of-range interface key {key:?}")]
    InvalidInterfaceKey { key: String },

    #[error("interface {key} is declared more than once")]
    DuplicateInterface { key: InterfaceKey },

    #[error(
        "cannot shrink disk {interface} from {current_gib} GiB to \
         {requested_gib} GiB"
    )]
    DiskShrink { interface: InterfaceKey, requested_gib: u64, current_gib: u64 },

    #[error(
        "disk {interface} exists remotely but is not declared; \
         disks are never deleted implicitly"
    )]
    DiskDeletionUnsupported { interface: InterfaceKey },

    #[error(
        "device {key} exists remotely but is not declared; \
         devices are never deleted implicitly"
    )]
    DeviceDeletionUnsupported { key: String },

    #[error(
        "configuration of entity {entity} still locked ({lock}) after \
         {attempts} attempts"
    )]
    LockTimeout { entity: EntityId, attempts: u32, lock: String },

    #[error(
        "entity {entity} did not reach status {expected} after {attempts} \
         attempts (last observed: {last_observed})"
    )]
    StatusTimeout {
        entity: EntityId,
        expected: PowerStatus,
        last_observed: PowerStatus,
        attempts: u32,
    },

    #[error(
        "failed to determine whether datastore {datastore:?} on node \
         {node:?} is shared"
    )]
    SharedStatusLookup {
        node: String,
        datastore: String,
        #[source]
        cause: anyhow::Error,
    },

    #[error("{operation} failed during {phase} phase")]
    RemoteCall {
        phase: Phase,
        operation: &'static str,
        #[source]
        cause: anyhow::Error,
    },

    #[error(
        "entity {entity} lives on node {current:?} but is declared on \
         {desired:?}, and migration is not enabled"
    )]
    NodeChangeWithoutMigration {
        entity: EntityId,
        current: String,
        desired: String,
    },

    #[error("entity {entity} is a template and cannot be converted back")]
    TemplateReversal { entity: EntityId },

    #[error("reconciliation was cancelled")]
    Cancelled,
}

impl Error {
    pub(crate) fn remote(
        phase: Phase,
        operation: &'static str,
    ) -> impl FnOnce(anyhow::Error) -> Error {
        move |cause| Error::RemoteCall { phase, operation, cause }
    }

    /// Returns true if the error can only be resolved by revising the
    /// desired configuration, rather than by retrying later.
    pub fn requires_operator(&self) -> bool {
        match self {
            Error::UnsupportedBus { .. }
            | Error::InvalidInterfaceKey { .. }
            | Error::DuplicateInterface { .. }
            | Error::DiskShrink { .. }
            | Error::DiskDeletionUnsupported { .. }
            | Error::DeviceDeletionUnsupported { .. }
            | Error::NodeChangeWithoutMigration { .. }
            | Error::TemplateReversal { .. } => true,
            Error::LockTimeout { .. }
            | Error::StatusTimeout { .. }
            | Error::SharedStatusLookup { .. }
            | Error::RemoteCall { .. }
            | Error::Cancelled => false,
        }
    }
}

/// Terminal failure of a reconciliation pass.
///
/// Phases that completed before the failure are not rolled back.
#[derive(Debug, thiserror::Error)]
#[error("reconciliation failed during {phase} phase")]
pub struct ReconcileFailure {
    pub phase: Phase,
    /// The entity being reconciled, if one had been identified or created
    /// by the time of the failure.
    pub entity: Option<EntityId>,
    #[source]
    pub error: Error,
}
