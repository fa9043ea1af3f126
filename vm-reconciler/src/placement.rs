// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Planning of disk moves, resizes and attachments.
//!
//! The planner compares the disks the hypervisor reports against the
//! declared disks and computes the smallest set of actions that brings the
//! former in line with the latter. It never shrinks and never deletes: a
//! smaller declared size and a disk missing from the declaration are both
//! errors that require the operator to revise the desired state.

use crate::disk::DiskDescriptor;
use crate::disk::InterfaceKey;
use crate::errors::Error;
use std::collections::BTreeMap;
use std::fmt;

/// What to do with a single disk.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ActionKind {
    /// Attach a new disk described by the descriptor.
    Create { descriptor: DiskDescriptor },
    /// Attach an existing volume the hypervisor reports as detached.
    Attach { descriptor: DiskDescriptor },
    /// Relocate the volume to another datastore, deleting the original on
    /// success.
    Move { target_datastore: String },
    /// Grow the volume.
    Resize { target_size_gib: u64 },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PlannedAction {
    pub interface: InterfaceKey,
    pub kind: ActionKind,
}

impl fmt::Display for PlannedAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            ActionKind::Create { descriptor } => write!(
                f,
                "create {} ({} GiB on {})",
                self.interface, descriptor.size_gib, descriptor.datastore_id
            ),
            ActionKind::Attach { descriptor } => write!(
                f,
                "attach {} (on {})",
                self.interface, descriptor.datastore_id
            ),
            ActionKind::Move { target_datastore } => {
                write!(f, "move {} -> {}", self.interface, target_datastore)
            }
            ActionKind::Resize { target_size_gib } => {
                write!(f, "resize {} -> {} GiB", self.interface, target_size_gib)
            }
        }
    }
}

/// Ordered disk actions for one reconciliation pass.
///
/// Actions follow the lexical order of the declared interface keys, and for
/// any one interface an `Attach` comes first and a `Move` always precedes
/// its `Resize`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MigrationPlan {
    actions: Vec<PlannedAction>,
}

impl MigrationPlan {
    pub fn actions(&self) -> &[PlannedAction] {
        &self.actions
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn has_moves(&self) -> bool {
        self.actions
            .iter()
            .any(|action| matches!(action.kind, ActionKind::Move { .. }))
    }
}

impl IntoIterator for MigrationPlan {
    type Item = PlannedAction;
    type IntoIter = std::vec::IntoIter<PlannedAction>;

    fn into_iter(self) -> Self::IntoIter {
        self.actions.into_iter()
    }
}

/// Compute the disk actions needed to take `observed` to `desired`.
pub fn plan(
    observed: &BTreeMap<InterfaceKey, DiskDescriptor>,
    desired: &BTreeMap<InterfaceKey, DiskDescriptor>,
) -> Result<MigrationPlan, Error> {
    // Refuse before planning anything else so that a missing declaration is
    // never mistaken for a no-op.
    if let Some(interface) =
        observed.keys().find(|interface| !desired.contains_key(*interface))
    {
        return Err(Error::DiskDeletionUnsupported {
            interface: interface.clone(),
        });
    }

    let mut actions = Vec::new();
    for (interface, want) in desired {
        let Some(have) = observed.get(interface) else {
            actions.push(PlannedAction {
                interface: interface.clone(),
                kind: ActionKind::Create { descriptor: want.clone() },
            });
            continue;
        };

        let resizable = interface.bus().is_resizable();
        if resizable && want.size_gib < have.size_gib {
            return Err(Error::DiskShrink {
                interface: interface.clone(),
                requested_gib: want.size_gib,
                current_gib: have.size_gib,
            });
        }

        // The detached volume keeps its contents; moves and resizes below
        // apply to it once it is back on the bus.
        if want.attached && !have.attached {
            actions.push(PlannedAction {
                interface: interface.clone(),
                kind: ActionKind::Attach {
                    descriptor: DiskDescriptor {
                        attached: true,
                        ..have.clone()
                    },
                },
            });
        }

        if want.datastore_id != have.datastore_id {
            actions.push(PlannedAction {
                interface: interface.clone(),
                kind: ActionKind::Move {
                    target_datastore: want.datastore_id.clone(),
                },
            });
        }
        if resizable && want.size_gib > have.size_gib {
            actions.push(PlannedAction {
                interface: interface.clone(),
                kind: ActionKind::Resize { target_size_gib: want.size_gib },
            });
        }
    }

    Ok(MigrationPlan { actions })
}
