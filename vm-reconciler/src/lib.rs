// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Reconciliation of virtual machines and containers on a hypervisor
//! cluster.
//!
//! Given the desired configuration of an entity and, if it already exists,
//! its last observed state, a [`Reconciler`] drives the cluster through
//! create or clone, attribute updates, disk placement and power transitions
//! until the remote state matches. The cluster itself is reached through an
//! implementation of [`HypervisorClient`].

pub mod client;
pub mod clone;
pub mod config;
pub mod disk;
pub mod errors;
mod lock;
pub mod placement;
pub mod poll;
pub mod power;
mod reconciler;
pub mod reconfigure;
pub mod types;

#[cfg(test)]
mod fakes;

pub use client::HypervisorClient;
pub use config::Config;
pub use errors::Error;
pub use errors::Phase;
pub use errors::ReconcileFailure;
pub use reconciler::DestroyOptions;
pub use reconciler::ReconcileState;
pub use reconciler::Reconciled;
pub use reconciler::ReconciliationResult;
pub use reconciler::Reconciler;
