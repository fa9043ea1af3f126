// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Choosing how a clone reaches its target node.
//!
//! A clone API can generally only write directly onto another node when every
//! datastore involved is reachable from both nodes. Otherwise the clone is
//! made next to its source and then migrated, together with its local disks,
//! to the target node. The route is chosen once per clone.

use crate::client::HypervisorClient;
use crate::errors::Error;
use crate::errors::Phase;
use crate::types::EntityRef;
use slog::Logger;
use slog::debug;
use slog::info;
use std::collections::BTreeMap;

#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "kebab-case")]
pub enum CloneRoute {
    /// Source and target are the same node.
    Direct,
    /// Every source datastore is shared; clone straight onto the target.
    DirectCrossNode,
    /// Clone on the source node, then migrate with local disks.
    CloneThenMigrate,
}

/// Decide the clone route from already-known shared flags.
///
/// A datastore missing from `shared_flags` counts as not shared, since
/// cloning then migrating works for every kind of storage.
pub fn decide<S: AsRef<str>>(
    source_datastores: &[S],
    source_node: &str,
    target_node: &str,
    shared_flags: &BTreeMap<String, bool>,
) -> CloneRoute {
    if source_node == target_node {
        return CloneRoute::Direct;
    }
    let all_shared = source_datastores.iter().all(|datastore| {
        shared_flags.get(datastore.as_ref()).copied().unwrap_or(false)
    });
    if all_shared {
        CloneRoute::DirectCrossNode
    } else {
        CloneRoute::CloneThenMigrate
    }
}

/// Look up shared flags for the datastores used by `source` and decide the
/// route to `target_node`.
///
/// Any failed lookup aborts the decision: guessing wrong would either fail
/// the clone or strand it on the wrong node.
pub(crate) async fn choose_route<C: HypervisorClient>(
    client: &C,
    log: &Logger,
    source: &EntityRef,
    target_node: &str,
) -> Result<CloneRoute, Error> {
    if source.node == target_node {
        return Ok(CloneRoute::Direct);
    }

    let source_config = client
        .get_entity_config(source)
        .await
        .map_err(Error::remote(Phase::Clone, "get_entity_config"))?;
    let datastores =
        source_config.datastores().into_iter().collect::<Vec<_>>();

    let mut shared_flags = BTreeMap::new();
    for datastore in &datastores {
        let shared = client
            .get_datastore_shared_flag(&source.node, datastore)
            .await
            .map_err(|cause| Error::SharedStatusLookup {
                node: source.node.clone(),
                datastore: datastore.clone(),
                cause,
            })?;
        debug!(
            log, "datastore shared status";
            "datastore" => datastore,
            "shared" => shared,
        );
        shared_flags.insert(datastore.clone(), shared);
    }

    let route = decide(&datastores, &source.node, target_node, &shared_flags);
    info!(
        log, "chose clone route";
        "source" => %source,
        "target_node" => target_node,
        "route" => %route,
        "datastores" => ?datastores,
    );
    Ok(route)
}
