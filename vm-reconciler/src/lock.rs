// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Waiting for the hypervisor's configuration lock on an entity to clear.
//!
//! Clones and migrations hold the lock after the API call itself returns;
//! mutating the entity before it clears fails remotely.

use crate::client::HypervisorClient;
use crate::errors::Error;
use crate::errors::Phase;
use crate::poll::CondCheckError;
use crate::poll::PollBudget;
use crate::poll::PollError;
use crate::poll::wait_for_condition;
use crate::types::EntityRef;
use slog::Logger;
use slog::debug;
use std::sync::Mutex;
use tokio_util::sync::CancellationToken;

pub(crate) async fn wait_for_config_unlock<C: HypervisorClient>(
    client: &C,
    log: &Logger,
    entity: &EntityRef,
    phase: Phase,
    budget: &PollBudget,
    cancel: &CancellationToken,
) -> Result<(), Error> {
    let last_lock = Mutex::new(None::<String>);

    let result = wait_for_condition(
        || async {
            let status = client
                .get_entity_status(entity)
                .await
                .map_err(Error::remote(phase, "get_entity_status"))?;
            match status.lock {
                None => Ok(()),
                Some(lock) => {
                    debug!(
                        log, "configuration still locked";
                        "entity" => %entity,
                        "lock" => &lock,
                    );
                    *last_lock.lock().unwrap() = Some(lock);
                    Err(CondCheckError::NotYet)
                }
            }
        },
        budget,
        cancel,
    )
    .await;

    match result {
        Ok(()) => Ok(()),
        Err(PollError::TimedOut { attempts }) => Err(Error::LockTimeout {
            entity: entity.id,
            attempts,
            lock: last_lock
                .into_inner()
                .unwrap()
                .unwrap_or_else(|| "unknown".to_string()),
        }),
        Err(PollError::Cancelled) => Err(Error::Cancelled),
        Err(PollError::PermanentError(error)) => Err(error),
    }
}
