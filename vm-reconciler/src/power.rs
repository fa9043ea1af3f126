// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Power state transitions with bounded waits for status convergence.

use crate::client::HypervisorClient;
use crate::client::RebootRequest;
use crate::client::ShutdownRequest;
use crate::errors::Error;
use crate::errors::Phase;
use crate::poll::CondCheckError;
use crate::poll::PollBudget;
use crate::poll::PollError;
use crate::poll::wait_for_condition;
use crate::types::EntityRef;
use crate::types::PowerStatus;
use slog::Logger;
use slog::debug;
use slog::info;
use slog::o;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Drives the power state of one entity.
///
/// Every operation blocks until the hypervisor reports the expected status.
/// An operation's timeout covers the remote call and the status wait
/// together: polling every `poll_interval` only spends what the call left.
pub struct PowerDriver<'a, C> {
    client: &'a C,
    log: Logger,
    entity: &'a EntityRef,
    phase: Phase,
    poll_interval: Duration,
    cancel: &'a CancellationToken,
}

impl<'a, C: HypervisorClient> PowerDriver<'a, C> {
    pub fn new(
        client: &'a C,
        log: &Logger,
        entity: &'a EntityRef,
        phase: Phase,
        poll_interval: Duration,
        cancel: &'a CancellationToken,
    ) -> Self {
        let log = log.new(o!("component" => "PowerDriver"));
        PowerDriver { client, log, entity, phase, poll_interval, cancel }
    }

    pub fn entity(&self) -> &EntityRef {
        self.entity
    }

    pub async fn start(&self, timeout: Duration) -> Result<(), Error> {
        info!(self.log, "starting entity"; "entity" => %self.entity);
        let deadline = Instant::now() + timeout;
        self.client
            .start_entity(self.entity, timeout)
            .await
            .map_err(Error::remote(self.phase, "start_entity"))?;
        self.await_until(PowerStatus::Running, deadline).await
    }

    /// Continue a paused entity.
    pub async fn resume(&self, timeout: Duration) -> Result<(), Error> {
        info!(self.log, "resuming entity"; "entity" => %self.entity);
        let deadline = Instant::now() + timeout;
        self.client
            .resume_entity(self.entity, timeout)
            .await
            .map_err(Error::remote(self.phase, "resume_entity"))?;
        self.await_until(PowerStatus::Running, deadline).await
    }

    /// Stop the entity. `force_stop` powers it off without waiting for the
    /// guest, which is what disk placement and teardown use so that an
    /// unresponsive guest cannot stall them.
    pub async fn shutdown(
        &self,
        force_stop: bool,
        timeout: Duration,
    ) -> Result<(), Error> {
        info!(
            self.log, "shutting down entity";
            "entity" => %self.entity,
            "force_stop" => force_stop,
        );
        let deadline = Instant::now() + timeout;
        let request = ShutdownRequest { force_stop, timeout };
        self.client
            .shutdown_entity(self.entity, &request, timeout)
            .await
            .map_err(Error::remote(self.phase, "shutdown_entity"))?;
        self.await_until(PowerStatus::Stopped, deadline).await
    }

    pub async fn reboot(&self, timeout: Duration) -> Result<(), Error> {
        info!(self.log, "rebooting entity"; "entity" => %self.entity);
        let deadline = Instant::now() + timeout;
        let request = RebootRequest { timeout };
        self.client
            .reboot_entity(self.entity, &request, timeout)
            .await
            .map_err(Error::remote(self.phase, "reboot_entity"))?;
        self.await_until(PowerStatus::Running, deadline).await
    }

    /// Poll for `target` with whatever time is left before `deadline`. At
    /// least one check is always made.
    async fn await_until(
        &self,
        target: PowerStatus,
        deadline: Instant,
    ) -> Result<(), Error> {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let budget = PollBudget::covering(remaining, self.poll_interval);
        self.await_status(target, budget.max_attempts, budget.interval).await
    }

    /// Poll until the entity reports `target`, at most `max_attempts` times.
    pub async fn await_status(
        &self,
        target: PowerStatus,
        max_attempts: u32,
        interval: Duration,
    ) -> Result<(), Error> {
        let budget = PollBudget { max_attempts, interval };
        let last_observed = Mutex::new(None::<PowerStatus>);

        let result = wait_for_condition(
            || async {
                let status = self
                    .client
                    .get_entity_status(self.entity)
                    .await
                    .map_err(Error::remote(self.phase, "get_entity_status"))?;
                *last_observed.lock().unwrap() = Some(status.status);
                if status.status == target {
                    Ok(())
                } else {
                    debug!(
                        self.log, "waiting for status";
                        "expected" => %target,
                        "observed" => %status.status,
                    );
                    Err(CondCheckError::NotYet)
                }
            },
            &budget,
            self.cancel,
        )
        .await;

        match result {
            Ok(()) => Ok(()),
            Err(PollError::TimedOut { attempts }) => {
                let last_observed = last_observed
                    .into_inner()
                    .unwrap()
                    .expect("timing out requires at least one observation");
                Err(Error::StatusTimeout {
                    entity: self.entity.id,
                    expected: target,
                    last_observed,
                    attempts,
                })
            }
            Err(PollError::Cancelled) => Err(Error::Cancelled),
            Err(PollError::PermanentError(error)) => Err(error),
        }
    }
}
