// SPDX-FileCopyrightText: 2025 Crewline Labs <dev@crewline.app>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Draining the mutation queue against the remote authority.
//!
//! One submission is in flight at a time; remote pushes for the submitted
//! entity are held back by the in-flight guard until its result is resolved.

use anyhow::{Context as _, bail};
use crewcommon::{
    api::{AuthToken, Mutation, SubmitRequest},
    time::TimeStamp,
};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    clients::process,
    conversations::messages::{ChatMessage, DeliveryStatus},
    jobs::Job,
    mutations::{MutationQueueEntry, backoff_delay},
    resolver::{SubmitResolution, resolve_submit},
    transport::{Transport, TransportError},
    utils::connection_ext::StoreExt,
};

use super::{OutboundServiceContext, OutboundServiceError};

impl<T: Transport + Sync + 'static> OutboundServiceContext<T> {
    pub(super) async fn drain_mutation_queue(
        &self,
        run_token: &CancellationToken,
    ) -> anyhow::Result<()> {
        // Used to identify entries locked by this drain cycle
        let task_id = Uuid::new_v4();
        loop {
            if run_token.is_cancelled() {
                return Ok(()); // the task is being stopped
            }

            let Some(token) = self.tokens.current_token() else {
                debug!("No auth token available; suspending queue drain");
                return Ok(());
            };

            let Some(entry) =
                MutationQueueEntry::dequeue(self.pool(), task_id, TimeStamp::now()).await?
            else {
                return Ok(());
            };
            debug!(mutation_id = %entry.id(), entity_id = %entry.target().id, "dequeued mutation");

            match self.submit_mutation(&entry, token).await {
                Ok(()) => {}
                Err(OutboundServiceError::Unauthenticated) => {
                    debug!("Token rejected mid-drain; mutation stays queued");
                    MutationQueueEntry::release(self.pool(), entry.id()).await?;
                    return Ok(());
                }
                Err(OutboundServiceError::Recoverable(error)) => {
                    let delay = backoff_delay(
                        self.config.backoff_base,
                        self.config.backoff_cap,
                        entry.attempts(),
                    );
                    warn!(%error, ?delay, "Failed to submit mutation; will retry later");
                    MutationQueueEntry::nack(self.pool(), entry.id(), delay, TimeStamp::now())
                        .await?;
                }
                Err(OutboundServiceError::Fatal(error)) => {
                    error!(%error, "Failed to submit mutation; dropping");
                    MutationQueueEntry::ack(self.pool(), entry.id()).await?;
                    return Err(error);
                }
            }
        }
    }

    async fn submit_mutation(
        &self,
        entry: &MutationQueueEntry,
        token: AuthToken,
    ) -> Result<(), OutboundServiceError> {
        self.in_flight.begin(entry.target().clone());
        let result = self.submit_and_resolve(entry, token).await;

        // Remote pushes held back during the submission apply now.
        for update in self.in_flight.finish() {
            if let Err(error) = process::apply_remote_update(self, update).await {
                error!(%error, "Failed to apply deferred remote update");
            }
        }

        result
    }

    async fn submit_and_resolve(
        &self,
        entry: &MutationQueueEntry,
        token: AuthToken,
    ) -> Result<(), OutboundServiceError> {
        let request = SubmitRequest {
            mutation_id: entry.id(),
            mutation: entry.mutation().clone(),
            token,
        };
        let response = match timeout(self.config.submit_timeout, self.transport.submit(request))
            .await
        {
            Ok(Ok(response)) => response,
            Ok(Err(TransportError::Unauthenticated)) => {
                return Err(OutboundServiceError::Unauthenticated);
            }
            Ok(Err(error)) => return Err(OutboundServiceError::recoverable(error)),
            Err(_elapsed) => {
                return Err(OutboundServiceError::recoverable(TransportError::Timeout));
            }
        };

        let resolution =
            resolve_submit(entry.mutation(), &response).map_err(OutboundServiceError::fatal)?;
        self.apply_resolution(entry, resolution)
            .await
            .map_err(OutboundServiceError::fatal)
    }

    /// Routes the authority's answer through the store: the entry is acked
    /// and the entity settles, all in one transaction.
    async fn apply_resolution(
        &self,
        entry: &MutationQueueEntry,
        resolution: SubmitResolution,
    ) -> anyhow::Result<()> {
        self.with_transaction_and_notifier(async |txn, notifier| {
            MutationQueueEntry::ack(txn.as_mut(), entry.id()).await?;

            match resolution {
                SubmitResolution::JobAcknowledged { snapshot } => {
                    let Some(mut job) = Job::load(txn.as_mut(), &snapshot.job_id).await? else {
                        warn!(job_id = %snapshot.job_id, "Acknowledged job is gone locally");
                        return Ok(());
                    };
                    let still_dirty =
                        MutationQueueEntry::has_pending_for_target(txn.as_mut(), entry.target())
                            .await?;
                    if still_dirty {
                        // Later mutations for this job are still queued; keep
                        // their optimistic state displayed and only advance
                        // the synced base.
                        job.absorb_remote(txn.as_mut(), notifier, &snapshot).await?;
                    } else {
                        job.acknowledge(txn.as_mut(), notifier, &snapshot).await?;
                    }
                }
                SubmitResolution::JobSuperseded { snapshot } => {
                    info!(job_id = %snapshot.job_id, status = %snapshot.status,
                        "Remote state superseded the local mutation");
                    if snapshot.status.is_terminal() {
                        let dropped =
                            MutationQueueEntry::delete_for_target(txn.as_mut(), entry.target())
                                .await?;
                        if dropped > 0 {
                            debug!(dropped, "Dropped queued mutations for terminal job");
                        }
                    }
                    match Job::load(txn.as_mut(), &snapshot.job_id).await? {
                        Some(mut job) => job.supersede(txn.as_mut(), notifier, &snapshot).await?,
                        None => {
                            Job::from_snapshot(snapshot)
                                .store(txn.as_mut(), notifier)
                                .await?;
                        }
                    }
                }
                SubmitResolution::JobRejected { reason } => {
                    let job_id = entry
                        .mutation()
                        .job_id()
                        .context("rejected job mutation has no job id")?;
                    warn!(%job_id, %reason, "Job mutation refused by authority");
                    if let Some(mut job) = Job::load(txn.as_mut(), job_id).await? {
                        job.roll_back(txn.as_mut(), notifier, reason).await?;
                        // Later queued intents for this job may have become
                        // illegal against the restored state.
                        crate::mutations::persistence::rebuild_job_projection(
                            txn.as_mut(),
                            notifier,
                            job_id,
                        )
                        .await?;
                    }
                }
                SubmitResolution::MessageConfirmed { confirmation } => {
                    ChatMessage::confirm(txn.as_mut(), notifier, &confirmation).await?;
                }
                SubmitResolution::MessageRejected { reason } => {
                    let Mutation::SendMessage(payload) = entry.mutation() else {
                        bail!("message rejection for a non-message mutation");
                    };
                    warn!(message_id = %payload.message_id, %reason,
                        "Message refused by authority");
                    if let Some(mut message) =
                        ChatMessage::load_by_client_key(txn.as_mut(), payload.message_id).await?
                    {
                        message
                            .set_status(txn.as_mut(), notifier, DeliveryStatus::Failed)
                            .await?;
                    }
                }
            }
            Ok(())
        })
        .await
    }
}
