// SPDX-FileCopyrightText: 2025 Crewline Labs <dev@crewline.app>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Application of remote-push events to the local store.
//!
//! Pushes for an entity with an in-flight submission are deferred by the
//! in-flight guard and applied right after the submission resolves; the
//! paths below are also reused for those deferred updates.

use anyhow::Context as _;
use crewcommon::api::{
    EntityKind, JobSnapshot, MessageConfirmation, MutationTarget, RemoteMessage, RemoteUpdate,
};
use tracing::{debug, info};

use crate::{
    clients::CoreClientInner,
    conversations::{Conversation, messages::ChatMessage},
    jobs::Job,
    mutations::MutationQueueEntry,
    resolver::{
        RemoteJobResolution, RemoteMessageResolution, resolve_remote_job, resolve_remote_message,
    },
    transport::Transport,
    utils::connection_ext::StoreExt,
};

pub(crate) async fn handle_remote_update<T: Transport + Sync + 'static>(
    core: &CoreClientInner<T>,
    update: RemoteUpdate,
) -> anyhow::Result<()> {
    if core.in_flight.defer_if_in_flight(&update) {
        debug!("Deferred remote update for entity with in-flight submission");
        return Ok(());
    }
    apply_remote_update(core, update).await
}

pub(crate) async fn apply_remote_update(
    store: &impl StoreExt,
    update: RemoteUpdate,
) -> anyhow::Result<()> {
    match update {
        RemoteUpdate::Job(snapshot) => apply_remote_job(store, snapshot).await,
        RemoteUpdate::Message(message) => apply_remote_message(store, message).await,
    }
}

async fn apply_remote_job(store: &impl StoreExt, snapshot: JobSnapshot) -> anyhow::Result<()> {
    store
        .with_transaction_and_notifier(async |txn, notifier| {
            let local = Job::load(txn.as_mut(), &snapshot.job_id).await?;
            match resolve_remote_job(local.as_ref(), &snapshot) {
                RemoteJobResolution::Insert => {
                    debug!(job_id = %snapshot.job_id, "New job pushed by authority");
                    Job::from_snapshot(snapshot)
                        .store(txn.as_mut(), notifier)
                        .await?;
                }
                RemoteJobResolution::Ignore => {
                    debug!(job_id = %snapshot.job_id, "Ignoring stale remote job update");
                }
                RemoteJobResolution::Apply { supersedes_pending } => {
                    let mut job = local.context("remote apply without local job")?;
                    if supersedes_pending {
                        let target = MutationTarget {
                            kind: EntityKind::Job,
                            id: snapshot.job_id.to_string(),
                        };
                        let dropped =
                            MutationQueueEntry::delete_for_target(txn.as_mut(), &target).await?;
                        info!(job_id = %snapshot.job_id, dropped,
                            "Remote update superseded pending local mutations");
                        job.supersede(txn.as_mut(), notifier, &snapshot).await?;
                    } else if job.is_dirty() {
                        // The local intent stays displayed; the remote state
                        // becomes the new synced base.
                        job.absorb_remote(txn.as_mut(), notifier, &snapshot).await?;
                    } else {
                        job.acknowledge(txn.as_mut(), notifier, &snapshot).await?;
                    }
                }
            }
            Ok(())
        })
        .await
}

async fn apply_remote_message(
    store: &impl StoreExt,
    remote: RemoteMessage,
) -> anyhow::Result<()> {
    store
        .with_transaction_and_notifier(async |txn, notifier| {
            let canonical_exists = ChatMessage::exists(txn.as_mut(), remote.canonical_id).await?;
            let placeholder = match remote.client_key {
                Some(key) => ChatMessage::load_by_client_key(txn.as_mut(), key).await?,
                None => None,
            };
            match resolve_remote_message(canonical_exists, placeholder.as_ref()) {
                RemoteMessageResolution::Ignore => {
                    debug!(canonical_id = %remote.canonical_id, "Ignoring duplicate remote message");
                }
                RemoteMessageResolution::ConfirmLocal => {
                    let confirmation = MessageConfirmation {
                        client_key: remote.client_key.context("confirmation without client key")?,
                        canonical_id: remote.canonical_id,
                        conversation_id: remote.conversation_id,
                        server_ts: remote.server_ts,
                        server_seq: remote.server_seq,
                    };
                    ChatMessage::confirm(txn.as_mut(), notifier, &confirmation).await?;
                }
                RemoteMessageResolution::InsertNew => {
                    Conversation::ensure_exists(txn.as_mut(), notifier, remote.conversation_id)
                        .await?;
                    ChatMessage::from_remote(remote)
                        .store(txn.as_mut(), notifier)
                        .await?;
                }
            }
            Ok(())
        })
        .await
}
