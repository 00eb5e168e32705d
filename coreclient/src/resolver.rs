// SPDX-FileCopyrightText: 2025 Crewline Labs <dev@crewline.app>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Pure conflict resolution.
//!
//! Reconciles locally applied optimistic state with what the remote
//! authority answered or pushed. The job version is authoritative: a
//! strictly newer remote version whose status is farther along the
//! lifecycle (or terminal) wins outright over a local intent. Messages are
//! append-only, so their reconciliation is ordering and deduplication, never
//! a merge.

use crewcommon::api::{
    AcceptedMutation, JobSnapshot, MessageConfirmation, Mutation, SubmitResponse,
};

use crate::{
    conversations::messages::ChatMessage,
    jobs::{Job, lifecycle::JobStatusExt},
};

/// The authority answered in a shape that does not fit the submitted
/// mutation. Treated as a fatal drain error rather than retried.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("response does not match the submitted mutation")]
pub struct ResponseMismatch;

/// Resolution of a submitted mutation against the authority's response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitResolution {
    /// The authority accepted the transition; the returned state is stamped
    /// and the job marked clean.
    JobAcknowledged { snapshot: JobSnapshot },
    /// The authority's state had already moved past the local intent; the
    /// intent is discarded and the remote state applied.
    JobSuperseded { snapshot: JobSnapshot },
    /// The authority refused the transition; the job rolls back to the last
    /// known-good remote state.
    JobRejected { reason: String },
    MessageConfirmed { confirmation: MessageConfirmation },
    MessageRejected { reason: String },
}

pub fn resolve_submit(
    mutation: &Mutation,
    response: &SubmitResponse,
) -> Result<SubmitResolution, ResponseMismatch> {
    match (mutation, response) {
        (
            Mutation::SendMessage(payload),
            SubmitResponse::Accepted(AcceptedMutation::Message(confirmation)),
        ) => {
            if confirmation.client_key != payload.message_id {
                return Err(ResponseMismatch);
            }
            Ok(SubmitResolution::MessageConfirmed {
                confirmation: confirmation.clone(),
            })
        }
        (Mutation::SendMessage(_), SubmitResponse::Rejected { reason }) => {
            Ok(SubmitResolution::MessageRejected {
                reason: reason.clone(),
            })
        }
        (Mutation::SendMessage(_), SubmitResponse::Accepted(AcceptedMutation::Job(_))) => {
            Err(ResponseMismatch)
        }
        (_, SubmitResponse::Accepted(AcceptedMutation::Job(snapshot))) => {
            let intended = mutation.intended_status().ok_or(ResponseMismatch)?;
            let base_version = mutation.base_version().ok_or(ResponseMismatch)?;
            if snapshot.status == intended {
                Ok(SubmitResolution::JobAcknowledged {
                    snapshot: snapshot.clone(),
                })
            } else if snapshot.version > base_version
                && (snapshot.status.progress_rank() > intended.progress_rank()
                    || snapshot.status.is_terminal())
            {
                Ok(SubmitResolution::JobSuperseded {
                    snapshot: snapshot.clone(),
                })
            } else {
                // The answer is authoritative either way; stamp it.
                Ok(SubmitResolution::JobAcknowledged {
                    snapshot: snapshot.clone(),
                })
            }
        }
        (_, SubmitResponse::Rejected { reason }) => Ok(SubmitResolution::JobRejected {
            reason: reason.clone(),
        }),
        (_, SubmitResponse::Accepted(AcceptedMutation::Message(_))) => Err(ResponseMismatch),
    }
}

/// Resolution of a pushed job update against local state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteJobResolution {
    /// No local record; the job becomes visible now.
    Insert,
    /// Strictly newer remote version; apply it. When it also supersedes a
    /// dirty local intent, the pending mutations for the job are dropped.
    Apply { supersedes_pending: bool },
    /// Stale or duplicate push; at-least-once delivery makes these routine.
    Ignore,
}

pub fn resolve_remote_job(local: Option<&Job>, remote: &JobSnapshot) -> RemoteJobResolution {
    let Some(job) = local else {
        return RemoteJobResolution::Insert;
    };
    if remote.version <= job.version() {
        return RemoteJobResolution::Ignore;
    }
    let supersedes_pending = job.is_dirty()
        && (remote.status.progress_rank() > job.status().progress_rank()
            || remote.status.is_terminal());
    RemoteJobResolution::Apply { supersedes_pending }
}

/// Resolution of a pushed message against local state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteMessageResolution {
    /// The push is the echo of a local placeholder; replace it in place.
    ConfirmLocal,
    InsertNew,
    /// Already applied under this canonical id or client key.
    Ignore,
}

pub fn resolve_remote_message(
    canonical_exists: bool,
    local_placeholder: Option<&ChatMessage>,
) -> RemoteMessageResolution {
    if canonical_exists {
        return RemoteMessageResolution::Ignore;
    }
    match local_placeholder {
        Some(message) if message.canonical_key().is_none() => {
            RemoteMessageResolution::ConfirmLocal
        }
        // A placeholder confirmed under a different canonical id means this
        // push is a duplicate of an older identity; drop it.
        Some(_) => RemoteMessageResolution::Ignore,
        None => RemoteMessageResolution::InsertNew,
    }
}
