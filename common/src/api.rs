// SPDX-FileCopyrightText: 2025 Crewline Labs <dev@crewline.app>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Wire-level contract between the sync core and the remote authority.
//!
//! The authority itself is opaque: the core only depends on the shapes of
//! the mutations it submits, the responses it gets back, and the update
//! events the authority pushes.

use std::fmt;

use serde::{Deserialize, Serialize};
use sqlx::{
    Database, Decode, Encode, Sqlite, Type, encode::IsNull, error::BoxDynError,
    sqlite::SqliteTypeInfo,
};

use crate::{
    identifiers::{ConversationId, JobId, MessageId, MutationId, UserId},
    time::TimeStamp,
};

/// Lifecycle status of a job.
///
/// The legal transitions between statuses are defined by the client's job
/// lifecycle module; this type only carries the value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobStatus {
    Pending,
    Accepted,
    InProgress,
    Completed,
    Cancelled,
}

impl JobStatus {
    /// Terminal statuses accept no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Cancelled)
    }

    pub fn repr(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Accepted => "accepted",
            JobStatus::InProgress => "in_progress",
            JobStatus::Completed => "completed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn from_repr(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(JobStatus::Pending),
            "accepted" => Some(JobStatus::Accepted),
            "in_progress" => Some(JobStatus::InProgress),
            "completed" => Some(JobStatus::Completed),
            "cancelled" => Some(JobStatus::Cancelled),
            _ => None,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.repr())
    }
}

impl Type<Sqlite> for JobStatus {
    fn type_info() -> SqliteTypeInfo {
        <String as Type<Sqlite>>::type_info()
    }
}

impl<'r> Decode<'r, Sqlite> for JobStatus {
    fn decode(value: <Sqlite as Database>::ValueRef<'r>) -> Result<Self, BoxDynError> {
        let s: &str = Decode::<Sqlite>::decode(value)?;
        JobStatus::from_repr(s).ok_or_else(|| format!("Unknown JobStatus variant: {s}").into())
    }
}

impl<'q> Encode<'q, Sqlite> for JobStatus {
    fn encode_by_ref(
        &self,
        buf: &mut <Sqlite as Database>::ArgumentBuffer<'q>,
    ) -> Result<IsNull, BoxDynError> {
        <&str as Encode<Sqlite>>::encode(self.repr(), buf)
    }
}

/// Kind of content carried by a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageKind {
    Text,
    Image,
    File,
}

impl MessageKind {
    pub fn repr(&self) -> &'static str {
        match self {
            MessageKind::Text => "text",
            MessageKind::Image => "image",
            MessageKind::File => "file",
        }
    }

    pub fn from_repr(s: &str) -> Option<Self> {
        match s {
            "text" => Some(MessageKind::Text),
            "image" => Some(MessageKind::Image),
            "file" => Some(MessageKind::File),
            _ => None,
        }
    }
}

impl Type<Sqlite> for MessageKind {
    fn type_info() -> SqliteTypeInfo {
        <String as Type<Sqlite>>::type_info()
    }
}

impl<'r> Decode<'r, Sqlite> for MessageKind {
    fn decode(value: <Sqlite as Database>::ValueRef<'r>) -> Result<Self, BoxDynError> {
        let s: &str = Decode::<Sqlite>::decode(value)?;
        MessageKind::from_repr(s).ok_or_else(|| format!("Unknown MessageKind variant: {s}").into())
    }
}

impl<'q> Encode<'q, Sqlite> for MessageKind {
    fn encode_by_ref(
        &self,
        buf: &mut <Sqlite as Database>::ArgumentBuffer<'q>,
    ) -> Result<IsNull, BoxDynError> {
        <&str as Encode<Sqlite>>::encode(self.repr(), buf)
    }
}

/// Completion metadata attached to a `CompleteJob` mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionReport {
    /// Customer confirmation email address.
    pub confirmation_email: String,
}

impl CompletionReport {
    pub fn new(confirmation_email: impl Into<String>) -> Self {
        Self {
            confirmation_email: confirmation_email.into(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.confirmation_email.trim().is_empty()
    }
}

/// Entity family a mutation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityKind {
    Job,
    Message,
}

impl EntityKind {
    pub fn repr(&self) -> &'static str {
        match self {
            EntityKind::Job => "job",
            EntityKind::Message => "message",
        }
    }

    pub fn from_repr(s: &str) -> Option<Self> {
        match s {
            "job" => Some(EntityKind::Job),
            "message" => Some(EntityKind::Message),
            _ => None,
        }
    }
}

impl Type<Sqlite> for EntityKind {
    fn type_info() -> SqliteTypeInfo {
        <String as Type<Sqlite>>::type_info()
    }
}

impl<'r> Decode<'r, Sqlite> for EntityKind {
    fn decode(value: <Sqlite as Database>::ValueRef<'r>) -> Result<Self, BoxDynError> {
        let s: &str = Decode::<Sqlite>::decode(value)?;
        EntityKind::from_repr(s).ok_or_else(|| format!("Unknown EntityKind variant: {s}").into())
    }
}

impl<'q> Encode<'q, Sqlite> for EntityKind {
    fn encode_by_ref(
        &self,
        buf: &mut <Sqlite as Database>::ArgumentBuffer<'q>,
    ) -> Result<IsNull, BoxDynError> {
        <&str as Encode<Sqlite>>::encode(self.repr(), buf)
    }
}

/// Target entity of a mutation, used for per-entity queue ordering.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MutationTarget {
    pub kind: EntityKind,
    pub id: String,
}

/// Payload of an outgoing chat message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagePayload {
    /// Locally generated message id; doubles as the message's client key for
    /// deduplication of authority echoes.
    pub message_id: MessageId,
    pub conversation_id: ConversationId,
    pub sender: UserId,
    pub kind: MessageKind,
    pub body: String,
    /// Provisional per-sender, per-conversation sequence number.
    pub sender_seq: i64,
}

/// A client-issued mutation.
///
/// All intents go through this single tagged type so the queue and resolver
/// machinery stays uniform across mutation kinds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Mutation {
    AcceptJob {
        job_id: JobId,
        base_version: i64,
    },
    StartJob {
        job_id: JobId,
        base_version: i64,
    },
    CancelJob {
        job_id: JobId,
        base_version: i64,
        reason: String,
    },
    CompleteJob {
        job_id: JobId,
        base_version: i64,
        report: CompletionReport,
    },
    SendMessage(MessagePayload),
}

impl Mutation {
    pub fn target(&self) -> MutationTarget {
        match self {
            Mutation::AcceptJob { job_id, .. }
            | Mutation::StartJob { job_id, .. }
            | Mutation::CancelJob { job_id, .. }
            | Mutation::CompleteJob { job_id, .. } => MutationTarget {
                kind: EntityKind::Job,
                id: job_id.to_string(),
            },
            Mutation::SendMessage(payload) => MutationTarget {
                kind: EntityKind::Message,
                id: payload.message_id.to_string(),
            },
        }
    }

    pub fn job_id(&self) -> Option<&JobId> {
        match self {
            Mutation::AcceptJob { job_id, .. }
            | Mutation::StartJob { job_id, .. }
            | Mutation::CancelJob { job_id, .. }
            | Mutation::CompleteJob { job_id, .. } => Some(job_id),
            Mutation::SendMessage(_) => None,
        }
    }

    /// The job status this mutation intends to reach, if it is a job
    /// transition.
    pub fn intended_status(&self) -> Option<JobStatus> {
        match self {
            Mutation::AcceptJob { .. } => Some(JobStatus::Accepted),
            Mutation::StartJob { .. } => Some(JobStatus::InProgress),
            Mutation::CancelJob { .. } => Some(JobStatus::Cancelled),
            Mutation::CompleteJob { .. } => Some(JobStatus::Completed),
            Mutation::SendMessage(_) => None,
        }
    }

    /// The version of the job this mutation was based on.
    pub fn base_version(&self) -> Option<i64> {
        match self {
            Mutation::AcceptJob { base_version, .. }
            | Mutation::StartJob { base_version, .. }
            | Mutation::CancelJob { base_version, .. }
            | Mutation::CompleteJob { base_version, .. } => Some(*base_version),
            Mutation::SendMessage(_) => None,
        }
    }
}

/// Bearer token authorizing transport calls.
///
/// Opaque to the core; issued and refreshed by the credential store.
#[derive(Clone, PartialEq, Eq)]
pub struct AuthToken(String);

impl AuthToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for AuthToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AuthToken(..)")
    }
}

/// A mutation submission, carrying its idempotency key.
#[derive(Debug, Clone)]
pub struct SubmitRequest {
    pub mutation_id: MutationId,
    pub mutation: Mutation,
    pub token: AuthToken,
}

/// Authoritative state of a job as reported by the remote authority.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSnapshot {
    pub job_id: JobId,
    pub version: i64,
    pub status: JobStatus,
    pub title: String,
    pub assigned_to: UserId,
    pub cancel_reason: Option<String>,
    pub completion: Option<CompletionReport>,
}

/// Canonical identity and ordering assigned to a confirmed message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageConfirmation {
    /// Echo of the client-generated key the message was submitted under.
    pub client_key: MessageId,
    pub canonical_id: MessageId,
    pub conversation_id: ConversationId,
    pub server_ts: TimeStamp,
    pub server_seq: i64,
}

/// Response of the remote authority to a submitted mutation.
///
/// Duplicate submissions under an already-applied idempotency key are
/// answered with the original `Accepted` result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitResponse {
    Accepted(AcceptedMutation),
    Rejected { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcceptedMutation {
    Job(JobSnapshot),
    Message(MessageConfirmation),
}

/// A remote-origin message pushed by the authority.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteMessage {
    pub canonical_id: MessageId,
    /// Client key of the originating device, if any; lets the origin device
    /// recognize the echo of its own send.
    pub client_key: Option<MessageId>,
    pub conversation_id: ConversationId,
    pub sender: UserId,
    pub kind: MessageKind,
    pub body: String,
    pub server_ts: TimeStamp,
    pub server_seq: i64,
}

/// An update event pushed by the remote authority.
///
/// Delivery is at-least-once and possibly out of order; consumers
/// deduplicate via version and idempotency checks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RemoteUpdate {
    Job(JobSnapshot),
    Message(RemoteMessage),
}
