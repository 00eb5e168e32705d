// SPDX-FileCopyrightText: 2025 Crewline Labs <dev@crewline.app>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Offline-first synchronization core of the Crewline client.
//!
//! Job transitions and chat messages issued by the UI are applied to the
//! local store immediately, queued durably, and replayed against the remote
//! authority once connectivity allows. Remote-origin updates are merged back
//! through the conflict resolver. The UI observes the store through change
//! notifications and never mutates records directly.

pub mod clients;
pub mod conversations;
pub mod jobs;
pub mod mutations;
pub mod outbound_service;
pub mod resolver;
pub mod store;
pub mod transport;
pub(crate) mod utils;

pub use crewcommon::{
    api::{
        CompletionReport, JobSnapshot, JobStatus, MessageKind, Mutation, RemoteMessage,
        RemoteUpdate,
    },
    identifiers::{ConversationId, JobId, MessageId, MutationId, UserId},
    time::TimeStamp,
};

pub use clients::CoreClient;
pub use conversations::Conversation;
pub use conversations::messages::{ChatMessage, DeliveryStatus};
pub use jobs::{Job, JobSyncOutcome, lifecycle::InvalidTransition};
pub use outbound_service::SyncConfig;
