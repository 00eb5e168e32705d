// SPDX-FileCopyrightText: 2025 Crewline Labs <dev@crewline.app>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Change notifications and the store facade exposed to the UI layer.
//!
//! Every committed transaction that touches a job, conversation, message or
//! queue entry emits exactly one [`StoreNotification`] batching the affected
//! entity ids. Consumers hold immutable snapshots and reload them on
//! notification; they never mutate stored records directly.

use std::{collections::BTreeMap, sync::Arc};

use crewcommon::{
    api::{CompletionReport, MessageKind},
    identifiers::{ConversationId, JobId, MessageId, MutationId, UserId},
    time::TimeStamp,
};
use tokio::sync::broadcast;
use tokio_stream::{Stream, StreamExt, wrappers::BroadcastStream};

use crate::{
    conversations::{Conversation, messages::ChatMessage},
    jobs::Job,
    mutations::MutationQueueEntry,
};

pub(crate) mod persistence;

pub use persistence::{open_client_db, open_db_in_memory};

/// Capacity of the change notification channel; subscribers that lag behind
/// further than this miss notifications and should reload their snapshots.
const NOTIFICATION_CHANNEL_SIZE: usize = 1024;

pub type StoreNotificationsSender = broadcast::Sender<Arc<StoreNotification>>;

pub(crate) fn new_notifications_channel() -> StoreNotificationsSender {
    broadcast::channel(NOTIFICATION_CHANNEL_SIZE).0
}

/// Id of an entity a change notification refers to.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, derive_more::From)]
pub enum StoreEntityId {
    Job(JobId),
    Conversation(ConversationId),
    Message(MessageId),
    Mutation(MutationId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOperation {
    Add,
    Update,
    Remove,
}

/// A batch of changes applied by a single committed transaction.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct StoreNotification {
    pub ops: BTreeMap<StoreEntityId, StoreOperation>,
}

impl StoreNotification {
    fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn contains(&self, id: impl Into<StoreEntityId>) -> bool {
        self.ops.contains_key(&id.into())
    }
}

/// Collects entity changes during a transaction and publishes them as a
/// single [`StoreNotification`] after the transaction committed.
#[derive(Debug)]
pub struct StoreNotifier {
    tx: Option<StoreNotificationsSender>,
    notification: StoreNotification,
}

impl StoreNotifier {
    pub(crate) fn new(tx: StoreNotificationsSender) -> Self {
        Self {
            tx: Some(tx),
            notification: StoreNotification::default(),
        }
    }

    /// A notifier that drops all collected changes. Used in tests and for
    /// writes whose notifications nobody can observe yet.
    pub fn noop() -> Self {
        Self {
            tx: None,
            notification: StoreNotification::default(),
        }
    }

    pub fn add(&mut self, id: impl Into<StoreEntityId>) -> &mut Self {
        self.notification.ops.insert(id.into(), StoreOperation::Add);
        self
    }

    pub fn update(&mut self, id: impl Into<StoreEntityId>) -> &mut Self {
        self.notification
            .ops
            .insert(id.into(), StoreOperation::Update);
        self
    }

    pub fn remove(&mut self, id: impl Into<StoreEntityId>) -> &mut Self {
        self.notification
            .ops
            .insert(id.into(), StoreOperation::Remove);
        self
    }

    pub fn notify(self) {
        if self.notification.is_empty() {
            return;
        }
        if let Some(tx) = self.tx {
            // Nobody listening is fine; new subscribers reload snapshots.
            let _ = tx.send(Arc::new(self.notification));
        }
    }
}

pub(crate) fn subscribe_stream(
    tx: &StoreNotificationsSender,
) -> impl Stream<Item = Arc<StoreNotification>> + Send + 'static + use<> {
    BroadcastStream::new(tx.subscribe()).filter_map(|notification| notification.ok())
}

/// The store facade exposed to the UI layer: intents, snapshot reads and
/// change subscription.
#[trait_variant::make(Store: Send)]
pub trait LocalStore {
    fn user_id(&self) -> &UserId;

    // Snapshot reads

    async fn job(&self, job_id: &JobId) -> anyhow::Result<Option<Job>>;

    async fn jobs(&self) -> anyhow::Result<Vec<Job>>;

    async fn conversation(
        &self,
        conversation_id: ConversationId,
    ) -> anyhow::Result<Option<Conversation>>;

    async fn conversations(&self) -> anyhow::Result<Vec<Conversation>>;

    /// Messages of a conversation in display order: confirmed messages by
    /// canonical sequence key, then unconfirmed local messages by their
    /// provisional counter.
    async fn messages(&self, conversation_id: ConversationId) -> anyhow::Result<Vec<ChatMessage>>;

    async fn message(&self, message_id: MessageId) -> anyhow::Result<Option<ChatMessage>>;

    async fn last_message(
        &self,
        conversation_id: ConversationId,
    ) -> anyhow::Result<Option<ChatMessage>>;

    async fn unread_messages_count(&self, conversation_id: ConversationId)
    -> anyhow::Result<usize>;

    async fn pending_mutations(&self) -> anyhow::Result<Vec<MutationQueueEntry>>;

    // Intents

    async fn accept_job(&self, job_id: &JobId) -> anyhow::Result<MutationId>;

    async fn start_job(&self, job_id: &JobId) -> anyhow::Result<MutationId>;

    async fn cancel_job(&self, job_id: &JobId, reason: String) -> anyhow::Result<MutationId>;

    async fn complete_job(
        &self,
        job_id: &JobId,
        report: CompletionReport,
    ) -> anyhow::Result<MutationId>;

    async fn send_message(
        &self,
        conversation_id: ConversationId,
        kind: MessageKind,
        body: String,
    ) -> anyhow::Result<ChatMessage>;

    async fn retry_message(&self, message_id: MessageId) -> anyhow::Result<()>;

    async fn mark_conversation_read(
        &self,
        conversation_id: ConversationId,
        until: TimeStamp,
    ) -> anyhow::Result<()>;

    /// Cancels a queued mutation. Succeeds only while the entry is still
    /// pending in the queue; an in-flight mutation runs to completion.
    async fn cancel_mutation(&self, mutation_id: MutationId) -> anyhow::Result<bool>;

    fn subscribe(&self) -> impl Stream<Item = Arc<StoreNotification>> + Send + 'static;
}
