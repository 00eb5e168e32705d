// SPDX-FileCopyrightText: 2025 Crewline Labs <dev@crewline.app>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! UI-issued intents.
//!
//! Every intent validates locally, applies its optimistic result and
//! appends the mutation to the queue inside one transaction, then nudges
//! the outbound service. Validation failures roll the transaction back, so
//! nothing is stored or enqueued for a rejected intent.

use std::sync::Arc;

use anyhow::{Context as _, bail};
use crewcommon::{
    api::{CompletionReport, MessageKind, MessagePayload, Mutation},
    identifiers::{ConversationId, JobId, MessageId, MutationId, UserId},
    time::TimeStamp,
};
use tokio_stream::Stream;

use crate::{
    JobStatus,
    conversations::{
        Conversation,
        messages::{ChatMessage, DeliveryStatus, sequence::ClientSequence},
    },
    jobs::{Job, lifecycle},
    mutations::{MutationQueueEntry, persistence::rebuild_job_projection},
    store::{Store, StoreNotification},
    transport::Transport,
    utils::connection_ext::StoreExt,
};

use super::CoreClient;

impl<T: Transport + Sync + 'static> CoreClient<T> {
    pub async fn accept_job(&self, job_id: &JobId) -> anyhow::Result<MutationId> {
        self.apply_job_transition(job_id, JobStatus::Accepted, None, None)
            .await
    }

    pub async fn start_job(&self, job_id: &JobId) -> anyhow::Result<MutationId> {
        self.apply_job_transition(job_id, JobStatus::InProgress, None, None)
            .await
    }

    pub async fn cancel_job(&self, job_id: &JobId, reason: String) -> anyhow::Result<MutationId> {
        lifecycle::check_cancel_reason(&reason)?;
        self.apply_job_transition(job_id, JobStatus::Cancelled, Some(reason), None)
            .await
    }

    pub async fn complete_job(
        &self,
        job_id: &JobId,
        report: CompletionReport,
    ) -> anyhow::Result<MutationId> {
        lifecycle::check_completion_report(&report)?;
        self.apply_job_transition(job_id, JobStatus::Completed, None, Some(report))
            .await
    }

    async fn apply_job_transition(
        &self,
        job_id: &JobId,
        target: JobStatus,
        cancel_reason: Option<String>,
        completion: Option<CompletionReport>,
    ) -> anyhow::Result<MutationId> {
        let mutation_id = self
            .inner()
            .with_transaction_and_notifier(async |txn, notifier| {
                let mut job = Job::load(txn.as_mut(), job_id)
                    .await?
                    .with_context(|| format!("Can't find job with id {job_id}"))?;
                lifecycle::check_transition(job.status(), target)?;

                let mutation = match target {
                    JobStatus::Accepted => Mutation::AcceptJob {
                        job_id: job_id.clone(),
                        base_version: job.version(),
                    },
                    JobStatus::InProgress => Mutation::StartJob {
                        job_id: job_id.clone(),
                        base_version: job.version(),
                    },
                    JobStatus::Cancelled => Mutation::CancelJob {
                        job_id: job_id.clone(),
                        base_version: job.version(),
                        reason: cancel_reason.clone().unwrap_or_default(),
                    },
                    JobStatus::Completed => Mutation::CompleteJob {
                        job_id: job_id.clone(),
                        base_version: job.version(),
                        report: completion.clone().context("completion report required")?,
                    },
                    JobStatus::Pending => bail!("pending is an entry state, not a target"),
                };

                job.apply_optimistic(txn.as_mut(), notifier, target, cancel_reason, completion)
                    .await?;

                let entry = MutationQueueEntry::new(mutation);
                entry.enqueue(txn.as_mut()).await?;
                notifier.add(entry.id());
                Ok(entry.id())
            })
            .await?;

        self.inner().outbound.notify_work();
        Ok(mutation_id)
    }

    /// Stores the message as `Pending` under a provisional sequence key and
    /// queues it for sending.
    pub async fn send_message(
        &self,
        conversation_id: ConversationId,
        kind: MessageKind,
        body: String,
    ) -> anyhow::Result<ChatMessage> {
        let sender = self.user_id().clone();
        let message = self
            .inner()
            .with_transaction_and_notifier(async |txn, notifier| {
                Conversation::load(txn.as_mut(), conversation_id)
                    .await?
                    .with_context(|| format!("Can't find conversation with id {conversation_id}"))?;

                let sender_seq =
                    ClientSequence::next(txn.as_mut(), conversation_id, &sender).await?;
                let message =
                    ChatMessage::new_unsent(sender.clone(), conversation_id, kind, body, sender_seq);
                message.store(txn.as_mut(), notifier).await?;

                let entry = MutationQueueEntry::new(Mutation::SendMessage(MessagePayload {
                    message_id: message.id(),
                    conversation_id,
                    sender,
                    kind,
                    body: message.body().to_owned(),
                    sender_seq,
                }));
                entry.enqueue(txn.as_mut()).await?;
                notifier.add(entry.id());
                Ok(message)
            })
            .await?;

        self.inner().outbound.notify_work();
        Ok(message)
    }

    /// Re-queues a failed message under its original client key, so the
    /// authority can still deduplicate an earlier delivery of it.
    pub async fn retry_message(&self, message_id: MessageId) -> anyhow::Result<()> {
        self.inner()
            .with_transaction_and_notifier(async |txn, notifier| {
                let mut message = ChatMessage::load(txn.as_mut(), message_id)
                    .await?
                    .with_context(|| format!("Can't find message with id {message_id}"))?;
                if message.status() != DeliveryStatus::Failed {
                    bail!("only failed messages can be retried");
                }
                let client_key = message
                    .client_key()
                    .context("failed message has no client key")?;
                let sender_seq = message
                    .sender_seq()
                    .context("failed message has no provisional sequence")?;

                message
                    .set_status(txn.as_mut(), notifier, DeliveryStatus::Pending)
                    .await?;

                let entry = MutationQueueEntry::new(Mutation::SendMessage(MessagePayload {
                    message_id: client_key,
                    conversation_id: message.conversation_id(),
                    sender: message.sender().clone(),
                    kind: message.kind(),
                    body: message.body().to_owned(),
                    sender_seq,
                }));
                entry.enqueue(txn.as_mut()).await?;
                notifier.add(entry.id());
                Ok(())
            })
            .await?;

        self.inner().outbound.notify_work();
        Ok(())
    }

    /// Advances the conversation's read watermark.
    pub async fn mark_conversation_read(
        &self,
        conversation_id: ConversationId,
        until: TimeStamp,
    ) -> anyhow::Result<()> {
        self.inner()
            .with_transaction_and_notifier(async |txn, notifier| {
                Conversation::mark_read_until(txn.as_mut(), notifier, conversation_id, until)
                    .await?;
                Ok(())
            })
            .await
    }

    /// Cancels a queued mutation while it is still pending.
    ///
    /// Returns false once the entry is in flight (or already settled); the
    /// outcome is then delivered asynchronously like any other submission.
    pub async fn cancel_mutation(&self, mutation_id: MutationId) -> anyhow::Result<bool> {
        self.inner()
            .with_transaction_and_notifier(async |txn, notifier| {
                let Some(entry) =
                    MutationQueueEntry::remove_if_pending(txn.as_mut(), mutation_id).await?
                else {
                    return Ok(false);
                };
                notifier.remove(entry.id());

                match entry.mutation() {
                    Mutation::SendMessage(payload) => {
                        if let Some(message) =
                            ChatMessage::load_by_client_key(txn.as_mut(), payload.message_id)
                                .await?
                            && message.canonical_key().is_none()
                        {
                            message.delete(txn.as_mut(), notifier).await?;
                        }
                    }
                    _ => {
                        let job_id = entry
                            .mutation()
                            .job_id()
                            .context("job mutation without job id")?;
                        rebuild_job_projection(txn.as_mut(), notifier, job_id).await?;
                    }
                }
                Ok(true)
            })
            .await
    }
}

impl<T: Transport + Sync + 'static> Store for CoreClient<T> {
    fn user_id(&self) -> &UserId {
        CoreClient::user_id(self)
    }

    async fn job(&self, job_id: &JobId) -> anyhow::Result<Option<Job>> {
        CoreClient::job(self, job_id).await
    }

    async fn jobs(&self) -> anyhow::Result<Vec<Job>> {
        CoreClient::jobs(self).await
    }

    async fn conversation(
        &self,
        conversation_id: ConversationId,
    ) -> anyhow::Result<Option<Conversation>> {
        CoreClient::conversation(self, conversation_id).await
    }

    async fn conversations(&self) -> anyhow::Result<Vec<Conversation>> {
        CoreClient::conversations(self).await
    }

    async fn messages(&self, conversation_id: ConversationId) -> anyhow::Result<Vec<ChatMessage>> {
        CoreClient::messages(self, conversation_id).await
    }

    async fn message(&self, message_id: MessageId) -> anyhow::Result<Option<ChatMessage>> {
        CoreClient::message(self, message_id).await
    }

    async fn last_message(
        &self,
        conversation_id: ConversationId,
    ) -> anyhow::Result<Option<ChatMessage>> {
        CoreClient::last_message(self, conversation_id).await
    }

    async fn unread_messages_count(
        &self,
        conversation_id: ConversationId,
    ) -> anyhow::Result<usize> {
        CoreClient::unread_messages_count(self, conversation_id).await
    }

    async fn pending_mutations(&self) -> anyhow::Result<Vec<MutationQueueEntry>> {
        CoreClient::pending_mutations(self).await
    }

    async fn accept_job(&self, job_id: &JobId) -> anyhow::Result<MutationId> {
        CoreClient::accept_job(self, job_id).await
    }

    async fn start_job(&self, job_id: &JobId) -> anyhow::Result<MutationId> {
        CoreClient::start_job(self, job_id).await
    }

    async fn cancel_job(&self, job_id: &JobId, reason: String) -> anyhow::Result<MutationId> {
        CoreClient::cancel_job(self, job_id, reason).await
    }

    async fn complete_job(
        &self,
        job_id: &JobId,
        report: CompletionReport,
    ) -> anyhow::Result<MutationId> {
        CoreClient::complete_job(self, job_id, report).await
    }

    async fn send_message(
        &self,
        conversation_id: ConversationId,
        kind: MessageKind,
        body: String,
    ) -> anyhow::Result<ChatMessage> {
        CoreClient::send_message(self, conversation_id, kind, body).await
    }

    async fn retry_message(&self, message_id: MessageId) -> anyhow::Result<()> {
        CoreClient::retry_message(self, message_id).await
    }

    async fn mark_conversation_read(
        &self,
        conversation_id: ConversationId,
        until: TimeStamp,
    ) -> anyhow::Result<()> {
        CoreClient::mark_conversation_read(self, conversation_id, until).await
    }

    async fn cancel_mutation(&self, mutation_id: MutationId) -> anyhow::Result<bool> {
        CoreClient::cancel_mutation(self, mutation_id).await
    }

    fn subscribe(&self) -> impl Stream<Item = Arc<StoreNotification>> + Send + 'static {
        CoreClient::subscribe(self)
    }
}
