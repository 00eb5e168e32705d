// SPDX-FileCopyrightText: 2025 Crewline Labs <dev@crewline.app>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! The client facade of the sync core.
//!
//! A [`CoreClient`] owns the local store, the outbound service and the
//! event loop for remote pushes. The UI issues intents and reads snapshots
//! through it (see [`Store`]); the transport feeds push events through
//! [`CoreClient::push_sender`] and signals connectivity through
//! [`CoreClient::set_connected`].

use std::{path::Path, sync::Arc};

use crewcommon::{
    api::RemoteUpdate,
    identifiers::{ConversationId, JobId, MessageId, UserId},
};
use sqlx::SqlitePool;
use tokio_stream::Stream;
use tokio_util::sync::CancellationToken;

use crate::{
    conversations::{Conversation, messages::ChatMessage},
    jobs::Job,
    mutations::MutationQueueEntry,
    outbound_service::{InFlightGuard, OutboundService, OutboundServiceContext, SyncConfig},
    store::{
        StoreNotification, StoreNotificationsSender, StoreNotifier, new_notifications_channel,
        open_client_db, subscribe_stream,
    },
    transport::{TokenProvider, Transport},
    utils::connection_ext::StoreExt,
};

pub use event_loop::EventLoopSender;

pub(crate) mod event_loop;
mod intents;
pub(crate) mod process;

use event_loop::EventLoop;

pub struct CoreClient<T: Transport + Sync + 'static> {
    inner: Arc<CoreClientInner<T>>,
}

impl<T: Transport + Sync + 'static> Clone for CoreClient<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

pub(crate) struct CoreClientInner<T: Transport + Sync + 'static> {
    pub(crate) pool: SqlitePool,
    pub(crate) user_id: UserId,
    pub(crate) store_notifications_tx: StoreNotificationsSender,
    pub(crate) outbound: OutboundService<OutboundServiceContext<T>>,
    pub(crate) in_flight: InFlightGuard,
    push_sender: EventLoopSender,
    cancel: CancellationToken,
}

impl<T: Transport + Sync + 'static> Drop for CoreClientInner<T> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl<T: Transport + Sync + 'static> StoreExt for CoreClientInner<T> {
    fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    fn notifier(&self) -> StoreNotifier {
        StoreNotifier::new(self.store_notifications_tx.clone())
    }
}

impl<T: Transport + Sync + 'static> CoreClient<T> {
    /// Opens the client database at the given path and starts the sync
    /// machinery. The outbound service starts in the stopped state until
    /// connectivity is signalled.
    pub async fn open(
        db_path: &Path,
        user_id: UserId,
        transport: Arc<T>,
        tokens: Arc<dyn TokenProvider>,
        config: SyncConfig,
    ) -> anyhow::Result<Self> {
        let pool = open_client_db(db_path).await?;
        Ok(Self::with_pool(pool, user_id, transport, tokens, config))
    }

    pub(crate) fn with_pool(
        pool: SqlitePool,
        user_id: UserId,
        transport: Arc<T>,
        tokens: Arc<dyn TokenProvider>,
        config: SyncConfig,
    ) -> Self {
        let store_notifications_tx = new_notifications_channel();
        let in_flight = InFlightGuard::default();
        let outbound = OutboundService::new(
            pool.clone(),
            transport,
            tokens,
            config.clone(),
            store_notifications_tx.clone(),
            in_flight.clone(),
        );
        let (event_loop, push_sender, cancel) = EventLoop::new();
        outbound.spawn_tick(config.tick_interval, cancel.clone());

        let inner = Arc::new(CoreClientInner {
            pool,
            user_id,
            store_notifications_tx,
            outbound,
            in_flight,
            push_sender,
            cancel,
        });
        event_loop.spawn(Arc::downgrade(&inner));

        Self { inner }
    }

    pub fn user_id(&self) -> &UserId {
        &self.inner.user_id
    }

    /// Signals a connectivity change. Restored connectivity starts the
    /// queue drain; lost connectivity cancels any running drain.
    ///
    /// Returns a future resolving when the drain settles.
    pub fn set_connected(&self, connected: bool) -> crate::outbound_service::WaitForDoneFuture {
        if connected {
            self.inner.outbound.start()
        } else {
            self.inner.outbound.stop()
        }
    }

    /// Runs a single foreground drain to completion.
    pub async fn sync_once(&self) {
        self.inner.outbound.run_once().await;
    }

    /// Sender through which the transport delivers its push subscription.
    pub fn push_sender(&self) -> EventLoopSender {
        self.inner.push_sender.clone()
    }

    /// Applies a single remote update, bypassing the event loop channel.
    /// Deferral for in-flight entities still applies.
    pub async fn process_remote_update(&self, update: RemoteUpdate) -> anyhow::Result<()> {
        process::handle_remote_update(&self.inner, update).await
    }

    // Snapshot reads

    pub async fn job(&self, job_id: &JobId) -> anyhow::Result<Option<Job>> {
        let mut connection = self.inner.pool.acquire().await?;
        Ok(Job::load(&mut connection, job_id).await?)
    }

    pub async fn jobs(&self) -> anyhow::Result<Vec<Job>> {
        let mut connection = self.inner.pool.acquire().await?;
        Ok(Job::load_all(&mut connection).await?)
    }

    pub async fn conversation(
        &self,
        conversation_id: ConversationId,
    ) -> anyhow::Result<Option<Conversation>> {
        let mut connection = self.inner.pool.acquire().await?;
        Ok(Conversation::load(&mut connection, conversation_id).await?)
    }

    pub async fn conversations(&self) -> anyhow::Result<Vec<Conversation>> {
        let mut connection = self.inner.pool.acquire().await?;
        Ok(Conversation::load_all(&mut connection).await?)
    }

    pub async fn messages(
        &self,
        conversation_id: ConversationId,
    ) -> anyhow::Result<Vec<ChatMessage>> {
        let mut connection = self.inner.pool.acquire().await?;
        Ok(ChatMessage::load_all(&mut *connection, conversation_id).await?)
    }

    pub async fn message(&self, message_id: MessageId) -> anyhow::Result<Option<ChatMessage>> {
        let mut connection = self.inner.pool.acquire().await?;
        Ok(ChatMessage::load(&mut *connection, message_id).await?)
    }

    pub async fn last_message(
        &self,
        conversation_id: ConversationId,
    ) -> anyhow::Result<Option<ChatMessage>> {
        let mut connection = self.inner.pool.acquire().await?;
        Ok(ChatMessage::last(&mut *connection, conversation_id).await?)
    }

    pub async fn unread_messages_count(
        &self,
        conversation_id: ConversationId,
    ) -> anyhow::Result<usize> {
        let mut connection = self.inner.pool.acquire().await?;
        Ok(
            Conversation::unread_messages_count(
                &mut connection,
                conversation_id,
                &self.inner.user_id,
            )
            .await?,
        )
    }

    pub async fn pending_mutations(&self) -> anyhow::Result<Vec<MutationQueueEntry>> {
        let mut connection = self.inner.pool.acquire().await?;
        Ok(MutationQueueEntry::load_all(&mut *connection).await?)
    }

    pub fn subscribe(&self) -> impl Stream<Item = Arc<StoreNotification>> + Send + 'static {
        subscribe_stream(&self.inner.store_notifications_tx)
    }

    pub(crate) fn inner(&self) -> &CoreClientInner<T> {
        &self.inner
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::HashMap,
        sync::{
            Mutex,
            atomic::{AtomicI64, Ordering},
        },
        time::Duration,
    };

    use crewcommon::{
        api::{
            AcceptedMutation, AuthToken, CompletionReport, JobSnapshot, JobStatus,
            MessageConfirmation, MessageKind, Mutation, RemoteMessage, SubmitRequest,
            SubmitResponse,
        },
        identifiers::MutationId,
        time::TimeStamp,
    };
    use tokio::sync::{Notify, Semaphore};
    use tokio_stream::StreamExt;

    use crate::{
        InvalidTransition,
        conversations::messages::DeliveryStatus,
        jobs::{JobSyncOutcome, lifecycle::JobStatusExt},
        store::open_db_in_memory,
        transport::TransportError,
        utils::init_test_tracing,
    };

    use super::*;

    #[derive(Debug, Clone, Copy)]
    enum FailNext {
        Network,
        Unauthenticated,
        /// The authority applies the mutation but the acknowledgement is
        /// lost, as seen from the client.
        TimeoutAfterApply,
    }

    #[derive(Clone)]
    struct Gate {
        started: Arc<Notify>,
        permits: Arc<Semaphore>,
    }

    impl Gate {
        fn new() -> Self {
            Self {
                started: Arc::new(Notify::new()),
                permits: Arc::new(Semaphore::new(0)),
            }
        }
    }

    /// Scripted remote authority: applies job transitions against its own
    /// job table and assigns canonical message sequence numbers. Idempotent
    /// per mutation id, like the real one.
    #[derive(Default)]
    struct TestAuthority {
        jobs: Mutex<HashMap<JobId, JobSnapshot>>,
        confirmations: Mutex<HashMap<MessageId, MessageConfirmation>>,
        applied: Mutex<HashMap<MutationId, SubmitResponse>>,
        submitted: Mutex<Vec<Mutation>>,
        fail_next: Mutex<Option<FailNext>>,
        reject_next: Mutex<Option<String>>,
        gate: Mutex<Option<Gate>>,
        next_seq: AtomicI64,
    }

    impl TestAuthority {
        fn new() -> Arc<Self> {
            let authority = Self::default();
            authority.next_seq.store(1, Ordering::SeqCst);
            Arc::new(authority)
        }

        fn set_job(&self, snapshot: JobSnapshot) {
            self.jobs
                .lock()
                .unwrap()
                .insert(snapshot.job_id.clone(), snapshot);
        }

        fn job(&self, job_id: &JobId) -> Option<JobSnapshot> {
            self.jobs.lock().unwrap().get(job_id).cloned()
        }

        fn submitted(&self) -> Vec<Mutation> {
            self.submitted.lock().unwrap().clone()
        }

        fn respond(&self, request: &SubmitRequest) -> Result<SubmitResponse, TransportError> {
            match self.fail_next.lock().unwrap().take() {
                Some(FailNext::Network) => {
                    return Err(TransportError::Network("connection reset".into()));
                }
                Some(FailNext::Unauthenticated) => return Err(TransportError::Unauthenticated),
                Some(FailNext::TimeoutAfterApply) => {
                    let _ = self.apply(request);
                    return Err(TransportError::Timeout);
                }
                None => {}
            }
            self.apply(request)
        }

        fn apply(&self, request: &SubmitRequest) -> Result<SubmitResponse, TransportError> {
            if let Some(response) = self.applied.lock().unwrap().get(&request.mutation_id) {
                return Ok(response.clone());
            }
            if let Some(reason) = self.reject_next.lock().unwrap().take() {
                return Ok(SubmitResponse::Rejected { reason });
            }

            let response = match &request.mutation {
                Mutation::SendMessage(payload) => {
                    let confirmation = self
                        .confirmations
                        .lock()
                        .unwrap()
                        .entry(payload.message_id)
                        .or_insert_with(|| MessageConfirmation {
                            client_key: payload.message_id,
                            canonical_id: MessageId::random(),
                            conversation_id: payload.conversation_id,
                            server_ts: TimeStamp::now(),
                            server_seq: self.next_seq.fetch_add(1, Ordering::SeqCst),
                        })
                        .clone();
                    SubmitResponse::Accepted(AcceptedMutation::Message(confirmation))
                }
                mutation => {
                    let job_id = mutation.job_id().unwrap();
                    let intended = mutation.intended_status().unwrap();
                    let base_version = mutation.base_version().unwrap();
                    let mut jobs = self.jobs.lock().unwrap();
                    let Some(current) = jobs.get_mut(job_id) else {
                        return Ok(SubmitResponse::Rejected {
                            reason: "unknown job".into(),
                        });
                    };
                    if current.version > base_version
                        && (current.status.progress_rank() > intended.progress_rank()
                            || current.status.is_terminal())
                    {
                        // The job moved past the stale intent; echo the
                        // authoritative state.
                        SubmitResponse::Accepted(AcceptedMutation::Job(current.clone()))
                    } else if current.status.may_transition_to(intended) {
                        current.version += 1;
                        current.status = intended;
                        match mutation {
                            Mutation::CancelJob { reason, .. } => {
                                current.cancel_reason = Some(reason.clone());
                            }
                            Mutation::CompleteJob { report, .. } => {
                                current.completion = Some(report.clone());
                            }
                            _ => {}
                        }
                        SubmitResponse::Accepted(AcceptedMutation::Job(current.clone()))
                    } else {
                        SubmitResponse::Rejected {
                            reason: format!("illegal transition to {intended}"),
                        }
                    }
                }
            };
            self.applied
                .lock()
                .unwrap()
                .insert(request.mutation_id, response.clone());
            Ok(response)
        }
    }

    impl Transport for TestAuthority {
        async fn submit(&self, request: SubmitRequest) -> Result<SubmitResponse, TransportError> {
            self.submitted
                .lock()
                .unwrap()
                .push(request.mutation.clone());
            let gate = self.gate.lock().unwrap().clone();
            if let Some(gate) = gate {
                gate.started.notify_one();
                let permit = gate
                    .permits
                    .acquire()
                    .await
                    .map_err(|_| TransportError::Network("gate closed".into()))?;
                permit.forget();
            }
            self.respond(&request)
        }
    }

    #[derive(Default)]
    struct TestTokens {
        token: Mutex<Option<AuthToken>>,
    }

    impl TestTokens {
        fn with_token() -> Arc<Self> {
            let tokens = Self::default();
            tokens.set(Some(AuthToken::new("token-1")));
            Arc::new(tokens)
        }

        fn set(&self, token: Option<AuthToken>) {
            *self.token.lock().unwrap() = token;
        }
    }

    impl TokenProvider for TestTokens {
        fn current_token(&self) -> Option<AuthToken> {
            self.token.lock().unwrap().clone()
        }
    }

    fn test_config() -> SyncConfig {
        SyncConfig {
            submit_timeout: Duration::from_secs(5),
            // Deterministic immediate retries in tests.
            backoff_base: Duration::ZERO,
            backoff_cap: Duration::ZERO,
            tick_interval: Duration::from_secs(3600),
        }
    }

    async fn test_client(
        authority: Arc<TestAuthority>,
        tokens: Arc<TestTokens>,
    ) -> CoreClient<TestAuthority> {
        init_test_tracing();
        let pool = open_db_in_memory().await.unwrap();
        CoreClient::with_pool(
            pool,
            UserId::new("worker-1"),
            authority,
            tokens,
            test_config(),
        )
    }

    fn job_snapshot(job_id: &str, version: i64, status: JobStatus) -> JobSnapshot {
        JobSnapshot {
            job_id: JobId::new(job_id),
            version,
            status,
            title: "Fix heat pump".into(),
            assigned_to: UserId::new("worker-1"),
            cancel_reason: None,
            completion: None,
        }
    }

    async fn seed_job(
        client: &CoreClient<TestAuthority>,
        authority: &TestAuthority,
        snapshot: JobSnapshot,
    ) {
        authority.set_job(snapshot.clone());
        client
            .process_remote_update(RemoteUpdate::Job(snapshot))
            .await
            .unwrap();
    }

    async fn seed_conversation(client: &CoreClient<TestAuthority>) -> ConversationId {
        let conversation = Conversation::new(
            ConversationId::random(),
            None,
            vec![UserId::new("worker-1"), UserId::new("dispatch")],
        );
        let conversation_id = conversation.id();
        client
            .inner()
            .with_transaction_and_notifier(async |txn, notifier| {
                conversation.store(txn.as_mut(), notifier).await?;
                Ok(())
            })
            .await
            .unwrap();
        conversation_id
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn complete_job_offline_then_sync() {
        let authority = TestAuthority::new();
        let tokens = TestTokens::with_token();
        let client = test_client(authority.clone(), tokens).await;

        let job_id = JobId::new("job-1");
        seed_job(
            &client,
            &authority,
            job_snapshot("job-1", 3, JobStatus::InProgress),
        )
        .await;

        // Offline: the optimistic result is visible immediately and the
        // mutation is queued.
        client
            .complete_job(&job_id, CompletionReport::new("a@b.com"))
            .await
            .unwrap();
        let job = client.job(&job_id).await.unwrap().unwrap();
        assert_eq!(job.status(), JobStatus::Completed);
        assert!(job.is_dirty());
        assert_eq!(job.version(), 3);
        assert_eq!(client.pending_mutations().await.unwrap().len(), 1);

        // Reconnect: the entry is acked and the job settles clean with the
        // authority's version.
        client.sync_once().await;
        let job = client.job(&job_id).await.unwrap().unwrap();
        assert_eq!(job.status(), JobStatus::Completed);
        assert!(!job.is_dirty());
        assert_eq!(job.version(), 4);
        assert_eq!(job.sync_outcome(), None);
        assert!(client.pending_mutations().await.unwrap().is_empty());
        assert_eq!(authority.submitted().len(), 1);
        assert_eq!(
            authority.job(&job_id).unwrap().status,
            JobStatus::Completed
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn invalid_intents_are_rejected_synchronously() {
        let authority = TestAuthority::new();
        let client = test_client(authority.clone(), TestTokens::with_token()).await;

        let job_id = JobId::new("job-1");
        seed_job(
            &client,
            &authority,
            job_snapshot("job-1", 2, JobStatus::Accepted),
        )
        .await;

        // Empty cancel reason.
        let error = client.cancel_job(&job_id, "".into()).await.unwrap_err();
        assert_eq!(
            error.downcast_ref::<InvalidTransition>(),
            Some(&InvalidTransition::MissingCancelReason)
        );

        // Illegal edge.
        let error = client
            .complete_job(&job_id, CompletionReport::new("a@b.com"))
            .await
            .unwrap_err();
        assert_eq!(
            error.downcast_ref::<InvalidTransition>(),
            Some(&InvalidTransition::IllegalEdge {
                from: JobStatus::Accepted,
                to: JobStatus::Completed,
            })
        );

        // Nothing stored, nothing queued, nothing submitted.
        let job = client.job(&job_id).await.unwrap().unwrap();
        assert_eq!(job.status(), JobStatus::Accepted);
        assert!(!job.is_dirty());
        assert!(client.pending_mutations().await.unwrap().is_empty());
        assert!(authority.submitted().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn same_job_mutations_submit_in_creation_order() {
        let authority = TestAuthority::new();
        let client = test_client(authority.clone(), TestTokens::with_token()).await;

        let job_id = JobId::new("job-1");
        seed_job(
            &client,
            &authority,
            job_snapshot("job-1", 1, JobStatus::Pending),
        )
        .await;

        client.accept_job(&job_id).await.unwrap();
        client.start_job(&job_id).await.unwrap();
        client.sync_once().await;

        let submitted = authority.submitted();
        assert!(matches!(submitted[0], Mutation::AcceptJob { .. }));
        assert!(matches!(submitted[1], Mutation::StartJob { .. }));
        assert_eq!(submitted.len(), 2);

        let job = client.job(&job_id).await.unwrap().unwrap();
        assert_eq!(job.status(), JobStatus::InProgress);
        assert_eq!(job.version(), 3);
        assert!(!job.is_dirty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn lost_acknowledgement_is_replayed_without_duplicates() {
        let authority = TestAuthority::new();
        let client = test_client(authority.clone(), TestTokens::with_token()).await;
        let conversation_id = seed_conversation(&client).await;

        // The authority applies the send but the acknowledgement is lost.
        *authority.fail_next.lock().unwrap() = Some(FailNext::TimeoutAfterApply);
        client
            .send_message(conversation_id, MessageKind::Text, "on my way".into())
            .await
            .unwrap();
        client.sync_once().await;

        // The replay under the same idempotency key got the original
        // confirmation; exactly one message, confirmed.
        assert_eq!(authority.submitted().len(), 2);
        let messages = client.messages(conversation_id).await.unwrap();
        assert_eq!(messages.len(), 1);
        assert!(messages[0].is_sent());
        assert!(client.pending_mutations().await.unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn canonical_order_wins_over_arrival_order() {
        let authority = TestAuthority::new();
        authority.next_seq.store(6, Ordering::SeqCst);
        let client = test_client(authority.clone(), TestTokens::with_token()).await;
        let conversation_id = seed_conversation(&client).await;

        // A peer message with an earlier canonical key arrives after the
        // local send was composed.
        let peer_message = RemoteMessage {
            canonical_id: MessageId::random(),
            client_key: None,
            conversation_id,
            sender: UserId::new("u2"),
            kind: MessageKind::Text,
            body: "peer first".into(),
            server_ts: TimeStamp::now(),
            server_seq: 5,
        };

        client
            .send_message(conversation_id, MessageKind::Text, "local second".into())
            .await
            .unwrap();
        client
            .process_remote_update(RemoteUpdate::Message(peer_message.clone()))
            .await
            .unwrap();
        client.sync_once().await;

        let bodies: Vec<_> = client
            .messages(conversation_id)
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.body().to_owned())
            .collect();
        assert_eq!(bodies, ["peer first", "local second"]);

        // At-least-once delivery: the duplicate push changes nothing.
        client
            .process_remote_update(RemoteUpdate::Message(peer_message))
            .await
            .unwrap();
        assert_eq!(client.messages(conversation_id).await.unwrap().len(), 2);
        assert_eq!(client.unread_messages_count(conversation_id).await.unwrap(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn dispatcher_cancellation_supersedes_local_completion() {
        let authority = TestAuthority::new();
        let client = test_client(authority.clone(), TestTokens::with_token()).await;

        let job_id = JobId::new("job-1");
        seed_job(
            &client,
            &authority,
            job_snapshot("job-1", 3, JobStatus::InProgress),
        )
        .await;

        // Completed locally while offline.
        client
            .complete_job(&job_id, CompletionReport::new("a@b.com"))
            .await
            .unwrap();

        // Meanwhile a dispatcher cancelled the job server-side.
        let mut cancelled = job_snapshot("job-1", 4, JobStatus::Cancelled);
        cancelled.cancel_reason = Some("customer cancelled the visit".into());
        authority.set_job(cancelled);

        client.sync_once().await;

        let job = client.job(&job_id).await.unwrap().unwrap();
        assert_eq!(job.status(), JobStatus::Cancelled);
        assert_eq!(job.version(), 4);
        assert_eq!(job.cancel_reason(), Some("customer cancelled the visit"));
        assert!(!job.is_dirty());
        assert_eq!(job.sync_outcome(), Some(&JobSyncOutcome::Superseded));
        assert!(client.pending_mutations().await.unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn missing_token_suspends_draining() {
        let authority = TestAuthority::new();
        let tokens = Arc::new(TestTokens::default());
        let client = test_client(authority.clone(), tokens.clone()).await;

        let job_id = JobId::new("job-1");
        seed_job(
            &client,
            &authority,
            job_snapshot("job-1", 1, JobStatus::Pending),
        )
        .await;
        client.accept_job(&job_id).await.unwrap();

        client.sync_once().await;
        assert!(authority.submitted().is_empty());
        let pending = client.pending_mutations().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].attempts(), 0);

        tokens.set(Some(AuthToken::new("token-1")));
        client.sync_once().await;
        assert_eq!(authority.submitted().len(), 1);
        assert!(client.pending_mutations().await.unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn rejected_token_leaves_mutation_queued() {
        let authority = TestAuthority::new();
        let client = test_client(authority.clone(), TestTokens::with_token()).await;

        let job_id = JobId::new("job-1");
        seed_job(
            &client,
            &authority,
            job_snapshot("job-1", 1, JobStatus::Pending),
        )
        .await;
        client.accept_job(&job_id).await.unwrap();

        // The transport refuses the token mid-drain; the entry must stay
        // queued without counting an attempt.
        *authority.fail_next.lock().unwrap() = Some(FailNext::Unauthenticated);
        client.sync_once().await;
        let pending = client.pending_mutations().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].attempts(), 0);

        client.sync_once().await;
        assert!(client.pending_mutations().await.unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn network_failure_backs_off_and_recovers() {
        let authority = TestAuthority::new();
        let client = test_client(authority.clone(), TestTokens::with_token()).await;

        let job_id = JobId::new("job-1");
        seed_job(
            &client,
            &authority,
            job_snapshot("job-1", 1, JobStatus::Pending),
        )
        .await;
        client.accept_job(&job_id).await.unwrap();

        *authority.fail_next.lock().unwrap() = Some(FailNext::Network);
        client.sync_once().await;

        // First attempt failed, the immediate retry succeeded.
        assert_eq!(authority.submitted().len(), 2);
        let job = client.job(&job_id).await.unwrap().unwrap();
        assert_eq!(job.status(), JobStatus::Accepted);
        assert!(!job.is_dirty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn rejected_mutation_rolls_back_with_reason() {
        let authority = TestAuthority::new();
        let client = test_client(authority.clone(), TestTokens::with_token()).await;

        let job_id = JobId::new("job-1");
        seed_job(
            &client,
            &authority,
            job_snapshot("job-1", 2, JobStatus::Accepted),
        )
        .await;

        client
            .cancel_job(&job_id, "customer no-show".into())
            .await
            .unwrap();
        *authority.reject_next.lock().unwrap() = Some("cancellation window elapsed".into());
        client.sync_once().await;

        let job = client.job(&job_id).await.unwrap().unwrap();
        assert_eq!(job.status(), JobStatus::Accepted);
        assert_eq!(job.cancel_reason(), None);
        assert!(!job.is_dirty());
        assert_eq!(
            job.sync_outcome(),
            Some(&JobSyncOutcome::Rejected {
                reason: "cancellation window elapsed".into()
            })
        );
        assert!(client.pending_mutations().await.unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn failed_message_can_be_retried() {
        let authority = TestAuthority::new();
        let client = test_client(authority.clone(), TestTokens::with_token()).await;
        let conversation_id = seed_conversation(&client).await;

        let message = client
            .send_message(conversation_id, MessageKind::Text, "running late".into())
            .await
            .unwrap();
        *authority.reject_next.lock().unwrap() = Some("conversation archived".into());
        client.sync_once().await;

        let failed = client.message(message.id()).await.unwrap().unwrap();
        assert_eq!(failed.status(), DeliveryStatus::Failed);

        client.retry_message(message.id()).await.unwrap();
        client.sync_once().await;

        let messages = client.messages(conversation_id).await.unwrap();
        assert_eq!(messages.len(), 1);
        assert!(messages[0].is_sent());
        assert_eq!(messages[0].client_key(), Some(message.id()));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn remote_push_creates_unknown_job() {
        let authority = TestAuthority::new();
        let client = test_client(authority.clone(), TestTokens::with_token()).await;

        let snapshot = job_snapshot("job-9", 1, JobStatus::Pending);
        client
            .process_remote_update(RemoteUpdate::Job(snapshot.clone()))
            .await
            .unwrap();
        let job = client.job(&JobId::new("job-9")).await.unwrap().unwrap();
        assert_eq!(job.status(), JobStatus::Pending);

        // Duplicate push with the same version is ignored.
        client
            .process_remote_update(RemoteUpdate::Job(snapshot))
            .await
            .unwrap();
        assert_eq!(client.jobs().await.unwrap().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn pending_mutation_can_be_cancelled() {
        let authority = TestAuthority::new();
        let client = test_client(authority.clone(), TestTokens::with_token()).await;

        let job_id = JobId::new("job-1");
        seed_job(
            &client,
            &authority,
            job_snapshot("job-1", 2, JobStatus::Accepted),
        )
        .await;

        let mutation_id = client
            .cancel_job(&job_id, "wrong address".into())
            .await
            .unwrap();
        assert!(client.cancel_mutation(mutation_id).await.unwrap());

        // The optimistic state is rebuilt from the synced snapshot.
        let job = client.job(&job_id).await.unwrap().unwrap();
        assert_eq!(job.status(), JobStatus::Accepted);
        assert!(!job.is_dirty());
        assert!(client.pending_mutations().await.unwrap().is_empty());

        client.sync_once().await;
        assert!(authority.submitted().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn remote_update_is_deferred_while_entity_in_flight() {
        let authority = TestAuthority::new();
        let client = test_client(authority.clone(), TestTokens::with_token()).await;

        let job_id = JobId::new("job-1");
        seed_job(
            &client,
            &authority,
            job_snapshot("job-1", 3, JobStatus::InProgress),
        )
        .await;
        client
            .complete_job(&job_id, CompletionReport::new("a@b.com"))
            .await
            .unwrap();

        let gate = Gate::new();
        *authority.gate.lock().unwrap() = Some(gate.clone());

        let drained = client.set_connected(true);
        gate.started.notified().await;

        // A newer remote snapshot arrives while the completion is in
        // flight; it must not be applied underneath the submission.
        let mut late_update = job_snapshot("job-1", 5, JobStatus::Completed);
        late_update.title = "Fix heat pump (rescheduled)".into();
        client
            .process_remote_update(RemoteUpdate::Job(late_update))
            .await
            .unwrap();
        let job = client.job(&job_id).await.unwrap().unwrap();
        assert_eq!(job.title(), "Fix heat pump");
        assert_eq!(job.version(), 3);

        gate.permits.add_permits(1);
        drained.await;
        client.set_connected(false).await;

        // Submission resolved first (version 4), then the deferred update
        // was applied on top.
        let job = client.job(&job_id).await.unwrap().unwrap();
        assert_eq!(job.version(), 5);
        assert_eq!(job.title(), "Fix heat pump (rescheduled)");
        assert!(!job.is_dirty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn committed_transactions_notify_subscribers() {
        let authority = TestAuthority::new();
        let client = test_client(authority.clone(), TestTokens::with_token()).await;

        let job_id = JobId::new("job-1");
        seed_job(
            &client,
            &authority,
            job_snapshot("job-1", 1, JobStatus::Pending),
        )
        .await;

        let mut notifications = std::pin::pin!(client.subscribe());
        let mutation_id = client.accept_job(&job_id).await.unwrap();

        let notification = tokio::time::timeout(Duration::from_secs(5), notifications.next())
            .await
            .expect("expected a store notification")
            .unwrap();
        assert!(notification.contains(job_id));
        assert!(notification.contains(mutation_id));
    }
}
