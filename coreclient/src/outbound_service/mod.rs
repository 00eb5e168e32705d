// SPDX-FileCopyrightText: 2025 Crewline Labs <dev@crewline.app>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

use std::{
    pin::Pin,
    sync::{Arc, Mutex},
    task::{Context, Poll},
    time::Duration,
};

use crewcommon::api::{EntityKind, MutationTarget, RemoteUpdate};
use pin_project::pin_project;
use sqlx::SqlitePool;
use tokio::{sync::watch, time::MissedTickBehavior};
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};
use tracing::{debug, error};

use crate::{
    store::{StoreNotificationsSender, StoreNotifier},
    transport::{TokenProvider, Transport},
    utils::connection_ext::StoreExt,
};

mod drain;
mod error;

pub(crate) use error::OutboundServiceError;

/// Tunables of the sync engine.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Upper bound on a single transport submission.
    pub submit_timeout: Duration,
    /// Base of the per-entity retry backoff.
    pub backoff_base: Duration,
    /// Cap of the retry backoff.
    pub backoff_cap: Duration,
    /// Period of the background drain tick.
    pub tick_interval: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            submit_timeout: Duration::from_secs(10),
            backoff_base: Duration::from_secs(1),
            backoff_cap: Duration::from_secs(60),
            tick_interval: Duration::from_secs(30),
        }
    }
}

/// A service which is responsible for replaying queued mutations.
///
/// The service starts a background task which drains the mutation queue. The
/// initial state of the service is `Stopped`, that is, the background task
/// is not running. The background task only runs when the service is
/// started, and when there is a notification to run. After doing the work
/// once, it waits for the next notification, or stops if it is stopped.
#[derive(Clone)]
pub struct OutboundService<C: OutboundServiceWork> {
    context: C,
    run_token_tx: watch::Sender<RunToken>,
}

pub trait OutboundServiceWork: Clone + Send + 'static {
    fn work(&self, run_token: CancellationToken) -> impl Future<Output = ()> + Send;
}

impl<T: Transport + Sync + 'static> OutboundServiceWork for OutboundServiceContext<T> {
    async fn work(&self, run_token: CancellationToken) {
        if let Err(error) = self.drain_mutation_queue(&run_token).await {
            error!(%error, "Failed to drain mutation queue");
        }
    }
}

impl<T: Transport + Sync + 'static> OutboundService<OutboundServiceContext<T>> {
    pub(crate) fn new(
        pool: SqlitePool,
        transport: Arc<T>,
        tokens: Arc<dyn TokenProvider>,
        config: SyncConfig,
        store_notifications_tx: StoreNotificationsSender,
        in_flight: InFlightGuard,
    ) -> Self {
        let context = OutboundServiceContext {
            pool,
            transport,
            tokens,
            config,
            store_notifications_tx,
            in_flight,
        };
        Self::with_context(context)
    }
}

impl<C: OutboundServiceWork> OutboundService<C> {
    fn with_context(context: C) -> Self {
        let (run_token_tx, run_token_rx) = watch::channel(RunToken::new_cancelled());
        let task = OutboundServiceTask {
            context: context.clone(),
        };
        tokio::spawn(task.run(run_token_rx));
        Self {
            context,
            run_token_tx,
        }
    }

    /// Starts the background task.
    ///
    /// Returns a future which finishes when the background task is done.
    pub fn start(&self) -> WaitForDoneFuture {
        let mut done_token = None;
        self.run_token_tx.send_if_modified(|run_token| {
            if !run_token.rotate() {
                run_token.rotate_done();
            }
            done_token = Some(run_token.done.clone());
            true // notify the background task
        });
        debug!("starting background task");
        WaitForDoneFuture::new(done_token)
    }

    /// Notifies the background task to stop.
    ///
    /// Returns a future which resolves when the background task fully stops.
    pub fn stop(&self) -> WaitForDoneFuture {
        let mut done_token = None;
        self.run_token_tx.send_if_modified(|run_token| {
            run_token.cancel();
            done_token = Some(run_token.done.clone());
            false // no more work => no need to wake up the background task
        });
        debug!("stopping background task");
        WaitForDoneFuture::new(done_token)
    }

    /// Notifies the background task about new work.
    pub(crate) fn notify_work(&self) -> WaitForDoneFuture {
        let mut done_token = None;
        let notified = self.run_token_tx.send_if_modified(|run_token| {
            if run_token.is_cancelled() {
                false
            } else {
                run_token.rotate_done();
                done_token = Some(run_token.done.clone());
                true
            }
        });
        debug!(?notified, "notifying background task about new work");
        WaitForDoneFuture::new(done_token)
    }

    /// Runs the background task and waits until it is done.
    ///
    /// If the background task is already running, just waits until it is
    /// done. The task is stopped in any case.
    pub async fn run_once(&self) {
        self.start().await;
        self.stop().await;
    }

    /// Wakes the drain periodically while the service is started.
    pub(crate) fn spawn_tick(&self, interval: Duration, cancel: CancellationToken) {
        let service = self.clone();
        let task = cancel.run_until_cancelled_owned(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                service.notify_work();
            }
        });
        tokio::spawn(task);
    }
}

struct OutboundServiceTask<C> {
    context: C,
}

impl<C: OutboundServiceWork> OutboundServiceTask<C> {
    async fn run(self, mut run_token_rx: watch::Receiver<RunToken>) {
        loop {
            if run_token_rx.changed().await.is_err() {
                break;
            }

            let run_token = {
                let run_token = run_token_rx.borrow_and_update().clone();
                debug!(?run_token, "incoming work notification");

                if run_token.is_cancelled() {
                    run_token.mark_as_done();
                    continue;
                }

                run_token
            };

            debug!("starting doing work in background task");
            self.context.work(run_token.cancel.clone()).await;
            debug!("finished work in background task");

            run_token.mark_as_done();
        }
    }
}

pub struct OutboundServiceContext<T> {
    pool: SqlitePool,
    transport: Arc<T>,
    tokens: Arc<dyn TokenProvider>,
    config: SyncConfig,
    store_notifications_tx: StoreNotificationsSender,
    in_flight: InFlightGuard,
}

impl<T> Clone for OutboundServiceContext<T> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            transport: self.transport.clone(),
            tokens: self.tokens.clone(),
            config: self.config.clone(),
            store_notifications_tx: self.store_notifications_tx.clone(),
            in_flight: self.in_flight.clone(),
        }
    }
}

impl<T> StoreExt for OutboundServiceContext<T> {
    fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    fn notifier(&self) -> StoreNotifier {
        StoreNotifier::new(self.store_notifications_tx.clone())
    }
}

/// Tracks the entity of the in-flight submission.
///
/// A remote-push update for that entity is buffered here and applied right
/// after the in-flight result is resolved, so a push can never race an
/// unresolved submission on the same entity.
#[derive(Debug, Clone, Default)]
pub(crate) struct InFlightGuard {
    inner: Arc<Mutex<InFlightInner>>,
}

#[derive(Debug, Default)]
struct InFlightInner {
    current: Option<MutationTarget>,
    buffered: Vec<RemoteUpdate>,
}

impl InFlightGuard {
    pub(crate) fn begin(&self, target: MutationTarget) {
        let mut inner = self.inner.lock().expect("poisoned in-flight lock");
        inner.current = Some(target);
    }

    /// Clears the in-flight marker and hands back the updates deferred
    /// while it was set.
    pub(crate) fn finish(&self) -> Vec<RemoteUpdate> {
        let mut inner = self.inner.lock().expect("poisoned in-flight lock");
        inner.current = None;
        std::mem::take(&mut inner.buffered)
    }

    /// Buffers the update if its target entity has an in-flight submission.
    /// Returns whether the update was deferred.
    pub(crate) fn defer_if_in_flight(&self, update: &RemoteUpdate) -> bool {
        let mut inner = self.inner.lock().expect("poisoned in-flight lock");
        let Some(current) = &inner.current else {
            return false;
        };
        let targets_current = match update {
            RemoteUpdate::Job(snapshot) => {
                current.kind == EntityKind::Job && current.id == snapshot.job_id.to_string()
            }
            RemoteUpdate::Message(message) => {
                current.kind == EntityKind::Message
                    && message
                        .client_key
                        .is_some_and(|key| current.id == key.to_string())
            }
        };
        if targets_current {
            inner.buffered.push(update.clone());
        }
        targets_current
    }
}

/// A token sent to the background task as work permit.
///
/// The token is stored in a [`tokio::sync::watch`] cell. Whenever the token
/// is updated, the background task is woken up and uses the token to start
/// work (if it is not running yet). When the token is cancelled, the
/// background work (if any) is cancelled. There is no need to wake up the
/// background task in this case.
///
/// The token also contains a `done` token which is *shared* between the
/// callers and the background task. The background task uses it to mark the
/// work as done. In case the run token is created but the work is
/// immediately cancelled such that the background task never receives the
/// token, the done token is cancelled too.
#[derive(Debug, Default, Clone)]
struct RunToken {
    cancel: CancellationToken,
    done: CancellationToken,
}

impl RunToken {
    fn new() -> Self {
        Default::default()
    }

    fn new_cancelled() -> Self {
        let run_token = RunToken::new();
        run_token.cancel();
        run_token.mark_as_done();
        run_token
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    fn rotate(&mut self) -> bool {
        if self.is_cancelled() {
            *self = RunToken::new();
            true
        } else {
            false
        }
    }

    fn rotate_done(&mut self) -> bool {
        if self.done.is_cancelled() {
            self.done = CancellationToken::new();
            true
        } else {
            false
        }
    }

    fn cancel(&self) {
        self.cancel.cancel();
    }

    fn mark_as_done(&self) {
        self.done.cancel();
    }
}

/// A future that resolves when the background task is done.
///
/// This future is not marked as `must_use`, because the default usage of the
/// apis returning this future is not to wait for its completion.
#[pin_project]
pub struct WaitForDoneFuture {
    #[pin]
    done_fut: Option<WaitForCancellationFutureOwned>,
}

impl WaitForDoneFuture {
    fn new(done: Option<CancellationToken>) -> Self {
        Self {
            done_fut: done.map(|done| done.cancelled_owned()),
        }
    }
}

impl Future for WaitForDoneFuture {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.project().done_fut.as_pin_mut() {
            Some(fut) => fut.poll(cx),
            None => Poll::Ready(()),
        }
    }
}
