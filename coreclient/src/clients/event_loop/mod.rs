// SPDX-FileCopyrightText: 2025 Crewline Labs <dev@crewline.app>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! The event loop of the [`CoreClient`](crate::clients::CoreClient).
//!
//! Remote-push events are applied one at a time through this loop, so their
//! application to the local store is linearized and never races a
//! concurrently delivered push for the same entity.

use std::sync::Weak;

use crewcommon::api::RemoteUpdate;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::{
    clients::{CoreClientInner, process},
    transport::Transport,
};

pub(crate) struct EventLoop {
    remote_update_rx: mpsc::Receiver<RemoteUpdate>,
    cancel: CancellationToken,
}

impl EventLoop {
    /// Creates a new [`EventLoop`].
    ///
    /// Returns the event loop, a sender for passing push events to it, and a
    /// cancellation token for stopping it.
    pub(crate) fn new() -> (Self, EventLoopSender, CancellationToken) {
        let (remote_update_tx, remote_update_rx) = mpsc::channel(1024);
        let cancel = CancellationToken::new();
        let sender = EventLoopSender { remote_update_tx };
        let event_loop = Self {
            remote_update_rx,
            cancel: cancel.clone(),
        };
        (event_loop, sender, cancel)
    }

    /// Spawns a task running the event loop.
    ///
    /// The task stops when one of the following conditions is met:
    /// * the cancellation token from the creation of the event loop is cancelled
    /// * the last instance of the `CoreClient` is dropped
    /// * the event loop sender channels are closed
    pub(crate) fn spawn<T: Transport + Sync + 'static>(self, core: Weak<CoreClientInner<T>>) {
        let cancel = self.cancel.clone();
        let task = cancel.run_until_cancelled_owned(self.run(core));
        tokio::spawn(task);
    }

    async fn run<T: Transport + Sync + 'static>(mut self, core: Weak<CoreClientInner<T>>) {
        while let Some(update) = self.remote_update_rx.recv().await {
            let Some(core) = core.upgrade() else {
                info!("Core client dropped; exit event loop");
                return;
            };
            if let Err(error) = process::handle_remote_update(&core, update).await {
                error!(%error, "Failed to apply remote update");
            }
        }
    }
}

/// Passes remote push events to the event loop.
///
/// Handed to the transport's push subscription; delivery is at-least-once
/// and possibly duplicated, deduplication happens during application.
#[derive(Debug, Clone)]
pub struct EventLoopSender {
    remote_update_tx: mpsc::Sender<RemoteUpdate>,
}

impl EventLoopSender {
    pub async fn send(&self, update: RemoteUpdate) {
        let _ = self.remote_update_tx.send(update).await;
    }
}
