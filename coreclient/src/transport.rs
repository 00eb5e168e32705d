// SPDX-FileCopyrightText: 2025 Crewline Labs <dev@crewline.app>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! The boundary towards the remote authority.
//!
//! The concrete network client lives outside this crate; the sync engine
//! only depends on these traits. Push events enter separately through
//! [`crate::clients::CoreClient::push_sender`].

use crewcommon::api::{AuthToken, SubmitRequest, SubmitResponse};

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("network error: {0}")]
    Network(String),
    #[error("request timed out")]
    Timeout,
    #[error("missing or expired auth token")]
    Unauthenticated,
}

impl TransportError {
    /// Retryable failures leave the mutation queued and back off; the rest
    /// are handled per kind.
    pub fn is_retryable(&self) -> bool {
        matches!(self, TransportError::Network(_) | TransportError::Timeout)
    }
}

/// Submits mutations to the remote authority.
///
/// `submit` must be idempotent per mutation id: a resubmission under an
/// already-applied idempotency key answers with the original result.
#[trait_variant::make(Transport: Send)]
pub trait LocalTransport {
    async fn submit(&self, request: SubmitRequest) -> Result<SubmitResponse, TransportError>;
}

/// Read access to the current credential.
///
/// `None` suspends queue draining until a token is available again.
pub trait TokenProvider: Send + Sync + 'static {
    fn current_token(&self) -> Option<AuthToken>;
}
