// SPDX-FileCopyrightText: 2025 Crewline Labs <dev@crewline.app>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Codec used for values persisted as opaque blobs (queued mutation
//! payloads). Centralized so the on-disk representation can change in one
//! place.

use serde::{Serialize, de::DeserializeOwned};

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("failed to encode persisted value: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("failed to decode persisted value: {0}")]
    Decode(#[source] serde_json::Error),
}

pub struct PersistenceCodec;

impl PersistenceCodec {
    pub fn to_vec<T: Serialize>(value: &T) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(value).map_err(CodecError::Encode)
    }

    pub fn from_slice<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CodecError> {
        serde_json::from_slice(bytes).map_err(CodecError::Decode)
    }
}
