// SPDX-FileCopyrightText: 2025 Crewline Labs <dev@crewline.app>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

use std::{
    fmt,
    ops::{Add, Deref, Sub},
    time::Duration,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A UTC timestamp.
///
/// Device-local timestamps are provisional; once the remote authority has
/// confirmed an entity, its timestamps are server-authoritative.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    sqlx::Type,
    derive_more::From,
)]
#[sqlx(transparent)]
pub struct TimeStamp(DateTime<Utc>);

impl TimeStamp {
    pub fn now() -> Self {
        Self(Utc::now())
    }

    pub fn as_utc(&self) -> DateTime<Utc> {
        self.0
    }
}

impl Deref for TimeStamp {
    type Target = DateTime<Utc>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Add<Duration> for TimeStamp {
    type Output = TimeStamp;

    fn add(self, rhs: Duration) -> Self::Output {
        Self(self.0 + rhs)
    }
}

impl Sub<Duration> for TimeStamp {
    type Output = TimeStamp;

    fn sub(self, rhs: Duration) -> Self::Output {
        Self(self.0 - rhs)
    }
}

impl fmt::Display for TimeStamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}
