// SPDX-FileCopyrightText: 2025 Crewline Labs <dev@crewline.app>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! The job lifecycle state machine.
//!
//! Consulted both when a local intent is applied optimistically and by the
//! conflict resolver when deciding whether a remote state supersedes a local
//! one. Transitions not listed here are rejected before anything is stored
//! or enqueued.

use crewcommon::api::{CompletionReport, JobStatus};

/// A locally rejected job transition. Never leaves the device.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InvalidTransition {
    #[error("illegal job transition: {from} -> {to}")]
    IllegalEdge { from: JobStatus, to: JobStatus },
    #[error("cancelling a job requires a non-empty reason")]
    MissingCancelReason,
    #[error("completing a job requires a completion report")]
    MissingCompletionReport,
}

pub(crate) trait JobStatusExt {
    /// Legal edges: `Pending -> Accepted`, `Accepted -> InProgress`,
    /// `InProgress -> Completed` and any non-terminal status `-> Cancelled`.
    fn may_transition_to(self, next: JobStatus) -> bool;

    /// Position of a status along the lifecycle. Terminal statuses rank past
    /// everything non-terminal.
    fn progress_rank(self) -> u8;
}

impl JobStatusExt for JobStatus {
    fn may_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Pending, Accepted)
                | (Accepted, InProgress)
                | (InProgress, Completed)
                | (Pending, Cancelled)
                | (Accepted, Cancelled)
                | (InProgress, Cancelled)
        )
    }

    fn progress_rank(self) -> u8 {
        match self {
            JobStatus::Pending => 0,
            JobStatus::Accepted => 1,
            JobStatus::InProgress => 2,
            JobStatus::Completed | JobStatus::Cancelled => 3,
        }
    }
}

pub(crate) fn check_transition(from: JobStatus, to: JobStatus) -> Result<(), InvalidTransition> {
    if from.may_transition_to(to) {
        Ok(())
    } else {
        Err(InvalidTransition::IllegalEdge { from, to })
    }
}

pub(crate) fn check_cancel_reason(reason: &str) -> Result<(), InvalidTransition> {
    if reason.trim().is_empty() {
        Err(InvalidTransition::MissingCancelReason)
    } else {
        Ok(())
    }
}

pub(crate) fn check_completion_report(report: &CompletionReport) -> Result<(), InvalidTransition> {
    if report.is_empty() {
        Err(InvalidTransition::MissingCompletionReport)
    } else {
        Ok(())
    }
}
