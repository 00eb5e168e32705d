// SPDX-FileCopyrightText: 2025 Crewline Labs <dev@crewline.app>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Jobs assigned to the local worker.
//!
//! A job row carries the optimistic (displayed) state plus the last
//! acknowledged remote snapshot, so a rejected mutation can be rolled back
//! without network access. The remote version is authoritative and
//! increases strictly with every accepted mutation.

use crewcommon::{
    api::{CompletionReport, JobSnapshot, JobStatus},
    identifiers::{JobId, UserId},
};

pub mod lifecycle;

/// Outcome surfaced on a job after a local mutation was discarded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobSyncOutcome {
    /// The authority refused the transition as a business rule.
    Rejected { reason: String },
    /// A newer authoritative state made the local intent moot.
    Superseded,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    job_id: JobId,
    status: JobStatus,
    version: i64,
    title: String,
    assigned_to: UserId,
    cancel_reason: Option<String>,
    completion: Option<CompletionReport>,
    dirty: bool,
    sync_outcome: Option<JobSyncOutcome>,
    synced_status: JobStatus,
    synced_cancel_reason: Option<String>,
    synced_completion: Option<CompletionReport>,
}

impl Job {
    /// A clean job as reported by the remote authority.
    pub(crate) fn from_snapshot(snapshot: JobSnapshot) -> Self {
        let JobSnapshot {
            job_id,
            version,
            status,
            title,
            assigned_to,
            cancel_reason,
            completion,
        } = snapshot;
        Self {
            job_id,
            status,
            version,
            title,
            assigned_to,
            cancel_reason: cancel_reason.clone(),
            completion: completion.clone(),
            dirty: false,
            sync_outcome: None,
            synced_status: status,
            synced_cancel_reason: cancel_reason,
            synced_completion: completion,
        }
    }

    pub fn id(&self) -> &JobId {
        &self.job_id
    }

    pub fn status(&self) -> JobStatus {
        self.status
    }

    pub fn version(&self) -> i64 {
        self.version
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn assigned_to(&self) -> &UserId {
        &self.assigned_to
    }

    pub fn cancel_reason(&self) -> Option<&str> {
        self.cancel_reason.as_deref()
    }

    pub fn completion(&self) -> Option<&CompletionReport> {
        self.completion.as_ref()
    }

    /// A dirty job has a pending local mutation not yet acknowledged by the
    /// remote authority.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn sync_outcome(&self) -> Option<&JobSyncOutcome> {
        self.sync_outcome.as_ref()
    }

    /// Applies a locally intended transition to the in-memory state only.
    pub(crate) fn apply_local(
        &mut self,
        target: JobStatus,
        cancel_reason: Option<String>,
        completion: Option<CompletionReport>,
    ) {
        self.status = target;
        if cancel_reason.is_some() {
            self.cancel_reason = cancel_reason;
        }
        if completion.is_some() {
            self.completion = completion;
        }
        self.dirty = true;
        self.sync_outcome = None;
    }

    /// Drops the optimistic state and falls back to the last acknowledged
    /// remote snapshot. In-memory only.
    pub(crate) fn reset_to_synced(&mut self) {
        self.status = self.synced_status;
        self.cancel_reason = self.synced_cancel_reason.clone();
        self.completion = self.synced_completion.clone();
        self.dirty = false;
    }

    fn set_remote_state(&mut self, snapshot: &JobSnapshot) {
        self.status = snapshot.status;
        self.version = snapshot.version;
        self.title = snapshot.title.clone();
        self.assigned_to = snapshot.assigned_to.clone();
        self.cancel_reason = snapshot.cancel_reason.clone();
        self.completion = snapshot.completion.clone();
        self.synced_status = snapshot.status;
        self.synced_cancel_reason = snapshot.cancel_reason.clone();
        self.synced_completion = snapshot.completion.clone();
    }
}

pub(crate) mod persistence {
    use sqlx::{SqliteConnection, SqliteExecutor, query, query_as};
    use tracing::{error, warn};

    use crate::store::StoreNotifier;

    use super::*;

    #[derive(Debug, thiserror::Error)]
    enum JobRecordError {
        #[error("unknown job status: {0}")]
        UnknownStatus(String),
        #[error("negative job version: {0}")]
        NegativeVersion(i64),
        #[error("unknown sync outcome kind: {0}")]
        UnknownOutcome(String),
    }

    #[derive(sqlx::FromRow)]
    struct SqlJob {
        job_id: JobId,
        status: String,
        version: i64,
        title: String,
        assigned_to: UserId,
        cancel_reason: Option<String>,
        completion_email: Option<String>,
        dirty: bool,
        outcome_kind: Option<String>,
        outcome_reason: Option<String>,
        synced_status: String,
        synced_cancel_reason: Option<String>,
        synced_completion_email: Option<String>,
    }

    impl SqlJob {
        fn decode(self) -> Result<Job, JobRecordError> {
            let status = JobStatus::from_repr(&self.status)
                .ok_or_else(|| JobRecordError::UnknownStatus(self.status.clone()))?;
            let synced_status = JobStatus::from_repr(&self.synced_status)
                .ok_or_else(|| JobRecordError::UnknownStatus(self.synced_status.clone()))?;
            if self.version < 0 {
                return Err(JobRecordError::NegativeVersion(self.version));
            }
            let sync_outcome = match self.outcome_kind.as_deref() {
                None => None,
                Some("rejected") => Some(JobSyncOutcome::Rejected {
                    reason: self.outcome_reason.unwrap_or_default(),
                }),
                Some("superseded") => Some(JobSyncOutcome::Superseded),
                Some(other) => return Err(JobRecordError::UnknownOutcome(other.to_owned())),
            };
            Ok(Job {
                job_id: self.job_id,
                status,
                version: self.version,
                title: self.title,
                assigned_to: self.assigned_to,
                cancel_reason: self.cancel_reason,
                completion: self.completion_email.map(CompletionReport::new),
                dirty: self.dirty,
                sync_outcome,
                synced_status,
                synced_cancel_reason: self.synced_cancel_reason,
                synced_completion: self.synced_completion_email.map(CompletionReport::new),
            })
        }
    }

    const SELECT_COLUMNS: &str = "job_id, status, version, title, assigned_to, cancel_reason, \
        completion_email, dirty, outcome_kind, outcome_reason, synced_status, \
        synced_cancel_reason, synced_completion_email";

    impl Job {
        pub(crate) async fn store(
            &self,
            executor: impl SqliteExecutor<'_>,
            notifier: &mut StoreNotifier,
        ) -> sqlx::Result<()> {
            self.write(executor).await?;
            notifier.add(self.job_id.clone());
            Ok(())
        }

        pub(crate) async fn update(
            &self,
            executor: impl SqliteExecutor<'_>,
            notifier: &mut StoreNotifier,
        ) -> sqlx::Result<()> {
            self.write(executor).await?;
            notifier.update(self.job_id.clone());
            Ok(())
        }

        async fn write(&self, executor: impl SqliteExecutor<'_>) -> sqlx::Result<()> {
            let (outcome_kind, outcome_reason) = match &self.sync_outcome {
                None => (None, None),
                Some(JobSyncOutcome::Rejected { reason }) => {
                    (Some("rejected"), Some(reason.clone()))
                }
                Some(JobSyncOutcome::Superseded) => (Some("superseded"), None),
            };
            // A fresh write also repairs a previously quarantined record.
            query(
                "INSERT OR REPLACE INTO job (
                    job_id, status, version, title, assigned_to, cancel_reason,
                    completion_email, dirty, outcome_kind, outcome_reason,
                    synced_status, synced_cancel_reason, synced_completion_email,
                    quarantined
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0)",
            )
            .bind(&self.job_id)
            .bind(self.status.repr())
            .bind(self.version)
            .bind(&self.title)
            .bind(&self.assigned_to)
            .bind(&self.cancel_reason)
            .bind(self.completion.as_ref().map(|r| &r.confirmation_email))
            .bind(self.dirty)
            .bind(outcome_kind)
            .bind(outcome_reason)
            .bind(self.synced_status.repr())
            .bind(&self.synced_cancel_reason)
            .bind(
                self.synced_completion
                    .as_ref()
                    .map(|r| &r.confirmation_email),
            )
            .execute(executor)
            .await?;
            Ok(())
        }

        /// Loads a job, quarantining it if the stored record is corrupt.
        ///
        /// A quarantined record is excluded from reads and from sync until a
        /// fresh authoritative snapshot replaces it.
        pub(crate) async fn load(
            connection: &mut SqliteConnection,
            job_id: &JobId,
        ) -> sqlx::Result<Option<Job>> {
            let sql_job = query_as::<_, SqlJob>(&format!(
                "SELECT {SELECT_COLUMNS} FROM job WHERE job_id = ? AND quarantined = 0"
            ))
            .bind(job_id)
            .fetch_optional(&mut *connection)
            .await?;
            let Some(sql_job) = sql_job else {
                return Ok(None);
            };
            match sql_job.decode() {
                Ok(job) => Ok(Some(job)),
                Err(error) => {
                    error!(%job_id, %error, "Corrupt job record; quarantining");
                    Self::quarantine(connection, job_id).await?;
                    Ok(None)
                }
            }
        }

        pub(crate) async fn load_all(connection: &mut SqliteConnection) -> sqlx::Result<Vec<Job>> {
            let sql_jobs = query_as::<_, SqlJob>(&format!(
                "SELECT {SELECT_COLUMNS} FROM job WHERE quarantined = 0 ORDER BY job_id"
            ))
            .fetch_all(&mut *connection)
            .await?;
            let mut jobs = Vec::with_capacity(sql_jobs.len());
            for sql_job in sql_jobs {
                let job_id = sql_job.job_id.clone();
                match sql_job.decode() {
                    Ok(job) => jobs.push(job),
                    Err(error) => {
                        error!(%job_id, %error, "Corrupt job record; quarantining");
                        Self::quarantine(&mut *connection, &job_id).await?;
                    }
                }
            }
            Ok(jobs)
        }

        pub(crate) async fn quarantine(
            executor: impl SqliteExecutor<'_>,
            job_id: &JobId,
        ) -> sqlx::Result<()> {
            warn!(%job_id, "Excluding job from reads and sync");
            query("UPDATE job SET quarantined = 1 WHERE job_id = ?")
                .bind(job_id)
                .execute(executor)
                .await?;
            Ok(())
        }

        /// Applies a locally intended transition ahead of remote
        /// confirmation. The caller has already validated it against the
        /// lifecycle.
        pub(crate) async fn apply_optimistic(
            &mut self,
            executor: impl SqliteExecutor<'_>,
            notifier: &mut StoreNotifier,
            target: JobStatus,
            cancel_reason: Option<String>,
            completion: Option<CompletionReport>,
        ) -> sqlx::Result<()> {
            self.apply_local(target, cancel_reason, completion);
            self.update(executor, notifier).await
        }

        /// Stamps the state returned by the authority after it accepted the
        /// job's last outstanding mutation; the job settles clean.
        pub(crate) async fn acknowledge(
            &mut self,
            executor: impl SqliteExecutor<'_>,
            notifier: &mut StoreNotifier,
            snapshot: &JobSnapshot,
        ) -> sqlx::Result<()> {
            self.set_remote_state(snapshot);
            self.dirty = false;
            self.sync_outcome = None;
            self.update(executor, notifier).await
        }

        /// The remote state won outright; the local intent is discarded.
        pub(crate) async fn supersede(
            &mut self,
            executor: impl SqliteExecutor<'_>,
            notifier: &mut StoreNotifier,
            snapshot: &JobSnapshot,
        ) -> sqlx::Result<()> {
            self.set_remote_state(snapshot);
            self.dirty = false;
            self.sync_outcome = Some(JobSyncOutcome::Superseded);
            self.update(executor, notifier).await
        }

        /// Restores the last known-good remote state after the authority
        /// rejected the local mutation.
        pub(crate) async fn roll_back(
            &mut self,
            executor: impl SqliteExecutor<'_>,
            notifier: &mut StoreNotifier,
            reason: String,
        ) -> sqlx::Result<()> {
            self.reset_to_synced();
            self.sync_outcome = Some(JobSyncOutcome::Rejected { reason });
            self.update(executor, notifier).await
        }

        /// Absorbs a remote update as the new synced base while a local
        /// optimistic state it does not supersede stays displayed.
        pub(crate) async fn absorb_remote(
            &mut self,
            executor: impl SqliteExecutor<'_>,
            notifier: &mut StoreNotifier,
            snapshot: &JobSnapshot,
        ) -> sqlx::Result<()> {
            self.version = snapshot.version;
            self.synced_status = snapshot.status;
            self.synced_cancel_reason = snapshot.cancel_reason.clone();
            self.synced_completion = snapshot.completion.clone();
            self.update(executor, notifier).await
        }
    }
}
