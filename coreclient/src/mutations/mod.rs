// SPDX-FileCopyrightText: 2025 Crewline Labs <dev@crewline.app>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! The durable outbound mutation queue.
//!
//! Every local mutation is appended here inside the same transaction that
//! applies it optimistically, so the queue and the optimistic state can
//! never diverge. Entries drain FIFO per target entity: if the head entry of
//! one entity is not yet retry-eligible, an eligible entry of a *different*
//! entity may drain, but same-entity order is never violated.

use std::time::Duration;

use crewcommon::{
    api::{Mutation, MutationTarget},
    identifiers::{JobId, MutationId},
    time::TimeStamp,
};
use rand::Rng;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutationQueueEntry {
    mutation_id: MutationId,
    target: MutationTarget,
    mutation: Mutation,
    number_of_attempts: u32,
    retry_due_at: Option<TimeStamp>,
    created_at: TimeStamp,
}

impl MutationQueueEntry {
    pub(crate) fn new(mutation: Mutation) -> Self {
        Self {
            mutation_id: MutationId::random(),
            target: mutation.target(),
            mutation,
            number_of_attempts: 0,
            retry_due_at: None,
            created_at: TimeStamp::now(),
        }
    }

    pub fn id(&self) -> MutationId {
        self.mutation_id
    }

    pub fn target(&self) -> &MutationTarget {
        &self.target
    }

    pub fn mutation(&self) -> &Mutation {
        &self.mutation
    }

    pub fn attempts(&self) -> u32 {
        self.number_of_attempts
    }

    pub fn retry_due_at(&self) -> Option<TimeStamp> {
        self.retry_due_at
    }

    pub fn created_at(&self) -> TimeStamp {
        self.created_at
    }
}

/// Full-jitter exponential backoff: a uniform sample from zero up to
/// `base * 2^attempts`, capped.
pub(crate) fn backoff_delay(base: Duration, cap: Duration, attempts: u32) -> Duration {
    let ceiling = base
        .saturating_mul(2u32.saturating_pow(attempts.min(16)))
        .min(cap);
    if ceiling.is_zero() {
        return Duration::ZERO;
    }
    rand::thread_rng().gen_range(Duration::ZERO..=ceiling)
}

pub(crate) mod persistence {
    use crewcommon::{
        api::{EntityKind, JobStatus, Mutation},
        codec::PersistenceCodec,
    };
    use sqlx::{SqliteConnection, SqliteExecutor, query, query_as, query_scalar};
    use tracing::{debug, warn};
    use uuid::Uuid;

    use crate::{
        jobs::{Job, lifecycle::JobStatusExt},
        store::StoreNotifier,
    };

    use super::*;

    #[derive(sqlx::FromRow)]
    struct SqlMutationQueueEntry {
        mutation_id: MutationId,
        entity_kind: EntityKind,
        entity_id: String,
        payload: Vec<u8>,
        number_of_attempts: i64,
        retry_due_at: Option<TimeStamp>,
        created_at: TimeStamp,
    }

    impl SqlMutationQueueEntry {
        fn decode(self) -> sqlx::Result<MutationQueueEntry> {
            let mutation: Mutation = PersistenceCodec::from_slice(&self.payload)
                .map_err(|e| sqlx::Error::Decode(Box::new(e)))?;
            Ok(MutationQueueEntry {
                mutation_id: self.mutation_id,
                target: MutationTarget {
                    kind: self.entity_kind,
                    id: self.entity_id,
                },
                mutation,
                number_of_attempts: self.number_of_attempts as u32,
                retry_due_at: self.retry_due_at,
                created_at: self.created_at,
            })
        }
    }

    const SELECT_COLUMNS: &str = "mutation_id, entity_kind, entity_id, payload, \
        number_of_attempts, retry_due_at, created_at";

    impl MutationQueueEntry {
        pub(crate) async fn enqueue(&self, executor: impl SqliteExecutor<'_>) -> sqlx::Result<()> {
            debug!(mutation_id = %self.mutation_id, entity_id = %self.target.id, "Enqueueing mutation");

            let payload = PersistenceCodec::to_vec(&self.mutation)
                .map_err(|e| sqlx::Error::Encode(Box::new(e)))?;
            query(
                "INSERT INTO mutation_queue
                    (mutation_id, entity_kind, entity_id, payload, number_of_attempts,
                    retry_due_at, created_at)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT DO NOTHING",
            )
            .bind(self.mutation_id)
            .bind(self.target.kind)
            .bind(&self.target.id)
            .bind(payload)
            .bind(self.number_of_attempts as i64)
            .bind(self.retry_due_at)
            .bind(self.created_at)
            .execute(executor)
            .await?;
            Ok(())
        }

        /// Locks and returns the next admissible entry: the oldest one that
        /// heads its entity's FIFO, is retry-eligible, is not locked by this
        /// drain cycle, and whose target entity is not quarantined.
        ///
        /// Locks held under a different task id are ignored, so entries
        /// locked by a dead process never strand.
        pub(crate) async fn dequeue(
            executor: impl SqliteExecutor<'_>,
            task_id: Uuid,
            now: TimeStamp,
        ) -> sqlx::Result<Option<MutationQueueEntry>> {
            let entry = query_as::<_, SqlMutationQueueEntry>(&format!(
                "UPDATE mutation_queue SET locked_by = ?1
                WHERE queue_position = (
                    SELECT m.queue_position FROM mutation_queue m
                    WHERE (m.locked_by IS NULL OR m.locked_by != ?1)
                        AND (m.retry_due_at IS NULL OR m.retry_due_at <= ?2)
                        AND NOT EXISTS (
                            SELECT 1 FROM mutation_queue e
                            WHERE e.entity_kind = m.entity_kind
                                AND e.entity_id = m.entity_id
                                AND e.queue_position < m.queue_position
                        )
                        AND NOT (m.entity_kind = 'job' AND EXISTS (
                            SELECT 1 FROM job j
                            WHERE j.job_id = m.entity_id AND j.quarantined = 1
                        ))
                    ORDER BY m.queue_position ASC
                    LIMIT 1
                )
                RETURNING {SELECT_COLUMNS}"
            ))
            .bind(task_id)
            .bind(now)
            .fetch_optional(executor)
            .await?;
            entry.map(SqlMutationQueueEntry::decode).transpose()
        }

        /// Removes an acknowledged entry.
        pub(crate) async fn ack(
            executor: impl SqliteExecutor<'_>,
            mutation_id: MutationId,
        ) -> sqlx::Result<()> {
            query("DELETE FROM mutation_queue WHERE mutation_id = ?")
                .bind(mutation_id)
                .execute(executor)
                .await?;
            Ok(())
        }

        /// Schedules a retry: bumps the attempt count, sets the retry
        /// deadline and releases the drain lock.
        pub(crate) async fn nack(
            executor: impl SqliteExecutor<'_>,
            mutation_id: MutationId,
            delay: Duration,
            now: TimeStamp,
        ) -> sqlx::Result<()> {
            let retry_due_at = now + delay;
            query(
                "UPDATE mutation_queue
                SET number_of_attempts = number_of_attempts + 1,
                    retry_due_at = ?, locked_by = NULL
                WHERE mutation_id = ?",
            )
            .bind(retry_due_at)
            .bind(mutation_id)
            .execute(executor)
            .await?;
            Ok(())
        }

        /// Releases the drain lock without counting an attempt. Used when
        /// draining suspends (missing auth token) rather than fails.
        pub(crate) async fn release(
            executor: impl SqliteExecutor<'_>,
            mutation_id: MutationId,
        ) -> sqlx::Result<()> {
            query("UPDATE mutation_queue SET locked_by = NULL WHERE mutation_id = ?")
                .bind(mutation_id)
                .execute(executor)
                .await?;
            Ok(())
        }

        /// Removes an entry, but only while it is still pending (not locked
        /// by a drain cycle). Returns the removed entry.
        pub(crate) async fn remove_if_pending(
            executor: impl SqliteExecutor<'_>,
            mutation_id: MutationId,
        ) -> sqlx::Result<Option<MutationQueueEntry>> {
            let entry = query_as::<_, SqlMutationQueueEntry>(&format!(
                "DELETE FROM mutation_queue
                WHERE mutation_id = ? AND locked_by IS NULL
                RETURNING {SELECT_COLUMNS}"
            ))
            .bind(mutation_id)
            .fetch_optional(executor)
            .await?;
            entry.map(SqlMutationQueueEntry::decode).transpose()
        }

        pub(crate) async fn load_all(
            executor: impl SqliteExecutor<'_>,
        ) -> sqlx::Result<Vec<MutationQueueEntry>> {
            let entries = query_as::<_, SqlMutationQueueEntry>(&format!(
                "SELECT {SELECT_COLUMNS} FROM mutation_queue ORDER BY queue_position ASC"
            ))
            .fetch_all(executor)
            .await?;
            entries.into_iter().map(SqlMutationQueueEntry::decode).collect()
        }

        pub(crate) async fn pending_count(executor: impl SqliteExecutor<'_>) -> sqlx::Result<u64> {
            let count = query_scalar::<_, i64>("SELECT COUNT(*) FROM mutation_queue")
                .fetch_one(executor)
                .await?;
            Ok(count as u64)
        }

        pub(crate) async fn has_pending_for_target(
            executor: impl SqliteExecutor<'_>,
            target: &MutationTarget,
        ) -> sqlx::Result<bool> {
            let exists = query_scalar::<_, i64>(
                "SELECT EXISTS(SELECT 1 FROM mutation_queue
                WHERE entity_kind = ? AND entity_id = ?)",
            )
            .bind(target.kind)
            .bind(&target.id)
            .fetch_one(executor)
            .await?;
            Ok(exists == 1)
        }

        /// Drops all queued mutations for an entity whose intents a terminal
        /// remote state has made moot.
        pub(crate) async fn delete_for_target(
            executor: impl SqliteExecutor<'_>,
            target: &MutationTarget,
        ) -> sqlx::Result<u64> {
            let result = query("DELETE FROM mutation_queue WHERE entity_kind = ? AND entity_id = ?")
                .bind(target.kind)
                .bind(&target.id)
                .execute(executor)
                .await?;
            Ok(result.rows_affected())
        }

        async fn load_pending_for_job(
            executor: impl SqliteExecutor<'_>,
            job_id: &JobId,
        ) -> sqlx::Result<Vec<MutationQueueEntry>> {
            let entries = query_as::<_, SqlMutationQueueEntry>(&format!(
                "SELECT {SELECT_COLUMNS} FROM mutation_queue
                WHERE entity_kind = 'job' AND entity_id = ?
                ORDER BY queue_position ASC"
            ))
            .bind(job_id)
            .fetch_all(executor)
            .await?;
            entries.into_iter().map(SqlMutationQueueEntry::decode).collect()
        }
    }

    /// Recomputes a job's optimistic state from its synced snapshot plus the
    /// mutations still queued for it, dropping entries whose transition is
    /// no longer legal.
    ///
    /// Used after a queued mutation was cancelled by the issuer and after a
    /// rejection rolled the job back underneath its successors.
    pub(crate) async fn rebuild_job_projection(
        connection: &mut SqliteConnection,
        notifier: &mut StoreNotifier,
        job_id: &JobId,
    ) -> anyhow::Result<()> {
        let Some(mut job) = Job::load(connection, job_id).await? else {
            return Ok(());
        };
        job.reset_to_synced();

        let entries = MutationQueueEntry::load_pending_for_job(&mut *connection, job_id).await?;
        for entry in entries {
            let (target, reason, completion) = match entry.mutation() {
                Mutation::AcceptJob { .. } => (JobStatus::Accepted, None, None),
                Mutation::StartJob { .. } => (JobStatus::InProgress, None, None),
                Mutation::CancelJob { reason, .. } => {
                    (JobStatus::Cancelled, Some(reason.clone()), None)
                }
                Mutation::CompleteJob { report, .. } => {
                    (JobStatus::Completed, None, Some(report.clone()))
                }
                Mutation::SendMessage(_) => continue,
            };
            if job.status().may_transition_to(target) {
                job.apply_local(target, reason, completion);
            } else {
                warn!(
                    mutation_id = %entry.id(), %job_id,
                    "Dropping queued mutation made illegal by rebuilt job state"
                );
                MutationQueueEntry::ack(&mut *connection, entry.id()).await?;
                notifier.remove(entry.id());
            }
        }

        job.update(&mut *connection, notifier).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crewcommon::api::{CompletionReport, JobStatus};
    use uuid::Uuid;

    use crate::store::{open_client_db, open_db_in_memory};

    use super::*;

    fn accept(job: &str) -> Mutation {
        Mutation::AcceptJob {
            job_id: job.into(),
            base_version: 1,
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn same_entity_entries_never_reorder() -> anyhow::Result<()> {
        let pool = open_db_in_memory().await?;
        let mut connection = pool.acquire().await?;

        let a1 = MutationQueueEntry::new(accept("job-a"));
        let a2 = MutationQueueEntry::new(Mutation::StartJob {
            job_id: "job-a".into(),
            base_version: 2,
        });
        let b1 = MutationQueueEntry::new(accept("job-b"));
        for entry in [&a1, &a2, &b1] {
            entry.enqueue(&mut *connection).await?;
        }

        let task_id = Uuid::new_v4();
        let now = TimeStamp::now();

        let first = MutationQueueEntry::dequeue(&mut *connection, task_id, now)
            .await?
            .unwrap();
        assert_eq!(first.id(), a1.id());

        // The head of job-a failed; job-a must not yield its second entry,
        // but job-b may drain.
        MutationQueueEntry::nack(&mut *connection, a1.id(), Duration::from_secs(60), now).await?;
        let second = MutationQueueEntry::dequeue(&mut *connection, task_id, now)
            .await?
            .unwrap();
        assert_eq!(second.id(), b1.id());

        MutationQueueEntry::ack(&mut *connection, b1.id()).await?;
        assert!(
            MutationQueueEntry::dequeue(&mut *connection, task_id, now)
                .await?
                .is_none()
        );

        // Once the retry deadline has passed, the head of job-a drains first.
        let later = now + Duration::from_secs(120);
        let retried = MutationQueueEntry::dequeue(&mut *connection, Uuid::new_v4(), later)
            .await?
            .unwrap();
        assert_eq!(retried.id(), a1.id());
        assert_eq!(retried.attempts(), 1);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn cancel_only_while_pending() -> anyhow::Result<()> {
        let pool = open_db_in_memory().await?;
        let mut connection = pool.acquire().await?;

        let entry = MutationQueueEntry::new(accept("job-a"));
        entry.enqueue(&mut *connection).await?;

        // Lock it as an in-flight drain would.
        let locked = MutationQueueEntry::dequeue(&mut *connection, Uuid::new_v4(), TimeStamp::now())
            .await?
            .unwrap();
        assert!(
            MutationQueueEntry::remove_if_pending(&mut *connection, locked.id())
                .await?
                .is_none()
        );

        MutationQueueEntry::release(&mut *connection, locked.id()).await?;
        let removed = MutationQueueEntry::remove_if_pending(&mut *connection, locked.id())
            .await?
            .unwrap();
        assert_eq!(removed.id(), entry.id());
        assert_eq!(MutationQueueEntry::pending_count(&mut *connection).await?, 0);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn queue_survives_restart() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let db_path = dir.path().join("crewline.sqlite");

        {
            let pool = open_client_db(&db_path).await?;
            let mut connection = pool.acquire().await?;
            for job in ["job-a", "job-b", "job-c"] {
                MutationQueueEntry::new(accept(job))
                    .enqueue(&mut *connection)
                    .await?;
            }
            // Leave one entry locked, as if the process died mid-drain.
            MutationQueueEntry::dequeue(&mut *connection, Uuid::new_v4(), TimeStamp::now()).await?;
            pool.close().await;
        }

        let pool = open_client_db(&db_path).await?;
        let mut connection = pool.acquire().await?;
        assert_eq!(MutationQueueEntry::pending_count(&mut *connection).await?, 3);

        // A fresh drain cycle ignores the stale lock and sees all three, in
        // creation order.
        let task_id = Uuid::new_v4();
        let mut drained = Vec::new();
        while let Some(entry) =
            MutationQueueEntry::dequeue(&mut *connection, task_id, TimeStamp::now()).await?
        {
            MutationQueueEntry::ack(&mut *connection, entry.id()).await?;
            drained.push(entry.target().id.clone());
        }
        assert_eq!(drained, ["job-a", "job-b", "job-c"]);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn payload_survives_roundtrip() -> anyhow::Result<()> {
        let pool = open_db_in_memory().await?;
        let mut connection = pool.acquire().await?;

        let mutation = Mutation::CompleteJob {
            job_id: "job-a".into(),
            base_version: 7,
            report: CompletionReport::new("a@b.com"),
        };
        let entry = MutationQueueEntry::new(mutation.clone());
        entry.enqueue(&mut *connection).await?;

        let loaded = MutationQueueEntry::dequeue(&mut *connection, Uuid::new_v4(), TimeStamp::now())
            .await?
            .unwrap();
        assert_eq!(loaded.mutation(), &mutation);
        assert_eq!(loaded.mutation().intended_status(), Some(JobStatus::Completed));
        Ok(())
    }

    #[test]
    fn backoff_grows_exponentially_and_caps() {
        let base = Duration::from_secs(1);
        let cap = Duration::from_secs(60);
        for attempts in 0..10 {
            let ceiling = base
                .saturating_mul(2u32.saturating_pow(attempts))
                .min(cap);
            for _ in 0..32 {
                let delay = backoff_delay(base, cap, attempts);
                assert!(delay <= ceiling, "delay {delay:?} above ceiling {ceiling:?}");
                assert!(delay <= cap);
            }
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn quarantined_jobs_are_excluded_from_draining() -> anyhow::Result<()> {
        let pool = open_db_in_memory().await?;
        let mut connection = pool.acquire().await?;

        let entry = MutationQueueEntry::new(accept("job-a"));
        entry.enqueue(&mut *connection).await?;

        sqlx::query(
            "INSERT INTO job (job_id, status, version, title, assigned_to, synced_status, quarantined)
            VALUES ('job-a', 'pending', 1, 'Broken', 'worker-1', 'pending', 1)",
        )
        .execute(&mut *connection)
        .await?;

        assert!(
            MutationQueueEntry::dequeue(&mut *connection, Uuid::new_v4(), TimeStamp::now())
                .await?
                .is_none()
        );
        Ok(())
    }
}
