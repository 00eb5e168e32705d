// SPDX-FileCopyrightText: 2025 Crewline Labs <dev@crewline.app>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

use crewcommon::identifiers::{ConversationId, UserId};
use sqlx::{SqliteExecutor, query_scalar};

/// Provisional message sequencing.
///
/// Each (conversation, sender) pair carries a durable counter that increases
/// monotonically and never resets, so provisional keys stay totally ordered
/// per sender across restarts.
pub(crate) struct ClientSequence;

impl ClientSequence {
    pub(crate) async fn next(
        executor: impl SqliteExecutor<'_>,
        conversation_id: ConversationId,
        sender: &UserId,
    ) -> sqlx::Result<i64> {
        query_scalar::<_, i64>(
            "INSERT INTO message_sequence (conversation_id, sender, next_seq)
            VALUES (?, ?, 1)
            ON CONFLICT (conversation_id, sender) DO UPDATE SET next_seq = next_seq + 1
            RETURNING next_seq",
        )
        .bind(conversation_id)
        .bind(sender)
        .fetch_one(executor)
        .await
    }
}

#[cfg(test)]
mod tests {
    use crate::store::open_db_in_memory;

    use super::*;

    #[tokio::test(flavor = "multi_thread")]
    async fn counters_are_monotonic_and_independent() -> anyhow::Result<()> {
        let pool = open_db_in_memory().await?;
        let mut connection = pool.acquire().await?;

        let a = ConversationId::random();
        let b = ConversationId::random();
        let sender = UserId::new("worker-1");
        let other = UserId::new("dispatch");

        assert_eq!(ClientSequence::next(&mut *connection, a, &sender).await?, 1);
        assert_eq!(ClientSequence::next(&mut *connection, a, &sender).await?, 2);
        assert_eq!(ClientSequence::next(&mut *connection, a, &sender).await?, 3);

        // Other pairs start independently.
        assert_eq!(ClientSequence::next(&mut *connection, b, &sender).await?, 1);
        assert_eq!(ClientSequence::next(&mut *connection, a, &other).await?, 1);
        Ok(())
    }
}
