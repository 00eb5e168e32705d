// SPDX-FileCopyrightText: 2025 Crewline Labs <dev@crewline.app>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Conversations tie chat messages to a job and a set of participants.
//!
//! Unread count and last message are derived from message rows and the
//! conversation's read watermark; neither is persisted as a source of truth.

use chrono::DateTime;
use crewcommon::{
    identifiers::{ConversationId, JobId, UserId},
    time::TimeStamp,
};

pub mod messages;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conversation {
    conversation_id: ConversationId,
    job_id: Option<JobId>,
    participants: Vec<UserId>,
    last_read_at: TimeStamp,
}

impl Conversation {
    pub(crate) fn new(
        conversation_id: ConversationId,
        job_id: Option<JobId>,
        mut participants: Vec<UserId>,
    ) -> Self {
        participants.sort_unstable();
        participants.dedup();
        Self {
            conversation_id,
            job_id,
            participants,
            last_read_at: TimeStamp::from(DateTime::UNIX_EPOCH),
        }
    }

    pub fn id(&self) -> ConversationId {
        self.conversation_id
    }

    pub fn job_id(&self) -> Option<&JobId> {
        self.job_id.as_ref()
    }

    pub fn participants(&self) -> &[UserId] {
        &self.participants
    }

    pub fn last_read_at(&self) -> TimeStamp {
        self.last_read_at
    }
}

pub(crate) mod persistence {
    use sqlx::{SqliteConnection, SqliteExecutor, query, query_as, query_scalar};
    use tracing::debug;

    use crate::store::StoreNotifier;

    use super::*;

    #[derive(sqlx::FromRow)]
    struct SqlConversation {
        conversation_id: ConversationId,
        job_id: Option<JobId>,
        last_read_at: TimeStamp,
    }

    impl Conversation {
        pub(crate) async fn store(
            &self,
            connection: &mut SqliteConnection,
            notifier: &mut StoreNotifier,
        ) -> sqlx::Result<()> {
            query("INSERT OR REPLACE INTO conversation (conversation_id, job_id, last_read_at) VALUES (?, ?, ?)")
                .bind(self.conversation_id)
                .bind(&self.job_id)
                .bind(self.last_read_at)
                .execute(&mut *connection)
                .await?;
            query("DELETE FROM conversation_participant WHERE conversation_id = ?")
                .bind(self.conversation_id)
                .execute(&mut *connection)
                .await?;
            for participant in &self.participants {
                query(
                    "INSERT INTO conversation_participant (conversation_id, user_id) VALUES (?, ?)",
                )
                .bind(self.conversation_id)
                .bind(participant)
                .execute(&mut *connection)
                .await?;
            }
            notifier.add(self.conversation_id);
            Ok(())
        }

        pub(crate) async fn load(
            connection: &mut SqliteConnection,
            conversation_id: ConversationId,
        ) -> sqlx::Result<Option<Conversation>> {
            let row = query_as::<_, SqlConversation>(
                "SELECT conversation_id, job_id, last_read_at FROM conversation WHERE conversation_id = ?",
            )
            .bind(conversation_id)
            .fetch_optional(&mut *connection)
            .await?;
            let Some(row) = row else {
                return Ok(None);
            };
            let participants = Self::load_participants(connection, conversation_id).await?;
            Ok(Some(Conversation {
                conversation_id: row.conversation_id,
                job_id: row.job_id,
                participants,
                last_read_at: row.last_read_at,
            }))
        }

        pub(crate) async fn load_all(
            connection: &mut SqliteConnection,
        ) -> sqlx::Result<Vec<Conversation>> {
            let rows = query_as::<_, SqlConversation>(
                "SELECT conversation_id, job_id, last_read_at FROM conversation",
            )
            .fetch_all(&mut *connection)
            .await?;
            let mut conversations = Vec::with_capacity(rows.len());
            for row in rows {
                let participants =
                    Self::load_participants(connection, row.conversation_id).await?;
                conversations.push(Conversation {
                    conversation_id: row.conversation_id,
                    job_id: row.job_id,
                    participants,
                    last_read_at: row.last_read_at,
                });
            }
            Ok(conversations)
        }

        async fn load_participants(
            connection: &mut SqliteConnection,
            conversation_id: ConversationId,
        ) -> sqlx::Result<Vec<UserId>> {
            query_scalar::<_, UserId>(
                "SELECT user_id FROM conversation_participant
                WHERE conversation_id = ? ORDER BY user_id",
            )
            .bind(conversation_id)
            .fetch_all(connection)
            .await
        }

        /// Makes sure a conversation row exists before a remote-origin
        /// message for it is stored.
        pub(crate) async fn ensure_exists(
            connection: &mut SqliteConnection,
            notifier: &mut StoreNotifier,
            conversation_id: ConversationId,
        ) -> sqlx::Result<()> {
            let exists = query_scalar::<_, i64>(
                "SELECT EXISTS(SELECT 1 FROM conversation WHERE conversation_id = ?)",
            )
            .bind(conversation_id)
            .fetch_one(&mut *connection)
            .await?;
            if exists == 0 {
                debug!(%conversation_id, "Creating conversation for remote message");
                Conversation::new(conversation_id, None, Vec::new())
                    .store(connection, notifier)
                    .await?;
            }
            Ok(())
        }

        /// Advances the read watermark. Never moves it backwards.
        pub(crate) async fn mark_read_until(
            connection: &mut SqliteConnection,
            notifier: &mut StoreNotifier,
            conversation_id: ConversationId,
            until: TimeStamp,
        ) -> sqlx::Result<()> {
            let Some(conversation) = Self::load(connection, conversation_id).await? else {
                return Ok(());
            };
            if until <= conversation.last_read_at {
                return Ok(());
            }
            query("UPDATE conversation SET last_read_at = ? WHERE conversation_id = ?")
                .bind(until)
                .bind(conversation_id)
                .execute(&mut *connection)
                .await?;
            notifier.update(conversation_id);
            Ok(())
        }

        /// Number of messages from other senders past the read watermark.
        pub(crate) async fn unread_messages_count(
            connection: &mut SqliteConnection,
            conversation_id: ConversationId,
            own_user: &UserId,
        ) -> sqlx::Result<usize> {
            let Some(conversation) = Self::load(connection, conversation_id).await? else {
                return Ok(0);
            };
            let count = query_scalar::<_, i64>(
                "SELECT COUNT(*) FROM message
                WHERE conversation_id = ? AND sender != ?
                    AND COALESCE(server_ts, created_at) > ?",
            )
            .bind(conversation_id)
            .bind(own_user)
            .bind(conversation.last_read_at)
            .fetch_one(&mut *connection)
            .await?;
            Ok(count as usize)
        }
    }
}
