// SPDX-FileCopyrightText: 2025 Crewline Labs <dev@crewline.app>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Chat messages.
//!
//! Messages are append-only. An outgoing message is stored as `Pending`
//! under a locally generated id, which doubles as its client key; on
//! confirmation the placeholder is replaced in place by the canonical
//! server identity and sequence. Ordering within a conversation follows the
//! canonical sequence key for confirmed messages, then the provisional
//! per-sender counter for unconfirmed local messages.

use crewcommon::{
    api::{MessageKind, RemoteMessage},
    identifiers::{ConversationId, MessageId, UserId},
    time::TimeStamp,
};
use sqlx::{
    Database, Decode, Encode, Sqlite, Type, encode::IsNull, error::BoxDynError,
    sqlite::SqliteTypeInfo,
};

pub(crate) mod sequence;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryStatus {
    Pending,
    Sent,
    Failed,
}

impl DeliveryStatus {
    pub fn repr(&self) -> &'static str {
        match self {
            DeliveryStatus::Pending => "pending",
            DeliveryStatus::Sent => "sent",
            DeliveryStatus::Failed => "failed",
        }
    }

    pub fn from_repr(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(DeliveryStatus::Pending),
            "sent" => Some(DeliveryStatus::Sent),
            "failed" => Some(DeliveryStatus::Failed),
            _ => None,
        }
    }
}

impl Type<Sqlite> for DeliveryStatus {
    fn type_info() -> SqliteTypeInfo {
        <String as Type<Sqlite>>::type_info()
    }
}

impl<'r> Decode<'r, Sqlite> for DeliveryStatus {
    fn decode(value: <Sqlite as Database>::ValueRef<'r>) -> Result<Self, BoxDynError> {
        let s: &str = Decode::<Sqlite>::decode(value)?;
        DeliveryStatus::from_repr(s)
            .ok_or_else(|| format!("Unknown DeliveryStatus variant: {s}").into())
    }
}

impl<'q> Encode<'q, Sqlite> for DeliveryStatus {
    fn encode_by_ref(
        &self,
        buf: &mut <Sqlite as Database>::ArgumentBuffer<'q>,
    ) -> Result<IsNull, BoxDynError> {
        <&str as Encode<Sqlite>>::encode(self.repr(), buf)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct ChatMessage {
    message_id: MessageId,
    conversation_id: ConversationId,
    sender: UserId,
    kind: MessageKind,
    body: String,
    status: DeliveryStatus,
    client_key: Option<MessageId>,
    sender_seq: Option<i64>,
    server_ts: Option<TimeStamp>,
    server_seq: Option<i64>,
    created_at: TimeStamp,
}

impl ChatMessage {
    /// A locally composed message awaiting submission.
    pub(crate) fn new_unsent(
        sender: UserId,
        conversation_id: ConversationId,
        kind: MessageKind,
        body: impl Into<String>,
        sender_seq: i64,
    ) -> Self {
        let message_id = MessageId::random();
        Self {
            message_id,
            conversation_id,
            sender,
            kind,
            body: body.into(),
            status: DeliveryStatus::Pending,
            client_key: Some(message_id),
            sender_seq: Some(sender_seq),
            server_ts: None,
            server_seq: None,
            created_at: TimeStamp::now(),
        }
    }

    /// A confirmed message of remote origin.
    pub(crate) fn from_remote(remote: RemoteMessage) -> Self {
        Self {
            message_id: remote.canonical_id,
            conversation_id: remote.conversation_id,
            sender: remote.sender,
            kind: remote.kind,
            body: remote.body,
            status: DeliveryStatus::Sent,
            client_key: remote.client_key,
            sender_seq: None,
            server_ts: Some(remote.server_ts),
            server_seq: Some(remote.server_seq),
            created_at: remote.server_ts,
        }
    }

    pub fn id(&self) -> MessageId {
        self.message_id
    }

    pub fn conversation_id(&self) -> ConversationId {
        self.conversation_id
    }

    pub fn sender(&self) -> &UserId {
        &self.sender
    }

    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    pub fn body(&self) -> &str {
        &self.body
    }

    pub fn status(&self) -> DeliveryStatus {
        self.status
    }

    pub fn is_sent(&self) -> bool {
        self.status == DeliveryStatus::Sent
    }

    pub fn client_key(&self) -> Option<MessageId> {
        self.client_key
    }

    pub fn sender_seq(&self) -> Option<i64> {
        self.sender_seq
    }

    /// Canonical sequence key, present once the authority confirmed the
    /// message.
    pub fn canonical_key(&self) -> Option<(TimeStamp, i64)> {
        Some((self.server_ts?, self.server_seq?))
    }

    /// Server-authoritative once confirmed, device-local before.
    pub fn timestamp(&self) -> TimeStamp {
        self.server_ts.unwrap_or(self.created_at)
    }
}

pub(crate) mod persistence {
    use crewcommon::api::MessageConfirmation;
    use sqlx::{SqliteExecutor, query, query_as, query_scalar};
    use tracing::debug;

    use crate::store::StoreNotifier;

    use super::*;

    const SELECT_COLUMNS: &str = "message_id, conversation_id, sender, kind, body, status, \
        client_key, sender_seq, server_ts, server_seq, created_at";

    /// Confirmed messages order by canonical key; unconfirmed local messages
    /// come after all confirmed ones, ordered by their provisional counter.
    const DISPLAY_ORDER: &str = "CASE WHEN server_seq IS NULL THEN 1 ELSE 0 END ASC, \
        server_ts ASC, server_seq ASC, sender_seq ASC, created_at ASC";

    impl ChatMessage {
        pub(crate) async fn store(
            &self,
            executor: impl SqliteExecutor<'_>,
            notifier: &mut StoreNotifier,
        ) -> sqlx::Result<()> {
            query(
                "INSERT OR REPLACE INTO message (
                    message_id, conversation_id, sender, kind, body, status,
                    client_key, sender_seq, server_ts, server_seq, created_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(self.message_id)
            .bind(self.conversation_id)
            .bind(&self.sender)
            .bind(self.kind)
            .bind(&self.body)
            .bind(self.status)
            .bind(self.client_key)
            .bind(self.sender_seq)
            .bind(self.server_ts)
            .bind(self.server_seq)
            .bind(self.created_at)
            .execute(executor)
            .await?;
            notifier.add(self.message_id).update(self.conversation_id);
            Ok(())
        }

        pub(crate) async fn load(
            executor: impl SqliteExecutor<'_>,
            message_id: MessageId,
        ) -> sqlx::Result<Option<ChatMessage>> {
            query_as::<_, ChatMessage>(&format!(
                "SELECT {SELECT_COLUMNS} FROM message WHERE message_id = ?"
            ))
            .bind(message_id)
            .fetch_optional(executor)
            .await
        }

        pub(crate) async fn load_by_client_key(
            executor: impl SqliteExecutor<'_>,
            client_key: MessageId,
        ) -> sqlx::Result<Option<ChatMessage>> {
            query_as::<_, ChatMessage>(&format!(
                "SELECT {SELECT_COLUMNS} FROM message WHERE client_key = ?"
            ))
            .bind(client_key)
            .fetch_optional(executor)
            .await
        }

        pub(crate) async fn exists(
            executor: impl SqliteExecutor<'_>,
            message_id: MessageId,
        ) -> sqlx::Result<bool> {
            let exists = query_scalar::<_, i64>(
                "SELECT EXISTS(SELECT 1 FROM message WHERE message_id = ?)",
            )
            .bind(message_id)
            .fetch_one(executor)
            .await?;
            Ok(exists == 1)
        }

        /// All messages of a conversation in display order.
        pub(crate) async fn load_all(
            executor: impl SqliteExecutor<'_>,
            conversation_id: ConversationId,
        ) -> sqlx::Result<Vec<ChatMessage>> {
            query_as::<_, ChatMessage>(&format!(
                "SELECT {SELECT_COLUMNS} FROM message
                WHERE conversation_id = ? ORDER BY {DISPLAY_ORDER}"
            ))
            .bind(conversation_id)
            .fetch_all(executor)
            .await
        }

        pub(crate) async fn last(
            executor: impl SqliteExecutor<'_>,
            conversation_id: ConversationId,
        ) -> sqlx::Result<Option<ChatMessage>> {
            query_as::<_, ChatMessage>(&format!(
                "SELECT {SELECT_COLUMNS} FROM message
                WHERE conversation_id = ?
                ORDER BY CASE WHEN server_seq IS NULL THEN 1 ELSE 0 END DESC,
                    server_ts DESC, server_seq DESC, sender_seq DESC, created_at DESC
                LIMIT 1"
            ))
            .bind(conversation_id)
            .fetch_optional(executor)
            .await
        }

        /// Replaces the local placeholder by its canonical identity.
        ///
        /// Returns false when there is nothing to confirm: an unknown client
        /// key or an already confirmed message (a duplicate acknowledgement
        /// is discarded).
        pub(crate) async fn confirm(
            connection: &mut sqlx::SqliteConnection,
            notifier: &mut StoreNotifier,
            confirmation: &MessageConfirmation,
        ) -> sqlx::Result<bool> {
            let Some(message) =
                Self::load_by_client_key(&mut *connection, confirmation.client_key).await?
            else {
                debug!(client_key = %confirmation.client_key, "No message for confirmation");
                return Ok(false);
            };
            if message.server_seq.is_some() {
                debug!(client_key = %confirmation.client_key, "Duplicate confirmation discarded");
                return Ok(false);
            }

            query(
                "UPDATE message
                SET message_id = ?, status = ?, server_ts = ?, server_seq = ?
                WHERE message_id = ?",
            )
            .bind(confirmation.canonical_id)
            .bind(DeliveryStatus::Sent)
            .bind(confirmation.server_ts)
            .bind(confirmation.server_seq)
            .bind(message.message_id)
            .execute(&mut *connection)
            .await?;

            if message.message_id != confirmation.canonical_id {
                notifier.remove(message.message_id);
            }
            notifier
                .add(confirmation.canonical_id)
                .update(message.conversation_id);
            Ok(true)
        }

        pub(crate) async fn delete(
            &self,
            executor: impl SqliteExecutor<'_>,
            notifier: &mut StoreNotifier,
        ) -> sqlx::Result<()> {
            query("DELETE FROM message WHERE message_id = ?")
                .bind(self.message_id)
                .execute(executor)
                .await?;
            notifier.remove(self.message_id).update(self.conversation_id);
            Ok(())
        }

        pub(crate) async fn set_status(
            &mut self,
            executor: impl SqliteExecutor<'_>,
            notifier: &mut StoreNotifier,
            status: DeliveryStatus,
        ) -> sqlx::Result<()> {
            self.status = status;
            query("UPDATE message SET status = ? WHERE message_id = ?")
                .bind(status)
                .bind(self.message_id)
                .execute(executor)
                .await?;
            notifier.update(self.message_id).update(self.conversation_id);
            Ok(())
        }
    }
}
