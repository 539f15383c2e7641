use application::repository::{ChatStore, FriendshipDirectory};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use domain::{
    Chat, ChatId, Message, MessageId, MessagePayload, MessageType, RepositoryError, Timestamp,
    UserId, VoiceClip,
};
use sqlx::{postgres::PgPoolOptions, FromRow, PgPool};
use uuid::Uuid;

fn map_sqlx_err(err: sqlx::Error) -> RepositoryError {
    if let sqlx::Error::Database(db) = &err {
        if db.is_unique_violation() {
            return RepositoryError::Conflict;
        }
        // 外键只指向 chats，写入时会话不存在
        if db.is_foreign_key_violation() {
            return RepositoryError::NotFound;
        }
    }
    RepositoryError::storage_with_source(err.to_string(), err)
}

fn invalid_data(message: impl Into<String>) -> RepositoryError {
    RepositoryError::storage(message)
}

const MESSAGE_COLUMNS: &str =
    "id, chat_id, sender_id, message_type, content, voice_url, blob_name, duration_secs, is_read, created_at";

const CHAT_COLUMNS: &str =
    "id, participant_low, participant_high, last_message_id, last_activity, created_at";

#[derive(Debug, FromRow)]
struct ChatRecord {
    id: Uuid,
    participant_low: Uuid,
    participant_high: Uuid,
    last_message_id: Option<Uuid>,
    last_activity: DateTime<Utc>,
    created_at: DateTime<Utc>,
}

impl From<ChatRecord> for Chat {
    fn from(value: ChatRecord) -> Self {
        Chat::restore(
            ChatId::from(value.id),
            UserId::from(value.participant_low),
            UserId::from(value.participant_high),
            value.last_message_id.map(MessageId::from),
            value.last_activity,
            value.created_at,
        )
    }
}

#[derive(Debug, FromRow)]
struct MessageRecord {
    id: Uuid,
    chat_id: Uuid,
    sender_id: Uuid,
    message_type: String,
    content: Option<String>,
    voice_url: Option<String>,
    blob_name: Option<String>,
    duration_secs: Option<i32>,
    is_read: bool,
    created_at: DateTime<Utc>,
}

impl TryFrom<MessageRecord> for Message {
    type Error = RepositoryError;

    fn try_from(value: MessageRecord) -> Result<Self, Self::Error> {
        let message_type: MessageType = value
            .message_type
            .parse()
            .map_err(|err: domain::DomainError| invalid_data(err.to_string()))?;

        let voice = match (value.voice_url, value.blob_name, value.duration_secs) {
            (Some(url), Some(blob_name), Some(duration)) => {
                let duration = u32::try_from(duration)
                    .map_err(|_| invalid_data(format!("negative duration {duration}")))?;
                Some(
                    VoiceClip::new(url, blob_name, duration)
                        .map_err(|err| invalid_data(err.to_string()))?,
                )
            }
            (None, None, None) => None,
            _ => return Err(invalid_data("incomplete voice columns")),
        };
        let payload = MessagePayload::from_parts(message_type, value.content, voice)
            .map_err(|err| invalid_data(err.to_string()))?;

        let mut message = Message::new(
            MessageId::from(value.id),
            ChatId::from(value.chat_id),
            UserId::from(value.sender_id),
            payload,
            value.created_at,
        );
        if value.is_read {
            message.mark_read();
        }
        Ok(message)
    }
}

/// 消息写入时的列值，和 `messages_exactly_one_payload` 约束一一对应。
struct MessageColumns<'a> {
    content: Option<&'a str>,
    voice_url: Option<&'a str>,
    blob_name: Option<&'a str>,
    duration_secs: Option<i32>,
}

impl<'a> MessageColumns<'a> {
    fn of(message: &'a Message) -> Result<Self, RepositoryError> {
        let voice = message.payload.voice();
        let duration_secs = voice
            .map(|clip| i32::try_from(clip.duration_secs))
            .transpose()
            .map_err(|_| invalid_data("voice duration out of range"))?;
        Ok(Self {
            content: message.payload.content().map(|content| content.as_str()),
            voice_url: voice.map(|clip| clip.url.as_str()),
            blob_name: voice.map(|clip| clip.blob_ref.as_str()),
            duration_secs,
        })
    }
}

#[derive(Clone)]
pub struct PgChatStore {
    pool: PgPool,
}

impl PgChatStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn insert_message<'e, E>(
        executor: E,
        message: &Message,
    ) -> Result<Message, RepositoryError>
    where
        E: sqlx::PgExecutor<'e>,
    {
        let columns = MessageColumns::of(message)?;
        let sql = format!(
            "INSERT INTO messages ({MESSAGE_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10) \
             RETURNING {MESSAGE_COLUMNS}"
        );
        let record = sqlx::query_as::<_, MessageRecord>(&sql)
            .bind(Uuid::from(message.id))
            .bind(Uuid::from(message.chat_id))
            .bind(Uuid::from(message.sender_id))
            .bind(message.message_type().as_str())
            .bind(columns.content)
            .bind(columns.voice_url)
            .bind(columns.blob_name)
            .bind(columns.duration_secs)
            .bind(message.is_read)
            .bind(message.created_at)
            .fetch_one(executor)
            .await
            .map_err(map_sqlx_err)?;
        Message::try_from(record)
    }

    async fn touch_chat<'e, E>(
        executor: E,
        chat_id: ChatId,
        message_id: MessageId,
        at: Timestamp,
    ) -> Result<(), RepositoryError>
    where
        E: sqlx::PgExecutor<'e>,
    {
        let result = sqlx::query(
            "UPDATE chats SET last_message_id = $2, last_activity = $3 WHERE id = $1",
        )
        .bind(Uuid::from(chat_id))
        .bind(Uuid::from(message_id))
        .bind(at)
        .execute(executor)
        .await
        .map_err(map_sqlx_err)?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }
}

#[async_trait]
impl ChatStore for PgChatStore {
    async fn find_chat_by_id(&self, id: ChatId) -> Result<Option<Chat>, RepositoryError> {
        let sql = format!("SELECT {CHAT_COLUMNS} FROM chats WHERE id = $1");
        let record = sqlx::query_as::<_, ChatRecord>(&sql)
            .bind(Uuid::from(id))
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_err)?;
        Ok(record.map(Chat::from))
    }

    async fn find_chat_by_participants(
        &self,
        first: UserId,
        second: UserId,
    ) -> Result<Option<Chat>, RepositoryError> {
        let [low, high] = Chat::normalize_pair(first, second);
        let sql = format!(
            "SELECT {CHAT_COLUMNS} FROM chats WHERE participant_low = $1 AND participant_high = $2"
        );
        let record = sqlx::query_as::<_, ChatRecord>(&sql)
            .bind(Uuid::from(low))
            .bind(Uuid::from(high))
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_err)?;
        Ok(record.map(Chat::from))
    }

    async fn create_chat(&self, chat: Chat) -> Result<Chat, RepositoryError> {
        let [low, high] = *chat.participants();
        let sql = format!(
            "INSERT INTO chats ({CHAT_COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6) \
             RETURNING {CHAT_COLUMNS}"
        );
        let record = sqlx::query_as::<_, ChatRecord>(&sql)
            .bind(Uuid::from(chat.id))
            .bind(Uuid::from(low))
            .bind(Uuid::from(high))
            .bind(chat.last_message.map(Uuid::from))
            .bind(chat.last_activity)
            .bind(chat.created_at)
            .fetch_one(&self.pool)
            .await
            .map_err(map_sqlx_err)?;
        Ok(Chat::from(record))
    }

    async fn list_chats_for_user(&self, user_id: UserId) -> Result<Vec<Chat>, RepositoryError> {
        let sql = format!(
            "SELECT {CHAT_COLUMNS} FROM chats \
             WHERE participant_low = $1 OR participant_high = $1 \
             ORDER BY last_activity DESC"
        );
        let records = sqlx::query_as::<_, ChatRecord>(&sql)
            .bind(Uuid::from(user_id))
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx_err)?;
        Ok(records.into_iter().map(Chat::from).collect())
    }

    async fn create_message(&self, message: Message) -> Result<Message, RepositoryError> {
        Self::insert_message(&self.pool, &message).await
    }

    async fn update_chat_last_message(
        &self,
        chat_id: ChatId,
        message_id: MessageId,
        at: Timestamp,
    ) -> Result<(), RepositoryError> {
        Self::touch_chat(&self.pool, chat_id, message_id, at).await
    }

    async fn find_message_by_id(&self, id: MessageId) -> Result<Option<Message>, RepositoryError> {
        let sql = format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = $1");
        let record = sqlx::query_as::<_, MessageRecord>(&sql)
            .bind(Uuid::from(id))
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_err)?;
        record.map(Message::try_from).transpose()
    }

    async fn list_messages(
        &self,
        chat_id: ChatId,
        page: u32,
        page_size: u32,
    ) -> Result<Vec<Message>, RepositoryError> {
        let offset = i64::from(page.saturating_sub(1)) * i64::from(page_size);
        let sql = format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE chat_id = $1 \
             ORDER BY created_at DESC, id DESC LIMIT $2 OFFSET $3"
        );
        let records = sqlx::query_as::<_, MessageRecord>(&sql)
            .bind(Uuid::from(chat_id))
            .bind(i64::from(page_size))
            .bind(offset)
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx_err)?;

        let mut messages = records
            .into_iter()
            .map(Message::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        messages.reverse();
        Ok(messages)
    }

    async fn delete_message(&self, id: MessageId) -> Result<(), RepositoryError> {
        let result = sqlx::query("DELETE FROM messages WHERE id = $1")
            .bind(Uuid::from(id))
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_err)?;
        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    async fn append_message(&self, message: Message) -> Result<Message, RepositoryError> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx_err)?;
        let stored = Self::insert_message(&mut *tx, &message).await?;
        Self::touch_chat(&mut *tx, stored.chat_id, stored.id, stored.created_at).await?;
        tx.commit().await.map_err(map_sqlx_err)?;
        Ok(stored)
    }
}

#[derive(Clone)]
pub struct PgFriendshipDirectory {
    pool: PgPool,
}

impl PgFriendshipDirectory {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl FriendshipDirectory for PgFriendshipDirectory {
    async fn are_friends(&self, first: UserId, second: UserId) -> Result<bool, RepositoryError> {
        sqlx::query_scalar::<_, bool>(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM friendships
                WHERE status = 'accepted'
                  AND ((requester_id = $1 AND addressee_id = $2)
                    OR (requester_id = $2 AND addressee_id = $1))
            )
            "#,
        )
        .bind(Uuid::from(first))
        .bind(Uuid::from(second))
        .fetch_one(&self.pool)
        .await
        .map_err(map_sqlx_err)
    }
}

pub async fn create_pg_pool(
    database_url: &str,
    max_connections: u32,
) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await
}
