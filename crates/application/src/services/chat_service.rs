use std::sync::Arc;

use domain::{
    Chat, ChatId, DomainError, Message, MessageId, MessagePayload, RepositoryError, UserId,
    VoiceClip,
};
use tracing::{info, warn};

use crate::{
    blob::{BlobStore, BlobUpload},
    clock::Clock,
    error::ApplicationError,
    repository::{ChatStore, FriendshipDirectory},
};

pub const DEFAULT_PAGE_SIZE: u32 = 50;
pub const MAX_PAGE_SIZE: u32 = 100;

#[derive(Debug, Clone)]
pub struct SendTextRequest {
    pub chat_id: ChatId,
    pub sender_id: UserId,
    pub content: String,
}

#[derive(Debug, Clone)]
pub struct SendVoiceRequest {
    pub chat_id: ChatId,
    pub sender_id: UserId,
    pub audio: Vec<u8>,
    pub mime_type: String,
    pub duration_secs: u32,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MessagePage {
    pub page: Option<u32>,
    pub limit: Option<u32>,
}

/// 一条已经持久化的消息以及它所在会话的最新状态。
#[derive(Debug, Clone)]
pub struct SentMessage {
    pub chat: Chat,
    pub message: Message,
}

pub struct ChatServiceDependencies {
    pub chat_store: Arc<dyn ChatStore>,
    pub friendships: Arc<dyn FriendshipDirectory>,
    pub blob_store: Arc<dyn BlobStore>,
    pub clock: Arc<dyn Clock>,
}

pub struct ChatService {
    deps: ChatServiceDependencies,
}

impl ChatService {
    pub fn new(deps: ChatServiceDependencies) -> Self {
        Self { deps }
    }

    pub async fn list_chats(&self, user_id: UserId) -> Result<Vec<Chat>, ApplicationError> {
        Ok(self.deps.chat_store.list_chats_for_user(user_id).await?)
    }

    /// 取得两位好友之间唯一的会话，不存在时创建。
    pub async fn get_or_create_chat(
        &self,
        user_id: UserId,
        friend_id: UserId,
    ) -> Result<Chat, ApplicationError> {
        if user_id == friend_id {
            return Err(DomainError::SelfChat.into());
        }
        if !self.deps.friendships.are_friends(user_id, friend_id).await? {
            return Err(DomainError::NotFriends.into());
        }

        if let Some(chat) = self
            .deps
            .chat_store
            .find_chat_by_participants(user_id, friend_id)
            .await?
        {
            return Ok(chat);
        }

        let chat = Chat::between(ChatId::generate(), user_id, friend_id, self.deps.clock.now())?;
        match self.deps.chat_store.create_chat(chat).await {
            Ok(chat) => {
                info!(chat_id = %chat.id, user_id = %user_id, "chat created");
                Ok(chat)
            }
            // 并发创建时以已落库的那一个为准
            Err(RepositoryError::Conflict) => self
                .deps
                .chat_store
                .find_chat_by_participants(user_id, friend_id)
                .await?
                .ok_or_else(|| RepositoryError::Conflict.into()),
            Err(err) => Err(err.into()),
        }
    }

    /// 会话存在且 `user_id` 是参与者时返回会话。
    pub async fn authorize_participant(
        &self,
        chat_id: ChatId,
        user_id: UserId,
    ) -> Result<Chat, ApplicationError> {
        let chat = self
            .deps
            .chat_store
            .find_chat_by_id(chat_id)
            .await?
            .ok_or(DomainError::ChatNotFound)?;
        chat.ensure_participant(user_id)?;
        Ok(chat)
    }

    pub async fn list_messages(
        &self,
        chat_id: ChatId,
        user_id: UserId,
        page: MessagePage,
    ) -> Result<Vec<Message>, ApplicationError> {
        let number = page.page.unwrap_or(1);
        if number == 0 {
            return Err(DomainError::invalid_argument("page", "must be at least 1").into());
        }
        let limit = page.limit.unwrap_or(DEFAULT_PAGE_SIZE);
        if limit == 0 {
            return Err(DomainError::invalid_argument("limit", "must be at least 1").into());
        }

        self.authorize_participant(chat_id, user_id).await?;
        Ok(self
            .deps
            .chat_store
            .list_messages(chat_id, number, limit.min(MAX_PAGE_SIZE))
            .await?)
    }

    pub async fn send_message(
        &self,
        request: SendTextRequest,
    ) -> Result<SentMessage, ApplicationError> {
        // 参与者身份每次都重新校验，不依赖连接之前是否 join 过
        let chat = self
            .authorize_participant(request.chat_id, request.sender_id)
            .await?;
        let payload = MessagePayload::text(request.content)?;
        self.persist(chat, request.sender_id, payload).await
    }

    /// 先上传音频再落库；落库失败时删除已上传的文件。
    pub async fn send_voice_message(
        &self,
        request: SendVoiceRequest,
    ) -> Result<SentMessage, ApplicationError> {
        let chat = self
            .authorize_participant(request.chat_id, request.sender_id)
            .await?;

        let stored = self
            .deps
            .blob_store
            .upload(BlobUpload {
                owner: request.sender_id,
                bytes: request.audio,
                mime_type: request.mime_type,
            })
            .await?;

        let blob_ref = stored.blob_ref.clone();
        let result = match VoiceClip::new(stored.url, stored.blob_ref, request.duration_secs) {
            Ok(clip) => {
                self.persist(chat, request.sender_id, MessagePayload::Voice(clip))
                    .await
            }
            Err(err) => Err(err.into()),
        };

        if result.is_err() {
            self.discard_blob(&blob_ref).await;
        }
        result
    }

    /// 只有发送者可以删除；语音消息同时删除音频文件。
    pub async fn delete_message(
        &self,
        message_id: MessageId,
        user_id: UserId,
    ) -> Result<Message, ApplicationError> {
        let message = self
            .deps
            .chat_store
            .find_message_by_id(message_id)
            .await?
            .ok_or(DomainError::MessageNotFound)?;
        if !message.is_sent_by(user_id) {
            return Err(DomainError::NotMessageSender.into());
        }

        self.deps.chat_store.delete_message(message_id).await?;
        if let Some(clip) = message.payload.voice() {
            self.discard_blob(&clip.blob_ref).await;
        }
        info!(message_id = %message_id, user_id = %user_id, "message deleted");
        Ok(message)
    }

    async fn persist(
        &self,
        mut chat: Chat,
        sender_id: UserId,
        payload: MessagePayload,
    ) -> Result<SentMessage, ApplicationError> {
        let message = Message::new(
            MessageId::generate(),
            chat.id,
            sender_id,
            payload,
            self.deps.clock.now(),
        );
        let message = self.deps.chat_store.append_message(message).await?;
        chat.record_message(message.id, message.created_at);
        Ok(SentMessage { chat, message })
    }

    async fn discard_blob(&self, blob_ref: &str) {
        if let Err(err) = self.deps.blob_store.delete(blob_ref).await {
            warn!(blob = blob_ref, error = %err, "failed to delete voice blob");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use chrono::{TimeZone, Utc};
    use domain::Timestamp;
    use mockall::predicate::eq;

    use super::*;
    use crate::blob::{BlobError, MockBlobStore, StoredBlob};
    use crate::error::ErrorKind;
    use crate::repository::{MockChatStore, MockFriendshipDirectory};

    struct FixedClock(Timestamp);

    impl Clock for FixedClock {
        fn now(&self) -> Timestamp {
            self.0
        }
    }

    fn now() -> Timestamp {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    fn service(
        store: MockChatStore,
        friendships: MockFriendshipDirectory,
        blobs: MockBlobStore,
    ) -> ChatService {
        ChatService::new(ChatServiceDependencies {
            chat_store: Arc::new(store),
            friendships: Arc::new(friendships),
            blob_store: Arc::new(blobs),
            clock: Arc::new(FixedClock(now())),
        })
    }

    fn chat(a: UserId, b: UserId) -> Chat {
        Chat::between(ChatId::generate(), a, b, now()).unwrap()
    }

    fn store_with_chat(chat: &Chat) -> MockChatStore {
        let mut store = MockChatStore::new();
        let found = chat.clone();
        store
            .expect_find_chat_by_id()
            .with(eq(chat.id))
            .returning(move |_| Ok(Some(found.clone())));
        store
    }

    #[tokio::test]
    async fn send_persists_and_advances_chat() {
        let (a, b) = (UserId::generate(), UserId::generate());
        let chat = chat(a, b);
        let mut store = store_with_chat(&chat);
        store
            .expect_append_message()
            .times(1)
            .returning(|message| Ok(message));

        let sent = service(store, MockFriendshipDirectory::new(), MockBlobStore::new())
            .send_message(SendTextRequest {
                chat_id: chat.id,
                sender_id: a,
                content: "hi".into(),
            })
            .await
            .unwrap();

        assert_eq!(sent.chat.last_message, Some(sent.message.id));
        assert_eq!(sent.chat.last_activity, now());
        assert_eq!(sent.message.sender_id, a);
        assert!(!sent.message.is_read);
    }

    #[tokio::test]
    async fn non_participant_cannot_send() {
        let (a, b) = (UserId::generate(), UserId::generate());
        let chat = chat(a, b);
        let mut store = store_with_chat(&chat);
        store.expect_append_message().never();

        let err = service(store, MockFriendshipDirectory::new(), MockBlobStore::new())
            .send_message(SendTextRequest {
                chat_id: chat.id,
                sender_id: UserId::generate(),
                content: "hi".into(),
            })
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Authorization);
        assert_eq!(err.client_message(), "Unauthorized");
    }

    #[tokio::test]
    async fn blank_text_is_rejected_before_persisting() {
        let (a, b) = (UserId::generate(), UserId::generate());
        let chat = chat(a, b);
        let mut store = store_with_chat(&chat);
        store.expect_append_message().never();

        let err = service(store, MockFriendshipDirectory::new(), MockBlobStore::new())
            .send_message(SendTextRequest {
                chat_id: chat.id,
                sender_id: a,
                content: "   ".into(),
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[tokio::test]
    async fn store_failure_is_reported_not_retried() {
        let (a, b) = (UserId::generate(), UserId::generate());
        let chat = chat(a, b);
        let mut store = store_with_chat(&chat);
        store
            .expect_append_message()
            .times(1)
            .returning(|_| Err(RepositoryError::storage("disk full")));

        let err = service(store, MockFriendshipDirectory::new(), MockBlobStore::new())
            .send_message(SendTextRequest {
                chat_id: chat.id,
                sender_id: a,
                content: "hi".into(),
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Store);
    }

    #[tokio::test]
    async fn strangers_cannot_open_a_chat() {
        let (a, b) = (UserId::generate(), UserId::generate());
        let mut friendships = MockFriendshipDirectory::new();
        friendships.expect_are_friends().returning(|_, _| Ok(false));
        let mut store = MockChatStore::new();
        store.expect_create_chat().never();

        let err = service(store, friendships, MockBlobStore::new())
            .get_or_create_chat(a, b)
            .await
            .unwrap_err();
        assert_eq!(err.client_message(), "You can only chat with friends");
    }

    #[tokio::test]
    async fn concurrent_creation_resolves_to_stored_chat() {
        let (a, b) = (UserId::generate(), UserId::generate());
        let existing = chat(a, b);
        let mut friendships = MockFriendshipDirectory::new();
        friendships.expect_are_friends().returning(|_, _| Ok(true));

        let mut store = MockChatStore::new();
        let lookups = AtomicUsize::new(0);
        let winner = existing.clone();
        store
            .expect_find_chat_by_participants()
            .times(2)
            .returning(move |_, _| {
                // 第一次查询时还不存在，创建冲突后再查到对方写入的会话
                if lookups.fetch_add(1, Ordering::SeqCst) == 0 {
                    Ok(None)
                } else {
                    Ok(Some(winner.clone()))
                }
            });
        store
            .expect_create_chat()
            .times(1)
            .returning(|_| Err(RepositoryError::Conflict));

        let chat = service(store, friendships, MockBlobStore::new())
            .get_or_create_chat(a, b)
            .await
            .unwrap();
        assert_eq!(chat.id, existing.id);
    }

    #[tokio::test]
    async fn page_size_is_capped() {
        let (a, b) = (UserId::generate(), UserId::generate());
        let chat = chat(a, b);
        let mut store = store_with_chat(&chat);
        store
            .expect_list_messages()
            .with(eq(chat.id), eq(2), eq(MAX_PAGE_SIZE))
            .times(1)
            .returning(|_, _, _| Ok(Vec::new()));

        let page = MessagePage {
            page: Some(2),
            limit: Some(500),
        };
        service(store, MockFriendshipDirectory::new(), MockBlobStore::new())
            .list_messages(chat.id, b, page)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn voice_blob_is_removed_when_persisting_fails() {
        let (a, b) = (UserId::generate(), UserId::generate());
        let chat = chat(a, b);
        let mut store = store_with_chat(&chat);
        store
            .expect_append_message()
            .returning(|_| Err(RepositoryError::storage("write failed")));

        let mut blobs = MockBlobStore::new();
        blobs.expect_upload().times(1).returning(|upload| {
            Ok(StoredBlob {
                url: "http://localhost/uploads/voice.mp3".into(),
                blob_ref: "voice.mp3".into(),
                size: upload.bytes.len() as u64,
            })
        });
        blobs
            .expect_delete()
            .with(eq("voice.mp3"))
            .times(1)
            .returning(|_| Ok(()));

        let err = service(store, MockFriendshipDirectory::new(), blobs)
            .send_voice_message(SendVoiceRequest {
                chat_id: chat.id,
                sender_id: a,
                audio: vec![1, 2, 3],
                mime_type: "audio/mpeg".into(),
                duration_secs: 3,
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Store);
    }

    #[tokio::test]
    async fn rejected_upload_persists_nothing() {
        let (a, b) = (UserId::generate(), UserId::generate());
        let chat = chat(a, b);
        let mut store = store_with_chat(&chat);
        store.expect_append_message().never();
        let mut blobs = MockBlobStore::new();
        blobs
            .expect_upload()
            .returning(|upload| Err(BlobError::UnsupportedMediaType(upload.mime_type)));
        blobs.expect_delete().never();

        let err = service(store, MockFriendshipDirectory::new(), blobs)
            .send_voice_message(SendVoiceRequest {
                chat_id: chat.id,
                sender_id: a,
                audio: vec![1],
                mime_type: "image/png".into(),
                duration_secs: 1,
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[tokio::test]
    async fn only_sender_may_delete() {
        let (a, b) = (UserId::generate(), UserId::generate());
        let chat = chat(a, b);
        let message = Message::new(
            MessageId::generate(),
            chat.id,
            a,
            MessagePayload::text("hi").unwrap(),
            now(),
        );
        let mut store = MockChatStore::new();
        let found = message.clone();
        store
            .expect_find_message_by_id()
            .returning(move |_| Ok(Some(found.clone())));
        store.expect_delete_message().never();

        let err = service(store, MockFriendshipDirectory::new(), MockBlobStore::new())
            .delete_message(message.id, b)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Authorization);
    }

    #[tokio::test]
    async fn deleting_voice_message_removes_blob() {
        let (a, b) = (UserId::generate(), UserId::generate());
        let chat = chat(a, b);
        let clip = VoiceClip::new("http://localhost/uploads/v.mp3", "v.mp3", 4).unwrap();
        let message = Message::new(
            MessageId::generate(),
            chat.id,
            a,
            MessagePayload::Voice(clip),
            now(),
        );
        let mut store = MockChatStore::new();
        let found = message.clone();
        store
            .expect_find_message_by_id()
            .returning(move |_| Ok(Some(found.clone())));
        store
            .expect_delete_message()
            .with(eq(message.id))
            .times(1)
            .returning(|_| Ok(()));
        let mut blobs = MockBlobStore::new();
        blobs
            .expect_delete()
            .with(eq("v.mp3"))
            .times(1)
            .returning(|_| Ok(()));

        let deleted = service(store, MockFriendshipDirectory::new(), blobs)
            .delete_message(message.id, a)
            .await
            .unwrap();
        assert_eq!(deleted.id, message.id);
    }
}
