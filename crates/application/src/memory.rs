//! 进程内的存储实现，用于测试和 `memory` 后端。

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use domain::{Chat, ChatId, Message, MessageId, RepositoryError, Timestamp, UserId};
use tokio::sync::RwLock;

use crate::repository::{ChatStore, FriendshipDirectory};

#[derive(Default)]
struct StoreState {
    chats: HashMap<ChatId, Chat>,
    pairs: HashMap<[UserId; 2], ChatId>,
    /// 每个会话的消息，按写入顺序
    messages: HashMap<ChatId, Vec<Message>>,
    message_index: HashMap<MessageId, ChatId>,
}

impl StoreState {
    fn touch_chat(
        &mut self,
        chat_id: ChatId,
        message_id: MessageId,
        at: Timestamp,
    ) -> Result<(), RepositoryError> {
        let chat = self
            .chats
            .get_mut(&chat_id)
            .ok_or(RepositoryError::NotFound)?;
        chat.record_message(message_id, at);
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryChatStore {
    state: RwLock<StoreState>,
}

impl InMemoryChatStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ChatStore for InMemoryChatStore {
    async fn find_chat_by_id(&self, id: ChatId) -> Result<Option<Chat>, RepositoryError> {
        Ok(self.state.read().await.chats.get(&id).cloned())
    }

    async fn find_chat_by_participants(
        &self,
        first: UserId,
        second: UserId,
    ) -> Result<Option<Chat>, RepositoryError> {
        let state = self.state.read().await;
        let pair = Chat::normalize_pair(first, second);
        Ok(state
            .pairs
            .get(&pair)
            .and_then(|id| state.chats.get(id))
            .cloned())
    }

    async fn create_chat(&self, chat: Chat) -> Result<Chat, RepositoryError> {
        let mut state = self.state.write().await;
        let pair = *chat.participants();
        if state.pairs.contains_key(&pair) || state.chats.contains_key(&chat.id) {
            return Err(RepositoryError::Conflict);
        }
        state.pairs.insert(pair, chat.id);
        state.chats.insert(chat.id, chat.clone());
        Ok(chat)
    }

    async fn list_chats_for_user(&self, user_id: UserId) -> Result<Vec<Chat>, RepositoryError> {
        let state = self.state.read().await;
        let mut chats: Vec<Chat> = state
            .chats
            .values()
            .filter(|chat| chat.has_participant(user_id))
            .cloned()
            .collect();
        chats.sort_by(|a, b| b.last_activity.cmp(&a.last_activity));
        Ok(chats)
    }

    async fn create_message(&self, message: Message) -> Result<Message, RepositoryError> {
        let mut state = self.state.write().await;
        if !state.chats.contains_key(&message.chat_id) {
            return Err(RepositoryError::NotFound);
        }
        if state.message_index.contains_key(&message.id) {
            return Err(RepositoryError::Conflict);
        }
        state.message_index.insert(message.id, message.chat_id);
        state
            .messages
            .entry(message.chat_id)
            .or_default()
            .push(message.clone());
        Ok(message)
    }

    async fn update_chat_last_message(
        &self,
        chat_id: ChatId,
        message_id: MessageId,
        at: Timestamp,
    ) -> Result<(), RepositoryError> {
        self.state.write().await.touch_chat(chat_id, message_id, at)
    }

    async fn find_message_by_id(&self, id: MessageId) -> Result<Option<Message>, RepositoryError> {
        let state = self.state.read().await;
        Ok(state
            .message_index
            .get(&id)
            .and_then(|chat_id| state.messages.get(chat_id))
            .and_then(|messages| messages.iter().find(|message| message.id == id))
            .cloned())
    }

    async fn list_messages(
        &self,
        chat_id: ChatId,
        page: u32,
        page_size: u32,
    ) -> Result<Vec<Message>, RepositoryError> {
        let state = self.state.read().await;
        let Some(messages) = state.messages.get(&chat_id) else {
            return Ok(Vec::new());
        };

        let mut newest_first: Vec<&Message> = messages.iter().collect();
        // 稳定排序，同一时刻写入的消息保持写入顺序
        newest_first.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        newest_first.reverse();

        let skip = page.saturating_sub(1) as usize * page_size as usize;
        let mut page: Vec<Message> = newest_first
            .into_iter()
            .skip(skip)
            .take(page_size as usize)
            .cloned()
            .collect();
        page.reverse();
        Ok(page)
    }

    async fn delete_message(&self, id: MessageId) -> Result<(), RepositoryError> {
        let mut state = self.state.write().await;
        let chat_id = state
            .message_index
            .remove(&id)
            .ok_or(RepositoryError::NotFound)?;
        if let Some(messages) = state.messages.get_mut(&chat_id) {
            messages.retain(|message| message.id != id);
        }
        // 与 PostgreSQL 的 ON DELETE SET NULL 保持一致
        if let Some(chat) = state.chats.get_mut(&chat_id) {
            if chat.last_message == Some(id) {
                chat.last_message = None;
            }
        }
        Ok(())
    }

    /// 在同一把写锁内完成写消息和更新会话。
    async fn append_message(&self, message: Message) -> Result<Message, RepositoryError> {
        let mut state = self.state.write().await;
        if !state.chats.contains_key(&message.chat_id) {
            return Err(RepositoryError::NotFound);
        }
        if state.message_index.contains_key(&message.id) {
            return Err(RepositoryError::Conflict);
        }
        state.touch_chat(message.chat_id, message.id, message.created_at)?;
        state.message_index.insert(message.id, message.chat_id);
        state
            .messages
            .entry(message.chat_id)
            .or_default()
            .push(message.clone());
        Ok(message)
    }
}

/// 好友关系的内存实现，关系是对称的。
#[derive(Default)]
pub struct InMemoryFriendshipDirectory {
    pairs: RwLock<HashSet<[UserId; 2]>>,
}

impl InMemoryFriendshipDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn befriend(&self, first: UserId, second: UserId) {
        self.pairs
            .write()
            .await
            .insert(Chat::normalize_pair(first, second));
    }

    pub async fn unfriend(&self, first: UserId, second: UserId) {
        self.pairs
            .write()
            .await
            .remove(&Chat::normalize_pair(first, second));
    }
}

#[async_trait]
impl FriendshipDirectory for InMemoryFriendshipDirectory {
    async fn are_friends(&self, first: UserId, second: UserId) -> Result<bool, RepositoryError> {
        Ok(self
            .pairs
            .read()
            .await
            .contains(&Chat::normalize_pair(first, second)))
    }
}
