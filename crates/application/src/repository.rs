use async_trait::async_trait;
use domain::{Chat, ChatId, Message, MessageId, RepositoryError, Timestamp, UserId};

/// 会话与消息的持久化契约。
///
/// 实现需要保证单个会话文档的写入是原子的；应用层不会为会话额外加锁。
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChatStore: Send + Sync {
    async fn find_chat_by_id(&self, id: ChatId) -> Result<Option<Chat>, RepositoryError>;

    /// 参与者顺序无关。
    async fn find_chat_by_participants(
        &self,
        first: UserId,
        second: UserId,
    ) -> Result<Option<Chat>, RepositoryError>;

    /// 同一对参与者已存在会话时返回 `RepositoryError::Conflict`。
    async fn create_chat(&self, chat: Chat) -> Result<Chat, RepositoryError>;

    /// 按最近活跃时间倒序。
    async fn list_chats_for_user(&self, user_id: UserId) -> Result<Vec<Chat>, RepositoryError>;

    async fn create_message(&self, message: Message) -> Result<Message, RepositoryError>;

    async fn update_chat_last_message(
        &self,
        chat_id: ChatId,
        message_id: MessageId,
        at: Timestamp,
    ) -> Result<(), RepositoryError>;

    async fn find_message_by_id(&self, id: MessageId) -> Result<Option<Message>, RepositoryError>;

    /// 取第 `page` 页（从 1 开始），按最新优先分页，页内按时间正序返回。
    async fn list_messages(
        &self,
        chat_id: ChatId,
        page: u32,
        page_size: u32,
    ) -> Result<Vec<Message>, RepositoryError>;

    async fn delete_message(&self, id: MessageId) -> Result<(), RepositoryError>;

    /// 写入消息并推进会话的 lastMessage / lastActivity。
    ///
    /// 支持事务的实现应当覆盖这个方法，让两步在同一个事务内完成。
    async fn append_message(&self, message: Message) -> Result<Message, RepositoryError> {
        let stored = self.create_message(message).await?;
        self.update_chat_last_message(stored.chat_id, stored.id, stored.created_at)
            .await?;
        Ok(stored)
    }
}

/// 好友关系查询，好友申请流程本身不在本系统内。
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait FriendshipDirectory: Send + Sync {
    async fn are_friends(&self, first: UserId, second: UserId) -> Result<bool, RepositoryError>;
}
