//! 聊天系统核心领域模型
//!
//! 包含一对一会话、消息以及相关的值对象和业务规则。

pub mod chat;
pub mod errors;
pub mod message;
pub mod value_objects;

pub use chat::Chat;
pub use errors::{DomainError, DomainResult, RepositoryError};
pub use message::{Message, MessagePayload, MessageType, VoiceClip};
pub use value_objects::{
    ChatId, MessageContent, MessageId, SessionId, Timestamp, UserEmail, UserId,
};
