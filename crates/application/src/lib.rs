//! 应用层实现。
//!
//! 这里提供围绕会话与消息的用例服务、实时协议引擎，
//! 以及对外部适配器（存储、好友关系、语音文件、身份校验）的抽象。

pub mod auth;
pub mod blob;
pub mod clock;
pub mod dto;
pub mod error;
pub mod memory;
pub mod realtime;
pub mod repository;
pub mod services;

pub use auth::{AuthenticatedUser, SessionAuthenticator};
pub use blob::{BlobError, BlobStore, BlobUpload, StoredBlob};
pub use clock::{Clock, SystemClock};
pub use dto::{ChatDto, MessageDto};
pub use error::{ApplicationError, ErrorKind};
pub use memory::{InMemoryChatStore, InMemoryFriendshipDirectory};
pub use realtime::{
    ChatProtocolEngine, ClientEvent, ConnectionSession, InMemoryRoomRegistry, RoomKey,
    RoomRegistry, ServerEvent, ServerEventKind,
};
pub use repository::{ChatStore, FriendshipDirectory};
pub use services::{
    ChatService, ChatServiceDependencies, MessagePage, SendTextRequest, SendVoiceRequest,
    SentMessage,
};
