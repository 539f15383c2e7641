//! 实时通道：线上事件格式、房间注册表和协议引擎。

pub mod engine;
pub mod events;
pub mod rooms;

pub use engine::{ChatProtocolEngine, ConnectionSession, Indicator};
pub use events::{
    ChatUpdated, ClientEvent, ErrorNotice, NewMessage, PresenceStatus, SendMessagePayload,
    ServerEvent, ServerEventKind, StatusChange, UserActivity,
};
pub use rooms::{
    InMemoryRoomRegistry, OutboundReceiver, OutboundSender, RoomError, RoomKey, RoomRegistry,
    SessionHandle,
};
