//! 聊天网关的客户端 SDK。
//!
//! 通过 WebSocket 连接网关，按事件类型订阅推送，并提供发送命令的便捷方法。

pub mod connection;
pub mod error;
pub mod event_bus;

pub use connection::{ChatClient, ClientOptions, ConnectionState, ReconnectPolicy};
pub use error::ClientError;
pub use event_bus::{EventBus, EventStream, Subscription};

pub use application::{ClientEvent, ServerEvent, ServerEventKind};
