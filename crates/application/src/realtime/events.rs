//! 实时通道的线上格式。
//!
//! 每一帧都是一个 JSON 文本：`{"event": "<名称>", "data": <负载>}`。

use domain::Timestamp;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::dto::MessageDto;

/// 客户端发往服务端的事件。
///
/// 会话 id 等字段保持客户端原样的字符串，由协议引擎负责校验。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ClientEvent {
    JoinChat(String),
    LeaveChat(String),
    SendMessage(SendMessagePayload),
    TypingStart(String),
    TypingStop(String),
    VoiceMessageStart(String),
    VoiceMessageStop(String),
    UserOnline,
}

impl ClientEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ClientEvent::JoinChat(_) => "join_chat",
            ClientEvent::LeaveChat(_) => "leave_chat",
            ClientEvent::SendMessage(_) => "send_message",
            ClientEvent::TypingStart(_) => "typing_start",
            ClientEvent::TypingStop(_) => "typing_stop",
            ClientEvent::VoiceMessageStart(_) => "voice_message_start",
            ClientEvent::VoiceMessageStop(_) => "voice_message_stop",
            ClientEvent::UserOnline => "user_online",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessagePayload {
    pub chat_id: String,
    #[serde(default)]
    pub content: Option<String>,
    /// 缺省为 `text`
    #[serde(default)]
    pub message_type: Option<String>,
}

/// 服务端推送给客户端的事件。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
    NewMessage(NewMessage),
    ChatUpdated(ChatUpdated),
    UserTyping(UserActivity),
    UserStoppedTyping(UserActivity),
    UserRecordingVoice(UserActivity),
    UserStoppedRecording(UserActivity),
    UserStatusChange(StatusChange),
    Error(ErrorNotice),
}

impl ServerEvent {
    pub fn error(message: impl Into<String>) -> Self {
        ServerEvent::Error(ErrorNotice {
            message: message.into(),
        })
    }

    pub fn kind(&self) -> ServerEventKind {
        match self {
            ServerEvent::NewMessage(_) => ServerEventKind::NewMessage,
            ServerEvent::ChatUpdated(_) => ServerEventKind::ChatUpdated,
            ServerEvent::UserTyping(_) => ServerEventKind::UserTyping,
            ServerEvent::UserStoppedTyping(_) => ServerEventKind::UserStoppedTyping,
            ServerEvent::UserRecordingVoice(_) => ServerEventKind::UserRecordingVoice,
            ServerEvent::UserStoppedRecording(_) => ServerEventKind::UserStoppedRecording,
            ServerEvent::UserStatusChange(_) => ServerEventKind::UserStatusChange,
            ServerEvent::Error(_) => ServerEventKind::Error,
        }
    }
}

/// 服务端事件的名称，用于按类型订阅。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServerEventKind {
    NewMessage,
    ChatUpdated,
    UserTyping,
    UserStoppedTyping,
    UserRecordingVoice,
    UserStoppedRecording,
    UserStatusChange,
    Error,
}

impl ServerEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServerEventKind::NewMessage => "new_message",
            ServerEventKind::ChatUpdated => "chat_updated",
            ServerEventKind::UserTyping => "user_typing",
            ServerEventKind::UserStoppedTyping => "user_stopped_typing",
            ServerEventKind::UserRecordingVoice => "user_recording_voice",
            ServerEventKind::UserStoppedRecording => "user_stopped_recording",
            ServerEventKind::UserStatusChange => "user_status_change",
            ServerEventKind::Error => "error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewMessage {
    pub message: MessageDto,
    pub chat_id: Uuid,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatUpdated {
    pub chat_id: Uuid,
    pub last_message: MessageDto,
    pub last_activity: Timestamp,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserActivity {
    pub user_id: Uuid,
    pub user_email: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    Online,
    Offline,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusChange {
    pub user_id: Uuid,
    pub status: PresenceStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorNotice {
    pub message: String,
}
