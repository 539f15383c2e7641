use domain::{Chat, Message, MessageType, Timestamp};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// 消息在 REST 响应和实时事件里的统一形态。
///
/// 文本消息只带 `content`，语音消息只带 `voiceUrl` / `blobName` / `duration`。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageDto {
    pub id: Uuid,
    pub chat_id: Uuid,
    pub sender: Uuid,
    pub message_type: MessageType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voice_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blob_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<u32>,
    pub is_read: bool,
    pub created_at: Timestamp,
}

impl From<&Message> for MessageDto {
    fn from(message: &Message) -> Self {
        let voice = message.payload.voice();
        Self {
            id: message.id.into(),
            chat_id: message.chat_id.into(),
            sender: message.sender_id.into(),
            message_type: message.message_type(),
            content: message
                .payload
                .content()
                .map(|content| content.as_str().to_owned()),
            voice_url: voice.map(|clip| clip.url.clone()),
            blob_name: voice.map(|clip| clip.blob_ref.clone()),
            duration: voice.map(|clip| clip.duration_secs),
            is_read: message.is_read,
            created_at: message.created_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatDto {
    pub id: Uuid,
    pub participants: Vec<Uuid>,
    pub last_message: Option<Uuid>,
    pub last_activity: Timestamp,
    pub created_at: Timestamp,
}

impl From<&Chat> for ChatDto {
    fn from(chat: &Chat) -> Self {
        Self {
            id: chat.id.into(),
            participants: chat.participants().iter().map(|id| Uuid::from(*id)).collect(),
            last_message: chat.last_message.map(Uuid::from),
            last_activity: chat.last_activity,
            created_at: chat.created_at,
        }
    }
}
