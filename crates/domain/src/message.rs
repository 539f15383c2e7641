use std::fmt;
use std::str::FromStr;

use crate::errors::DomainError;
use crate::value_objects::{ChatId, MessageContent, MessageId, Timestamp, UserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Text,
    Voice,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Text => "text",
            MessageType::Voice => "voice",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageType {
    type Err = DomainError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "text" => Ok(MessageType::Text),
            "voice" => Ok(MessageType::Voice),
            other => Err(DomainError::invalid_argument(
                "message_type",
                format!("unsupported message type `{other}`"),
            )),
        }
    }
}

/// 语音消息在 blob 存储中的位置和时长。
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct VoiceClip {
    pub url: String,
    pub blob_ref: String,
    pub duration_secs: u32,
}

impl VoiceClip {
    pub fn new(
        url: impl Into<String>,
        blob_ref: impl Into<String>,
        duration_secs: u32,
    ) -> Result<Self, DomainError> {
        let url = url.into();
        let blob_ref = blob_ref.into();
        if url.trim().is_empty() {
            return Err(DomainError::invalid_argument("voice_url", "cannot be empty"));
        }
        if blob_ref.trim().is_empty() {
            return Err(DomainError::invalid_argument("blob_name", "cannot be empty"));
        }
        Ok(Self {
            url,
            blob_ref,
            duration_secs,
        })
    }
}

/// 消息负载：文本和语音互斥，由类型决定。
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum MessagePayload {
    Text(MessageContent),
    Voice(VoiceClip),
}

impl MessagePayload {
    pub fn text(content: impl Into<String>) -> Result<Self, DomainError> {
        MessageContent::new(content).map(MessagePayload::Text)
    }

    /// 由松散字段组装负载，保证恰好填充了类型对应的那一组字段。
    pub fn from_parts(
        message_type: MessageType,
        content: Option<String>,
        voice: Option<VoiceClip>,
    ) -> Result<Self, DomainError> {
        match (message_type, content, voice) {
            (MessageType::Text, Some(content), None) => Self::text(content),
            (MessageType::Text, None, _) => {
                Err(DomainError::invalid_argument("content", "required for text messages"))
            }
            (MessageType::Text, Some(_), Some(_)) => Err(DomainError::invalid_argument(
                "voice_url",
                "not allowed for text messages",
            )),
            (MessageType::Voice, None, Some(clip)) => Ok(MessagePayload::Voice(clip)),
            (MessageType::Voice, _, None) => Err(DomainError::invalid_argument(
                "voice_url",
                "voice messages must carry an uploaded clip",
            )),
            (MessageType::Voice, Some(_), Some(_)) => Err(DomainError::invalid_argument(
                "content",
                "not allowed for voice messages",
            )),
        }
    }

    pub fn message_type(&self) -> MessageType {
        match self {
            MessagePayload::Text(_) => MessageType::Text,
            MessagePayload::Voice(_) => MessageType::Voice,
        }
    }

    pub fn content(&self) -> Option<&MessageContent> {
        match self {
            MessagePayload::Text(content) => Some(content),
            MessagePayload::Voice(_) => None,
        }
    }

    pub fn voice(&self) -> Option<&VoiceClip> {
        match self {
            MessagePayload::Voice(clip) => Some(clip),
            MessagePayload::Text(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub chat_id: ChatId,
    pub sender_id: UserId,
    pub payload: MessagePayload,
    pub is_read: bool,
    pub created_at: Timestamp,
}

impl Message {
    pub fn new(
        id: MessageId,
        chat_id: ChatId,
        sender_id: UserId,
        payload: MessagePayload,
        created_at: Timestamp,
    ) -> Self {
        Self {
            id,
            chat_id,
            sender_id,
            payload,
            is_read: false,
            created_at,
        }
    }

    pub fn message_type(&self) -> MessageType {
        self.payload.message_type()
    }

    pub fn is_sent_by(&self, user_id: UserId) -> bool {
        self.sender_id == user_id
    }

    pub fn mark_read(&mut self) {
        self.is_read = true;
    }
}
