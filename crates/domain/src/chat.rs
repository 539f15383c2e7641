use crate::errors::DomainError;
use crate::value_objects::{ChatId, MessageId, Timestamp, UserId};

/// 两个用户之间唯一的一对一会话。
///
/// 参与者总是按排序后的顺序保存，存储层据此对 `(low, high)` 建唯一约束，
/// 从而保证同一对用户最多只有一个会话。
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Chat {
    pub id: ChatId,
    participants: [UserId; 2],
    pub last_message: Option<MessageId>,
    pub last_activity: Timestamp,
    pub created_at: Timestamp,
}

impl Chat {
    pub fn between(
        id: ChatId,
        first: UserId,
        second: UserId,
        now: Timestamp,
    ) -> Result<Self, DomainError> {
        if first == second {
            return Err(DomainError::SelfChat);
        }
        Ok(Self {
            id,
            participants: Self::normalize_pair(first, second),
            last_message: None,
            last_activity: now,
            created_at: now,
        })
    }

    /// 从存储中恢复会话，参与者顺序会被重新规范化。
    pub fn restore(
        id: ChatId,
        first: UserId,
        second: UserId,
        last_message: Option<MessageId>,
        last_activity: Timestamp,
        created_at: Timestamp,
    ) -> Self {
        Self {
            id,
            participants: Self::normalize_pair(first, second),
            last_message,
            last_activity,
            created_at,
        }
    }

    pub fn normalize_pair(first: UserId, second: UserId) -> [UserId; 2] {
        if first <= second {
            [first, second]
        } else {
            [second, first]
        }
    }

    pub fn participants(&self) -> &[UserId; 2] {
        &self.participants
    }

    pub fn has_participant(&self, user_id: UserId) -> bool {
        self.participants.contains(&user_id)
    }

    pub fn other_participant(&self, user_id: UserId) -> Option<UserId> {
        match self.participants {
            [a, b] if a == user_id => Some(b),
            [a, b] if b == user_id => Some(a),
            _ => None,
        }
    }

    pub fn ensure_participant(&self, user_id: UserId) -> Result<(), DomainError> {
        if self.has_participant(user_id) {
            Ok(())
        } else {
            Err(DomainError::NotChatParticipant)
        }
    }

    pub fn record_message(&mut self, message_id: MessageId, at: Timestamp) {
        self.last_message = Some(message_id);
        self.last_activity = at;
    }
}
