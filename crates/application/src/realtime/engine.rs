//! 协议引擎：把客户端事件翻译成存储操作和房间广播。
//!
//! 每个连接对应一个 [`ConnectionSession`]，由网关持有并串行地交给
//! [`ChatProtocolEngine::handle_event`]。引擎自身不持有连接状态，
//! 房间成员关系全部记录在 [`RoomRegistry`] 里。

use std::collections::HashSet;
use std::sync::Arc;

use domain::{ChatId, DomainError, MessageType, SessionId};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::auth::AuthenticatedUser;
use crate::dto::MessageDto;
use crate::error::ApplicationError;
use crate::realtime::events::{
    ChatUpdated, ClientEvent, NewMessage, PresenceStatus, SendMessagePayload, ServerEvent,
    StatusChange, UserActivity,
};
use crate::realtime::rooms::{OutboundSender, RoomKey, RoomRegistry, SessionHandle};
use crate::services::{ChatService, SendTextRequest, SentMessage};

/// 会话里可以开关的瞬时状态。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Indicator {
    Typing,
    Recording,
}

impl Indicator {
    fn event(self, activity: UserActivity, active: bool) -> ServerEvent {
        match (self, active) {
            (Indicator::Typing, true) => ServerEvent::UserTyping(activity),
            (Indicator::Typing, false) => ServerEvent::UserStoppedTyping(activity),
            (Indicator::Recording, true) => ServerEvent::UserRecordingVoice(activity),
            (Indicator::Recording, false) => ServerEvent::UserStoppedRecording(activity),
        }
    }
}

/// 一条已认证连接的状态。身份在握手时绑定，之后不会改变。
#[derive(Debug)]
pub struct ConnectionSession {
    id: SessionId,
    user: AuthenticatedUser,
    /// 已开启但尚未关闭的输入/录音提示，断开时补发结束事件
    indicators: HashSet<(ChatId, Indicator)>,
}

impl ConnectionSession {
    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn user(&self) -> &AuthenticatedUser {
        &self.user
    }

    fn activity(&self) -> UserActivity {
        UserActivity {
            user_id: self.user.user_id.into(),
            user_email: self.user.email.as_str().to_owned(),
        }
    }
}

pub struct ChatProtocolEngine {
    chat_service: Arc<ChatService>,
    rooms: Arc<dyn RoomRegistry>,
}

impl ChatProtocolEngine {
    pub fn new(chat_service: Arc<ChatService>, rooms: Arc<dyn RoomRegistry>) -> Self {
        Self {
            chat_service,
            rooms,
        }
    }

    pub fn rooms(&self) -> &Arc<dyn RoomRegistry> {
        &self.rooms
    }

    /// 注册连接并加入个人通知房间，之后即可收到会话列表更新。
    pub async fn connect(
        &self,
        user: AuthenticatedUser,
        outbound: OutboundSender,
    ) -> Result<ConnectionSession, ApplicationError> {
        let session = ConnectionSession {
            id: SessionId::generate(),
            user,
            indicators: HashSet::new(),
        };
        self.rooms
            .register(SessionHandle::new(session.id, session.user.clone(), outbound))
            .await;
        self.rooms
            .join(session.id, RoomKey::Personal(session.user.user_id))
            .await
            .map_err(|err| ApplicationError::Transport(err.to_string()))?;

        info!(
            session_id = %session.id,
            user_id = %session.user.user_id,
            "user connected"
        );
        Ok(session)
    }

    /// 处理一个客户端事件。失败只会以 `error` 事件回给当前连接。
    pub async fn handle_event(&self, session: &mut ConnectionSession, event: ClientEvent) {
        let name = event.name();
        let result = match event {
            ClientEvent::JoinChat(chat_id) => self.join_chat(session, &chat_id).await,
            ClientEvent::LeaveChat(chat_id) => self.leave_chat(session, &chat_id).await,
            ClientEvent::SendMessage(payload) => self.send_message(session, payload).await,
            ClientEvent::TypingStart(chat_id) => {
                self.signal(session, &chat_id, Indicator::Typing, true).await;
                Ok(())
            }
            ClientEvent::TypingStop(chat_id) => {
                self.signal(session, &chat_id, Indicator::Typing, false).await;
                Ok(())
            }
            ClientEvent::VoiceMessageStart(chat_id) => {
                self.signal(session, &chat_id, Indicator::Recording, true).await;
                Ok(())
            }
            ClientEvent::VoiceMessageStop(chat_id) => {
                self.signal(session, &chat_id, Indicator::Recording, false).await;
                Ok(())
            }
            ClientEvent::UserOnline => {
                self.announce_presence(session.id, session.user(), PresenceStatus::Online)
                    .await;
                Ok(())
            }
        };

        if let Err(err) = result {
            warn!(
                session_id = %session.id,
                user_id = %session.user.user_id,
                event = name,
                error = %err,
                "client event rejected"
            );
            self.reject(session.id, &err).await;
        }
    }

    /// 把解析失败等网关层的问题回给连接。
    pub async fn reject(&self, session_id: SessionId, err: &ApplicationError) {
        self.rooms
            .send_to(session_id, ServerEvent::error(err.client_message()))
            .await;
    }

    async fn join_chat(
        &self,
        session: &ConnectionSession,
        chat_id: &str,
    ) -> Result<(), ApplicationError> {
        let chat_id: ChatId = chat_id.parse()?;
        self.chat_service
            .authorize_participant(chat_id, session.user.user_id)
            .await?;
        self.rooms
            .join(session.id, RoomKey::Chat(chat_id))
            .await
            .map_err(|err| ApplicationError::Transport(err.to_string()))?;
        info!(session_id = %session.id, chat_id = %chat_id, "joined chat");
        Ok(())
    }

    async fn leave_chat(
        &self,
        session: &ConnectionSession,
        chat_id: &str,
    ) -> Result<(), ApplicationError> {
        let chat_id: ChatId = chat_id.parse()?;
        self.rooms.leave(session.id, RoomKey::Chat(chat_id)).await;
        debug!(session_id = %session.id, chat_id = %chat_id, "left chat");
        Ok(())
    }

    async fn send_message(
        &self,
        session: &ConnectionSession,
        payload: SendMessagePayload,
    ) -> Result<(), ApplicationError> {
        let message_type = match payload.message_type.as_deref() {
            None => MessageType::Text,
            Some(raw) => raw.parse()?,
        };
        if message_type == MessageType::Voice {
            return Err(DomainError::invalid_argument(
                "messageType",
                "voice messages are uploaded over HTTP",
            )
            .into());
        }
        let chat_id: ChatId = payload.chat_id.parse()?;
        let content = payload
            .content
            .ok_or_else(|| DomainError::invalid_argument("content", "is required"))?;

        let sent = self
            .chat_service
            .send_message(SendTextRequest {
                chat_id,
                sender_id: session.user.user_id,
                content,
            })
            .await?;
        self.publish_message(&sent).await;
        Ok(())
    }

    /// 广播一条已经持久化的消息。
    ///
    /// 先发 `new_message` 到会话房间（包括发送者自己的其他连接），
    /// 再向每个参与者的个人房间发 `chat_updated`。
    pub async fn publish_message(&self, sent: &SentMessage) {
        let chat_id = sent.chat.id;
        let message = MessageDto::from(&sent.message);

        let delivered = self
            .rooms
            .broadcast(
                RoomKey::Chat(chat_id),
                ServerEvent::NewMessage(NewMessage {
                    message: message.clone(),
                    chat_id: chat_id.into(),
                }),
                None,
            )
            .await;

        let update = ChatUpdated {
            chat_id: chat_id.into(),
            last_message: message,
            last_activity: sent.chat.last_activity,
        };
        for participant in sent.chat.participants() {
            self.rooms
                .broadcast(
                    RoomKey::Personal(*participant),
                    ServerEvent::ChatUpdated(update.clone()),
                    None,
                )
                .await;
        }

        info!(
            chat_id = %chat_id,
            message_id = %sent.message.id,
            sender_id = %sent.message.sender_id,
            delivered,
            "message published"
        );
    }

    async fn signal(
        &self,
        session: &mut ConnectionSession,
        chat_id: &str,
        indicator: Indicator,
        active: bool,
    ) {
        let Ok(chat_id) = chat_id.parse::<ChatId>() else {
            debug!(session_id = %session.id, "indicator for malformed chat id dropped");
            return;
        };
        let room = RoomKey::Chat(chat_id);
        if !self.rooms.is_member(session.id, room).await {
            debug!(
                session_id = %session.id,
                chat_id = %chat_id,
                ?indicator,
                "indicator for unjoined chat dropped"
            );
            return;
        }

        if active {
            session.indicators.insert((chat_id, indicator));
        } else {
            session.indicators.remove(&(chat_id, indicator));
        }
        self.rooms
            .broadcast(room, indicator.event(session.activity(), active), Some(session.id))
            .await;
    }

    async fn announce_presence(
        &self,
        session_id: SessionId,
        user: &AuthenticatedUser,
        status: PresenceStatus,
    ) {
        let event = ServerEvent::UserStatusChange(StatusChange {
            user_id: Uuid::from(user.user_id),
            status,
        });
        let delivered = self.rooms.broadcast_all(event, Some(session_id)).await;
        debug!(user_id = %user.user_id, ?status, delivered, "presence broadcast");
    }

    /// 连接关闭时调用，可以安全地重复调用。
    ///
    /// 先为仍然开启的提示补发结束事件，再移出所有房间，最后广播下线。
    pub async fn disconnect(&self, session: ConnectionSession) {
        let activity = session.activity();
        for (chat_id, indicator) in &session.indicators {
            self.rooms
                .broadcast(
                    RoomKey::Chat(*chat_id),
                    indicator.event(activity.clone(), false),
                    Some(session.id),
                )
                .await;
        }

        let rooms = self.rooms.remove_session(session.id).await;
        if rooms.is_empty() {
            return;
        }
        self.announce_presence(session.id, &session.user, PresenceStatus::Offline)
            .await;
        info!(
            session_id = %session.id,
            user_id = %session.user.user_id,
            "user disconnected"
        );
    }
}
