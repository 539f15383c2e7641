//! 房间注册表：记录每个房间当前有哪些连接，并负责扇出。
//!
//! 注册表只描述本进程内的连接。需要跨进程扇出时，替换 `RoomRegistry`
//! 的实现即可，协议引擎不需要改动。

use std::collections::{HashMap, HashSet};
use std::fmt;

use async_trait::async_trait;
use domain::{ChatId, SessionId, UserId};
use thiserror::Error;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info};

use crate::auth::AuthenticatedUser;
use crate::realtime::events::ServerEvent;

/// 每个连接的下行通道。没有背压，发送端永远不会阻塞。
pub type OutboundSender = mpsc::UnboundedSender<ServerEvent>;
pub type OutboundReceiver = mpsc::UnboundedReceiver<ServerEvent>;

/// 逻辑房间。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RoomKey {
    /// 用户的个人通知房间，连接建立时自动加入
    Personal(UserId),
    /// 会话房间，校验成员身份后显式加入
    Chat(ChatId),
}

impl fmt::Display for RoomKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RoomKey::Personal(user_id) => write!(f, "user_{user_id}"),
            RoomKey::Chat(chat_id) => write!(f, "chat_{chat_id}"),
        }
    }
}

/// 注册到房间表里的一条连接。
#[derive(Debug, Clone)]
pub struct SessionHandle {
    pub session_id: SessionId,
    pub user: AuthenticatedUser,
    outbound: OutboundSender,
}

impl SessionHandle {
    pub fn new(session_id: SessionId, user: AuthenticatedUser, outbound: OutboundSender) -> Self {
        Self {
            session_id,
            user,
            outbound,
        }
    }

    /// 连接已经关闭时返回 `false`。
    fn deliver(&self, event: ServerEvent) -> bool {
        self.outbound.send(event).is_ok()
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RoomError {
    #[error("session {0} is not registered")]
    UnknownSession(SessionId),
}

#[async_trait]
pub trait RoomRegistry: Send + Sync {
    async fn register(&self, session: SessionHandle);

    /// 重复加入同一房间不会产生额外效果。
    async fn join(&self, session_id: SessionId, room: RoomKey) -> Result<(), RoomError>;

    /// 不在房间内时什么也不做。
    async fn leave(&self, session_id: SessionId, room: RoomKey);

    async fn is_member(&self, session_id: SessionId, room: RoomKey) -> bool;

    /// 投递给调用时刻房间内的全部连接，返回成功投递的数量。
    async fn broadcast(
        &self,
        room: RoomKey,
        event: ServerEvent,
        exclude: Option<SessionId>,
    ) -> usize;

    /// 投递给本进程内所有已认证的连接。
    async fn broadcast_all(&self, event: ServerEvent, exclude: Option<SessionId>) -> usize;

    async fn send_to(&self, session_id: SessionId, event: ServerEvent) -> bool;

    /// 移除连接并返回它离开的房间。幂等，重复调用返回空列表。
    async fn remove_session(&self, session_id: SessionId) -> Vec<RoomKey>;

    async fn session_count(&self) -> usize;
}

struct SessionEntry {
    handle: SessionHandle,
    rooms: HashSet<RoomKey>,
}

#[derive(Default)]
struct RegistryState {
    sessions: HashMap<SessionId, SessionEntry>,
    rooms: HashMap<RoomKey, HashSet<SessionId>>,
}

/// 单进程内存实现。
///
/// 连接表和房间表放在同一把锁下，两者始终一致。
#[derive(Default)]
pub struct InMemoryRoomRegistry {
    state: RwLock<RegistryState>,
}

impl InMemoryRoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn members_of(&self, room: RoomKey) -> Vec<SessionId> {
        let state = self.state.read().await;
        state
            .rooms
            .get(&room)
            .map(|members| members.iter().copied().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl RoomRegistry for InMemoryRoomRegistry {
    async fn register(&self, session: SessionHandle) {
        let mut state = self.state.write().await;
        info!(
            session_id = %session.session_id,
            user_id = %session.user.user_id,
            "session registered"
        );
        state.sessions.insert(
            session.session_id,
            SessionEntry {
                handle: session,
                rooms: HashSet::new(),
            },
        );
    }

    async fn join(&self, session_id: SessionId, room: RoomKey) -> Result<(), RoomError> {
        let mut state = self.state.write().await;
        let entry = state
            .sessions
            .get_mut(&session_id)
            .ok_or(RoomError::UnknownSession(session_id))?;

        if entry.rooms.insert(room) {
            state.rooms.entry(room).or_default().insert(session_id);
            debug!(session_id = %session_id, room = %room, "joined room");
        }
        Ok(())
    }

    async fn leave(&self, session_id: SessionId, room: RoomKey) {
        let mut state = self.state.write().await;
        let removed = state
            .sessions
            .get_mut(&session_id)
            .map(|entry| entry.rooms.remove(&room))
            .unwrap_or(false);
        if !removed {
            return;
        }

        if let Some(members) = state.rooms.get_mut(&room) {
            members.remove(&session_id);
            if members.is_empty() {
                state.rooms.remove(&room);
            }
        }
        debug!(session_id = %session_id, room = %room, "left room");
    }

    async fn is_member(&self, session_id: SessionId, room: RoomKey) -> bool {
        let state = self.state.read().await;
        state
            .sessions
            .get(&session_id)
            .is_some_and(|entry| entry.rooms.contains(&room))
    }

    async fn broadcast(
        &self,
        room: RoomKey,
        event: ServerEvent,
        exclude: Option<SessionId>,
    ) -> usize {
        let state = self.state.read().await;
        let Some(members) = state.rooms.get(&room) else {
            return 0;
        };

        let delivered = members
            .iter()
            .filter(|session_id| Some(**session_id) != exclude)
            .filter_map(|session_id| state.sessions.get(session_id))
            .filter(|entry| entry.handle.deliver(event.clone()))
            .count();
        debug!(room = %room, event = event.kind().as_str(), delivered, "room broadcast");
        delivered
    }

    async fn broadcast_all(&self, event: ServerEvent, exclude: Option<SessionId>) -> usize {
        let state = self.state.read().await;
        let delivered = state
            .sessions
            .values()
            .filter(|entry| Some(entry.handle.session_id) != exclude)
            .filter(|entry| entry.handle.deliver(event.clone()))
            .count();
        debug!(event = event.kind().as_str(), delivered, "global broadcast");
        delivered
    }

    async fn send_to(&self, session_id: SessionId, event: ServerEvent) -> bool {
        let state = self.state.read().await;
        state
            .sessions
            .get(&session_id)
            .is_some_and(|entry| entry.handle.deliver(event))
    }

    async fn remove_session(&self, session_id: SessionId) -> Vec<RoomKey> {
        let mut state = self.state.write().await;
        let Some(entry) = state.sessions.remove(&session_id) else {
            return Vec::new();
        };

        for room in &entry.rooms {
            if let Some(members) = state.rooms.get_mut(room) {
                members.remove(&session_id);
                if members.is_empty() {
                    state.rooms.remove(room);
                }
            }
        }
        info!(
            session_id = %session_id,
            user_id = %entry.handle.user.user_id,
            rooms = entry.rooms.len(),
            "session removed"
        );
        entry.rooms.into_iter().collect()
    }

    async fn session_count(&self) -> usize {
        self.state.read().await.sessions.len()
    }
}
