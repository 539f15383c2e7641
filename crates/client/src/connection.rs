use std::collections::BTreeSet;
use std::time::Duration;

use application::{realtime::SendMessagePayload, ClientEvent, ServerEvent, ServerEventKind};
use domain::ChatId;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_tungstenite::{
    connect_async, tungstenite::Message as WsMessage, MaybeTlsStream, WebSocketStream,
};

use crate::error::ClientError;
use crate::event_bus::{EventBus, EventStream, Subscription};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// 断线重连的退避策略：指数增长，封顶在 `max_delay`。
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// `None` 表示一直重试
    pub max_attempts: Option<u32>,
}

impl ReconnectPolicy {
    pub fn disabled() -> Self {
        Self {
            max_attempts: Some(0),
            ..Self::default()
        }
    }

    /// 第 `attempt` 次重连（从 1 开始）之前的等待时间
    pub fn delay_at(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(20);
        self.initial_delay
            .saturating_mul(1u32 << exp)
            .min(self.max_delay)
    }

    fn allows(&self, attempt: u32) -> bool {
        self.max_attempts.map_or(true, |max| attempt <= max)
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            max_attempts: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// 网关地址，例如 `ws://127.0.0.1:3000/ws`
    pub url: String,
    pub token: String,
    pub token_query_param: String,
    pub reconnect: ReconnectPolicy,
}

impl ClientOptions {
    pub fn new(url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            token: token.into(),
            token_query_param: "token".to_string(),
            reconnect: ReconnectPolicy::default(),
        }
    }

    pub fn with_reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    fn handshake_url(&self) -> String {
        let separator = if self.url.contains('?') { '&' } else { '?' };
        format!(
            "{}{}{}={}",
            self.url, separator, self.token_query_param, self.token
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    Reconnecting { attempt: u32 },
    Disconnected,
}

/// 聊天网关的客户端
///
/// 连接建立后自动上报 `user_online`；连接断开时按 [`ReconnectPolicy`] 重连，
/// 并重新加入此前加入过的会话。drop 时断开连接并清空全部订阅。
pub struct ChatClient {
    commands: mpsc::UnboundedSender<ClientEvent>,
    state: watch::Receiver<ConnectionState>,
    events: EventBus,
    shutdown: Option<oneshot::Sender<()>>,
    driver: Option<JoinHandle<()>>,
}

impl ChatClient {
    /// 建立第一条连接。握手失败（包括 401）直接返回错误，不进入重连。
    pub async fn connect(options: ClientOptions) -> Result<Self, ClientError> {
        let socket = open(&options).await?;
        tracing::info!(url = %options.url, "chat client connected");

        let events = EventBus::new();
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (state_tx, state) = watch::channel(ConnectionState::Connected);
        let (shutdown, shutdown_rx) = oneshot::channel();

        let driver = Driver {
            options,
            events: events.clone(),
            commands: command_rx,
            state: state_tx,
            joined: BTreeSet::new(),
        };
        let driver = tokio::spawn(driver.run(socket, shutdown_rx));

        Ok(Self {
            commands,
            state,
            events,
            shutdown: Some(shutdown),
            driver: Some(driver),
        })
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn on<F>(&self, kind: ServerEventKind, handler: F) -> Subscription
    where
        F: Fn(&ServerEvent) + Send + Sync + 'static,
    {
        self.events.subscribe(kind, handler)
    }

    pub fn stream(&self, kind: ServerEventKind) -> EventStream {
        self.events.stream(kind)
    }

    pub fn join_chat(&self, chat_id: ChatId) -> Result<(), ClientError> {
        self.emit(ClientEvent::JoinChat(chat_id.to_string()))
    }

    pub fn leave_chat(&self, chat_id: ChatId) -> Result<(), ClientError> {
        self.emit(ClientEvent::LeaveChat(chat_id.to_string()))
    }

    pub fn send_message(
        &self,
        chat_id: ChatId,
        content: impl Into<String>,
    ) -> Result<(), ClientError> {
        self.emit(ClientEvent::SendMessage(SendMessagePayload {
            chat_id: chat_id.to_string(),
            content: Some(content.into()),
            message_type: Some("text".to_string()),
        }))
    }

    pub fn start_typing(&self, chat_id: ChatId) -> Result<(), ClientError> {
        self.emit(ClientEvent::TypingStart(chat_id.to_string()))
    }

    pub fn stop_typing(&self, chat_id: ChatId) -> Result<(), ClientError> {
        self.emit(ClientEvent::TypingStop(chat_id.to_string()))
    }

    pub fn start_voice_recording(&self, chat_id: ChatId) -> Result<(), ClientError> {
        self.emit(ClientEvent::VoiceMessageStart(chat_id.to_string()))
    }

    pub fn stop_voice_recording(&self, chat_id: ChatId) -> Result<(), ClientError> {
        self.emit(ClientEvent::VoiceMessageStop(chat_id.to_string()))
    }

    /// 连接断开期间的命令会排队，重连成功后按顺序发出。
    pub fn emit(&self, event: ClientEvent) -> Result<(), ClientError> {
        self.commands.send(event).map_err(|_| ClientError::Closed)
    }

    /// 主动断开并等待后台任务结束
    pub async fn close(mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(driver) = self.driver.take() {
            if let Err(err) = driver.await {
                tracing::warn!(error = %err, "chat client driver failed");
            }
        }
    }
}

impl Drop for ChatClient {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        self.events.clear();
    }
}

async fn open(options: &ClientOptions) -> Result<Socket, ClientError> {
    let (socket, _response) = connect_async(options.handshake_url())
        .await
        .map_err(ClientError::from_handshake)?;
    Ok(socket)
}

enum SessionEnd {
    Shutdown,
    Lost,
}

/// 后台任务：持有连接，转发命令，分发事件，负责重连。
struct Driver {
    options: ClientOptions,
    events: EventBus,
    commands: mpsc::UnboundedReceiver<ClientEvent>,
    state: watch::Sender<ConnectionState>,
    joined: BTreeSet<String>,
}

impl Driver {
    async fn run(mut self, mut socket: Socket, mut shutdown: oneshot::Receiver<()>) {
        loop {
            match self.session(socket, &mut shutdown).await {
                SessionEnd::Shutdown => break,
                SessionEnd::Lost => {
                    tracing::warn!(url = %self.options.url, "chat connection lost");
                }
            }

            match self.reconnect(&mut shutdown).await {
                Some(next) => socket = next,
                None => break,
            }
        }
        // 先关闭命令通道，状态变为 Disconnected 时命令一定会失败
        self.commands.close();
        let _ = self.state.send(ConnectionState::Disconnected);
        tracing::info!(url = %self.options.url, "chat client stopped");
    }

    async fn reconnect(&mut self, shutdown: &mut oneshot::Receiver<()>) -> Option<Socket> {
        let mut attempt = 1;
        while self.options.reconnect.allows(attempt) {
            let _ = self.state.send(ConnectionState::Reconnecting { attempt });
            let delay = self.options.reconnect.delay_at(attempt);
            tokio::select! {
                _ = &mut *shutdown => return None,
                _ = sleep(delay) => {}
            }

            match open(&self.options).await {
                Ok(socket) => {
                    tracing::info!(attempt, "chat client reconnected");
                    let _ = self.state.send(ConnectionState::Connected);
                    return Some(socket);
                }
                Err(err) if err.is_fatal() => {
                    tracing::warn!(error = %err, "reconnect rejected, giving up");
                    return None;
                }
                Err(err) => {
                    tracing::debug!(error = %err, attempt, "reconnect attempt failed");
                    attempt += 1;
                }
            }
        }
        None
    }

    async fn session(
        &mut self,
        socket: Socket,
        shutdown: &mut oneshot::Receiver<()>,
    ) -> SessionEnd {
        let (mut sink, mut stream) = socket.split();

        // 每次（重新）连接都先上报在线，再恢复此前加入的会话
        let mut greeting = vec![ClientEvent::UserOnline];
        greeting.extend(self.joined.iter().cloned().map(ClientEvent::JoinChat));
        for event in greeting {
            if send_event(&mut sink, &event).await.is_err() {
                return SessionEnd::Lost;
            }
        }

        loop {
            tokio::select! {
                _ = &mut *shutdown => {
                    let _ = sink.send(WsMessage::Close(None)).await;
                    let _ = sink.close().await;
                    return SessionEnd::Shutdown;
                }
                command = self.commands.recv() => {
                    let Some(event) = command else {
                        let _ = sink.close().await;
                        return SessionEnd::Shutdown;
                    };
                    self.remember(&event);
                    if let Err(err) = send_event(&mut sink, &event).await {
                        tracing::warn!(error = %err, event = event.name(), "failed to send event");
                        return SessionEnd::Lost;
                    }
                }
                frame = stream.next() => {
                    match frame {
                        Some(Ok(WsMessage::Text(text))) => {
                            match serde_json::from_str::<ServerEvent>(text.as_str()) {
                                Ok(event) => {
                                    self.events.publish(&event);
                                }
                                Err(err) => {
                                    tracing::debug!(error = %err, "ignoring unknown server frame");
                                }
                            }
                        }
                        Some(Ok(WsMessage::Close(_))) | None => return SessionEnd::Lost,
                        Some(Ok(_)) => {}
                        Some(Err(err)) => {
                            tracing::debug!(error = %err, "websocket read failed");
                            return SessionEnd::Lost;
                        }
                    }
                }
            }
        }
    }

    fn remember(&mut self, event: &ClientEvent) {
        match event {
            ClientEvent::JoinChat(chat_id) => {
                self.joined.insert(chat_id.clone());
            }
            ClientEvent::LeaveChat(chat_id) => {
                self.joined.remove(chat_id);
            }
            _ => {}
        }
    }
}

async fn send_event<S>(sink: &mut S, event: &ClientEvent) -> Result<(), ClientError>
where
    S: futures_util::Sink<WsMessage, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
{
    let payload = serde_json::to_string(event)?;
    sink.send(WsMessage::Text(payload.into())).await?;
    Ok(())
}
