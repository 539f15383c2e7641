use std::collections::HashMap;

use application::{
    realtime::OutboundReceiver, ApplicationError, AuthenticatedUser, ClientEvent,
    ConnectionSession,
};
use axum::{
    body::Bytes,
    extract::{
        ws::{rejection::WebSocketUpgradeRejection, Message as WsMessage, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::HeaderMap,
    response::{IntoResponse, Response},
};
use domain::DomainError;
use futures_util::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use tokio::sync::mpsc;

use crate::auth::bearer_token;
use crate::error::ApiError;
use crate::state::AppState;

/// 握手：先校验 token，失败时直接返回 401，不会建立任何连接状态。
pub(crate) async fn websocket_upgrade(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let token = params
        .get(&state.settings.token_query_param)
        .map(String::as_str)
        .filter(|token| !token.is_empty())
        .or_else(|| bearer_token(&headers));
    let Some(token) = token else {
        tracing::warn!("websocket handshake without token");
        return ApiError::unauthorized("Authentication error").into_response();
    };

    let user = match state.authenticator.verify(token).await {
        Ok(user) => user,
        Err(err) => {
            tracing::warn!(error = %err, "websocket handshake rejected");
            return ApiError::unauthorized("Authentication error").into_response();
        }
    };

    match ws {
        Ok(ws) => ws.on_upgrade(move |socket| WebSocketConnection::new(socket, state, user).run()),
        Err(rejection) => rejection.into_response(),
    }
}

/// 单个已认证的 WebSocket 连接
///
/// 读循环串行地把客户端事件交给协议引擎；写操作统一由发送任务完成。
pub struct WebSocketConnection {
    socket: WebSocket,
    state: AppState,
    user: AuthenticatedUser,
}

impl WebSocketConnection {
    pub fn new(socket: WebSocket, state: AppState, user: AuthenticatedUser) -> Self {
        Self {
            socket,
            state,
            user,
        }
    }

    pub async fn run(self) {
        let Self {
            socket,
            state,
            user,
        } = self;
        let engine = state.engine.clone();

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let mut session = match engine.connect(user, outbound_tx).await {
            Ok(session) => session,
            Err(err) => {
                tracing::error!(error = %err, "failed to register websocket session");
                return;
            }
        };

        let (sender, incoming) = socket.split();
        // 创建 mpsc channel 来解耦对 sender 的访问
        let (cmd_tx, cmd_rx) = mpsc::channel::<WsCommand>(32);
        let send_task = tokio::spawn(Self::send_loop(sender, outbound_rx, cmd_rx));

        Self::receive_loop(incoming, &engine, &mut session, &cmd_tx).await;

        // 移出注册表后下行通道关闭，发送任务随之结束
        let session_id = session.id();
        let user_id = session.user().user_id;
        engine.disconnect(session).await;
        drop(cmd_tx);
        if let Err(err) = send_task.await {
            tracing::warn!(error = %err, "websocket send task failed");
        }

        tracing::info!(session_id = %session_id, user_id = %user_id, "websocket closed");
    }

    async fn receive_loop(
        mut incoming: SplitStream<WebSocket>,
        engine: &application::ChatProtocolEngine,
        session: &mut ConnectionSession,
        cmd_tx: &mpsc::Sender<WsCommand>,
    ) {
        while let Some(frame) = incoming.next().await {
            let message = match frame {
                Ok(message) => message,
                Err(err) => {
                    tracing::debug!(error = %err, session_id = %session.id(), "websocket read failed");
                    break;
                }
            };

            match message {
                WsMessage::Text(text) => match serde_json::from_str::<ClientEvent>(text.as_str()) {
                    Ok(event) => engine.handle_event(session, event).await,
                    Err(err) => {
                        tracing::debug!(error = %err, session_id = %session.id(), "unparseable client frame");
                        let error = ApplicationError::from(DomainError::invalid_argument(
                            "event",
                            "unrecognized event or payload",
                        ));
                        engine.reject(session.id(), &error).await;
                    }
                },
                WsMessage::Binary(_) => {
                    tracing::debug!(session_id = %session.id(), "binary frame ignored");
                }
                WsMessage::Ping(data) => {
                    if cmd_tx.send(WsCommand::SendPong(data)).await.is_err() {
                        tracing::warn!("Failed to send pong command");
                        break;
                    }
                }
                WsMessage::Pong(_) => {}
                WsMessage::Close(_) => {
                    tracing::debug!(session_id = %session.id(), "close frame received");
                    break;
                }
            }
        }
    }

    async fn send_loop(
        mut sender: SplitSink<WebSocket, WsMessage>,
        mut outbound_rx: OutboundReceiver,
        mut cmd_rx: mpsc::Receiver<WsCommand>,
    ) {
        loop {
            tokio::select! {
                Some(cmd) = cmd_rx.recv() => {
                    match cmd {
                        WsCommand::SendPong(data) => {
                            if sender.send(WsMessage::Pong(data)).await.is_err() {
                                tracing::warn!("Failed to send pong message");
                                break;
                            }
                        }
                    }
                }
                event = outbound_rx.recv() => {
                    let Some(event) = event else {
                        break;
                    };
                    let payload = match serde_json::to_string(&event) {
                        Ok(json) => json,
                        Err(err) => {
                            tracing::warn!(error = %err, "failed to serialize websocket payload");
                            continue;
                        }
                    };
                    if sender.send(WsMessage::Text(payload.into())).await.is_err() {
                        tracing::warn!(event = event.kind().as_str(), "Failed to send text message");
                        break;
                    }
                }
            }
        }
        let _ = sender.close().await;
    }
}

/// WebSocket 写操作命令
///
/// 下行事件走注册表的通道，这里只剩协议层的控制帧
#[derive(Debug)]
enum WsCommand {
    SendPong(Bytes),
}
