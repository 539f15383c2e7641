#![allow(dead_code)]

use std::{net::SocketAddr, sync::Arc, time::Duration};

use application::{
    AuthenticatedUser, ChatProtocolEngine, ChatService, ChatServiceDependencies,
    InMemoryChatStore, InMemoryFriendshipDirectory, InMemoryRoomRegistry, SystemClock,
};
use domain::{UserEmail, UserId};
use futures_util::{SinkExt, StreamExt};
use infrastructure::LocalBlobStore;
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::{net::TcpListener, sync::oneshot, time::timeout};
use tokio_tungstenite::{
    connect_async, tungstenite::Message as TungsteniteMessage, MaybeTlsStream, WebSocketStream,
};
use web_api::{router, AppState, GatewaySettings, JwtConfig, JwtService};

pub type WsClient = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

pub const MAX_UPLOAD_BYTES: usize = 64 * 1024;

/// 一个跑在随机端口上的完整服务，存储全部在内存里。
pub struct TestApp {
    pub addr: SocketAddr,
    pub jwt: Arc<JwtService>,
    pub friendships: Arc<InMemoryFriendshipDirectory>,
    pub blob_dir: TempDir,
    shutdown: Option<oneshot::Sender<()>>,
}

pub struct TestUser {
    pub identity: AuthenticatedUser,
    pub token: String,
}

impl TestUser {
    pub fn id(&self) -> String {
        self.identity.user_id.to_string()
    }
}

impl TestApp {
    pub async fn spawn() -> Self {
        let blob_dir = tempfile::tempdir().expect("temp dir");
        let blob_store = LocalBlobStore::new(
            blob_dir.path(),
            "http://localhost/uploads",
            MAX_UPLOAD_BYTES,
        )
        .await
        .expect("blob store");

        let friendships = Arc::new(InMemoryFriendshipDirectory::new());
        let chat_service = Arc::new(ChatService::new(ChatServiceDependencies {
            chat_store: Arc::new(InMemoryChatStore::new()),
            friendships: friendships.clone(),
            blob_store: Arc::new(blob_store),
            clock: Arc::new(SystemClock),
        }));
        let engine = Arc::new(ChatProtocolEngine::new(
            chat_service.clone(),
            Arc::new(InMemoryRoomRegistry::new()),
        ));
        let jwt = Arc::new(JwtService::new(JwtConfig {
            secret: "integration-test-secret-0123456789abcdef".to_string(),
            expiration_hours: 1,
        }));

        let state = AppState::new(
            chat_service,
            engine,
            jwt.clone(),
            GatewaySettings {
                token_query_param: "token".to_string(),
                max_upload_bytes: MAX_UPLOAD_BYTES,
            },
        );

        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let app = router(state);
        tokio::spawn(async move {
            axum::serve(listener, app.into_make_service())
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await
                .ok();
        });

        Self {
            addr,
            jwt,
            friendships,
            blob_dir,
            shutdown: Some(shutdown_tx),
        }
    }

    pub fn http(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn user(&self, email: &str) -> TestUser {
        let identity = AuthenticatedUser {
            user_id: UserId::generate(),
            email: UserEmail::parse(email).expect("email"),
        };
        let token = self
            .jwt
            .generate_token(identity.user_id, &identity.email)
            .expect("token");
        TestUser { identity, token }
    }

    pub async fn befriend(&self, a: &TestUser, b: &TestUser) {
        self.friendships
            .befriend(a.identity.user_id, b.identity.user_id)
            .await;
    }

    /// 通过 REST 取得（或创建）两人之间的会话，返回会话 id。
    pub async fn open_chat(&self, client: &reqwest::Client, user: &TestUser, friend: &TestUser) -> String {
        let chat: Value = client
            .get(self.http(&format!("/api/chats/{}/chat", friend.id())))
            .bearer_auth(&user.token)
            .send()
            .await
            .expect("open chat")
            .error_for_status()
            .expect("chat status")
            .json()
            .await
            .expect("chat json");
        chat["id"].as_str().expect("chat id").to_string()
    }

    pub async fn connect(&self, user: &TestUser) -> WsClient {
        let url = format!("ws://{}/ws?token={}", self.addr, user.token);
        let (socket, _) = connect_async(url).await.expect("websocket connect");
        socket
    }
}

impl Drop for TestApp {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

pub async fn emit(ws: &mut WsClient, event: &str, data: Value) {
    let frame = if data.is_null() {
        json!({ "event": event })
    } else {
        json!({ "event": event, "data": data })
    };
    ws.send(TungsteniteMessage::Text(frame.to_string().into()))
        .await
        .expect("send frame");
}

/// 读取下一条服务端事件，跳过控制帧。
pub async fn next_event(ws: &mut WsClient) -> Value {
    loop {
        let frame = timeout(Duration::from_secs(3), ws.next())
            .await
            .expect("timed out waiting for event")
            .expect("stream ended")
            .expect("websocket error");
        if let TungsteniteMessage::Text(text) = frame {
            return serde_json::from_str(text.as_str()).expect("event json");
        }
    }
}

/// 读取事件直到出现指定名称，返回它的 data。
pub async fn expect_event(ws: &mut WsClient, name: &str) -> Value {
    loop {
        let event = next_event(ws).await;
        if event["event"] == name {
            return event["data"].clone();
        }
    }
}

/// 同一连接上的事件按顺序处理：发一个无法识别的帧并等到它的 error，
/// 之前发出的帧就都已经处理完了。
pub async fn barrier(ws: &mut WsClient) {
    emit(ws, "barrier", Value::Null).await;
    loop {
        let event = next_event(ws).await;
        if event["event"] == "error" && event["data"]["message"]
            .as_str()
            .is_some_and(|m| m.starts_with("event:"))
        {
            return;
        }
    }
}

/// 确认一段时间内没有收到任何事件。
pub async fn assert_silent(ws: &mut WsClient) {
    if let Ok(Some(Ok(TungsteniteMessage::Text(text)))) =
        timeout(Duration::from_millis(200), ws.next()).await
    {
        panic!("unexpected event: {text}");
    }
}
