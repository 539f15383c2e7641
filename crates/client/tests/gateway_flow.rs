use std::{sync::Arc, time::Duration};

use application::realtime::PresenceStatus;
use application::{
    AuthenticatedUser, ChatProtocolEngine, ChatService, ChatServiceDependencies,
    InMemoryChatStore, InMemoryFriendshipDirectory, InMemoryRoomRegistry, SystemClock,
};
use client::{ChatClient, ClientError, ClientOptions, ReconnectPolicy, ServerEvent, ServerEventKind};
use config::JwtConfig;
use domain::{ChatId, UserEmail, UserId};
use infrastructure::LocalBlobStore;
use tempfile::TempDir;
use tokio::{net::TcpListener, time::timeout};
use web_api::{router, AppState, GatewaySettings, JwtService};

struct Gateway {
    url: String,
    jwt: Arc<JwtService>,
    chat_service: Arc<ChatService>,
    friendships: Arc<InMemoryFriendshipDirectory>,
    _blobs: TempDir,
}

impl Gateway {
    async fn start() -> Self {
        let blobs = tempfile::tempdir().expect("temp dir");
        let blob_store = LocalBlobStore::new(blobs.path(), "http://localhost/uploads", 1024)
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
            secret: "client-integration-secret-0123456789".to_string(),
            expiration_hours: 1,
        }));
        let app = router(AppState::new(
            chat_service.clone(),
            engine,
            jwt.clone(),
            GatewaySettings::default(),
        ));

        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            axum::serve(listener, app.into_make_service()).await.ok();
        });

        Self {
            url: format!("ws://{addr}/ws"),
            jwt,
            chat_service,
            friendships,
            _blobs: blobs,
        }
    }

    fn identity(&self, email: &str) -> (UserId, String) {
        let user = AuthenticatedUser {
            user_id: UserId::generate(),
            email: UserEmail::parse(email).expect("email"),
        };
        let token = self
            .jwt
            .generate_token(user.user_id, &user.email)
            .expect("token");
        (user.user_id, token)
    }

    async fn client(&self, token: &str) -> ChatClient {
        ChatClient::connect(
            ClientOptions::new(&self.url, token).with_reconnect(ReconnectPolicy::disabled()),
        )
        .await
        .expect("client connect")
    }
}

async fn next(stream: &mut client::EventStream) -> ServerEvent {
    timeout(Duration::from_secs(3), stream.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event stream closed")
}

#[tokio::test]
async fn rejected_token_is_reported_without_retrying() {
    let gateway = Gateway::start().await;
    let result = ChatClient::connect(ClientOptions::new(&gateway.url, "forged")).await;
    assert!(matches!(result, Err(ClientError::Unauthorized)));
}

#[tokio::test]
async fn clients_exchange_messages_and_presence() {
    let gateway = Gateway::start().await;
    let (alice_id, alice_token) = gateway.identity("alice@example.com");
    let (bob_id, bob_token) = gateway.identity("bob@example.com");
    gateway.friendships.befriend(alice_id, bob_id).await;
    let chat = gateway
        .chat_service
        .get_or_create_chat(alice_id, bob_id)
        .await
        .expect("chat");
    let chat_id: ChatId = chat.id;

    let alice = gateway.client(&alice_token).await;
    let mut alice_status = alice.stream(ServerEventKind::UserStatusChange);
    let mut alice_messages = alice.stream(ServerEventKind::NewMessage);

    // 自己收到自己的消息即说明连接已注册、join 已生效
    alice.join_chat(chat_id).expect("join");
    alice.send_message(chat_id, "hello").expect("send");
    match next(&mut alice_messages).await {
        ServerEvent::NewMessage(event) => {
            assert_eq!(event.message.content.as_deref(), Some("hello"))
        }
        other => panic!("unexpected {other:?}"),
    }

    // bob 连上后自动上报在线
    let bob = gateway.client(&bob_token).await;
    let mut bob_messages = bob.stream(ServerEventKind::NewMessage);
    match next(&mut alice_status).await {
        ServerEvent::UserStatusChange(change) => {
            assert_eq!(UserId::from(change.user_id), bob_id);
            assert_eq!(change.status, PresenceStatus::Online);
        }
        other => panic!("unexpected {other:?}"),
    }

    bob.join_chat(chat_id).expect("join");
    bob.send_message(chat_id, "hi").expect("send");
    for stream in [&mut alice_messages, &mut bob_messages] {
        match next(stream).await {
            ServerEvent::NewMessage(event) => {
                assert_eq!(ChatId::from(event.chat_id), chat_id);
                assert_eq!(event.message.content.as_deref(), Some("hi"));
                assert_eq!(UserId::from(event.message.sender), bob_id);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    let mut alice_typing = alice.stream(ServerEventKind::UserTyping);
    bob.start_typing(chat_id).expect("typing");
    match next(&mut alice_typing).await {
        ServerEvent::UserTyping(activity) => assert_eq!(activity.user_email, "bob@example.com"),
        other => panic!("unexpected {other:?}"),
    }

    drop(bob);
    match next(&mut alice_status).await {
        ServerEvent::UserStatusChange(change) => {
            assert_eq!(UserId::from(change.user_id), bob_id);
            assert_eq!(change.status, PresenceStatus::Offline);
        }
        other => panic!("unexpected {other:?}"),
    }

    alice.close().await;
}
