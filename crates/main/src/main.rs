//! 主应用程序入口
//!
//! 加载配置，装配存储、协议引擎和网关，启动 Axum 服务。

use std::sync::Arc;

use anyhow::Context;
use application::{
    ChatProtocolEngine, ChatService, ChatServiceDependencies, ChatStore, FriendshipDirectory,
    InMemoryChatStore, InMemoryFriendshipDirectory, InMemoryRoomRegistry, SystemClock,
};
use axum::http::HeaderValue;
use config::{AppConfig, StorageBackend};
use infrastructure::{Infrastructure, InfrastructureConfig, LocalBlobStore};
use tower_http::{
    cors::{Any, CorsLayer},
    services::ServeDir,
    trace::TraceLayer,
};
use tracing_subscriber::EnvFilter;
use web_api::{router, AppState, GatewaySettings, JwtService};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::load().context("failed to load configuration")?;

    // 初始化日志，RUST_LOG 优先于配置里的默认规则
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.logging.filter)),
        )
        .init();

    let (chat_store, friendships) = build_stores(&config).await?;
    let blob_store = LocalBlobStore::from_config(&config.storage)
        .await
        .context("failed to prepare blob directory")?;
    let blob_root = blob_store.root().to_path_buf();

    let chat_service = Arc::new(ChatService::new(ChatServiceDependencies {
        chat_store,
        friendships,
        blob_store: Arc::new(blob_store),
        clock: Arc::new(SystemClock),
    }));
    // 注册表在进程内只构建一次，由网关和引擎共享
    let engine = Arc::new(ChatProtocolEngine::new(
        chat_service.clone(),
        Arc::new(InMemoryRoomRegistry::new()),
    ));
    let jwt_service = Arc::new(JwtService::new(config.jwt.clone()));

    let state = AppState::new(
        chat_service,
        engine,
        jwt_service,
        GatewaySettings::from(&config),
    );

    let mut app = router(state);
    if let Some(path) = &config.storage.serve_path {
        app = app.nest_service(path, ServeDir::new(&blob_root));
        tracing::info!(path = %path, dir = %blob_root.display(), "serving stored voice notes");
    }
    let app = app
        .layer(cors_layer(config.server.cors_origin.as_deref())?)
        .layer(TraceLayer::new_for_http());

    let address = config.bind_address();
    let listener = tokio::net::TcpListener::bind(&address)
        .await
        .with_context(|| format!("failed to bind {address}"))?;

    tracing::info!(address = %address, "聊天服务器启动");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("聊天服务器已停止");
    Ok(())
}

async fn build_stores(
    config: &AppConfig,
) -> anyhow::Result<(Arc<dyn ChatStore>, Arc<dyn FriendshipDirectory>)> {
    match config.database.backend {
        StorageBackend::Postgres => {
            let infrastructure =
                Infrastructure::connect(InfrastructureConfig::from(&config.database))
                    .await
                    .context("failed to initialize database")?;
            let chat_store: Arc<dyn ChatStore> = infrastructure.chat_store;
            let friendships: Arc<dyn FriendshipDirectory> = infrastructure.friendships;
            Ok((chat_store, friendships))
        }
        StorageBackend::Memory => {
            tracing::warn!("using in-memory storage, data is lost on restart");
            let chat_store: Arc<dyn ChatStore> = Arc::new(InMemoryChatStore::new());
            let friendships: Arc<dyn FriendshipDirectory> =
                Arc::new(InMemoryFriendshipDirectory::new());
            Ok((chat_store, friendships))
        }
    }
}

fn cors_layer(origin: Option<&str>) -> anyhow::Result<CorsLayer> {
    let layer = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    Ok(match origin {
        Some(origin) => {
            let origin = HeaderValue::from_str(origin)
                .with_context(|| format!("invalid cors origin {origin}"))?;
            layer.allow_origin(origin)
        }
        None => layer.allow_origin(Any),
    })
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for shutdown signal");
    }
}
