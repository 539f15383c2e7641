use std::sync::Arc;

use application::{ChatProtocolEngine, ChatService, SessionAuthenticator};
use config::AppConfig;

/// 网关相关的运行参数
#[derive(Debug, Clone)]
pub struct GatewaySettings {
    /// 握手时携带 token 的查询参数名
    pub token_query_param: String,
    pub max_upload_bytes: usize,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            token_query_param: "token".to_string(),
            max_upload_bytes: 10 * 1024 * 1024,
        }
    }
}

impl From<&AppConfig> for GatewaySettings {
    fn from(config: &AppConfig) -> Self {
        Self {
            token_query_param: config.realtime.token_query_param.clone(),
            max_upload_bytes: config.storage.max_upload_bytes,
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub chat_service: Arc<ChatService>,
    pub engine: Arc<ChatProtocolEngine>,
    pub authenticator: Arc<dyn SessionAuthenticator>,
    pub settings: Arc<GatewaySettings>,
}

impl AppState {
    pub fn new(
        chat_service: Arc<ChatService>,
        engine: Arc<ChatProtocolEngine>,
        authenticator: Arc<dyn SessionAuthenticator>,
        settings: GatewaySettings,
    ) -> Self {
        Self {
            chat_service,
            engine,
            authenticator,
            settings: Arc::new(settings),
        }
    }
}
