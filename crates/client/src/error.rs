use thiserror::Error;
use tokio_tungstenite::tungstenite;

/// 客户端 SDK 的错误类型
#[derive(Debug, Error)]
pub enum ClientError {
    /// 握手被服务端以 401 拒绝，重连也不会成功
    #[error("authentication rejected by server")]
    Unauthorized,
    #[error("websocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),
    #[error("failed to encode event: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("client is closed")]
    Closed,
}

impl ClientError {
    /// 把握手错误归类：401 单独区分出来
    pub(crate) fn from_handshake(error: tungstenite::Error) -> Self {
        match &error {
            tungstenite::Error::Http(response) if response.status().as_u16() == 401 => {
                ClientError::Unauthorized
            }
            _ => ClientError::WebSocket(error),
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, ClientError::Unauthorized | ClientError::Closed)
    }
}
