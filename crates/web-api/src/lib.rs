//! Web API 层。
//!
//! 提供 Axum 路由：REST 请求委托给应用层的会话服务，
//! `/ws` 上的实时连接交给协议引擎处理。

mod auth;
mod error;
mod routes;
mod state;
mod ws_connection;

pub use auth::{bearer_token, Claims, CurrentUser, JwtService};
pub use config::JwtConfig;
pub use error::{ApiError, ErrorBody};
pub use routes::router;
pub use state::{AppState, GatewaySettings};
