use async_trait::async_trait;
use domain::{UserEmail, UserId};
use serde::{Deserialize, Serialize};

use crate::error::ApplicationError;

/// 凭证校验通过后绑定到连接或请求上的身份。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthenticatedUser {
    pub user_id: UserId,
    pub email: UserEmail,
}

/// 校验不透明的 bearer 凭证。
#[async_trait]
pub trait SessionAuthenticator: Send + Sync {
    async fn verify(&self, token: &str) -> Result<AuthenticatedUser, ApplicationError>;
}
