//! JWT 认证模块
//!
//! 签发和校验 bearer token，并为 REST 处理函数提供当前用户提取器。

use application::{ApplicationError, AuthenticatedUser, SessionAuthenticator};
use async_trait::async_trait;
use axum::{
    extract::FromRequestParts,
    http::{header::AUTHORIZATION, request::Parts, HeaderMap},
};
use config::JwtConfig;
use domain::{UserEmail, UserId};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{error::ApiError, state::AppState};

/// JWT Claims 结构
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub id: Uuid,
    pub email: String,
    pub exp: i64, // 过期时间 (Unix timestamp)
}

/// JWT Token 服务
#[derive(Clone)]
pub struct JwtService {
    config: JwtConfig,
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
}

impl JwtService {
    pub fn new(config: JwtConfig) -> Self {
        let encoding_key = EncodingKey::from_secret(config.secret.as_ref());
        let decoding_key = DecodingKey::from_secret(config.secret.as_ref());

        Self {
            config,
            encoding_key,
            decoding_key,
        }
    }

    /// 生成 JWT token
    pub fn generate_token(&self, user_id: UserId, email: &UserEmail) -> Result<String, ApiError> {
        let now = chrono::Utc::now();
        let exp = now + chrono::Duration::hours(self.config.expiration_hours);

        let claims = Claims {
            id: user_id.into(),
            email: email.as_str().to_owned(),
            exp: exp.timestamp(),
        };

        encode(&Header::default(), &claims, &self.encoding_key).map_err(|err| {
            ApiError::internal_server_error(format!("Token generation failed: {}", err))
        })
    }

    /// 验证并解析 JWT token
    pub fn verify_token(&self, token: &str) -> Result<Claims, ApplicationError> {
        decode::<Claims>(token, &self.decoding_key, &Validation::default())
            .map(|token_data| token_data.claims)
            .map_err(|err| ApplicationError::authentication(format!("invalid token: {err}")))
    }
}

#[async_trait]
impl SessionAuthenticator for JwtService {
    async fn verify(&self, token: &str) -> Result<AuthenticatedUser, ApplicationError> {
        let claims = self.verify_token(token)?;
        let email = UserEmail::parse(claims.email)
            .map_err(|err| ApplicationError::authentication(err.to_string()))?;
        Ok(AuthenticatedUser {
            user_id: UserId::from(claims.id),
            email,
        })
    }
}

/// 从 `Authorization: Bearer <token>` 中取出 token
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)
        .and_then(|header| header.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

/// 已认证的调用者
#[derive(Debug, Clone)]
pub struct CurrentUser(pub AuthenticatedUser);

impl FromRequestParts<AppState> for CurrentUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let token = bearer_token(&parts.headers)
            .ok_or_else(|| ApiError::unauthorized("Authentication error"))?;
        let user = state.authenticator.verify(token).await?;
        Ok(CurrentUser(user))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn service(secret: &str) -> JwtService {
        JwtService::new(JwtConfig {
            secret: secret.to_string(),
            expiration_hours: 1,
        })
    }

    #[tokio::test]
    async fn issued_token_verifies_to_same_identity() {
        let jwt = service("a-secret-that-is-long-enough-for-tests!!");
        let user_id = UserId::generate();
        let email = UserEmail::parse("alice@example.com").unwrap();
        let token = jwt.generate_token(user_id, &email).unwrap();

        let user = jwt.verify(&token).await.unwrap();
        assert_eq!(user.user_id, user_id);
        assert_eq!(user.email, email);
    }

    #[tokio::test]
    async fn foreign_or_garbage_tokens_are_rejected() {
        let issuer = service("a-secret-that-is-long-enough-for-tests!!");
        let verifier = service("another-secret-that-is-long-enough-too!!");
        let token = issuer
            .generate_token(
                UserId::generate(),
                &UserEmail::parse("bob@example.com").unwrap(),
            )
            .unwrap();

        let err = verifier.verify(&token).await.unwrap_err();
        assert_eq!(err.client_message(), "Authentication error");
        assert!(verifier.verify("not-a-jwt").await.is_err());
    }

    #[tokio::test]
    async fn expired_token_is_rejected() {
        let jwt = JwtService::new(JwtConfig {
            secret: "a-secret-that-is-long-enough-for-tests!!".to_string(),
            expiration_hours: -2,
        });
        let token = jwt
            .generate_token(
                UserId::generate(),
                &UserEmail::parse("carol@example.com").unwrap(),
            )
            .unwrap();
        assert!(jwt.verify(&token).await.is_err());
    }

    #[test]
    fn bearer_prefix_is_required() {
        let mut headers = HeaderMap::new();
        assert!(bearer_token(&headers).is_none());
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Token abc"));
        assert!(bearer_token(&headers).is_none());
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer abc"));
        assert_eq!(bearer_token(&headers), Some("abc"));
    }
}
