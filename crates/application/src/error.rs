use domain::{DomainError, RepositoryError};
use thiserror::Error;

use crate::blob::BlobError;

/// 应用层统一错误。
#[derive(Debug, Error)]
pub enum ApplicationError {
    #[error("domain error: {0}")]
    Domain(#[from] DomainError),
    #[error("repository error: {0}")]
    Repository(RepositoryError),
    #[error("blob storage error: {0}")]
    Blob(#[from] BlobError),
    #[error("authentication failed: {0}")]
    Authentication(String),
    #[error("transport error: {0}")]
    Transport(String),
}

/// 对外暴露的错误分类，决定 HTTP 状态码和事件里的提示。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Authentication,
    NotFound,
    Authorization,
    Validation,
    Store,
    Transport,
}

impl ApplicationError {
    pub fn authentication(reason: impl Into<String>) -> Self {
        Self::Authentication(reason.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            ApplicationError::Domain(err) => match err {
                DomainError::InvalidArgument { .. } | DomainError::SelfChat => {
                    ErrorKind::Validation
                }
                DomainError::ChatNotFound | DomainError::MessageNotFound => ErrorKind::NotFound,
                DomainError::NotChatParticipant
                | DomainError::NotMessageSender
                | DomainError::NotFriends => ErrorKind::Authorization,
            },
            ApplicationError::Repository(RepositoryError::NotFound) => ErrorKind::NotFound,
            ApplicationError::Repository(_) => ErrorKind::Store,
            ApplicationError::Blob(err) if err.is_client_error() => ErrorKind::Validation,
            ApplicationError::Blob(_) => ErrorKind::Store,
            ApplicationError::Authentication(_) => ErrorKind::Authentication,
            ApplicationError::Transport(_) => ErrorKind::Transport,
        }
    }

    /// 推送给客户端的简短说明。
    pub fn client_message(&self) -> String {
        match self {
            ApplicationError::Domain(DomainError::InvalidArgument { field, reason }) => {
                format!("{field}: {reason}")
            }
            ApplicationError::Domain(DomainError::SelfChat) => {
                "You cannot start a chat with yourself".to_string()
            }
            ApplicationError::Domain(DomainError::ChatNotFound) => "Chat not found".to_string(),
            ApplicationError::Domain(DomainError::MessageNotFound) => {
                "Message not found".to_string()
            }
            ApplicationError::Domain(DomainError::NotChatParticipant) => {
                "Unauthorized".to_string()
            }
            ApplicationError::Domain(DomainError::NotMessageSender) => {
                "Not authorized to delete this message".to_string()
            }
            ApplicationError::Domain(DomainError::NotFriends) => {
                "You can only chat with friends".to_string()
            }
            ApplicationError::Repository(RepositoryError::NotFound) => {
                "Resource not found".to_string()
            }
            ApplicationError::Repository(err) => format!("Storage failure: {err}"),
            ApplicationError::Blob(err) => err.to_string(),
            ApplicationError::Authentication(_) => "Authentication error".to_string(),
            ApplicationError::Transport(reason) => format!("Connection failure: {reason}"),
        }
    }
}

impl From<RepositoryError> for ApplicationError {
    fn from(value: RepositoryError) -> Self {
        ApplicationError::Repository(value)
    }
}
