mod chat_service;

pub use chat_service::{
    ChatService, ChatServiceDependencies, MessagePage, SendTextRequest, SendVoiceRequest,
    SentMessage, DEFAULT_PAGE_SIZE, MAX_PAGE_SIZE,
};
