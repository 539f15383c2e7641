//! 基础设施层实现。
//!
//! 提供 PostgreSQL 存储、好友关系查询和本地语音文件存储等适配器，
//! 实现应用层定义的接口。

pub mod blob;
pub mod builder;
pub mod migrations;
pub mod repository;

pub use blob::LocalBlobStore;
pub use builder::{Infrastructure, InfrastructureConfig, InfrastructureError};
pub use migrations::MIGRATOR;
pub use repository::{create_pg_pool, PgChatStore, PgFriendshipDirectory};
