// Web服务器模块
//
// 开发用的分片接收端：保存分片、合并文件、查询已接收分片

pub mod error;
pub mod handlers;
pub mod state;
pub mod store;

pub use error::{ApiError, ApiResult};
pub use state::AppState;
pub use store::{ChunkStore, MergeError, MergedFile};

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};

/// 单个请求体的上限: 256MB（分片大小可配置，默认限制 2MB 不够用）
const MAX_BODY_BYTES: usize = 256 * 1024 * 1024;

/// 构建路由
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route(
            "/upload",
            post(handlers::upload_chunk).put(handlers::upload_chunk),
        )
        .route("/upload/merge", post(handlers::merge_chunks))
        .route("/upload/parts", get(handlers::list_parts))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .with_state(state)
}
