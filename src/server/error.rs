// 接收端 API 错误

use crate::server::handlers::ApiResponse;
use crate::server::store::MergeError;
use axum::{
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use tracing::{error, warn};

/// 合并失败的业务码（与分片失败区分）
pub const CODE_MERGE_FAILED: i32 = 2001;
/// 请求参数错误
pub const CODE_BAD_REQUEST: i32 = 400;
/// 存储错误
pub const CODE_STORAGE: i32 = 500;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// 缺少必需的请求头
    #[error("Access Denied")]
    AccessDenied,

    #[error("请求参数错误: {0}")]
    BadRequest(String),

    #[error(transparent)]
    Merge(#[from] MergeError),

    #[error("存储错误: {0}")]
    Storage(#[from] std::io::Error),
}

impl From<axum::extract::multipart::MultipartError> for ApiError {
    fn from(e: axum::extract::multipart::MultipartError) -> Self {
        ApiError::BadRequest(e.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            // 与 multipart 接收端约定：拒绝访问时返回纯文本
            ApiError::AccessDenied => {
                warn!("拒绝访问: 缺少必需的请求头");
                (
                    StatusCode::UNAUTHORIZED,
                    [(header::CONTENT_TYPE, "text/plain")],
                    "Access Denied",
                )
                    .into_response()
            }
            ApiError::BadRequest(message) => {
                warn!("请求参数错误: {}", message);
                (
                    StatusCode::BAD_REQUEST,
                    Json(ApiResponse::<()>::error(CODE_BAD_REQUEST, message)),
                )
                    .into_response()
            }
            ApiError::Merge(e) => {
                error!("合并分片失败: {}", e);
                (
                    StatusCode::BAD_REQUEST,
                    Json(ApiResponse::<()>::error(CODE_MERGE_FAILED, e.to_string())),
                )
                    .into_response()
            }
            ApiError::Storage(e) => {
                error!("存储错误: {}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(ApiResponse::<()>::error(CODE_STORAGE, e.to_string())),
                )
                    .into_response()
            }
        }
    }
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;
