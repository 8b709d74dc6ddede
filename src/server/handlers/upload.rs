// 分片接收API处理器

use crate::server::error::{ApiError, ApiResult};
use crate::server::handlers::ApiResponse;
use crate::server::store::{sanitize_file_name, MergedFile};
use crate::server::AppState;
use crate::uploader::{FIELD_CHUNK, FIELD_CHUNKS, FIELD_FILE, FIELD_FILE_NAME};
use axum::{
    extract::{Multipart, Query, State},
    http::HeaderMap,
    Json,
};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// 故障注入字段：值等于分片索引时返回错误码
pub const FIELD_RANDOM: &str = "random";
/// 注入的分片错误码
pub const CODE_CHUNK_ERROR: i32 = 10;

/// 解析后的分片表单
#[derive(Debug, Default)]
struct ChunkForm {
    file: Option<Bytes>,
    chunk: Option<usize>,
    chunks: Option<usize>,
    file_name: Option<String>,
    random: Option<String>,
}

async fn parse_chunk_form(mut multipart: Multipart) -> ApiResult<ChunkForm> {
    let mut form = ChunkForm::default();

    while let Some(field) = multipart.next_field().await? {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            FIELD_FILE => form.file = Some(field.bytes().await?),
            FIELD_CHUNK => form.chunk = Some(parse_index(FIELD_CHUNK, &field.text().await?)?),
            FIELD_CHUNKS => form.chunks = Some(parse_index(FIELD_CHUNKS, &field.text().await?)?),
            FIELD_FILE_NAME => form.file_name = Some(field.text().await?),
            FIELD_RANDOM => form.random = Some(field.text().await?),
            other => debug!("忽略未知字段: {}", other),
        }
    }

    Ok(form)
}

fn parse_index(field: &str, value: &str) -> ApiResult<usize> {
    value
        .trim()
        .parse()
        .map_err(|_| ApiError::BadRequest(format!("字段 {} 不是有效的数字: {}", field, value)))
}

/// 接收分片
///
/// POST /upload (multipart: file, chunk, chunks, fileName)
pub async fn upload_chunk(
    State(state): State<AppState>,
    headers: HeaderMap,
    multipart: Multipart,
) -> ApiResult<Json<ApiResponse<()>>> {
    // 先读完请求体，避免提前响应时客户端仍在发送
    let form = parse_chunk_form(multipart).await?;

    if let Some(required) = state.required_header.as_deref() {
        if !headers.contains_key(required) {
            return Err(ApiError::AccessDenied);
        }
    }

    let file = form
        .file
        .ok_or_else(|| ApiError::BadRequest("缺少字段 file".to_string()))?;
    let chunk = form
        .chunk
        .ok_or_else(|| ApiError::BadRequest("缺少字段 chunk".to_string()))?;
    let raw_name = form
        .file_name
        .ok_or_else(|| ApiError::BadRequest("缺少字段 fileName".to_string()))?;
    let file_name = sanitize_file_name(&raw_name)
        .ok_or_else(|| ApiError::BadRequest(format!("无效的文件名: {}", raw_name)))?;

    if let Some(chunks) = form.chunks {
        if chunk >= chunks {
            return Err(ApiError::BadRequest(format!(
                "分片索引越界: {} >= {}",
                chunk, chunks
            )));
        }
    }

    if form.random.as_deref().map(str::trim) == Some(chunk.to_string().as_str()) {
        warn!("注入分片错误: {} #{}", file_name, chunk);
        return Ok(Json(ApiResponse::error(CODE_CHUNK_ERROR, "Chunk is error")));
    }

    state.store.save_part(&file_name, chunk, &file).await?;

    debug!(
        "接收分片: {} #{}/{}, {} bytes",
        file_name,
        chunk,
        form.chunks.map_or_else(|| "?".to_string(), |n| n.to_string()),
        file.len()
    );

    Ok(Json(ApiResponse::ok()))
}

/// 合并请求
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeRequest {
    pub file_name: Option<String>,
    /// 分片总数（为空时要求已有分片连续）
    pub chunks: Option<usize>,
}

/// 合并分片
///
/// POST /upload/merge （JSON 或查询参数: fileName, chunks）
pub async fn merge_chunks(
    State(state): State<AppState>,
    Query(query): Query<MergeRequest>,
    body: Option<Json<MergeRequest>>,
) -> ApiResult<Json<ApiResponse<MergedFile>>> {
    let body = body.map(|Json(b)| b).unwrap_or_default();
    let raw_name = body
        .file_name
        .or(query.file_name)
        .ok_or_else(|| ApiError::BadRequest("缺少字段 fileName".to_string()))?;
    let file_name = sanitize_file_name(&raw_name)
        .ok_or_else(|| ApiError::BadRequest(format!("无效的文件名: {}", raw_name)))?;

    info!("API: 合并分片 {}", file_name);
    let merged = state.store.merge(&file_name, body.chunks.or(query.chunks)).await?;
    Ok(Json(ApiResponse::success(merged)))
}

/// 已接收分片查询参数
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartsQuery {
    pub file_name: String,
}

/// 已接收分片
#[derive(Debug, Serialize)]
pub struct PartsInfo {
    pub file_name: String,
    pub parts: Vec<usize>,
}

/// 查询已接收的分片（用于断点续传时预置成功分片）
///
/// GET /upload/parts?fileName=xxx
pub async fn list_parts(
    State(state): State<AppState>,
    Query(query): Query<PartsQuery>,
) -> ApiResult<Json<ApiResponse<PartsInfo>>> {
    let file_name = sanitize_file_name(&query.file_name)
        .ok_or_else(|| ApiError::BadRequest(format!("无效的文件名: {}", query.file_name)))?;
    let parts = state.store.list_parts(&file_name).await?;

    Ok(Json(ApiResponse::success(PartsInfo { file_name, parts })))
}

/// 健康检查
///
/// GET /health
pub async fn health() -> Json<ApiResponse<&'static str>> {
    Json(ApiResponse::success("ok"))
}
