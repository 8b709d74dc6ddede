// 分片传输
//
// 引擎与网络之间的接缝：
// - ChunkTransport: 发送单个分片并返回原始响应
// - HttpTransport: 基于 reqwest multipart 的默认实现，按块流式发送并回报进度

use crate::config::UploadMethod;
use crate::error::TransferError;
use crate::events::{FormFields, RequestHeaders};
use crate::uploader::FileSlice;
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::multipart;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// 分片数据字段
pub const FIELD_FILE: &str = "file";
/// 分片总数字段
pub const FIELD_CHUNKS: &str = "chunks";
/// 分片索引字段
pub const FIELD_CHUNK: &str = "chunk";
/// 文件名字段
pub const FIELD_FILE_NAME: &str = "fileName";

/// 流式发送时每块的大小: 64KB
const UPLOAD_PIECE_SIZE: usize = 64 * 1024;

/// 响应体
///
/// 能解析为 JSON 时为 `Parsed`，否则原样保留文本
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseBody {
    Parsed(serde_json::Value),
    Raw(String),
}

impl ResponseBody {
    /// 解析响应文本，解析失败不是错误
    pub fn parse(text: &str) -> Self {
        match serde_json::from_str(text) {
            Ok(value) => ResponseBody::Parsed(value),
            Err(_) => ResponseBody::Raw(text.to_string()),
        }
    }

    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            ResponseBody::Parsed(value) => Some(value),
            ResponseBody::Raw(_) => None,
        }
    }

    pub fn as_raw(&self) -> Option<&str> {
        match self {
            ResponseBody::Parsed(_) => None,
            ResponseBody::Raw(text) => Some(text),
        }
    }
}

impl fmt::Display for ResponseBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResponseBody::Parsed(value) => write!(f, "{}", value),
            ResponseBody::Raw(text) => f.write_str(text),
        }
    }
}

/// 单个分片的请求
#[derive(Debug, Clone)]
pub struct ChunkRequest {
    pub method: UploadMethod,
    pub endpoint: String,
    pub index: usize,
    pub total_chunks: usize,
    pub file_name: String,
    /// 分片数据
    pub body: FileSlice,
    /// 文本字段（包含 chunks / chunk / fileName 以及监听器注入的字段）
    pub fields: FormFields,
    pub headers: RequestHeaders,
}

/// 分片响应（未解析）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkResponse {
    pub status: u16,
    pub body: String,
}

/// 进度回报
///
/// 每次回报的是本次尝试累计已发送的字节数
#[derive(Clone)]
pub struct ProgressReporter(Arc<dyn Fn(u64) + Send + Sync>);

impl ProgressReporter {
    pub fn new<F>(report: F) -> Self
    where
        F: Fn(u64) + Send + Sync + 'static,
    {
        Self(Arc::new(report))
    }

    pub fn noop() -> Self {
        Self::new(|_| {})
    }

    pub fn report(&self, loaded: u64) {
        (self.0)(loaded)
    }
}

impl fmt::Debug for ProgressReporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ProgressReporter(..)")
    }
}

/// 分片传输
#[async_trait]
pub trait ChunkTransport: Send + Sync {
    /// 发送一个分片，收到完整响应后返回
    ///
    /// 返回的 future 可能在任意时刻被丢弃（暂停、取消或超时）
    async fn send(
        &self,
        request: ChunkRequest,
        progress: ProgressReporter,
    ) -> Result<ChunkResponse, TransferError>;
}

/// HTTP 分片传输
#[derive(Debug, Clone, Default)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new() -> Result<Self, TransferError> {
        let client = reqwest::Client::builder().build()?;
        Ok(Self { client })
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ChunkTransport for HttpTransport {
    async fn send(
        &self,
        request: ChunkRequest,
        progress: ProgressReporter,
    ) -> Result<ChunkResponse, TransferError> {
        let headers = build_headers(&request.headers)?;
        let data = request.body.read().await?;
        let total = data.len() as u64;

        debug!(
            "上传分片: file={}, part={}/{}, size={}, endpoint={}",
            request.file_name, request.index, request.total_chunks, total, request.endpoint
        );

        let mut sent = 0u64;
        let stream = futures::stream::iter(split_pieces(data, UPLOAD_PIECE_SIZE).into_iter().map(
            move |piece| {
                sent += piece.len() as u64;
                progress.report(sent);
                Ok::<Bytes, std::io::Error>(piece)
            },
        ));

        let part = multipart::Part::stream_with_length(reqwest::Body::wrap_stream(stream), total)
            .file_name(request.file_name.clone())
            .mime_str("application/octet-stream")?;

        // 文本字段在前，便于接收端流式解析
        let mut form = multipart::Form::new();
        for (name, value) in &request.fields {
            form = form.text(name.clone(), value.clone());
        }
        let form = form.part(FIELD_FILE, part);

        let response = self
            .client
            .request(request.method.as_reqwest(), &request.endpoint)
            .headers(headers)
            .multipart(form)
            .send()
            .await?;

        let status = response.status().as_u16();
        let body = response.text().await?;

        debug!(
            "上传分片响应: file={}, part={}, status={}, body={}",
            request.file_name, request.index, status, body
        );

        Ok(ChunkResponse { status, body })
    }
}

/// 转换附加请求头
fn build_headers(headers: &RequestHeaders) -> Result<HeaderMap, TransferError> {
    let mut map = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        let header_name =
            HeaderName::from_bytes(name.as_bytes()).map_err(|e| TransferError::InvalidHeader {
                name: name.clone(),
                reason: e.to_string(),
            })?;
        let header_value = HeaderValue::from_str(value).map_err(|e| TransferError::InvalidHeader {
            name: name.clone(),
            reason: e.to_string(),
        })?;
        map.insert(header_name, header_value);
    }
    Ok(map)
}

/// 按固定大小拆分数据（零拷贝）
fn split_pieces(data: Bytes, piece_size: usize) -> Vec<Bytes> {
    let mut pieces = Vec::with_capacity(data.len().div_ceil(piece_size.max(1)));
    let mut offset = 0;
    while offset < data.len() {
        let end = (offset + piece_size).min(data.len());
        pieces.push(data.slice(offset..end));
        offset = end;
    }
    pieces
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_json_body() {
        let body = ResponseBody::parse(r#"{"code":0,"message":"success"}"#);
        assert_eq!(body, ResponseBody::Parsed(json!({"code": 0, "message": "success"})));
        assert_eq!(body.as_json().unwrap()["code"], 0);
        assert!(body.as_raw().is_none());
    }

    #[test]
    fn test_parse_falls_back_to_raw() {
        let body = ResponseBody::parse("upload failed");
        assert_eq!(body, ResponseBody::Raw("upload failed".to_string()));
        assert_eq!(body.to_string(), "upload failed");

        assert_eq!(ResponseBody::parse(""), ResponseBody::Raw(String::new()));
    }

    #[test]
    fn test_split_pieces() {
        let data = Bytes::from(vec![1u8; 150]);
        let pieces = split_pieces(data, 64);
        let sizes: Vec<usize> = pieces.iter().map(Bytes::len).collect();
        assert_eq!(sizes, vec![64, 64, 22]);

        assert!(split_pieces(Bytes::new(), 64).is_empty());
    }

    #[test]
    fn test_build_headers() {
        let mut headers = RequestHeaders::new();
        headers.insert("token".to_string(), "abc".to_string());
        let map = build_headers(&headers).unwrap();
        assert_eq!(map.get("token").unwrap(), "abc");

        headers.insert("bad header".to_string(), "x".to_string());
        assert!(matches!(
            build_headers(&headers),
            Err(TransferError::InvalidHeader { .. })
        ));
    }

    #[test]
    fn test_progress_reporter() {
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        let reporter = ProgressReporter::new(move |loaded| seen_clone.lock().push(loaded));
        reporter.report(10);
        reporter.report(20);
        ProgressReporter::noop().report(30);
        assert_eq!(*seen.lock(), vec![10, 20]);
    }
}
