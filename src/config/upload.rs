// 上传配置
//
// 配置是不可变的值：更新时构造新值并整体替换，
// 进行中的传输继续使用发送时的快照

use crate::uploader::{ResponseBody, DEFAULT_CHUNK_SIZE};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// 请求方法
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum UploadMethod {
    #[default]
    Post,
    Put,
    Get,
}

impl UploadMethod {
    pub fn as_reqwest(self) -> reqwest::Method {
        match self {
            UploadMethod::Post => reqwest::Method::POST,
            UploadMethod::Put => reqwest::Method::PUT,
            UploadMethod::Get => reqwest::Method::GET,
        }
    }
}

impl fmt::Display for UploadMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            UploadMethod::Post => "POST",
            UploadMethod::Put => "PUT",
            UploadMethod::Get => "GET",
        };
        f.write_str(name)
    }
}

type ValidatorFn = dyn Fn(u16, &ResponseBody) -> bool + Send + Sync;

/// 响应校验函数
///
/// 根据状态码和（解析后或原始的）响应体判断分片是否上传成功，
/// 默认只要求状态码为 200
#[derive(Clone)]
pub struct ResponseValidator(Arc<ValidatorFn>);

impl ResponseValidator {
    pub fn new<F>(check: F) -> Self
    where
        F: Fn(u16, &ResponseBody) -> bool + Send + Sync + 'static,
    {
        Self(Arc::new(check))
    }

    pub fn check(&self, status: u16, body: &ResponseBody) -> bool {
        (self.0)(status, body)
    }
}

impl Default for ResponseValidator {
    fn default() -> Self {
        Self::new(|status, _| status == 200)
    }
}

impl fmt::Debug for ResponseValidator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ResponseValidator(..)")
    }
}

/// 上传配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadOptions {
    /// 分片大小（字节，默认 5MB）
    #[serde(default = "default_chunk_size")]
    pub chunk_size: u64,
    /// 单个分片的最大尝试次数（默认 3）
    #[serde(default = "default_chunk_retry")]
    pub chunk_retry: u32,
    /// 单文件并发分片数（默认 1）
    #[serde(default = "default_threads")]
    pub threads: usize,
    /// 请求方法
    #[serde(default)]
    pub method: UploadMethod,
    /// 上传地址
    #[serde(default)]
    pub server: Option<String>,
    /// 单次传输超时（毫秒，默认 10000）
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// 响应校验函数（不参与序列化）
    #[serde(skip)]
    pub validator: ResponseValidator,
}

fn default_chunk_size() -> u64 {
    DEFAULT_CHUNK_SIZE
}

fn default_chunk_retry() -> u32 {
    3
}

fn default_threads() -> usize {
    1
}

fn default_timeout_ms() -> u64 {
    10_000
}

impl Default for UploadOptions {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            chunk_retry: default_chunk_retry(),
            threads: default_threads(),
            method: UploadMethod::default(),
            server: None,
            timeout_ms: default_timeout_ms(),
            validator: ResponseValidator::default(),
        }
    }
}

impl UploadOptions {
    /// 以上传地址创建默认配置
    pub fn for_server(server: impl Into<String>) -> Self {
        Self::default().with_server(server)
    }

    pub fn with_server(mut self, server: impl Into<String>) -> Self {
        self.server = Some(server.into());
        self
    }

    pub fn with_chunk_size(mut self, chunk_size: u64) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    pub fn with_chunk_retry(mut self, chunk_retry: u32) -> Self {
        self.chunk_retry = chunk_retry;
        self
    }

    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = threads;
        self
    }

    pub fn with_method(mut self, method: UploadMethod) -> Self {
        self.method = method;
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn with_validator<F>(mut self, check: F) -> Self
    where
        F: Fn(u16, &ResponseBody) -> bool + Send + Sync + 'static,
    {
        self.validator = ResponseValidator::new(check);
        self
    }

    /// 非空的上传地址
    pub fn endpoint(&self) -> Option<&str> {
        self.server.as_deref().filter(|s| !s.trim().is_empty())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}
