//! 错误类型定义
//!
//! 分片校验失败、暂停/取消引起的中止、响应体解析失败都不是错误值：
//! 它们分别表现为 `failed` 事件、被静默丢弃的尝试、以及 `ResponseBody::Raw`

use crate::uploader::FileId;

/// 上传控制错误（同步返回给调用方，不会重试）
#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    /// 未配置上传地址
    #[error("未配置上传地址 (server)，请先更新配置")]
    MissingEndpoint,

    /// 指定的文件不存在
    #[error("文件不存在: {0}")]
    FileNotFound(FileId),

    /// 上传引擎已停止
    #[error("上传引擎已停止")]
    EngineStopped,

    #[error("I/O 错误: {0}")]
    Io(#[from] std::io::Error),
}

/// 单次分片传输错误
///
/// 所有变体都按一次失败的尝试处理，进入常规重试流程
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("请求超时 ({0} ms)")]
    Timeout(u64),

    #[error("请求失败: {0}")]
    Request(#[from] reqwest::Error),

    #[error("无效的请求头 {name}: {reason}")]
    InvalidHeader { name: String, reason: String },

    #[error("读取分片数据失败: {0}")]
    Io(#[from] std::io::Error),
}

pub type UploadResult<T> = std::result::Result<T, UploadError>;
