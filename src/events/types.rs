//! 上传事件类型定义
//!
//! 事件名称是封闭的枚举，订阅不存在的事件在编译期即不可能发生

use crate::uploader::{Chunk, FileInfo, FileSlice, ResponseBody};
use std::collections::BTreeMap;
use std::fmt;

/// 附加表单字段（before-chunk-send 监听器可修改）
pub type FormFields = BTreeMap<String, String>;

/// 附加请求头（before-chunk-send 监听器可修改）
pub type RequestHeaders = BTreeMap<String, String>;

/// 事件名称
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EventKind {
    Init,
    BeforeChunkSend,
    Progress,
    Success,
    Failed,
    Complete,
    Paused,
    Canceled,
}

impl EventKind {
    /// 全部事件名称（用于事件代理）
    pub const ALL: [EventKind; 8] = [
        EventKind::Init,
        EventKind::BeforeChunkSend,
        EventKind::Progress,
        EventKind::Success,
        EventKind::Failed,
        EventKind::Complete,
        EventKind::Paused,
        EventKind::Canceled,
    ];

    pub fn name(self) -> &'static str {
        match self {
            EventKind::Init => "init",
            EventKind::BeforeChunkSend => "before-chunk-send",
            EventKind::Progress => "progress",
            EventKind::Success => "success",
            EventKind::Failed => "failed",
            EventKind::Complete => "complete",
            EventKind::Paused => "paused",
            EventKind::Canceled => "canceled",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// 上传事件
#[derive(Debug)]
pub enum UploadEvent<'a> {
    /// 文件初始化完成
    Init { file: &'a FileInfo },
    /// 分片即将发送，监听器对字段和请求头的修改会被采用
    BeforeChunkSend {
        file: &'a FileInfo,
        chunk: &'a Chunk,
        body: &'a FileSlice,
        fields: &'a mut FormFields,
        headers: &'a mut RequestHeaders,
    },
    /// 进度更新
    Progress {
        file: &'a FileInfo,
        /// 百分比（两位小数）
        percentage: f64,
        loaded: u64,
        total: u64,
    },
    /// 全部分片上传成功
    Success { file: &'a FileInfo },
    /// 分片重试耗尽，携带最后一次响应
    Failed {
        file: &'a FileInfo,
        response: &'a ResponseBody,
    },
    /// 终态（成功或失败）之后触发，暂停与取消不触发
    Complete { file: &'a FileInfo },
    Paused { file: &'a FileInfo },
    Canceled { file: &'a FileInfo },
}

impl UploadEvent<'_> {
    pub fn kind(&self) -> EventKind {
        match self {
            UploadEvent::Init { .. } => EventKind::Init,
            UploadEvent::BeforeChunkSend { .. } => EventKind::BeforeChunkSend,
            UploadEvent::Progress { .. } => EventKind::Progress,
            UploadEvent::Success { .. } => EventKind::Success,
            UploadEvent::Failed { .. } => EventKind::Failed,
            UploadEvent::Complete { .. } => EventKind::Complete,
            UploadEvent::Paused { .. } => EventKind::Paused,
            UploadEvent::Canceled { .. } => EventKind::Canceled,
        }
    }

    /// 事件所属文件
    pub fn file(&self) -> &FileInfo {
        match self {
            UploadEvent::Init { file }
            | UploadEvent::BeforeChunkSend { file, .. }
            | UploadEvent::Progress { file, .. }
            | UploadEvent::Success { file }
            | UploadEvent::Failed { file, .. }
            | UploadEvent::Complete { file }
            | UploadEvent::Paused { file }
            | UploadEvent::Canceled { file } => file,
        }
    }
}
