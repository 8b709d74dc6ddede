// 上传任务定义
//
// 引擎对外暴露的身份、状态以及只读快照

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Range;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_FILE_ID: AtomicU64 = AtomicU64::new(1);

/// 文件上传标识
///
/// 进程内单调递增，每次分配新文件时重新生成
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FileId(u64);

impl FileId {
    pub(crate) fn next() -> Self {
        Self(NEXT_FILE_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// 空标识（尚未分配文件）
    pub(crate) const fn none() -> Self {
        Self(0)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "file-{}", self.0)
    }
}

/// 上传状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UploadStatus {
    /// 尚未分配文件
    None,
    /// 已初始化，等待上传
    Init,
    /// 上传中
    Uploading,
    /// 已暂停
    Paused,
    /// 已取消
    Canceled,
    /// 上传成功
    Succeeded,
    /// 上传失败
    Failed,
}

impl UploadStatus {
    /// 是否可以开启新一轮上传
    pub fn can_start(self) -> bool {
        matches!(
            self,
            UploadStatus::Init | UploadStatus::Paused | UploadStatus::Failed | UploadStatus::Canceled
        )
    }

    /// 是否可以取消（SUCCEEDED / FAILED 为终态，取消无效）
    pub fn can_cancel(self) -> bool {
        matches!(
            self,
            UploadStatus::Init | UploadStatus::Uploading | UploadStatus::Paused
        )
    }
}

impl fmt::Display for UploadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            UploadStatus::None => "NONE",
            UploadStatus::Init => "INIT",
            UploadStatus::Uploading => "UPLOADING",
            UploadStatus::Paused => "PAUSED",
            UploadStatus::Canceled => "CANCELED",
            UploadStatus::Succeeded => "SUCCEEDED",
            UploadStatus::Failed => "FAILED",
        };
        f.write_str(name)
    }
}

/// 事件中携带的文件信息
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    pub id: FileId,
    pub name: String,
    pub size: u64,
    pub status: UploadStatus,
}

impl FileInfo {
    pub(crate) fn unassigned() -> Self {
        Self {
            id: FileId::none(),
            name: String::new(),
            size: 0,
            status: UploadStatus::None,
        }
    }
}

/// 单个分片快照
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChunkSnapshot {
    pub index: usize,
    pub range: Range<u64>,
    pub loaded: u64,
    pub retry_count: u32,
    pub in_flight: bool,
}

/// 引擎完整快照
#[derive(Debug, Clone, Serialize)]
pub struct UploadSnapshot {
    pub info: FileInfo,
    /// 调度游标
    pub cursor: usize,
    /// 已成功的分片索引（升序）
    pub succeeded: Vec<usize>,
    pub chunks: Vec<ChunkSnapshot>,
    pub loaded: u64,
    pub percentage: f64,
}

impl UploadSnapshot {
    /// 正在传输的分片数量
    pub fn in_flight(&self) -> usize {
        self.chunks.iter().filter(|c| c.in_flight).count()
    }

    pub fn status(&self) -> UploadStatus {
        self.info.status
    }
}
