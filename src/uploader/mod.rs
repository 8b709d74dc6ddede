// 上传引擎模块
//
// - 分片规划与分片状态管理
// - 单文件上传引擎（并发窗口、立即重试、暂停/取消/继续）
// - 多文件管理器（事件转发、顺序上传）
// - 可替换的分片传输（默认 HTTP multipart）

pub mod chunk;
pub mod engine;
pub mod manager;
pub mod source;
pub mod task;
pub mod transport;

#[cfg(test)]
pub(crate) mod mock;

pub use chunk::{percentage, plan_chunks, Chunk, DEFAULT_CHUNK_SIZE};
pub use engine::FileUploader;
pub use manager::{MultiUploader, RetryOptions};
pub use source::{FileSlice, FileSource, LocalFile, MemoryFile};
pub use task::{ChunkSnapshot, FileId, FileInfo, UploadSnapshot, UploadStatus};
pub use transport::{
    ChunkRequest, ChunkResponse, ChunkTransport, HttpTransport, ProgressReporter, ResponseBody,
    FIELD_CHUNK, FIELD_CHUNKS, FIELD_FILE, FIELD_FILE_NAME,
};
