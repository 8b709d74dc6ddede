// Multi Uploader
// 可续传、并发分片的多文件 HTTP 上传引擎

// 配置管理模块
pub mod config;

// 错误类型
pub mod error;

// 上传事件模块
pub mod events;

// 日志模块
pub mod logging;

// 分片接收端（开发用）
pub mod server;

// 上传引擎模块
pub mod uploader;

// 导出常用类型
pub use config::{AppConfig, UploadMethod, UploadOptions};
pub use error::{TransferError, UploadError, UploadResult};
pub use events::{EventKind, ListenerId, UploadEvent};
pub use uploader::{
    FileId, FileInfo, FileSource, FileUploader, HttpTransport, LocalFile, MemoryFile,
    MultiUploader, ResponseBody, RetryOptions, UploadStatus,
};
