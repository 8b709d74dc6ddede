// 上传数据源
//
// 引擎只引用数据源，不持有其生命周期之外的任何资源；
// 分片数据在真正发送时才读取

use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use std::io::{self, SeekFrom};
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::debug;

/// 可上传的文件
#[async_trait]
pub trait FileSource: Send + Sync {
    /// 文件名（请求中的 fileName 字段）
    fn name(&self) -> &str;

    /// 文件总大小
    fn size(&self) -> u64;

    /// 读取指定字节范围
    async fn read_range(&self, range: Range<u64>) -> io::Result<Bytes>;
}

/// 内存文件
#[derive(Debug, Clone)]
pub struct MemoryFile {
    name: String,
    data: Bytes,
}

impl MemoryFile {
    pub fn new(name: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            data: data.into(),
        }
    }
}

#[async_trait]
impl FileSource for MemoryFile {
    fn name(&self) -> &str {
        &self.name
    }

    fn size(&self) -> u64 {
        self.data.len() as u64
    }

    async fn read_range(&self, range: Range<u64>) -> io::Result<Bytes> {
        let end = usize::try_from(range.end).unwrap_or(usize::MAX);
        let start = usize::try_from(range.start).unwrap_or(usize::MAX);
        if start > end || end > self.data.len() {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("范围越界: {:?}, 文件大小={}", range, self.data.len()),
            ));
        }
        Ok(self.data.slice(start..end))
    }
}

/// 本地磁盘文件
#[derive(Debug, Clone)]
pub struct LocalFile {
    path: PathBuf,
    name: String,
    size: u64,
}

impl LocalFile {
    /// 打开本地文件并读取大小
    pub async fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let metadata = tokio::fs::metadata(&path).await?;
        if !metadata.is_file() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("不是文件: {:?}", path),
            ));
        }

        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        Ok(Self {
            path,
            name,
            size: metadata.len(),
        })
    }

    /// 使用自定义文件名
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl FileSource for LocalFile {
    fn name(&self) -> &str {
        &self.name
    }

    fn size(&self) -> u64 {
        self.size
    }

    async fn read_range(&self, range: Range<u64>) -> io::Result<Bytes> {
        let mut file = File::open(&self.path).await?;

        // 定位到分片起始位置
        file.seek(SeekFrom::Start(range.start)).await?;

        let size = (range.end - range.start) as usize;
        let mut buffer = vec![0u8; size];
        file.read_exact(&mut buffer).await?;

        debug!(
            "读取分片数据: {}, bytes={}..{}",
            self.name, range.start, range.end
        );

        Ok(Bytes::from(buffer))
    }
}

/// 文件切片（惰性引用，不持有数据）
#[derive(Clone)]
pub struct FileSlice {
    file: Arc<dyn FileSource>,
    range: Range<u64>,
}

impl FileSlice {
    pub fn new(file: Arc<dyn FileSource>, range: Range<u64>) -> Self {
        Self { file, range }
    }

    pub fn range(&self) -> &Range<u64> {
        &self.range
    }

    pub fn len(&self) -> u64 {
        self.range.end - self.range.start
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn file_name(&self) -> &str {
        self.file.name()
    }

    /// 读取切片数据
    pub async fn read(&self) -> io::Result<Bytes> {
        self.file.read_range(self.range.clone()).await
    }
}

impl fmt::Debug for FileSlice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileSlice")
            .field("file", &self.file.name())
            .field("range", &self.range)
            .finish()
    }
}
