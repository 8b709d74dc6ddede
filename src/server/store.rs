// 分片存储
//
// 目录结构：
//   <upload_dir>/<fileName>-part<chunk>.part   已接收的分片
//   <upload_dir>/<fileName>                    合并后的文件

use std::io;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

/// 合并失败原因
#[derive(Debug, thiserror::Error)]
pub enum MergeError {
    #[error("没有可合并的分片: {0}")]
    NoParts(String),

    #[error("缺少分片 #{0}")]
    MissingPart(usize),

    #[error("合并文件失败: {0}")]
    Io(#[from] io::Error),
}

/// 合并结果
#[derive(Debug, Clone, serde::Serialize)]
pub struct MergedFile {
    pub file_name: String,
    pub size: u64,
    pub chunks: usize,
}

/// 分片存储
#[derive(Debug)]
pub struct ChunkStore {
    dir: PathBuf,
}

impl ChunkStore {
    /// 打开存储目录（不存在则创建）
    pub async fn open(dir: impl Into<PathBuf>) -> io::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// 合并后文件的路径
    pub fn file_path(&self, file_name: &str) -> PathBuf {
        self.dir.join(file_name)
    }

    fn part_path(&self, file_name: &str, index: usize) -> PathBuf {
        self.dir.join(format!("{}-part{}.part", file_name, index))
    }

    /// 保存分片（先写临时文件再重命名，重复上传直接覆盖）
    pub async fn save_part(&self, file_name: &str, index: usize, data: &[u8]) -> io::Result<()> {
        let path = self.part_path(file_name, index);
        let tmp = path.with_extension("part.tmp");

        fs::write(&tmp, data).await?;
        fs::rename(&tmp, &path).await?;

        debug!(
            "保存分片: {} #{}, {} bytes -> {:?}",
            file_name,
            index,
            data.len(),
            path
        );
        Ok(())
    }

    /// 已接收的分片索引（升序）
    pub async fn list_parts(&self, file_name: &str) -> io::Result<Vec<usize>> {
        let prefix = format!("{}-part", file_name);
        let mut indices = Vec::new();

        let mut entries = fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            let index = name
                .strip_prefix(&prefix)
                .and_then(|rest| rest.strip_suffix(".part"))
                .and_then(|n| n.parse::<usize>().ok());
            if let Some(index) = index {
                indices.push(index);
            }
        }

        indices.sort_unstable();
        Ok(indices)
    }

    /// 按索引顺序合并分片并删除分片文件
    ///
    /// `expected` 为分片总数；为空时要求已有分片从 0 开始连续
    pub async fn merge(
        &self,
        file_name: &str,
        expected: Option<usize>,
    ) -> Result<MergedFile, MergeError> {
        let parts = self.list_parts(file_name).await?;
        if parts.is_empty() {
            return Err(MergeError::NoParts(file_name.to_string()));
        }

        let count = expected.unwrap_or(parts.len());
        if let Some(missing) = (0..count).find(|i| parts.binary_search(i).is_err()) {
            return Err(MergeError::MissingPart(missing));
        }

        let target = self.file_path(file_name);
        let mut output = fs::File::create(&target).await?;
        let mut size = 0u64;

        for index in 0..count {
            let data = fs::read(self.part_path(file_name, index)).await?;
            output.write_all(&data).await?;
            size += data.len() as u64;
        }
        output.flush().await?;

        for index in 0..count {
            fs::remove_file(self.part_path(file_name, index)).await?;
        }

        info!(
            "合并完成: {} ({} 个分片, {} bytes)",
            file_name, count, size
        );

        Ok(MergedFile {
            file_name: file_name.to_string(),
            size,
            chunks: count,
        })
    }
}

/// 只保留文件名的最后一段，拒绝空名与 `..`
pub fn sanitize_file_name(name: &str) -> Option<String> {
    let base = Path::new(name.trim()).file_name()?.to_str()?;
    if base.is_empty() || base == "." || base == ".." {
        return None;
    }
    Some(base.to_string())
}
