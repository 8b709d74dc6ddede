// 上传分片管理
//
// 分片规则：
// - 按固定分片大小从 0 开始切分，区间左闭右开
// - 除最后一个分片外，每个分片长度都等于分片大小
// - 空文件不产生分片
//
// 分片管理器只记录状态，不发起任何网络请求；
// 所有修改都发生在所属引擎的事件循环内

use crate::config::UploadOptions;
use std::collections::BTreeSet;
use std::ops::Range;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// 默认分片大小: 5MB
pub const DEFAULT_CHUNK_SIZE: u64 = 5 * 1024 * 1024;

/// 分片（不可变的规划结果）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// 分片索引
    pub index: usize,
    /// 字节范围
    pub range: Range<u64>,
}

impl Chunk {
    pub fn new(index: usize, range: Range<u64>) -> Self {
        Self { index, range }
    }

    /// 分片大小
    pub fn size(&self) -> u64 {
        self.range.end - self.range.start
    }
}

/// 计算分片规划
///
/// # 参数
/// * `total_size` - 文件总大小
/// * `chunk_size` - 分片大小（为 0 时按 1 处理）
///
/// # 返回
/// 按索引排列的分片列表，区间恰好覆盖 `[0, total_size)`
pub fn plan_chunks(total_size: u64, chunk_size: u64) -> Vec<Chunk> {
    let chunk_size = chunk_size.max(1);
    let mut chunks = Vec::with_capacity(total_size.div_ceil(chunk_size) as usize);
    let mut offset = 0u64;
    let mut index = 0;

    while offset < total_size {
        let end = offset.saturating_add(chunk_size).min(total_size);
        chunks.push(Chunk::new(index, offset..end));
        offset = end;
        index += 1;
    }

    chunks
}

/// 进行中的传输句柄
///
/// 由所属分片独占；完成、失败或中止时释放，释放后不再读取
#[derive(Debug)]
pub(crate) struct TransferHandle {
    /// 尝试编号（引擎内唯一，用于识别过期通知）
    pub attempt: u64,
    /// 发送时的配置快照
    pub options: Arc<UploadOptions>,
    cancel: CancellationToken,
}

impl TransferHandle {
    pub fn new(attempt: u64, options: Arc<UploadOptions>, cancel: CancellationToken) -> Self {
        Self {
            attempt,
            options,
            cancel,
        }
    }

    /// 中止传输
    pub fn abort(self) {
        self.cancel.cancel();
    }
}

/// 分片传输状态
#[derive(Debug)]
pub(crate) struct ChunkState {
    pub chunk: Chunk,
    /// 本轮已传输字节数
    pub loaded: u64,
    /// 本轮尝试次数
    pub retry_count: u32,
    pub transfer: Option<TransferHandle>,
}

impl ChunkState {
    fn new(chunk: Chunk) -> Self {
        Self {
            chunk,
            loaded: 0,
            retry_count: 0,
            transfer: None,
        }
    }

    pub fn is_in_flight(&self) -> bool {
        self.transfer.is_some()
    }

    /// 判断通知是否属于当前活跃的传输
    pub fn is_current(&self, attempt: u64) -> bool {
        self.transfer.as_ref().map(|t| t.attempt) == Some(attempt)
    }

    /// 记录进度，同一轮内只增不减
    pub fn record_loaded(&mut self, loaded: u64) -> bool {
        let loaded = loaded.min(self.chunk.size());
        if loaded > self.loaded {
            self.loaded = loaded;
            true
        } else {
            false
        }
    }
}

/// 上传分片管理器
///
/// 持有分片列表、成功集合以及调度游标
#[derive(Debug)]
pub(crate) struct UploadChunkManager {
    chunks: Vec<ChunkState>,
    succeeded: BTreeSet<usize>,
    /// 下一个待考虑的分片索引
    cursor: usize,
    total_size: u64,
}

impl UploadChunkManager {
    pub fn new(total_size: u64, chunk_size: u64) -> Self {
        let chunks: Vec<ChunkState> = plan_chunks(total_size, chunk_size)
            .into_iter()
            .map(ChunkState::new)
            .collect();

        debug!(
            "创建分片管理器: 文件大小={} bytes, 分片大小={} bytes, 分片数量={}",
            total_size,
            chunk_size,
            chunks.len()
        );

        Self {
            chunks,
            succeeded: BTreeSet::new(),
            cursor: 0,
            total_size,
        }
    }

    pub fn empty() -> Self {
        Self::new(0, DEFAULT_CHUNK_SIZE)
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn chunks(&self) -> &[ChunkState] {
        &self.chunks
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut ChunkState> {
        self.chunks.get_mut(index)
    }

    pub fn succeeded(&self) -> &BTreeSet<usize> {
        &self.succeeded
    }

    /// 是否全部完成
    pub fn is_completed(&self) -> bool {
        self.succeeded.len() == self.chunks.len()
    }

    /// 正在传输的分片数量
    pub fn in_flight_count(&self) -> usize {
        self.chunks.iter().filter(|c| c.is_in_flight()).count()
    }

    /// 取出下一个需要发送的分片
    ///
    /// 跳过模式下，已成功的分片直接略过且不占用并发名额。
    /// 迭代实现，连续跳过大量分片也不会加深调用栈
    pub fn next_to_dispatch(&mut self, skip_success: bool) -> Option<usize> {
        while self.cursor < self.chunks.len() {
            let index = self.cursor;
            self.cursor += 1;

            if skip_success && self.succeeded.contains(&index) {
                debug!("跳过已成功分片 #{}", index);
                continue;
            }

            return Some(index);
        }

        None
    }

    /// 标记分片成功，返回进度是否因此变化
    pub fn mark_succeeded(&mut self, index: usize) -> bool {
        let Some(state) = self.chunks.get_mut(index) else {
            return false;
        };
        let size = state.chunk.size();
        let changed = state.record_loaded(size);
        self.succeeded.insert(index);
        changed
    }

    /// 预置成功分片（忽略越界索引）
    pub fn seed_succeeded(&mut self, indices: impl IntoIterator<Item = usize>) {
        for index in indices {
            if index < self.chunks.len() {
                self.mark_succeeded(index);
            }
        }
    }

    pub fn reset_cursor(&mut self) {
        self.cursor = 0;
    }

    /// 清空成功集合，同时清零所有进度
    pub fn clear_succeeded(&mut self) {
        self.succeeded.clear();
        for state in &mut self.chunks {
            state.loaded = 0;
        }
    }

    /// 开启新一轮上传前重置未成功分片的进度与重试计数
    pub fn prepare_run(&mut self) {
        self.cursor = 0;
        for state in &mut self.chunks {
            if !self.succeeded.contains(&state.chunk.index) {
                state.loaded = 0;
                state.retry_count = 0;
            }
        }
    }

    /// 中止所有进行中的传输，返回被中止的分片索引
    pub fn abort_all(&mut self) -> Vec<usize> {
        let mut aborted = Vec::new();
        for state in &mut self.chunks {
            if let Some(handle) = state.transfer.take() {
                handle.abort();
                aborted.push(state.chunk.index);
            }
        }
        aborted
    }

    /// 已传输字节数（所有分片之和）
    pub fn loaded(&self) -> u64 {
        self.chunks.iter().map(|c| c.loaded).sum()
    }

    /// 上传百分比，保留两位小数
    pub fn percentage(&self) -> f64 {
        percentage(self.loaded(), self.total_size)
    }
}

/// 计算百分比: round(loaded / total * 10000) / 100
pub fn percentage(loaded: u64, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    (loaded as f64 / total as f64 * 10000.0).round() / 100.0
}
