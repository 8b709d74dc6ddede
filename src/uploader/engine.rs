// 上传引擎
//
// 核心功能：
// 1. 按并发窗口调度分片上传
// 2. 分片校验失败时立即重试，超过次数后整个文件失败
// 3. 支持暂停、取消、继续（跳过已成功分片）与完整重试
// 4. 聚合分片进度并发布事件
//
// 并发模型：
// - 每个文件一个引擎任务，独占分片列表、成功集合与调度游标
// - 外部通过 FileUploader 句柄发送命令，传输任务通过通道回报进度和结果
// - 所有状态修改在引擎任务内顺序执行，监听器同步调用
// - 每次发送分配唯一的尝试编号，已中止传输的迟到通知按编号丢弃

use crate::config::UploadOptions;
use crate::error::{TransferError, UploadError, UploadResult};
use crate::events::{
    EventChannel, EventKind, FormFields, ListenerId, RequestHeaders, UploadEvent,
};
use crate::uploader::chunk::{TransferHandle, UploadChunkManager};
use crate::uploader::{
    percentage, ChunkRequest, ChunkResponse, ChunkSnapshot, ChunkTransport, FileId, FileInfo,
    FileSlice, FileSource, ProgressReporter, ResponseBody, UploadSnapshot, UploadStatus,
    FIELD_CHUNK, FIELD_CHUNKS, FIELD_FILE_NAME,
};
use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// 引擎命令
enum Command {
    SetFile {
        file: Arc<dyn FileSource>,
        id: FileId,
    },
    Start {
        skip_success: bool,
        reset_success: bool,
    },
    Pause,
    Cancel,
    SkipChunks(Vec<usize>),
    Snapshot(oneshot::Sender<UploadSnapshot>),
}

/// 传输任务回报
enum TransferNotice {
    Progress {
        index: usize,
        attempt: u64,
        loaded: u64,
    },
    Finished {
        index: usize,
        attempt: u64,
        result: Result<ChunkResponse, TransferError>,
    },
}

/// 句柄与引擎任务共享的状态
struct Shared {
    options: RwLock<Arc<UploadOptions>>,
    /// 对外可见的文件信息（由引擎任务同步）
    info: RwLock<FileInfo>,
    events: EventChannel,
}

impl Shared {
    fn options(&self) -> Arc<UploadOptions> {
        Arc::clone(&self.options.read())
    }
}

/// 单文件上传句柄
///
/// 可以廉价克隆；所有克隆都被丢弃后，引擎任务中止在途传输并退出。
/// 命令按调用顺序在引擎任务内执行，因此 `status()` 反映的是
/// 最近一次已处理命令之后的状态
#[derive(Clone)]
pub struct FileUploader {
    commands: mpsc::UnboundedSender<Command>,
    shared: Arc<Shared>,
}

impl FileUploader {
    /// 创建引擎（需要在 tokio 运行时内调用）
    pub fn new(options: UploadOptions, transport: Arc<dyn ChunkTransport>) -> Self {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (notices_tx, notices_rx) = mpsc::unbounded_channel();

        let shared = Arc::new(Shared {
            options: RwLock::new(Arc::new(options)),
            info: RwLock::new(FileInfo::unassigned()),
            events: EventChannel::new(),
        });

        let engine = UploadEngine {
            shared: shared.clone(),
            transport,
            file: None,
            info: FileInfo::unassigned(),
            manager: UploadChunkManager::empty(),
            skip_success: false,
            next_attempt: 1,
            notices: notices_tx,
        };
        tokio::spawn(engine.run(commands_rx, notices_rx));

        Self {
            commands: commands_tx,
            shared,
        }
    }

    /// 创建引擎并立即分配文件
    pub fn with_file(
        options: UploadOptions,
        transport: Arc<dyn ChunkTransport>,
        file: Arc<dyn FileSource>,
    ) -> Self {
        let uploader = Self::new(options, transport);
        uploader.set_file(file);
        uploader
    }

    /// 分配文件
    ///
    /// 生成新的文件标识并重新规划分片；之前的进度、成功集合全部丢弃，
    /// 在途传输被中止。`init` 事件由引擎任务异步发布
    pub fn set_file(&self, file: Arc<dyn FileSource>) -> FileId {
        let id = FileId::next();
        *self.shared.info.write() = FileInfo {
            id,
            name: file.name().to_string(),
            size: file.size(),
            status: UploadStatus::Init,
        };
        self.send(Command::SetFile { file, id });
        id
    }

    /// 开始上传（不跳过已成功分片）
    ///
    /// 只有 INIT / PAUSED / FAILED / CANCELED 状态下会真正开始，
    /// 其他状态下静默忽略
    pub fn start_upload(&self) -> UploadResult<()> {
        self.start(false, false)
    }

    /// 重新上传
    ///
    /// `skip_success` 为 false 时先清空成功集合，所有分片重新上传
    pub fn retry(&self, skip_success: bool) -> UploadResult<()> {
        self.start(skip_success, !skip_success)
    }

    /// 继续上传（跳过已成功分片）
    pub fn continue_upload(&self) -> UploadResult<()> {
        self.retry(true)
    }

    pub fn pause_upload(&self) {
        self.send(Command::Pause);
    }

    pub fn cancel_upload(&self) {
        self.send(Command::Cancel);
    }

    /// 预置已成功的分片（例如从服务端查询到的已上传分片）
    ///
    /// 越界索引被忽略；上传进行中调用无效
    pub fn set_skip_chunks(&self, indices: impl IntoIterator<Item = usize>) {
        self.send(Command::SkipChunks(indices.into_iter().collect()));
    }

    /// 替换配置
    ///
    /// 已发出的分片仍按发送时的配置校验，之后的发送与重试次数使用新配置
    pub fn update_options(&self, options: UploadOptions) {
        *self.shared.options.write() = Arc::new(options);
    }

    pub fn options(&self) -> Arc<UploadOptions> {
        self.shared.options()
    }

    pub fn id(&self) -> FileId {
        self.shared.info.read().id
    }

    pub fn info(&self) -> FileInfo {
        self.shared.info.read().clone()
    }

    pub fn status(&self) -> UploadStatus {
        self.shared.info.read().status
    }

    /// 获取引擎完整快照（在之前发送的命令全部处理之后）
    pub async fn snapshot(&self) -> UploadResult<UploadSnapshot> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Snapshot(tx))
            .map_err(|_| UploadError::EngineStopped)?;
        rx.await.map_err(|_| UploadError::EngineStopped)
    }

    pub fn on<F>(&self, kind: EventKind, listener: F) -> ListenerId
    where
        F: Fn(&mut UploadEvent<'_>) + Send + Sync + 'static,
    {
        self.shared.events.on(kind, listener)
    }

    pub fn off(&self, kind: EventKind, id: ListenerId) -> bool {
        self.shared.events.off(kind, id)
    }

    pub fn off_all(&self) {
        self.shared.events.off_all()
    }

    fn start(&self, skip_success: bool, reset_success: bool) -> UploadResult<()> {
        if self.shared.options().endpoint().is_none() {
            return Err(UploadError::MissingEndpoint);
        }
        self.commands
            .send(Command::Start {
                skip_success,
                reset_success,
            })
            .map_err(|_| UploadError::EngineStopped)
    }

    fn send(&self, command: Command) {
        if self.commands.send(command).is_err() {
            error!("上传引擎已停止，命令被丢弃: {}", self.id());
        }
    }
}

impl fmt::Debug for FileUploader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileUploader")
            .field("info", &*self.shared.info.read())
            .finish()
    }
}

/// 引擎任务
struct UploadEngine {
    shared: Arc<Shared>,
    transport: Arc<dyn ChunkTransport>,
    file: Option<Arc<dyn FileSource>>,
    info: FileInfo,
    manager: UploadChunkManager,
    /// 本轮是否跳过已成功分片
    skip_success: bool,
    next_attempt: u64,
    notices: mpsc::UnboundedSender<TransferNotice>,
}

impl UploadEngine {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut notices: mpsc::UnboundedReceiver<TransferNotice>,
    ) {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },
                Some(notice) = notices.recv() => self.handle_notice(notice),
            }
        }

        let aborted = self.manager.abort_all();
        debug!(
            "上传引擎退出: {}, 中止 {} 个在途分片",
            self.info.id,
            aborted.len()
        );
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::SetFile { file, id } => self.set_file(file, id),
            Command::Start {
                skip_success,
                reset_success,
            } => self.start(skip_success, reset_success),
            Command::Pause => self.pause(),
            Command::Cancel => self.cancel(),
            Command::SkipChunks(indices) => self.skip_chunks(indices),
            Command::Snapshot(reply) => {
                let _ = reply.send(self.snapshot());
            }
        }
    }

    fn handle_notice(&mut self, notice: TransferNotice) {
        match notice {
            TransferNotice::Progress {
                index,
                attempt,
                loaded,
            } => self.on_progress(index, attempt, loaded),
            TransferNotice::Finished {
                index,
                attempt,
                result,
            } => self.on_finished(index, attempt, result),
        }
    }

    // =====================================================
    // 命令处理
    // =====================================================

    fn set_file(&mut self, file: Arc<dyn FileSource>, id: FileId) {
        let aborted = self.manager.abort_all();
        if !aborted.is_empty() {
            debug!("重新分配文件，中止在途分片: {:?}", aborted);
        }

        let options = self.shared.options();
        self.manager = UploadChunkManager::new(file.size(), options.chunk_size);
        self.skip_success = false;
        self.info = FileInfo {
            id,
            name: file.name().to_string(),
            size: file.size(),
            status: UploadStatus::Init,
        };
        self.file = Some(file);
        self.sync_info();

        info!(
            "文件初始化完成: {} ({}), 大小={} bytes, 分片数量={}",
            self.info.name,
            self.info.id,
            self.info.size,
            self.manager.chunk_count()
        );

        self.shared
            .events
            .emit(&mut UploadEvent::Init { file: &self.info });
    }

    fn start(&mut self, skip_success: bool, reset_success: bool) {
        let status = self.info.status;
        if !status.can_start() {
            if status == UploadStatus::None {
                warn!("尚未分配文件，忽略上传请求");
            } else {
                debug!("文件 {} 当前状态 {}，忽略上传请求", self.info.id, status);
            }
            return;
        }

        // 失败后仍在途的分片属于上一轮
        let stragglers = self.manager.abort_all();
        if !stragglers.is_empty() {
            debug!("中止上一轮遗留的分片: {:?}", stragglers);
        }

        if reset_success {
            self.manager.clear_succeeded();
        }
        self.manager.prepare_run();
        self.skip_success = skip_success;
        self.set_status(UploadStatus::Uploading);

        let options = self.shared.options();
        info!(
            "开始上传: {} ({}), 分片数量={}, 已成功={}, 并发数={}, 跳过已成功={}",
            self.info.name,
            self.info.id,
            self.manager.chunk_count(),
            self.manager.succeeded().len(),
            options.threads,
            skip_success
        );

        if self.manager.is_completed() {
            self.finish_success();
            return;
        }

        let window = options.threads.max(1).min(self.manager.chunk_count());
        for _ in 0..window {
            self.dispatch_next();
        }
    }

    fn pause(&mut self) {
        if self.info.status != UploadStatus::Uploading {
            debug!(
                "文件 {} 当前状态 {}，忽略暂停请求",
                self.info.id, self.info.status
            );
            return;
        }

        self.set_status(UploadStatus::Paused);
        let aborted = self.manager.abort_all();
        self.manager.reset_cursor();

        info!(
            "上传已暂停: {} ({}), 中止 {} 个在途分片, 已成功 {}/{}",
            self.info.name,
            self.info.id,
            aborted.len(),
            self.manager.succeeded().len(),
            self.manager.chunk_count()
        );

        self.shared
            .events
            .emit(&mut UploadEvent::Paused { file: &self.info });
    }

    fn cancel(&mut self) {
        if !self.info.status.can_cancel() {
            debug!(
                "文件 {} 当前状态 {}，忽略取消请求",
                self.info.id, self.info.status
            );
            return;
        }

        self.set_status(UploadStatus::Canceled);
        let aborted = self.manager.abort_all();
        self.manager.clear_succeeded();
        self.manager.reset_cursor();

        info!(
            "上传已取消: {} ({}), 中止 {} 个在途分片",
            self.info.name,
            self.info.id,
            aborted.len()
        );

        self.shared
            .events
            .emit(&mut UploadEvent::Canceled { file: &self.info });
    }

    fn skip_chunks(&mut self, indices: Vec<usize>) {
        if self.info.status == UploadStatus::Uploading {
            warn!("文件 {} 上传中，忽略预置分片请求", self.info.id);
            return;
        }
        self.manager.seed_succeeded(indices);
        debug!(
            "预置已成功分片: {} ({}/{})",
            self.info.id,
            self.manager.succeeded().len(),
            self.manager.chunk_count()
        );
    }

    fn snapshot(&self) -> UploadSnapshot {
        let chunks = self
            .manager
            .chunks()
            .iter()
            .map(|state| ChunkSnapshot {
                index: state.chunk.index,
                range: state.chunk.range.clone(),
                loaded: state.loaded,
                retry_count: state.retry_count,
                in_flight: state.is_in_flight(),
            })
            .collect();

        UploadSnapshot {
            info: self.info.clone(),
            cursor: self.manager.cursor(),
            succeeded: self.manager.succeeded().iter().copied().collect(),
            chunks,
            loaded: self.manager.loaded(),
            percentage: self.manager.percentage(),
        }
    }

    // =====================================================
    // 分片调度
    // =====================================================

    fn dispatch_next(&mut self) {
        if self.info.status != UploadStatus::Uploading {
            return;
        }
        match self.manager.next_to_dispatch(self.skip_success) {
            Some(index) => self.send_chunk(index),
            None => debug!(
                "文件 {} 没有待发送的分片，在途分片数: {}",
                self.info.id,
                self.manager.in_flight_count()
            ),
        }
    }

    fn send_chunk(&mut self, index: usize) {
        let Some(file) = self.file.clone() else {
            return;
        };
        let options = self.shared.options();
        let Some(endpoint) = options.endpoint().map(str::to_string) else {
            error!("[分片#{}] 发送失败: 未配置上传地址", index);
            self.fail(ResponseBody::Raw(UploadError::MissingEndpoint.to_string()));
            return;
        };
        let Some(chunk) = self.manager.chunks().get(index).map(|s| s.chunk.clone()) else {
            return;
        };

        let total_chunks = self.manager.chunk_count();
        let body = FileSlice::new(file.clone(), chunk.range.clone());

        let mut fields = FormFields::new();
        fields.insert(FIELD_CHUNKS.to_string(), total_chunks.to_string());
        fields.insert(FIELD_CHUNK.to_string(), index.to_string());
        fields.insert(FIELD_FILE_NAME.to_string(), file.name().to_string());
        let mut headers = RequestHeaders::new();

        self.shared.events.emit(&mut UploadEvent::BeforeChunkSend {
            file: &self.info,
            chunk: &chunk,
            body: &body,
            fields: &mut fields,
            headers: &mut headers,
        });

        let attempt = self.next_attempt;
        self.next_attempt += 1;
        let cancel = CancellationToken::new();

        let Some(state) = self.manager.get_mut(index) else {
            return;
        };
        state.retry_count += 1;
        state.transfer = Some(TransferHandle::new(
            attempt,
            options.clone(),
            cancel.clone(),
        ));

        debug!(
            "[分片#{}] 开始上传 (第 {}/{} 次, 范围: {}-{}, 大小: {} bytes)",
            index,
            state.retry_count,
            options.chunk_retry,
            chunk.range.start,
            chunk.range.end,
            chunk.size()
        );

        let request = ChunkRequest {
            method: options.method,
            endpoint,
            index,
            total_chunks,
            file_name: file.name().to_string(),
            body,
            fields,
            headers,
        };

        let progress_tx = self.notices.clone();
        let progress = ProgressReporter::new(move |loaded| {
            let _ = progress_tx.send(TransferNotice::Progress {
                index,
                attempt,
                loaded,
            });
        });

        let notices = self.notices.clone();
        let transport = self.transport.clone();
        let timeout = options.timeout();
        let timeout_ms = options.timeout_ms;

        tokio::spawn(async move {
            let result = tokio::select! {
                _ = cancel.cancelled() => return,
                result = tokio::time::timeout(timeout, transport.send(request, progress)) => {
                    result.unwrap_or_else(|_| Err(TransferError::Timeout(timeout_ms)))
                }
            };
            let _ = notices.send(TransferNotice::Finished {
                index,
                attempt,
                result,
            });
        });
    }

    // =====================================================
    // 传输回报
    // =====================================================

    fn on_progress(&mut self, index: usize, attempt: u64, loaded: u64) {
        if self.info.status != UploadStatus::Uploading {
            return;
        }
        let Some(state) = self.manager.get_mut(index) else {
            return;
        };
        if !state.is_current(attempt) {
            return;
        }
        state.record_loaded(loaded);
        self.emit_progress();
    }

    fn on_finished(
        &mut self,
        index: usize,
        attempt: u64,
        result: Result<ChunkResponse, TransferError>,
    ) {
        let Some(state) = self.manager.get_mut(index) else {
            return;
        };
        if !state.is_current(attempt) {
            debug!("[分片#{}] 忽略已中止传输的结果", index);
            return;
        }
        let Some(handle) = state.transfer.take() else {
            return;
        };

        // 按发送时的配置校验
        let (passed, response) = match result {
            Ok(response) => {
                let body = ResponseBody::parse(&response.body);
                let passed = handle.options.validator.check(response.status, &body);
                if !passed {
                    warn!(
                        "[分片#{}] 响应校验未通过: status={}, body={}",
                        index, response.status, body
                    );
                }
                (passed, body)
            }
            Err(e) => {
                warn!("[分片#{}] 传输失败: {}", index, e);
                (false, ResponseBody::Raw(e.to_string()))
            }
        };

        if passed {
            self.on_chunk_succeeded(index);
        } else {
            self.on_chunk_failed(index, response);
        }
    }

    fn on_chunk_succeeded(&mut self, index: usize) {
        let progressed = self.manager.mark_succeeded(index);
        debug!(
            "[分片#{}] ✓ 上传成功 ({}/{} 完成)",
            index,
            self.manager.succeeded().len(),
            self.manager.chunk_count()
        );

        if self.info.status != UploadStatus::Uploading {
            return;
        }
        if progressed {
            self.emit_progress();
        }

        if self.manager.is_completed() {
            self.finish_success();
        } else {
            self.dispatch_next();
        }
    }

    fn on_chunk_failed(&mut self, index: usize, response: ResponseBody) {
        if self.info.status != UploadStatus::Uploading {
            debug!(
                "[分片#{}] 失败时引擎状态为 {}，不再重试",
                index, self.info.status
            );
            return;
        }

        let retry_limit = self.shared.options().chunk_retry;
        let retry_count = self
            .manager
            .chunks()
            .get(index)
            .map_or(u32::MAX, |s| s.retry_count);

        if retry_count < retry_limit {
            warn!(
                "[分片#{}] 上传失败，立即重试 ({}/{})",
                index, retry_count, retry_limit
            );
            self.send_chunk(index);
            return;
        }

        error!(
            "[分片#{}] 上传失败，已达最大尝试次数 ({})",
            index, retry_limit
        );
        self.fail(response);
    }

    // =====================================================
    // 终态
    // =====================================================

    fn finish_success(&mut self) {
        self.set_status(UploadStatus::Succeeded);
        info!(
            "文件上传成功: {} ({}), 大小={} bytes",
            self.info.name, self.info.id, self.info.size
        );

        self.shared
            .events
            .emit(&mut UploadEvent::Success { file: &self.info });
        self.shared
            .events
            .emit(&mut UploadEvent::Complete { file: &self.info });
    }

    fn fail(&mut self, response: ResponseBody) {
        self.set_status(UploadStatus::Failed);
        error!(
            "文件上传失败: {} ({}), 已成功 {}/{} 个分片",
            self.info.name,
            self.info.id,
            self.manager.succeeded().len(),
            self.manager.chunk_count()
        );

        self.shared.events.emit(&mut UploadEvent::Failed {
            file: &self.info,
            response: &response,
        });
        self.shared
            .events
            .emit(&mut UploadEvent::Complete { file: &self.info });
    }

    fn emit_progress(&self) {
        let loaded = self.manager.loaded();
        let total = self.manager.total_size();
        self.shared.events.emit(&mut UploadEvent::Progress {
            file: &self.info,
            percentage: percentage(loaded, total),
            loaded,
            total,
        });
    }

    fn set_status(&mut self, status: UploadStatus) {
        self.info.status = status;
        self.sync_info();
    }

    /// 同步对外可见的文件信息
    ///
    /// 句柄上已分配了更新的文件时不覆盖
    fn sync_info(&self) {
        let mut shared = self.shared.info.write();
        if shared.id == self.info.id {
            shared.status = self.info.status;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::uploader::mock::{eventually, wait_snapshot, MockReply, MockTransport};
    use crate::uploader::MemoryFile;
    use parking_lot::Mutex;

    const ENDPOINT: &str = "http://localhost:3000/upload";

    /// 记录事件名称、进度等
    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<EventKind>>,
        progress: Mutex<Vec<(f64, u64)>>,
        failed_body: Mutex<Option<ResponseBody>>,
    }

    impl Recorder {
        fn attach(uploader: &FileUploader) -> Arc<Self> {
            let recorder = Arc::new(Self::default());
            for kind in EventKind::ALL {
                let recorder = recorder.clone();
                uploader.on(kind, move |event| {
                    recorder.events.lock().push(event.kind());
                    match event {
                        UploadEvent::Progress {
                            percentage, loaded, ..
                        } => recorder.progress.lock().push((*percentage, *loaded)),
                        UploadEvent::Failed { response, .. } => {
                            *recorder.failed_body.lock() = Some((*response).clone())
                        }
                        _ => {}
                    }
                });
            }
            recorder
        }

        fn events(&self) -> Vec<EventKind> {
            self.events.lock().clone()
        }

        fn count(&self, kind: EventKind) -> usize {
            self.events.lock().iter().filter(|k| **k == kind).count()
        }

        /// 去掉 progress 与 before-chunk-send 后的事件序列
        fn milestones(&self) -> Vec<EventKind> {
            self.events()
                .into_iter()
                .filter(|k| !matches!(k, EventKind::Progress | EventKind::BeforeChunkSend))
                .collect()
        }
    }

    fn options(chunk_size: u64) -> UploadOptions {
        UploadOptions::for_server(ENDPOINT).with_chunk_size(chunk_size)
    }

    fn file(size: usize) -> Arc<dyn FileSource> {
        Arc::new(MemoryFile::new("test-file.txt", vec![b'x'; size]))
    }

    async fn wait_status(uploader: &FileUploader, status: UploadStatus) {
        eventually(&format!("状态变为 {}", status), || uploader.status() == status).await;
    }

    #[tokio::test]
    async fn test_upload_two_chunks() {
        let transport = MockTransport::always_ok();
        let uploader = FileUploader::new(options(7), transport.clone());
        let recorder = Recorder::attach(&uploader);

        let id = uploader.set_file(Arc::new(MemoryFile::new(
            "test-file.txt",
            &b"dummy content"[..],
        )));
        assert_eq!(uploader.id(), id);
        assert_eq!(uploader.status(), UploadStatus::Init);

        uploader.start_upload().unwrap();
        wait_status(&uploader, UploadStatus::Succeeded).await;

        let snapshot = uploader.snapshot().await.unwrap();
        assert_eq!(snapshot.succeeded, vec![0, 1]);
        assert_eq!(snapshot.chunks[0].range, 0..7);
        assert_eq!(snapshot.chunks[1].range, 7..13);
        assert_eq!(snapshot.percentage, 100.0);

        assert_eq!(
            recorder.milestones(),
            vec![EventKind::Init, EventKind::Success, EventKind::Complete]
        );
        assert_eq!(recorder.count(EventKind::BeforeChunkSend), 2);

        let mut calls = transport.calls();
        calls.sort_by_key(|c| c.index);
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].fields.get("chunks").map(String::as_str), Some("2"));
        assert_eq!(calls[0].fields.get("chunk").map(String::as_str), Some("0"));
        assert_eq!(
            calls[1].fields.get("fileName").map(String::as_str),
            Some("test-file.txt")
        );
        assert_eq!(calls[0].body_len, 7);
        assert_eq!(calls[1].body_len, 6);
        assert_eq!(calls[0].endpoint, ENDPOINT);
    }

    #[tokio::test]
    async fn test_retry_then_fail_with_last_response() {
        // chunk #1 一直返回 500
        let transport = MockTransport::new(|call| {
            if call.index == 1 {
                MockReply::status(500, "server error")
            } else {
                MockReply::ok()
            }
        });
        let uploader = FileUploader::with_file(
            options(7).with_chunk_retry(3),
            transport.clone(),
            file(13),
        );
        let recorder = Recorder::attach(&uploader);

        uploader.start_upload().unwrap();
        wait_status(&uploader, UploadStatus::Failed).await;
        eventually("complete 事件", || recorder.count(EventKind::Complete) == 1).await;

        // 共 3 次尝试
        assert_eq!(transport.calls_for("test-file.txt").iter().filter(|c| c.index == 1).count(), 3);
        assert_eq!(
            *recorder.failed_body.lock(),
            Some(ResponseBody::Raw("server error".to_string()))
        );
        assert_eq!(recorder.count(EventKind::Success), 0);

        let milestones = recorder.milestones();
        assert_eq!(
            &milestones[milestones.len() - 2..],
            &[EventKind::Failed, EventKind::Complete]
        );

        let snapshot = uploader.snapshot().await.unwrap();
        assert_eq!(snapshot.succeeded, vec![0]);
        assert_eq!(snapshot.chunks[1].retry_count, 3);
    }

    #[tokio::test]
    async fn test_retry_recovers_within_budget() {
        let transport = MockTransport::new(|call| {
            if call.index == 0 && call.attempt < 3 {
                MockReply::Error("connection reset".to_string())
            } else {
                MockReply::ok()
            }
        });
        let uploader =
            FileUploader::with_file(options(10).with_chunk_retry(3), transport.clone(), file(20));
        let recorder = Recorder::attach(&uploader);

        uploader.start_upload().unwrap();
        wait_status(&uploader, UploadStatus::Succeeded).await;

        assert_eq!(transport.calls_for("test-file.txt").len(), 4);
        assert_eq!(recorder.count(EventKind::Failed), 0);
    }

    #[tokio::test]
    async fn test_custom_validator_uses_parsed_body() {
        let transport = MockTransport::new(|call| {
            if call.index == 0 {
                MockReply::status(200, r#"{"code":1}"#)
            } else {
                MockReply::status(200, r#"{"code":0}"#)
            }
        });
        let uploader = FileUploader::with_file(
            options(5).with_chunk_retry(1).with_validator(|status, body| {
                status == 200 && body.as_json().and_then(|v| v["code"].as_i64()) == Some(0)
            }),
            transport,
            file(10),
        );
        let recorder = Recorder::attach(&uploader);

        uploader.start_upload().unwrap();
        wait_status(&uploader, UploadStatus::Failed).await;
        eventually("failed 事件", || recorder.failed_body.lock().is_some()).await;

        let body = recorder.failed_body.lock().clone().unwrap();
        assert_eq!(body.as_json().unwrap()["code"], 1);
    }

    #[tokio::test]
    async fn test_concurrency_bound() {
        let transport = MockTransport::new(|_| MockReply::ok_after(10));
        let uploader = FileUploader::with_file(
            options(1).with_threads(3),
            transport.clone(),
            file(12),
        );

        uploader.start_upload().unwrap();
        wait_status(&uploader, UploadStatus::Succeeded).await;

        assert_eq!(transport.call_count(), 12);
        assert!(transport.max_in_flight() <= 3);
        assert!(transport.max_in_flight() >= 2);
    }

    #[tokio::test]
    async fn test_progress_is_monotonic_and_reaches_total() {
        let transport = MockTransport::new(|_| MockReply::ok_after(2));
        let uploader =
            FileUploader::with_file(options(4).with_threads(2), transport, file(10));
        let recorder = Recorder::attach(&uploader);

        uploader.start_upload().unwrap();
        wait_status(&uploader, UploadStatus::Succeeded).await;

        let progress = recorder.progress.lock().clone();
        assert!(!progress.is_empty());
        assert!(progress.windows(2).all(|w| w[0].1 <= w[1].1));
        assert!(progress.iter().all(|(p, _)| *p <= 100.0));
        assert_eq!(progress.last().map(|p| p.1), Some(10));
    }

    #[tokio::test]
    async fn test_before_send_injects_fields_and_headers() {
        let transport = MockTransport::always_ok();
        let uploader = FileUploader::with_file(options(100), transport.clone(), file(10));

        uploader.on(EventKind::BeforeChunkSend, |event| {
            if let UploadEvent::BeforeChunkSend {
                fields,
                headers,
                chunk,
                body,
                ..
            } = event
            {
                assert_eq!(body.len(), chunk.size());
                fields.insert("random".to_string(), "3".to_string());
                headers.insert("token".to_string(), "secret".to_string());
            }
        });

        uploader.start_upload().unwrap();
        wait_status(&uploader, UploadStatus::Succeeded).await;

        let calls = transport.calls();
        assert_eq!(calls[0].fields.get("random").map(String::as_str), Some("3"));
        assert_eq!(calls[0].headers.get("token").map(String::as_str), Some("secret"));
    }

    #[tokio::test]
    async fn test_pause_then_continue_skips_succeeded() {
        // 分片 #0 立即成功，其余分片挂起直到暂停
        let transport = MockTransport::new(|call| {
            if call.index == 0 || call.attempt > 1 {
                MockReply::ok()
            } else {
                MockReply::Hang
            }
        });
        let uploader = FileUploader::with_file(
            options(5).with_threads(3),
            transport.clone(),
            file(15),
        );
        let recorder = Recorder::attach(&uploader);

        uploader.start_upload().unwrap();
        wait_snapshot(&uploader, "分片 #0 成功", |s| s.succeeded == vec![0]).await;
        eventually("分片 #1、#2 在途", || transport.in_flight() == 2).await;

        uploader.pause_upload();
        wait_status(&uploader, UploadStatus::Paused).await;
        eventually("在途传输被中止", || transport.in_flight() == 0).await;

        let paused = uploader.snapshot().await.unwrap();
        assert_eq!(paused.cursor, 0);
        assert_eq!(paused.in_flight(), 0);
        assert_eq!(paused.succeeded, vec![0]);
        assert_eq!(recorder.count(EventKind::Paused), 1);

        uploader.continue_upload().unwrap();
        wait_status(&uploader, UploadStatus::Succeeded).await;

        // 分片 #0 只上传过一次
        let calls = transport.calls();
        assert_eq!(calls.iter().filter(|c| c.index == 0).count(), 1);
        assert_eq!(calls.iter().filter(|c| c.index == 1).count(), 2);
        assert_eq!(recorder.count(EventKind::Complete), 1);
    }

    #[tokio::test]
    async fn test_cancel_clears_progress_and_retry_reuploads_everything() {
        let transport = MockTransport::new(|call| {
            if call.attempt == 1 && call.index == 1 {
                MockReply::Hang
            } else {
                MockReply::ok()
            }
        });
        let uploader = FileUploader::with_file(
            options(5).with_threads(2),
            transport.clone(),
            file(10),
        );
        let recorder = Recorder::attach(&uploader);

        uploader.start_upload().unwrap();
        eventually("分片 #1 在途", || transport.in_flight() == 1 && transport.call_count() == 2)
            .await;

        uploader.cancel_upload();
        wait_status(&uploader, UploadStatus::Canceled).await;

        let snapshot = uploader.snapshot().await.unwrap();
        assert!(snapshot.succeeded.is_empty());
        assert_eq!(snapshot.cursor, 0);
        assert_eq!(snapshot.in_flight(), 0);
        assert_eq!(snapshot.loaded, 0);
        assert_eq!(recorder.count(EventKind::Canceled), 1);
        assert_eq!(recorder.count(EventKind::Complete), 0);

        uploader.retry(false).unwrap();
        wait_status(&uploader, UploadStatus::Succeeded).await;
        assert_eq!(
            transport.calls().iter().filter(|c| c.index == 0).count(),
            2
        );
    }

    #[tokio::test]
    async fn test_timeout_counts_as_failed_attempt() {
        let transport = MockTransport::new(|call| {
            if call.attempt == 1 {
                MockReply::Hang
            } else {
                MockReply::ok()
            }
        });
        let uploader = FileUploader::with_file(
            options(100).with_timeout_ms(20).with_chunk_retry(2),
            transport.clone(),
            file(10),
        );

        uploader.start_upload().unwrap();
        wait_status(&uploader, UploadStatus::Succeeded).await;
        assert_eq!(transport.call_count(), 2);
    }

    #[tokio::test]
    async fn test_timeout_failure_carries_raw_error() {
        let transport = MockTransport::new(|_| MockReply::Hang);
        let uploader = FileUploader::with_file(
            options(100).with_timeout_ms(10).with_chunk_retry(1),
            transport,
            file(10),
        );
        let recorder = Recorder::attach(&uploader);

        uploader.start_upload().unwrap();
        eventually("failed 事件", || recorder.failed_body.lock().is_some()).await;

        let body = recorder.failed_body.lock().clone().unwrap();
        assert!(body.as_raw().is_some());
        assert_eq!(uploader.status(), UploadStatus::Failed);
    }

    #[tokio::test]
    async fn test_start_requires_endpoint() {
        let transport = MockTransport::always_ok();
        let uploader = FileUploader::with_file(UploadOptions::default(), transport.clone(), file(10));

        assert!(matches!(
            uploader.start_upload(),
            Err(UploadError::MissingEndpoint)
        ));
        assert_eq!(uploader.status(), UploadStatus::Init);

        // 分片规划在分配文件时确定，新配置只影响之后的发送
        uploader.update_options(options(5));
        uploader.start_upload().unwrap();
        wait_status(&uploader, UploadStatus::Succeeded).await;
        assert_eq!(transport.call_count(), 1);
    }

    #[tokio::test]
    async fn test_empty_file_succeeds_immediately() {
        let transport = MockTransport::always_ok();
        let uploader = FileUploader::with_file(options(5), transport.clone(), file(0));
        let recorder = Recorder::attach(&uploader);

        uploader.start_upload().unwrap();
        wait_status(&uploader, UploadStatus::Succeeded).await;

        assert_eq!(transport.call_count(), 0);
        assert_eq!(
            recorder.milestones(),
            vec![EventKind::Init, EventKind::Success, EventKind::Complete]
        );
    }

    #[tokio::test]
    async fn test_start_is_ignored_while_uploading_or_succeeded() {
        let transport = MockTransport::new(|_| MockReply::ok_after(20));
        let uploader = FileUploader::with_file(options(5), transport.clone(), file(5));
        let recorder = Recorder::attach(&uploader);

        uploader.start_upload().unwrap();
        uploader.start_upload().unwrap();
        wait_status(&uploader, UploadStatus::Succeeded).await;

        uploader.start_upload().unwrap();
        let snapshot = uploader.snapshot().await.unwrap();
        assert_eq!(snapshot.status(), UploadStatus::Succeeded);
        assert_eq!(transport.call_count(), 1);
        assert_eq!(recorder.count(EventKind::Complete), 1);
    }

    #[tokio::test]
    async fn test_pause_and_cancel_are_noops_in_wrong_state() {
        let transport = MockTransport::always_ok();
        let uploader = FileUploader::new(options(5), transport);
        let recorder = Recorder::attach(&uploader);

        // 尚未分配文件
        uploader.pause_upload();
        uploader.cancel_upload();
        let snapshot = uploader.snapshot().await.unwrap();
        assert_eq!(snapshot.status(), UploadStatus::None);

        uploader.set_file(file(5));
        uploader.pause_upload();
        let snapshot = uploader.snapshot().await.unwrap();
        assert_eq!(snapshot.status(), UploadStatus::Init);
        assert_eq!(recorder.count(EventKind::Paused), 0);

        // INIT 状态允许取消
        uploader.cancel_upload();
        wait_status(&uploader, UploadStatus::Canceled).await;
        assert_eq!(recorder.count(EventKind::Canceled), 1);
    }

    #[tokio::test]
    async fn test_skip_chunks_are_not_uploaded() {
        let transport = MockTransport::always_ok();
        let uploader = FileUploader::with_file(options(5), transport.clone(), file(20));

        uploader.set_skip_chunks([0, 2, 99]);
        uploader.continue_upload().unwrap();
        wait_status(&uploader, UploadStatus::Succeeded).await;

        let mut indices: Vec<usize> = transport.calls().iter().map(|c| c.index).collect();
        indices.sort_unstable();
        assert_eq!(indices, vec![1, 3]);
    }

    #[tokio::test]
    async fn test_retry_after_failure_skipping_success() {
        let transport = MockTransport::new(|call| {
            if call.index == 1 && call.attempt == 1 {
                MockReply::status(500, "")
            } else {
                MockReply::ok()
            }
        });
        let uploader = FileUploader::with_file(
            options(5).with_chunk_retry(1),
            transport.clone(),
            file(15),
        );

        uploader.start_upload().unwrap();
        wait_status(&uploader, UploadStatus::Failed).await;
        wait_snapshot(&uploader, "分片 #0 成功", |s| s.succeeded.contains(&0)).await;

        uploader.retry(true).unwrap();
        wait_status(&uploader, UploadStatus::Succeeded).await;

        let calls = transport.calls();
        assert_eq!(calls.iter().filter(|c| c.index == 0).count(), 1);
        assert_eq!(calls.iter().filter(|c| c.index == 1).count(), 2);
    }

    #[tokio::test]
    async fn test_set_file_resets_engine() {
        let transport = MockTransport::always_ok();
        let uploader = FileUploader::with_file(options(5), transport.clone(), file(10));
        let first = uploader.id();

        uploader.start_upload().unwrap();
        wait_status(&uploader, UploadStatus::Succeeded).await;

        let second = uploader.set_file(Arc::new(MemoryFile::new("other.bin", vec![1u8; 7])));
        assert_ne!(first, second);

        let snapshot = uploader.snapshot().await.unwrap();
        assert_eq!(snapshot.status(), UploadStatus::Init);
        assert_eq!(snapshot.info.name, "other.bin");
        assert_eq!(snapshot.chunks.len(), 2);
        assert!(snapshot.succeeded.is_empty());
    }

    #[tokio::test]
    async fn test_options_update_applies_to_later_sends() {
        let transport = MockTransport::new(|call| {
            if call.index == 0 {
                MockReply::ok()
            } else {
                MockReply::Hang
            }
        });
        let uploader = FileUploader::with_file(options(5), transport.clone(), file(10));

        uploader.start_upload().unwrap();
        eventually("两个分片已发送", || transport.call_count() == 2).await;
        uploader.pause_upload();
        wait_status(&uploader, UploadStatus::Paused).await;

        uploader.update_options(
            options(5).with_method(crate::config::UploadMethod::Put),
        );
        assert_eq!(uploader.options().method, crate::config::UploadMethod::Put);

        uploader.continue_upload().unwrap();
        eventually("第三次发送", || transport.call_count() == 3).await;
        assert_eq!(
            transport.calls()[2].method,
            crate::config::UploadMethod::Put
        );
        uploader.cancel_upload();
    }

    /// 不经过句柄，直接驱动引擎任务的内部状态
    fn detached_engine() -> (UploadEngine, Arc<Mutex<Vec<EventKind>>>) {
        let (notices, _) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            options: RwLock::new(Arc::new(options(5))),
            info: RwLock::new(FileInfo::unassigned()),
            events: EventChannel::new(),
        });
        let events = Arc::new(Mutex::new(Vec::new()));
        for kind in EventKind::ALL {
            let events = events.clone();
            shared.events.on(kind, move |event| events.lock().push(event.kind()));
        }

        let mut engine = UploadEngine {
            shared,
            transport: MockTransport::new(|_| MockReply::Hang),
            file: None,
            info: FileInfo::unassigned(),
            manager: UploadChunkManager::empty(),
            skip_success: false,
            next_attempt: 1,
            notices,
        };
        engine.set_file(file(5), FileId::next());
        (engine, events)
    }

    fn finished_ok(attempt: u64) -> TransferNotice {
        TransferNotice::Finished {
            index: 0,
            attempt,
            result: Ok(ChunkResponse {
                status: 200,
                body: r#"{"code":0}"#.to_string(),
            }),
        }
    }

    #[tokio::test]
    async fn test_late_completion_of_aborted_transfer_is_ignored() {
        let (mut engine, events) = detached_engine();

        // 第 1 次尝试在途时暂停，之后它的成功结果才到达
        engine.start(false, false);
        assert!(engine.manager.chunks()[0].is_current(1));
        engine.pause();
        engine.handle_notice(finished_ok(1));

        assert_eq!(engine.info.status, UploadStatus::Paused);
        assert!(engine.manager.succeeded().is_empty());
        assert!(!events.lock().contains(&EventKind::Success));

        // 继续后第 2 次尝试在途，第 1 次的结果再次到达也不算数
        engine.start(true, false);
        engine.handle_notice(finished_ok(1));
        assert_eq!(engine.info.status, UploadStatus::Uploading);
        assert!(engine.manager.chunks()[0].is_current(2));
        assert!(engine.manager.succeeded().is_empty());

        engine.handle_notice(finished_ok(2));
        assert_eq!(engine.info.status, UploadStatus::Succeeded);
        let events = events.lock();
        assert_eq!(events.iter().filter(|k| **k == EventKind::Success).count(), 1);
        assert_eq!(events.iter().filter(|k| **k == EventKind::Complete).count(), 1);
    }

    #[tokio::test]
    async fn test_cancel_is_noop_in_terminal_states() {
        let transport = MockTransport::new(|call| {
            if call.index == 1 {
                MockReply::status(500, "")
            } else {
                MockReply::ok()
            }
        });
        let failed = FileUploader::with_file(
            options(5).with_chunk_retry(1),
            transport,
            file(10),
        );
        let recorder = Recorder::attach(&failed);
        failed.start_upload().unwrap();
        wait_status(&failed, UploadStatus::Failed).await;
        wait_snapshot(&failed, "分片 #0 成功", |s| s.succeeded.contains(&0)).await;

        failed.cancel_upload();
        let snapshot = failed.snapshot().await.unwrap();
        assert_eq!(snapshot.status(), UploadStatus::Failed);
        assert_eq!(snapshot.succeeded, vec![0]);
        assert_eq!(recorder.count(EventKind::Canceled), 0);

        let succeeded = FileUploader::with_file(options(5), MockTransport::always_ok(), file(5));
        let recorder = Recorder::attach(&succeeded);
        succeeded.start_upload().unwrap();
        wait_status(&succeeded, UploadStatus::Succeeded).await;

        succeeded.cancel_upload();
        let snapshot = succeeded.snapshot().await.unwrap();
        assert_eq!(snapshot.status(), UploadStatus::Succeeded);
        assert_eq!(recorder.count(EventKind::Canceled), 0);
    }
}
