// 多文件上传管理器
//
// 职责：
// - 为每个文件创建独立的上传引擎，并把引擎事件转发到管理器自身的事件通道
// - 按文件标识定向控制，或广播到所有文件
// - 顺序上传：同一时间只有一个文件处于上传中，前一个文件完成后再开始下一个

use crate::config::UploadOptions;
use crate::error::{UploadError, UploadResult};
use crate::events::{EventChannel, EventKind, ListenerId, UploadEvent};
use crate::uploader::{ChunkTransport, FileId, FileSource, FileUploader, UploadStatus};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// 重试参数
#[derive(Debug, Clone, Copy, Default)]
pub struct RetryOptions {
    /// 为空时重试所有文件
    pub file_id: Option<FileId>,
    /// 是否跳过已成功分片
    pub skip_success: bool,
}

/// 多文件上传管理器
pub struct MultiUploader {
    options: RwLock<UploadOptions>,
    transport: Arc<dyn ChunkTransport>,
    files: Arc<RwLock<Vec<FileUploader>>>,
    events: Arc<EventChannel>,
    /// 顺序上传任务
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl MultiUploader {
    pub fn new(options: UploadOptions, transport: Arc<dyn ChunkTransport>) -> Self {
        Self {
            options: RwLock::new(options),
            transport,
            files: Arc::new(RwLock::new(Vec::new())),
            events: Arc::new(EventChannel::new()),
            driver: Mutex::new(None),
        }
    }

    /// 添加文件，按输入顺序返回文件标识
    ///
    /// 每个文件一个引擎，引擎的所有事件都会转发到管理器
    pub fn add_files<I>(&self, files: I) -> Vec<FileId>
    where
        I: IntoIterator<Item = Arc<dyn FileSource>>,
    {
        let options = self.options.read().clone();
        let ids: Vec<FileId> = files
            .into_iter()
            .map(|file| {
                let uploader = FileUploader::new(options.clone(), self.transport.clone());
                self.forward_events(&uploader);
                let id = uploader.set_file(file);
                self.files.write().push(uploader);
                id
            })
            .collect();

        info!("添加 {} 个上传文件，当前共 {} 个", ids.len(), self.files.read().len());
        ids
    }

    pub fn add_file(&self, file: Arc<dyn FileSource>) -> FileId {
        let ids = self.add_files(std::iter::once(file));
        ids[0]
    }

    /// 开始上传
    ///
    /// - 指定文件：立即开始该文件
    /// - 不指定：按添加顺序依次上传处于 INIT 状态的文件，已有顺序上传进行中时忽略
    pub fn upload(&self, file_id: Option<FileId>) -> UploadResult<()> {
        if let Some(id) = file_id {
            let uploader = self.get_file(id).ok_or(UploadError::FileNotFound(id))?;
            return uploader.start_upload();
        }

        if self.options.read().endpoint().is_none() {
            return Err(UploadError::MissingEndpoint);
        }

        let mut driver = self.driver.lock();
        if driver.as_ref().is_some_and(|handle| !handle.is_finished()) {
            debug!("顺序上传进行中，忽略重复请求");
            return Ok(());
        }

        info!("开始顺序上传");
        *driver = Some(tokio::spawn(drive_sequential(self.files.clone())));
        Ok(())
    }

    pub fn cancel(&self, file_id: Option<FileId>) {
        for uploader in self.targets(file_id) {
            uploader.cancel_upload();
        }
    }

    pub fn pause(&self, file_id: Option<FileId>) {
        for uploader in self.targets(file_id) {
            uploader.pause_upload();
        }
    }

    /// 继续上传（跳过已成功分片）
    pub fn continue_upload(&self, file_id: Option<FileId>) {
        for uploader in self.targets(file_id) {
            if let Err(e) = uploader.continue_upload() {
                warn!("继续上传失败: {}, 错误: {}", uploader.id(), e);
            }
        }
    }

    pub fn retry(&self, options: RetryOptions) {
        for uploader in self.targets(options.file_id) {
            if let Err(e) = uploader.retry(options.skip_success) {
                warn!("重试上传失败: {}, 错误: {}", uploader.id(), e);
            }
        }
    }

    /// 替换配置（同时应用到已添加的文件）
    pub fn update_options(&self, options: UploadOptions) {
        for uploader in self.files.read().iter() {
            uploader.update_options(options.clone());
        }
        *self.options.write() = options;
    }

    pub fn get_file(&self, file_id: FileId) -> Option<FileUploader> {
        self.files
            .read()
            .iter()
            .find(|uploader| uploader.id() == file_id)
            .cloned()
    }

    /// 所有文件（按添加顺序）
    pub fn files(&self) -> Vec<FileUploader> {
        self.files.read().clone()
    }

    pub fn len(&self) -> usize {
        self.files.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.read().is_empty()
    }

    pub fn on<F>(&self, kind: EventKind, listener: F) -> ListenerId
    where
        F: Fn(&mut UploadEvent<'_>) + Send + Sync + 'static,
    {
        self.events.on(kind, listener)
    }

    pub fn off(&self, kind: EventKind, id: ListenerId) -> bool {
        self.events.off(kind, id)
    }

    pub fn off_all(&self) {
        self.events.off_all()
    }

    fn targets(&self, file_id: Option<FileId>) -> Vec<FileUploader> {
        match file_id {
            Some(id) => match self.get_file(id) {
                Some(uploader) => vec![uploader],
                None => {
                    warn!("文件不存在，忽略: {}", id);
                    Vec::new()
                }
            },
            None => self.files.read().clone(),
        }
    }

    fn forward_events(&self, uploader: &FileUploader) {
        for kind in EventKind::ALL {
            let events = self.events.clone();
            uploader.on(kind, move |event| events.emit(event));
        }
    }
}

impl Drop for MultiUploader {
    fn drop(&mut self) {
        if let Some(handle) = self.driver.lock().take() {
            handle.abort();
        }
    }
}

/// 顺序上传
///
/// 每一步重新读取文件列表，上传过程中追加的文件也会被处理。
/// 当前文件被暂停或取消时停在该文件上，直到它最终完成
async fn drive_sequential(files: Arc<RwLock<Vec<FileUploader>>>) {
    let mut position = 0;

    loop {
        let next = files.read().get(position).cloned();
        let Some(uploader) = next else {
            break;
        };
        position += 1;

        let status = match uploader.snapshot().await {
            Ok(snapshot) => snapshot.status(),
            Err(e) => {
                warn!("读取文件状态失败: {}, 错误: {}", uploader.id(), e);
                continue;
            }
        };
        if status != UploadStatus::Init {
            debug!("跳过状态为 {} 的文件: {}", status, uploader.id());
            continue;
        }

        // 只以 complete 推进：取消或暂停的文件之后被重试/继续并完成时，队列照常向后推进
        let (done_tx, done_rx) = oneshot::channel::<()>();
        let done_tx = Mutex::new(Some(done_tx));
        let listener = uploader.on(EventKind::Complete, move |_| {
            if let Some(tx) = done_tx.lock().take() {
                let _ = tx.send(());
            }
        });

        if let Err(e) = uploader.start_upload() {
            warn!("开始上传失败: {}, 错误: {}", uploader.id(), e);
            uploader.off(EventKind::Complete, listener);
            continue;
        }

        let finished = done_rx.await;
        uploader.off(EventKind::Complete, listener);

        if finished.is_err() {
            warn!("上传引擎已停止，结束顺序上传: {}", uploader.id());
            return;
        }
        debug!("文件上传结束: {} ({})", uploader.id(), uploader.status());
    }

    info!("顺序上传完成");
}
