// 测试用的分片传输
//
// 按 (文件名, 分片索引, 第几次尝试) 决定响应，并统计并发情况

use crate::config::UploadMethod;
use crate::error::TransferError;
use crate::events::{FormFields, RequestHeaders};
use crate::uploader::{
    ChunkRequest, ChunkResponse, ChunkTransport, FileUploader, ProgressReporter, UploadSnapshot,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// 预设响应
#[derive(Debug, Clone)]
pub(crate) enum MockReply {
    /// 延迟指定毫秒后返回状态码和响应体
    Respond { delay_ms: u64, status: u16, body: String },
    /// 传输层错误
    Error(String),
    /// 永不返回（等待被中止或超时）
    Hang,
}

impl MockReply {
    pub fn ok() -> Self {
        Self::ok_after(0)
    }

    pub fn ok_after(delay_ms: u64) -> Self {
        MockReply::Respond {
            delay_ms,
            status: 200,
            body: r#"{"code":0}"#.to_string(),
        }
    }

    pub fn status(status: u16, body: &str) -> Self {
        MockReply::Respond {
            delay_ms: 0,
            status,
            body: body.to_string(),
        }
    }
}

/// 一次请求记录
#[derive(Debug, Clone)]
pub(crate) struct RecordedCall {
    pub file_name: String,
    pub index: usize,
    /// 该分片的第几次请求（从 1 开始，跨轮次累计）
    pub attempt: usize,
    pub method: UploadMethod,
    pub endpoint: String,
    pub fields: FormFields,
    pub headers: RequestHeaders,
    pub body_len: u64,
}

type ReplyFn = dyn Fn(&RecordedCall) -> MockReply + Send + Sync;

#[derive(Default)]
struct MockState {
    calls: Vec<RecordedCall>,
    attempts: HashMap<(String, usize), usize>,
    in_flight: usize,
    max_in_flight: usize,
    active_files: HashMap<String, usize>,
    max_active_files: usize,
}

pub(crate) struct MockTransport {
    reply: Box<ReplyFn>,
    state: Mutex<MockState>,
}

impl MockTransport {
    pub fn new<F>(reply: F) -> Arc<Self>
    where
        F: Fn(&RecordedCall) -> MockReply + Send + Sync + 'static,
    {
        Arc::new(Self {
            reply: Box::new(reply),
            state: Mutex::new(MockState::default()),
        })
    }

    /// 所有分片立即成功
    pub fn always_ok() -> Arc<Self> {
        Self::new(|_| MockReply::ok())
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.state.lock().calls.clone()
    }

    pub fn calls_for(&self, file_name: &str) -> Vec<RecordedCall> {
        self.calls()
            .into_iter()
            .filter(|c| c.file_name == file_name)
            .collect()
    }

    pub fn call_count(&self) -> usize {
        self.state.lock().calls.len()
    }

    pub fn in_flight(&self) -> usize {
        self.state.lock().in_flight
    }

    pub fn max_in_flight(&self) -> usize {
        self.state.lock().max_in_flight
    }

    /// 同时有请求在途的文件数量峰值
    pub fn max_active_files(&self) -> usize {
        self.state.lock().max_active_files
    }

    fn begin(&self, request: &ChunkRequest) -> RecordedCall {
        let mut guard = self.state.lock();
        let state = &mut *guard;

        let attempt = {
            let counter = state
                .attempts
                .entry((request.file_name.clone(), request.index))
                .or_insert(0);
            *counter += 1;
            *counter
        };

        let call = RecordedCall {
            file_name: request.file_name.clone(),
            index: request.index,
            attempt,
            method: request.method,
            endpoint: request.endpoint.clone(),
            fields: request.fields.clone(),
            headers: request.headers.clone(),
            body_len: request.body.len(),
        };
        state.calls.push(call.clone());

        state.in_flight += 1;
        state.max_in_flight = state.max_in_flight.max(state.in_flight);
        *state.active_files.entry(request.file_name.clone()).or_insert(0) += 1;
        state.max_active_files = state.max_active_files.max(state.active_files.len());

        call
    }

    fn end(&self, file_name: &str) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        state.in_flight -= 1;
        if let Some(count) = state.active_files.get_mut(file_name) {
            *count -= 1;
            if *count == 0 {
                state.active_files.remove(file_name);
            }
        }
    }
}

/// 请求结束（包括 future 被丢弃）时归还并发计数
struct InFlightGuard<'a> {
    transport: &'a MockTransport,
    file_name: String,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.transport.end(&self.file_name);
    }
}

#[async_trait]
impl ChunkTransport for MockTransport {
    async fn send(
        &self,
        request: ChunkRequest,
        progress: ProgressReporter,
    ) -> Result<ChunkResponse, TransferError> {
        let call = self.begin(&request);
        let _guard = InFlightGuard {
            transport: self,
            file_name: call.file_name.clone(),
        };

        match (self.reply)(&call) {
            MockReply::Respond {
                delay_ms,
                status,
                body,
            } => {
                progress.report(call.body_len / 2);
                if delay_ms > 0 {
                    tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                } else {
                    tokio::task::yield_now().await;
                }
                progress.report(call.body_len);
                Ok(ChunkResponse { status, body })
            }
            MockReply::Error(message) => Err(TransferError::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionReset,
                message,
            ))),
            MockReply::Hang => {
                progress.report(call.body_len / 2);
                std::future::pending::<()>().await;
                unreachable!()
            }
        }
    }
}

/// 轮询等待条件成立，超时则测试失败
pub(crate) async fn eventually<F>(what: &str, condition: F)
where
    F: Fn() -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        if tokio::time::Instant::now() > deadline {
            panic!("等待超时: {}", what);
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// 轮询引擎快照直到条件成立
pub(crate) async fn wait_snapshot<F>(uploader: &FileUploader, what: &str, condition: F) -> UploadSnapshot
where
    F: Fn(&UploadSnapshot) -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let snapshot = uploader.snapshot().await.expect("引擎已停止");
        if condition(&snapshot) {
            return snapshot;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("等待超时: {}", what);
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
