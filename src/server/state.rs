// 应用状态

use crate::config::ReceiverConfig;
use crate::server::store::ChunkStore;
use std::sync::Arc;

/// 接收端全局状态
#[derive(Clone)]
pub struct AppState {
    /// 分片存储
    pub store: Arc<ChunkStore>,
    /// 上传分片时必须携带的请求头
    pub required_header: Option<Arc<str>>,
}

impl AppState {
    /// 根据配置创建状态（创建存储目录）
    pub async fn new(config: &ReceiverConfig) -> anyhow::Result<Self> {
        let store = ChunkStore::open(&config.upload_dir).await?;
        let required_header = config
            .required_header
            .as_deref()
            .map(str::trim)
            .filter(|h| !h.is_empty())
            .map(Arc::from);

        Ok(Self {
            store: Arc::new(store),
            required_header,
        })
    }
}
