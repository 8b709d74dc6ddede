//! 事件通道
//!
//! 每个引擎与编排器各自持有一个通道，监听器按注册顺序同步调用

use super::{EventKind, UploadEvent};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::trace;

/// 事件监听器
pub type Listener = Arc<dyn Fn(&mut UploadEvent<'_>) + Send + Sync>;

/// 监听器标识（用于取消订阅）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// 事件通道
#[derive(Default)]
pub struct EventChannel {
    next_id: AtomicU64,
    listeners: Mutex<HashMap<EventKind, Vec<(ListenerId, Listener)>>>,
}

impl EventChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// 订阅事件
    pub fn on<F>(&self, kind: EventKind, listener: F) -> ListenerId
    where
        F: Fn(&mut UploadEvent<'_>) + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners
            .lock()
            .entry(kind)
            .or_default()
            .push((id, Arc::new(listener)));
        id
    }

    /// 取消订阅，返回是否找到该监听器
    pub fn off(&self, kind: EventKind, id: ListenerId) -> bool {
        let mut listeners = self.listeners.lock();
        let Some(list) = listeners.get_mut(&kind) else {
            return false;
        };
        let before = list.len();
        list.retain(|(listener_id, _)| *listener_id != id);
        before != list.len()
    }

    /// 清空所有监听器
    pub fn off_all(&self) {
        self.listeners.lock().clear();
    }

    pub fn listener_count(&self, kind: EventKind) -> usize {
        self.listeners.lock().get(&kind).map_or(0, Vec::len)
    }

    /// 发布事件
    ///
    /// 调用监听器时不持有注册表锁，监听器内可以继续订阅或取消订阅
    pub fn emit(&self, event: &mut UploadEvent<'_>) {
        let kind = event.kind();
        let listeners: Vec<Listener> = match self.listeners.lock().get(&kind) {
            Some(list) => list.iter().map(|(_, l)| Arc::clone(l)).collect(),
            None => Vec::new(),
        };

        if listeners.is_empty() {
            trace!("事件 '{}' 没有监听器", kind);
            return;
        }

        for listener in listeners {
            listener(event);
        }
    }
}

impl fmt::Debug for EventChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let listeners = self.listeners.lock();
        let counts: HashMap<EventKind, usize> =
            listeners.iter().map(|(k, v)| (*k, v.len())).collect();
        f.debug_struct("EventChannel")
            .field("listeners", &counts)
            .finish()
    }
}
