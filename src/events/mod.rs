//! 事件模块
//!
//! - `types.rs`: 事件名称与各事件的负载
//! - `channel.rs`: 按实例隔离的监听器注册表

mod channel;
mod types;

pub use channel::*;
pub use types::*;
