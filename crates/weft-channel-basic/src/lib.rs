#![doc = r#"
# weft-channel-basic

## 模块使命（Why）
- 主机内存通道后端：发送方把负载按操作顺序写成帧，经由通道自己的连接直达
  接收方的目标缓冲。没有带外信息、没有设备依赖，是操作状态机最朴素的实例，
  也是端到端场景在无设备环境下的试金石。

## 核心契约（What）
- `BasicContext::create_channel` 在一条既有连接上装配通道；
- 通道动词（`send`/`recv`/`close`/`set_id`）见 `weft-core` 的 [`Channel`](weft_core::Channel) 契约；
- 描述符恒为空字节串，配对依赖两侧提交顺序一致（由帧序保证）。
"#]

mod channel;

pub use channel::BasicChannel;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use weft_core::{Connection, ContextCore, WeftError};

/// 主机内存通道的上下文：事件循环与存活通道登记的所有者。
pub struct BasicContext {
    core: Arc<ContextCore>,
    channel_counter: AtomicU64,
}

impl BasicContext {
    pub fn new() -> Result<Self, WeftError> {
        Ok(Self {
            core: ContextCore::new("basic")?,
            channel_counter: AtomicU64::new(0),
        })
    }

    /// 在一条既有连接上装配通道。
    pub fn create_channel(&self, connection: Arc<dyn Connection>) -> BasicChannel {
        let serial = self.channel_counter.fetch_add(1, Ordering::Relaxed);
        let id = format!("{}.ch{serial}", self.core.id());
        BasicChannel::new(Arc::clone(&self.core), connection, id)
    }

    /// 触发上下文关闭广播；幂等。
    pub fn close(&self) {
        self.core.close();
    }

    /// 关闭并等待全部通道排空，随后汇合事件循环。
    pub fn join(&self) {
        self.core.join();
    }
}
