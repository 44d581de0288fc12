#![doc = r#"
# weft-channel-cuda-ipc

## 模块使命（Why）
- 同机两进程之间的 GPU 快速通路：显存经 IPC 句柄直接映射进对端进程，
  搬运是接收方流上的一次设备间异步拷贝，两侧 CPU 全程不阻塞。
- 跨进程的流间同步靠一对设备事件完成：发送方的**起始事件**标记"字节可读"，
  接收方的**停止事件**标记"字节读毕"，二者的 IPC 句柄经描述符与回执交换。

## 核心契约（What）
- `CudaIpcContext::create_channel(reply, ack)` 在两条控制连接上装配通道：
  reply 流承载接收方→发送方的回执，ack 流承载发送方→接收方的确认；
- 通道动词见 `weft-core` 的 [`Channel`](weft_core::Channel) 契约；缓冲为 [`CudaBuffer`]
  （设备指针、长度、调用方的流）；
- 同一远端分配按分配标识缓存，只映射一次，随上下文拆除统一释放。

## 环境契约（Environment）
- 需要可用的 CUDA 驱动（经 `cudarc` 动态加载）；两进程须运行在同一台主机上；
- 跨设备拷贝依赖驱动的按需对等访问（打开句柄时启用 lazy peer access）。
"#]

mod channel;
mod cuda;
mod wire;

pub use channel::CudaIpcChannel;
pub use cuda::CudaStream;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tracing::trace;

use weft_core::{Connection, ContextCore, WeftError};

use crate::cuda::PrimaryContext;

/// 设备侧缓冲：指针、长度与调用方的流。
///
/// # 契约说明（What）
/// - `ptr` 必须指向设备显存分配内部（发送侧允许带偏移，基址由驱动反查）；
/// - `stream`：提交方用来排队后续工作的流；通道在其上记录/等待事件，
///   使用户工作与搬运天然串联；
/// - 发送侧的 `length` 不参与拷贝（拷贝长度由接收方指定），仅用于日志。
#[derive(Clone, Copy, Debug)]
pub struct CudaBuffer {
    pub ptr: u64,
    pub length: usize,
    pub stream: CudaStream,
}

/// 上下文内部：核心骨架 + 设备与远端分配缓存。
pub(crate) struct ContextInner {
    pub(crate) core: Arc<ContextCore>,
    devices: Mutex<HashMap<i32, Arc<PrimaryContext>>>,
    /// 已映射的远端分配，按（分配标识, 本地设备）为键。
    allocations: Mutex<HashMap<(String, i32), u64>>,
}

impl ContextInner {
    /// 取（或 retain）某设备的主上下文。
    pub(crate) fn device(&self, ordinal: i32) -> Result<Arc<PrimaryContext>, WeftError> {
        let mut devices = self.devices.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(device) = devices.get(&ordinal) {
            return Ok(Arc::clone(device));
        }
        let device = PrimaryContext::retain(ordinal)?;
        devices.insert(ordinal, Arc::clone(&device));
        Ok(device)
    }

    /// 打开（或复用）对端分配的显存 IPC 句柄，返回本进程内基址。
    pub(crate) fn open_ipc_handle(
        &self,
        allocation_id: &str,
        handle: &[u8],
        device: &Arc<PrimaryContext>,
    ) -> Result<u64, WeftError> {
        let key = (allocation_id.to_owned(), device.ordinal());
        let mut allocations = self.allocations.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(base) = allocations.get(&key) {
            return Ok(*base);
        }
        let base = cuda::open_ipc_mem_handle(device, handle)?;
        trace!(allocation = %allocation_id, device = device.ordinal(), "opened remote allocation");
        allocations.insert(key, base);
        Ok(base)
    }

    /// 释放全部已映射的远端分配；上下文拆除时调用。
    fn release_allocations(&self) {
        let drained: Vec<_> = {
            let mut allocations = self.allocations.lock().unwrap_or_else(|e| e.into_inner());
            allocations.drain().collect()
        };
        let devices = self.devices.lock().unwrap_or_else(|e| e.into_inner());
        for ((allocation_id, ordinal), base) in drained {
            if let Some(device) = devices.get(&ordinal) {
                if let Err(error) = cuda::close_ipc_mem_handle(device, base) {
                    trace!(allocation = %allocation_id, %error, "failed to close remote allocation");
                }
            }
        }
    }
}

/// CUDA IPC 通道上下文：事件循环、设备句柄与分配缓存的所有者。
pub struct CudaIpcContext {
    inner: Arc<ContextInner>,
    channel_counter: AtomicU64,
}

impl CudaIpcContext {
    /// 创建上下文；首次调用完成驱动初始化。
    pub fn new() -> Result<Self, WeftError> {
        cuda::ensure_initialized()?;
        Ok(Self {
            inner: Arc::new(ContextInner {
                core: ContextCore::new("cuda-ipc")?,
                devices: Mutex::new(HashMap::new()),
                allocations: Mutex::new(HashMap::new()),
            }),
            channel_counter: AtomicU64::new(0),
        })
    }

    /// 在两条控制连接上装配通道：`reply` 承载回执，`ack` 承载确认。
    pub fn create_channel(
        &self,
        reply_connection: Arc<dyn Connection>,
        ack_connection: Arc<dyn Connection>,
    ) -> CudaIpcChannel {
        let serial = self.channel_counter.fetch_add(1, Ordering::Relaxed);
        let id = format!("{}.ch{serial}", self.inner.core.id());
        CudaIpcChannel::new(
            Arc::clone(&self.inner),
            reply_connection,
            ack_connection,
            id,
        )
    }

    /// 触发上下文关闭广播；幂等。
    pub fn close(&self) {
        self.inner.core.close();
    }

    /// 关闭并等待全部通道排空，随后释放设备资源。
    pub fn join(&self) {
        self.inner.core.join();
        self.inner.release_allocations();
    }
}
