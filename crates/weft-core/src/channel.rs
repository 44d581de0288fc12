use bytes::Bytes;

use crate::error::WeftError;

/// 描述符：标识一次发送的透明字节串，经带外途径送达对端、由配对的接收消费。
pub type Descriptor = Bytes;

/// 发送完成回调：恰好调用一次，携带成功或通道错误。
pub type SendCallback = Box<dyn FnOnce(Result<(), WeftError>) + Send + 'static>;

/// 接收完成回调：恰好调用一次；成功时归还后端定义的返回值（例如写满的缓冲）。
pub type RecvCallback<T> = Box<dyn FnOnce(Result<T, WeftError>) + Send + 'static>;

/// 点对点通道的公开契约。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 对调用方隐藏搬运字节所用的物理机制（套接字、共享内存、设备间拷贝）；
///   不同后端以关联类型声明各自的缓冲形态，公开动词保持一致。
///
/// ## 契约说明（What）
/// - `send`：同步返回描述符（透明字节串）；`callback` 稍后恰好触发一次。
///   返回 `Err` 仅发生在通道/设备已处于错误态时——此时回调同样会以该错误触发，
///   不存在被静默丢弃的操作。
/// - `recv`：异步；携带对端转交的描述符与本地目标缓冲，回调恰好触发一次。
/// - `close`：幂等；在途与后续操作的回调都以 `channel.closed` 收尾。
/// - **不变量**：同方向内回调严格按提交顺序触发；错误槽单调（首错获胜、永不清空）。
///
/// ## 风险提示（Trade-offs）
/// - 回调里抛出的 panic 不属于契约：通道已经履行了"恰好调用一次"的义务，
///   事件循环会捕获并记录，不会波及其余在途操作。
pub trait Channel: Send + Sync + 'static {
    /// 发送缓冲的形态（主机字节、设备指针等）。
    type SendBuffer: Send + 'static;
    /// 接收目标缓冲的形态。
    type RecvBuffer: Send + 'static;
    /// 接收成功时经回调归还的值。
    type RecvReturn: Send + 'static;

    /// 提交一次发送，立即返回描述符。
    fn send(
        &self,
        buffer: Self::SendBuffer,
        callback: SendCallback,
    ) -> Result<Descriptor, WeftError>;

    /// 提交一次接收。
    fn recv(
        &self,
        descriptor: Descriptor,
        buffer: Self::RecvBuffer,
        callback: RecvCallback<Self::RecvReturn>,
    );

    /// 重命名，仅影响日志。
    fn set_id(&self, id: String);

    /// 关闭通道；幂等。
    fn close(&self);
}
