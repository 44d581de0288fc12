use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;

/// `WeftError` 表示 weft 内核统一的错误域。
///
/// # 设计背景（Why）
/// - 通道/监听器的回调链路需要跨层传递稳定的错误码，以便日志与上层调度系统进行机器可读的根因识别。
/// - 通道持有一个粘性错误槽：首个错误一旦写入便不可覆盖，且之后每一个在途回调都要观测到**同一个**错误。
///   因此错误必须可以低成本克隆，内部以 `Arc` 共享载荷。
///
/// # 逻辑解析（How）
/// - `code` 字段承载稳定错误码（见 [`codes`]），`message` 面向人类调试；`cause` 为可选的底层错误链。
/// - `Display` 输出固定为 `[code] message`，适合直接进入结构化日志的 message 字段。
///
/// # 契约说明（What）
/// - **前置条件**：调用方应保证错误码在 [`codes`] 模块中声明，或遵守约定的 `namespace.action` 形式。
/// - **后置条件**：克隆得到的副本与原件共享同一载荷，`code()`/`message()` 永远一致。
///
/// # 设计取舍与风险（Trade-offs）
/// - 采用 `String` 储存消息，牺牲少量分配成本换取拼装上下文的灵活性。
/// - `cause` 仅保留一层装箱引用，更深的链路由各层 `source()` 递归表达。
#[derive(Clone)]
pub struct WeftError {
    inner: Arc<ErrorInner>,
}

struct ErrorInner {
    code: &'static str,
    message: String,
    cause: Option<Box<dyn StdError + Send + Sync + 'static>>,
}

impl WeftError {
    /// 使用稳定错误码与消息创建 `WeftError`。
    pub fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(ErrorInner {
                code,
                message: message.into(),
                cause: None,
            }),
        }
    }

    /// 创建携带底层原因的 `WeftError`，形成错误链。
    pub fn wrap(
        code: &'static str,
        message: impl Into<String>,
        cause: impl StdError + Send + Sync + 'static,
    ) -> Self {
        Self {
            inner: Arc::new(ErrorInner {
                code,
                message: message.into(),
                cause: Some(Box::new(cause)),
            }),
        }
    }

    /// 获取稳定错误码。
    pub fn code(&self) -> &'static str {
        self.inner.code
    }

    /// 获取人类可读的错误描述。
    pub fn message(&self) -> &str {
        &self.inner.message
    }

    /// 获取可选的底层原因。
    pub fn cause(&self) -> Option<&(dyn StdError + 'static)> {
        self.inner
            .cause
            .as_ref()
            .map(|boxed| boxed.as_ref() as &(dyn StdError + 'static))
    }
}

impl fmt::Display for WeftError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.inner.code, self.inner.message)
    }
}

impl fmt::Debug for WeftError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WeftError")
            .field("code", &self.inner.code)
            .field("message", &self.inner.message)
            .finish()
    }
}

impl StdError for WeftError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.cause()
    }
}

/// 内核内置的错误码常量集合，确保可观测性系统具有稳定识别符。
pub mod codes {
    /// 通道已关闭，在途与后续操作均以此收尾。
    pub const CHANNEL_CLOSED: &str = "channel.closed";
    /// 通道在操作在途时被整体取消。
    pub const CHANNEL_CANCELLED: &str = "channel.cancelled";
    /// 监听器已关闭，未完成的 accept 以此收尾。
    pub const LISTENER_CLOSED: &str = "listener.closed";
    /// 上下文关闭，广播至全部存活对象。
    pub const CONTEXT_CLOSED: &str = "context.closed";
    /// 传输层 I/O 错误。
    pub const CONNECTION_IO: &str = "connection.io";
    /// 对端在消息边界之外关闭了连接。
    pub const CONNECTION_EOF: &str = "connection.eof";
    /// 连接被本端主动关闭。
    pub const CONNECTION_CLOSED: &str = "connection.closed";
    /// 控制消息结构非法，无法解码。
    pub const PROTOCOL_DECODE: &str = "protocol.decode";
    /// 帧长度超出配置上限。
    pub const PROTOCOL_FRAME_TOO_LARGE: &str = "protocol.frame_too_large";
    /// 协议语义被违反（长度不匹配、序号错乱等）。
    pub const PROTOCOL_VIOLATION: &str = "protocol.violation";
    /// 设备驱动调用失败。
    pub const DEVICE_DRIVER: &str = "device.driver";
    /// 地址字符串缺少 scheme 或格式非法。
    pub const ADDRESS_INVALID: &str = "address.invalid";
    /// 事件循环线程无法创建。
    pub const LOOP_SPAWN: &str = "loop.spawn";
    /// 事件循环已经汇合，任务不再被受理。
    pub const LOOP_CLOSED: &str = "loop.closed";
}

/// 构造"通道已关闭"错误。
pub fn channel_closed() -> WeftError {
    WeftError::new(codes::CHANNEL_CLOSED, "channel was closed")
}

/// 构造"监听器已关闭"错误。
pub fn listener_closed() -> WeftError {
    WeftError::new(codes::LISTENER_CLOSED, "listener was closed")
}

/// 构造"上下文关闭"错误。
pub fn context_closed() -> WeftError {
    WeftError::new(codes::CONTEXT_CLOSED, "context is shutting down")
}

/// 通道与监听器共用的粘性错误槽。
///
/// # 设计背景（Why）
/// - 状态机的全部错误分支都以"错误槽是否已置位"为条件；第一个错误必须获胜，
///   之后的写入只能被忽略，否则在途回调会观测到互相矛盾的失败原因。
///
/// # 契约说明（What）
/// - `set` 仅在槽为空时写入并返回 `true`；已置位时返回 `false` 且不覆盖。
/// - `as_result` 把当前槽位翻译成回调可直接携带的 `Result`。
/// - **不变量**：槽位一旦非空便永不回到空，也永不被改写。
#[derive(Default)]
pub struct ErrorSlot {
    error: Option<WeftError>,
}

impl ErrorSlot {
    pub fn new() -> Self {
        Self { error: None }
    }

    /// 槽位是否已经置位。
    pub fn is_set(&self) -> bool {
        self.error.is_some()
    }

    /// 读取当前错误。
    pub fn error(&self) -> Option<&WeftError> {
        self.error.as_ref()
    }

    /// 尝试写入首个错误；仅当槽位为空时生效。
    pub fn set(&mut self, error: WeftError) -> bool {
        if self.error.is_some() {
            return false;
        }
        self.error = Some(error);
        true
    }

    /// 将槽位翻译为回调携带的结果。
    pub fn as_result(&self) -> Result<(), WeftError> {
        match &self.error {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_is_code_then_message() {
        let err = WeftError::new(codes::CHANNEL_CLOSED, "channel was closed");
        assert_eq!(err.to_string(), "[channel.closed] channel was closed");
    }

    #[test]
    fn slot_keeps_first_error() {
        let mut slot = ErrorSlot::new();
        assert!(slot.as_result().is_ok());
        assert!(slot.set(WeftError::new(codes::CONNECTION_EOF, "eof")));
        assert!(!slot.set(WeftError::new(codes::CHANNEL_CLOSED, "closed")));
        assert_eq!(slot.error().unwrap().code(), codes::CONNECTION_EOF);
        assert_eq!(
            slot.as_result().unwrap_err().code(),
            codes::CONNECTION_EOF
        );
    }

    #[test]
    fn wrap_exposes_source() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "boom");
        let err = WeftError::wrap(codes::CONNECTION_IO, "read failed", io);
        assert!(err.cause().is_some());
    }
}
