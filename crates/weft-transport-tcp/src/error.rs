//! # error 模块说明
//!
//! ## 角色定位（Why）
//! - 为 TCP 传输暴露的错误语义提供集中定义，确保与 `weft-core::WeftError` 对齐；
//! - 区分 I/O 故障、对端流终止、本端关闭与帧超限四类根因，方便上层状态机
//!   选择"排空"还是"报协议错"。
//!
//! ## 设计要求（What）
//! - 枚举实现 `thiserror::Error` 以兼容 `std::error::Error` 生态；
//! - 经 `From` 转换为 [`WeftError`] 时挑选稳定错误码，`?` 在传输内部直接生效。

use std::io;

use thiserror::Error;
use weft_core::{codes, WeftError};

/// 错误语境常量：标注失败发生在哪一步。
pub(crate) const CONNECT: &str = "connect";
pub(crate) const BIND: &str = "bind";
pub(crate) const ACCEPT: &str = "accept";
pub(crate) const READ: &str = "read";
pub(crate) const WRITE: &str = "write";

/// TCP 传输错误域。
#[derive(Debug, Error)]
pub enum TcpTransportError {
    /// 底层套接字 I/O 失败。
    #[error("i/o failure during `{op}`")]
    Io {
        op: &'static str,
        #[source]
        source: io::Error,
    },

    /// 对端在消息边界之外终止了字节流。
    #[error("peer closed the stream during `{op}`")]
    Eof { op: &'static str },

    /// 连接被本端关闭，在途与后续操作以此收尾。
    #[error("connection was closed locally")]
    Closed,

    /// 帧长度超出配置上限，视为协议违例而非资源问题。
    #[error("frame of {len} bytes exceeds the {max} byte limit")]
    FrameTooLarge { len: u64, max: u64 },
}

impl From<TcpTransportError> for WeftError {
    fn from(value: TcpTransportError) -> Self {
        match value {
            TcpTransportError::Io { op, source } => {
                WeftError::wrap(codes::CONNECTION_IO, format!("i/o failure during `{op}`"), source)
            }
            TcpTransportError::Eof { op } => WeftError::new(
                codes::CONNECTION_EOF,
                format!("peer closed the stream during `{op}`"),
            ),
            TcpTransportError::Closed => {
                WeftError::new(codes::CONNECTION_CLOSED, "connection was closed locally")
            }
            TcpTransportError::FrameTooLarge { len, max } => WeftError::new(
                codes::PROTOCOL_FRAME_TOO_LARGE,
                format!("frame of {len} bytes exceeds the {max} byte limit"),
            ),
        }
    }
}

/// 把套接字错误映射进统一错误域；干净的 EOF 单独归类。
pub(crate) fn map_io_error(op: &'static str, err: io::Error) -> WeftError {
    if err.kind() == io::ErrorKind::UnexpectedEof {
        TcpTransportError::Eof { op }.into()
    } else {
        TcpTransportError::Io { op, source: err }.into()
    }
}

/// 本端关闭错误。
pub(crate) fn closed_error() -> WeftError {
    TcpTransportError::Closed.into()
}
