//! 传输契约：字节流连接与监听器样板。
//!
//! # 模块定位（Why）
//! - 通道层只通过这里的契约触碰底层传输：一条可靠、保序的字节流连接，
//!   外加一个按提交顺序交付连接的监听器。
//! - 具体传输（TCP、共享内存等）在各自 crate 中实现 [`Connection`] 与
//!   [`ListenerBackend`]，监听器的序号纪律与错误收尾由本模块的样板统一承担。

mod listener;

pub use listener::{AcceptCallback, Listener, ListenerBackend};

use bytes::Bytes;

use crate::error::{codes, WeftError};

/// 读完成回调：恰好调用一次，成功携带一条完整消息。
pub type ReadCallback = Box<dyn FnOnce(Result<Bytes, WeftError>) + Send + 'static>;

/// 写完成回调：恰好调用一次。
pub type WriteCallback = Box<dyn FnOnce(Result<(), WeftError>) + Send + 'static>;

/// 可靠、保序、长度成帧的双向字节流连接。
///
/// # 契约说明（What）
/// - `read` 发起读取一条完整消息；`write` 发起写出一条完整消息；
///   两者都立即返回，完成时恰好调用一次回调（可能在任意线程上）。
/// - **FIFO 完成序**：同一方向上，先发起的操作先完成；这是通道状态机
///   控制流保序的根基，任何实现都必须满足。
/// - 连接失败后，在途与后续操作的回调都以错误收尾，顺序仍为发起顺序。
/// - `close` 幂等；关闭会打断在途操作并使对端观测到流终止。
///
/// # 风险提示（Trade-offs）
/// - 回调的调用线程不作保证，调用方（通道层）负责把完成转投回自己的事件循环。
pub trait Connection: Send + Sync + 'static {
    /// 发起读取一条消息。
    fn read(&self, callback: ReadCallback);

    /// 发起写出一条消息。
    fn write(&self, payload: Bytes, callback: WriteCallback);

    /// 关闭连接；幂等。
    fn close(&self);
}

/// 拆分 `scheme://rest` 形式的地址。
pub fn split_scheme_of_url(addr: &str) -> Result<(&str, &str), WeftError> {
    match addr.split_once("://") {
        Some((scheme, rest)) => Ok((scheme, rest)),
        None => Err(WeftError::new(
            codes::ADDRESS_INVALID,
            format!("address has no scheme: {addr}"),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_scheme_accepts_well_formed_urls() {
        let (scheme, rest) = split_scheme_of_url("tcp://127.0.0.1:0").unwrap();
        assert_eq!(scheme, "tcp");
        assert_eq!(rest, "127.0.0.1:0");
    }

    #[test]
    fn split_scheme_rejects_bare_addresses() {
        let err = split_scheme_of_url("127.0.0.1:0").unwrap_err();
        assert_eq!(err.code(), codes::ADDRESS_INVALID);
    }
}
