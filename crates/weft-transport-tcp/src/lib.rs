#![doc = r#"
# weft-transport-tcp

## 模块使命（Why）
- **承载控制流**：为通道层提供一条可靠、保序、长度成帧的字节流连接，
  满足 `weft-core` 对 FIFO 完成序与恰好一次回调的契约。
- **承载监听**：以核心监听器样板 + TCP 后端的组合交付"按提交顺序接受连接"的语义。

## 核心契约（What）
- `TcpContext` 拥有独立的 tokio 运行时与一个上下文骨架（事件循环、关闭广播、登记表）；
- `connect` 同步建立连接并返回成帧的 [`TcpConnection`]；
- `listen` 绑定地址并返回 [`TcpListener`]，其 `accept`/`addr`/`close` 契约由样板统一保证；
- 地址同时接受 `tcp://host:port` 与裸 `host:port` 两种写法。

## 实现策略（How）
- 套接字读写直接委托给 tokio，成帧与 FIFO 排队在连接内部完成；
- 监听接受循环只在有人排队等待时才真正 `accept`，结果经事件循环与回调配对；
- 所有 I/O 错误经 `error` 模块映射为稳定错误码。
"#]

mod connection;
mod error;
mod listener;

pub use connection::TcpConnection;
pub use error::TcpTransportError;
pub use listener::TcpListenerBackend;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::net::TcpStream;
use tokio::runtime::{Builder, Runtime};
use tracing::trace;

use weft_core::{codes, split_scheme_of_url, ContextCore, Listener, WeftError};

use crate::error::{map_io_error, CONNECT};

/// 监听器类型别名：核心样板套上 TCP 后端。
pub type TcpListener = Listener<TcpListenerBackend>;

/// TCP 传输的静态配置。
#[derive(Clone, Copy, Debug)]
pub struct TcpOptions {
    max_frame_len: u64,
}

impl TcpOptions {
    /// 默认配置：单帧上限 1 GiB。
    pub const fn new() -> Self {
        Self {
            max_frame_len: 1 << 30,
        }
    }

    /// 设置单帧长度上限，超限的入站帧以 `protocol.frame_too_large` 失败。
    pub fn with_max_frame_len(mut self, max_frame_len: u64) -> Self {
        self.max_frame_len = max_frame_len;
        self
    }

    /// 读取当前单帧上限。
    pub fn max_frame_len(&self) -> u64 {
        self.max_frame_len
    }
}

impl Default for TcpOptions {
    fn default() -> Self {
        Self::new()
    }
}

/// TCP 传输上下文：运行时、事件循环与存活对象登记的所有者。
///
/// # 契约说明（What）
/// - `connect`/`listen` 可从任意线程调用；
/// - `close` 幂等，触发关闭广播（监听器随之排空）；
/// - `join` 等待全部监听器退场后汇合事件循环，再后台回收运行时；
///   调用方应当先关闭由本上下文产出的连接所服务的通道。
pub struct TcpContext {
    core: Arc<ContextCore>,
    runtime: Mutex<Option<Runtime>>,
    handle: tokio::runtime::Handle,
    options: TcpOptions,
    connection_counter: Arc<AtomicU64>,
    listener_counter: AtomicU64,
}

impl TcpContext {
    /// 以默认配置创建上下文。
    pub fn new() -> Result<Self, WeftError> {
        Self::with_options(TcpOptions::new())
    }

    /// 以指定配置创建上下文。
    pub fn with_options(options: TcpOptions) -> Result<Self, WeftError> {
        let core = ContextCore::new("tcp")?;
        let runtime = Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("weft-tcp")
            .enable_all()
            .build()
            .map_err(|err| {
                WeftError::wrap(codes::CONNECTION_IO, "failed to build tokio runtime", err)
            })?;
        let handle = runtime.handle().clone();
        Ok(Self {
            core,
            runtime: Mutex::new(Some(runtime)),
            handle,
            options,
            connection_counter: Arc::new(AtomicU64::new(0)),
            listener_counter: AtomicU64::new(0),
        })
    }

    /// 连接到对端监听器，同步返回成帧连接。
    pub fn connect(&self, addr: &str) -> Result<Arc<TcpConnection>, WeftError> {
        let target = parse_addr(addr)?;
        let stream = self
            .handle
            .block_on(TcpStream::connect(target))
            .map_err(|err| map_io_error(CONNECT, err))?;
        let serial = self.connection_counter.fetch_add(1, Ordering::Relaxed);
        let id = format!("{}.c{serial}", self.core.id());
        trace!(context = %self.core.id(), connection = %id, peer = %target, "connected");
        Ok(TcpConnection::spawn(
            &self.handle,
            stream,
            self.options.max_frame_len(),
            id,
        ))
    }

    /// 绑定地址并返回监听器。
    pub fn listen(&self, addr: &str) -> Result<TcpListener, WeftError> {
        let target = parse_addr(addr)?;
        let serial = self.listener_counter.fetch_add(1, Ordering::Relaxed);
        let id = format!("{}.l{serial}", self.core.id());
        let backend = TcpListenerBackend::bind(
            Arc::clone(&self.core),
            &self.handle,
            target,
            self.options,
            Arc::clone(&self.connection_counter),
            id.clone(),
        )?;
        Ok(Listener::new(Arc::clone(&self.core), backend, id))
    }

    /// 触发上下文关闭广播；幂等。
    pub fn close(&self) {
        self.core.close();
    }

    /// 关闭并等待全部对象退场，随后回收运行时。
    pub fn join(&self) {
        self.core.join();
        let runtime = self
            .runtime
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(runtime) = runtime {
            runtime.shutdown_background();
        }
    }
}

fn parse_addr(addr: &str) -> Result<SocketAddr, WeftError> {
    let rest = if addr.contains("://") {
        let (scheme, rest) = split_scheme_of_url(addr)?;
        if scheme != "tcp" {
            return Err(WeftError::new(
                codes::ADDRESS_INVALID,
                format!("unsupported scheme `{scheme}`"),
            ));
        }
        rest
    } else {
        addr
    };
    rest.parse().map_err(|_| {
        WeftError::new(
            codes::ADDRESS_INVALID,
            format!("not a socket address: {rest}"),
        )
    })
}
