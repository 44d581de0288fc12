use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::net::TcpListener as TokioTcpListener;
use tokio::runtime::Handle;
use tokio::sync::Semaphore;
use tracing::trace;

use weft_core::{AcceptCallback, Connection, ContextCore, ListenerBackend, WeftError};

use crate::connection::TcpConnection;
use crate::error::{map_io_error, ACCEPT};
use crate::TcpOptions;

/// 核心监听器样板的 TCP 后端。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 样板负责序号与 FIFO 纪律，这里只剩一件事：把 tokio 监听套接字上到来的
///   连接与排队中的 accept 回调一一配对，并保证配对动作全部发生在事件循环线程上，
///   从而与关闭排空天然串行。
///
/// ## 逻辑解析（How）
/// - `accept_impl` 把回调压入待决队列并向接受任务发放一个信号量许可；
/// - 接受任务拿到许可后才调用 `accept`，避免接受无人认领的连接；
///   每个结果都以"投递闭包"形式转回事件循环，在循环上弹出队头回调完成配对；
/// - 关闭时样板调用 `handle_error_impl`：中止接受任务、就地按序排空待决回调；
///   已在循环队列里的投递闭包随后执行时会发现队列已空，把多余的连接直接关闭。
///
/// ## 风险提示（Trade-offs）
/// - 中止接受任务可能丢弃一个刚接受但尚未投递的套接字，对端表现为连接复位；
///   监听器既已关闭，这是预期行为。
pub struct TcpListenerBackend {
    pending: PendingAccepts,
    permits: Arc<Semaphore>,
    local_addr: SocketAddr,
    accept_task: tokio::task::JoinHandle<()>,
}

type PendingAccepts = Arc<Mutex<VecDeque<AcceptCallback<Arc<TcpConnection>>>>>;

impl TcpListenerBackend {
    pub(crate) fn bind(
        context: Arc<ContextCore>,
        handle: &Handle,
        addr: SocketAddr,
        options: TcpOptions,
        connection_counter: Arc<AtomicU64>,
        id: String,
    ) -> Result<Self, WeftError> {
        let listener = handle
            .block_on(TokioTcpListener::bind(addr))
            .map_err(|err| map_io_error(crate::error::BIND, err))?;
        let local_addr = listener
            .local_addr()
            .map_err(|err| map_io_error(crate::error::BIND, err))?;

        let pending: PendingAccepts = Arc::new(Mutex::new(VecDeque::new()));
        let permits = Arc::new(Semaphore::new(0));
        let accept_task = handle.spawn(accept_loop(
            listener,
            Arc::clone(&permits),
            Arc::clone(&pending),
            context,
            handle.clone(),
            options,
            connection_counter,
            id,
        ));

        Ok(Self {
            pending,
            permits,
            local_addr,
            accept_task,
        })
    }
}

impl ListenerBackend for TcpListenerBackend {
    type Conn = Arc<TcpConnection>;

    fn accept_impl(&mut self, callback: AcceptCallback<Arc<TcpConnection>>) {
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(callback);
        self.permits.add_permits(1);
    }

    fn addr_impl(&self) -> String {
        format!("tcp://{}", self.local_addr)
    }

    fn handle_error_impl(&mut self, error: &WeftError) {
        self.accept_task.abort();
        let drained: Vec<_> = self
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        for callback in drained {
            callback(Err(error.clone()));
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn accept_loop(
    listener: TokioTcpListener,
    permits: Arc<Semaphore>,
    pending: PendingAccepts,
    context: Arc<ContextCore>,
    handle: Handle,
    options: TcpOptions,
    connection_counter: Arc<AtomicU64>,
    id: String,
) {
    loop {
        match permits.acquire().await {
            Ok(permit) => permit.forget(),
            Err(_) => return,
        }
        let delivery = match listener.accept().await {
            Ok((stream, peer)) => {
                let serial = connection_counter.fetch_add(1, Ordering::Relaxed);
                let conn_id = format!("{id}.c{serial}");
                trace!(listener = %id, connection = %conn_id, peer = %peer, "accepted a connection");
                Ok(TcpConnection::spawn(
                    &handle,
                    stream,
                    options.max_frame_len(),
                    conn_id,
                ))
            }
            Err(err) => Err(map_io_error(ACCEPT, err)),
        };
        let pending = Arc::clone(&pending);
        context.event_loop().defer(move || {
            let callback = pending
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .pop_front();
            match callback {
                Some(callback) => callback(delivery),
                None => {
                    // 监听器已关闭排空；多余的连接就地关闭。
                    if let Ok(conn) = delivery {
                        conn.close();
                    }
                }
            }
        });
    }
}
