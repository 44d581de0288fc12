use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tracing::trace;

use weft_core::{Connection, ReadCallback, WriteCallback, WeftError};

use crate::error::{closed_error, map_io_error, READ, WRITE};

/// 长度成帧的 TCP 连接，满足内核对控制流的 FIFO 完成序契约。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 通道状态机要求：同一方向上先发起的读/写先完成，失败后在途与后续
///   请求全部按序以错误收尾。把每个方向的请求收进一条队列、由一个专属
///   任务顺序消费，保序便不再依赖任何调用方纪律。
///
/// ## 逻辑解析（How）
/// - 连接拆成读写两半，各配一条无界请求队列与一个 tokio 任务；
/// - 帧格式为 u64 小端长度前缀 + 负载；读任务对长度做上限校验；
/// - `close` 通过 watch 信号打断在途 I/O：任务随即丢弃持有的半部
///   （促使对端观测到流终止），再把排队中的请求逐个以错误收尾；
/// - 首个错误同时落入连接级失败槽，之后的 `read`/`write` 在提交线程
///   上直接快速失败。
///
/// ## 契约说明（What）
/// - 每个回调恰好调用一次；完成顺序等于发起顺序（含失败路径）；
/// - 回调可能在 tokio 工作线程或提交线程上触发，调用方自行转投循环；
/// - `close` 幂等。
///
/// ## 风险提示（Trade-offs）
/// - 无界队列意味着背压交由上层（通道每方向同时至多一帧在途，天然有界）；
/// - 写任务对每帧执行两次 `write_all`，小消息吞吐换取实现简单，
///   控制流消息的尺寸让这笔开销可以忽略。
#[derive(Debug)]
pub struct TcpConnection {
    inner: Arc<ConnectionInner>,
}

#[derive(Debug)]
struct ConnectionInner {
    id: String,
    read_tx: mpsc::UnboundedSender<ReadRequest>,
    write_tx: mpsc::UnboundedSender<WriteRequest>,
    shutdown: watch::Sender<bool>,
    failed: FailSlot,
}

struct ReadRequest {
    callback: ReadCallback,
}

struct WriteRequest {
    payload: Bytes,
    callback: WriteCallback,
}

impl TcpConnection {
    /// 把已建立的套接字装配为成帧连接，并在运行时上启动读写任务。
    pub(crate) fn spawn(
        handle: &Handle,
        stream: TcpStream,
        max_frame_len: u64,
        id: String,
    ) -> Arc<Self> {
        let (read_half, write_half) = stream.into_split();
        let (read_tx, read_rx) = mpsc::unbounded_channel();
        let (write_tx, write_rx) = mpsc::unbounded_channel();
        let (shutdown, shutdown_rx) = watch::channel(false);

        let failed: FailSlot = Arc::new(Mutex::new(None));
        handle.spawn(read_loop(
            read_half,
            read_rx,
            shutdown_rx.clone(),
            Arc::clone(&failed),
            max_frame_len,
        ));
        handle.spawn(write_loop(write_half, write_rx, shutdown_rx, Arc::clone(&failed)));

        trace!(connection = %id, "connection is up");
        Arc::new(Self {
            inner: Arc::new(ConnectionInner {
                id,
                read_tx,
                write_tx,
                shutdown,
                failed,
            }),
        })
    }

    /// 日志用标识。
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    fn current_failure(&self) -> Option<WeftError> {
        self.inner
            .failed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

impl Connection for TcpConnection {
    fn read(&self, callback: ReadCallback) {
        if let Some(error) = self.current_failure() {
            callback(Err(error));
            return;
        }
        if let Err(rejected) = self.inner.read_tx.send(ReadRequest { callback }) {
            (rejected.0.callback)(Err(closed_error()));
        }
    }

    fn write(&self, payload: Bytes, callback: WriteCallback) {
        if let Some(error) = self.current_failure() {
            callback(Err(error));
            return;
        }
        if let Err(rejected) = self.inner.write_tx.send(WriteRequest { payload, callback }) {
            (rejected.0.callback)(Err(closed_error()));
        }
    }

    fn close(&self) {
        record_failure(&self.inner.failed, &closed_error());
        if self.inner.shutdown.send_replace(true) {
            return;
        }
        trace!(connection = %self.inner.id, "connection is closing");
    }
}

type FailSlot = Arc<Mutex<Option<WeftError>>>;

fn record_failure(slot: &FailSlot, error: &WeftError) {
    let mut failed = slot.lock().unwrap_or_else(|e| e.into_inner());
    if failed.is_none() {
        *failed = Some(error.clone());
    }
}

async fn read_loop(
    mut half: OwnedReadHalf,
    mut requests: mpsc::UnboundedReceiver<ReadRequest>,
    mut shutdown: watch::Receiver<bool>,
    failed: FailSlot,
    max_frame_len: u64,
) {
    let error = loop {
        let request = tokio::select! {
            biased;
            _ = shutdown.changed() => break closed_error(),
            request = requests.recv() => match request {
                Some(request) => request,
                None => return,
            },
        };
        let outcome = tokio::select! {
            biased;
            _ = shutdown.changed() => Err(closed_error()),
            outcome = read_frame(&mut half, max_frame_len) => outcome,
        };
        match outcome {
            Ok(payload) => (request.callback)(Ok(payload)),
            Err(error) => {
                (request.callback)(Err(error.clone()));
                break error;
            }
        }
    };
    record_failure(&failed, &error);
    drop(half);
    requests.close();
    while let Some(request) = requests.recv().await {
        (request.callback)(Err(error.clone()));
    }
}

async fn read_frame(half: &mut OwnedReadHalf, max_frame_len: u64) -> Result<Bytes, WeftError> {
    let mut header = [0u8; 8];
    half.read_exact(&mut header)
        .await
        .map_err(|err| map_io_error(READ, err))?;
    let len = u64::from_le_bytes(header);
    if len > max_frame_len {
        return Err(crate::error::TcpTransportError::FrameTooLarge {
            len,
            max: max_frame_len,
        }
        .into());
    }
    let mut payload = vec![0u8; len as usize];
    half.read_exact(&mut payload)
        .await
        .map_err(|err| map_io_error(READ, err))?;
    Ok(Bytes::from(payload))
}

async fn write_loop(
    mut half: OwnedWriteHalf,
    mut requests: mpsc::UnboundedReceiver<WriteRequest>,
    mut shutdown: watch::Receiver<bool>,
    failed: FailSlot,
) {
    let error = loop {
        let request = tokio::select! {
            biased;
            _ = shutdown.changed() => break closed_error(),
            request = requests.recv() => match request {
                Some(request) => request,
                None => return,
            },
        };
        let outcome = tokio::select! {
            biased;
            _ = shutdown.changed() => Err(closed_error()),
            outcome = write_frame(&mut half, &request.payload) => outcome,
        };
        match outcome {
            Ok(()) => (request.callback)(Ok(())),
            Err(error) => {
                (request.callback)(Err(error.clone()));
                break error;
            }
        }
    };
    record_failure(&failed, &error);
    drop(half);
    requests.close();
    while let Some(request) = requests.recv().await {
        (request.callback)(Err(error.clone()));
    }
}

async fn write_frame(half: &mut OwnedWriteHalf, payload: &Bytes) -> Result<(), WeftError> {
    let header = (payload.len() as u64).to_le_bytes();
    half.write_all(&header)
        .await
        .map_err(|err| map_io_error(WRITE, err))?;
    half.write_all(payload)
        .await
        .map_err(|err| map_io_error(WRITE, err))?;
    half.flush().await.map_err(|err| map_io_error(WRITE, err))
}
