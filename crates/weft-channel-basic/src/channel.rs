use std::mem;
use std::sync::{Arc, Mutex};

use bytes::{Bytes, BytesMut};
use tracing::{debug, trace};

use weft_core::{
    attempt, channel_closed, codes, prev_at_least, Channel, ClosingReceiver, Connection,
    ContextCore, Descriptor, ErrorSlot, OpQueue, Operation, RecvCallback, SendCallback, WeftError,
};

/// 主机内存通道：负载作为一帧经由通道自己的连接搬运。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 为纯主机字节提供一个无需任何设备机制的搬运后端；
///   它与 CUDA IPC 后端共享同一套操作队列与条件转移引擎，只是动作不同——
///   发送方把负载按操作顺序写成帧，接收方按同样的顺序逐帧读入目标缓冲。
///
/// ## 逻辑解析（How）
/// - 发送：UNINITIALIZED → WRITING_PAYLOAD → FINISHED。
///   进入 WRITING_PAYLOAD 需要前驱已发起写（帧序 = 操作序）；写完成置
///   `done_writing_payload` 并推进，FINISHED 时触发用户回调。
/// - 接收：UNINITIALIZED → READING_PAYLOAD → FINISHED。
///   进入 READING_PAYLOAD 需要前驱已发起读；读完成校验帧长等于目标缓冲长，
///   不符视为 `protocol.violation` 落入错误槽；FINISHED 时拷贝负载并触发回调。
/// - 描述符为空字节串：本后端不经带外途径传递任何信息，配对完全依赖两侧
///   提交顺序一致——这正是帧序所保证的。
/// - 错误路径：任何完成报错 → 错误落槽（首错获胜）→ 两个方向 `advance_all`
///   排空 → 关闭连接 → 注销上下文登记。错误转移同样要求前驱先完结，
///   回调因此在任何交错下都严格按序号触发。
///
/// ## 契约说明（What）
/// - `send` 同步返回描述符；通道已在错误态时返回该错误，且回调仍会触发一次；
/// - 用户回调经事件循环投递：在回调里重入通道 API 不会自锁；
/// - `close` 幂等，句柄析构等价于一次 `close`。
pub struct BasicChannel {
    shared: Arc<ChannelShared>,
}

struct ChannelShared {
    context: Arc<ContextCore>,
    state: Mutex<ChannelState>,
}

struct ChannelState {
    id: String,
    connection: Arc<dyn Connection>,
    error: ErrorSlot,
    send_ops: OpQueue<SendOp>,
    recv_ops: OpQueue<RecvOp>,
    closing: Option<ClosingReceiver>,
    enrolled: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
enum SendState {
    Uninitialized,
    WritingPayload,
    Finished,
}

struct SendOp {
    sequence: u64,
    state: SendState,
    callback: Option<SendCallback>,
    payload: Option<Bytes>,
    done_writing_payload: bool,
}

impl Operation for SendOp {
    type State = SendState;
    const TERMINAL: SendState = SendState::Finished;

    fn sequence(&self) -> u64 {
        self.sequence
    }
    fn state(&self) -> SendState {
        self.state
    }
    fn set_state(&mut self, next: SendState) {
        self.state = next;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
enum RecvState {
    Uninitialized,
    ReadingPayload,
    Finished,
}

struct RecvOp {
    sequence: u64,
    state: RecvState,
    callback: Option<RecvCallback<BytesMut>>,
    buffer: Option<BytesMut>,
    payload: Option<Bytes>,
    done_reading_payload: bool,
}

impl Operation for RecvOp {
    type State = RecvState;
    const TERMINAL: RecvState = RecvState::Finished;

    fn sequence(&self) -> u64 {
        self.sequence
    }
    fn state(&self) -> RecvState {
        self.state
    }
    fn set_state(&mut self, next: RecvState) {
        self.state = next;
    }
}

impl BasicChannel {
    pub(crate) fn new(
        context: Arc<ContextCore>,
        connection: Arc<dyn Connection>,
        id: String,
    ) -> Self {
        context.enroll();
        let shared = Arc::new(ChannelShared {
            context,
            state: Mutex::new(ChannelState {
                id,
                connection,
                error: ErrorSlot::new(),
                send_ops: OpQueue::new(),
                recv_ops: OpQueue::new(),
                closing: None,
                enrolled: true,
            }),
        });

        let init = Arc::clone(&shared);
        shared.context.event_loop().defer(move || {
            let weak = Arc::downgrade(&init);
            let receiver = init.context.closing().subscribe(move || {
                if let Some(shared) = weak.upgrade() {
                    let target = Arc::clone(&shared);
                    shared.context.event_loop().defer(move || {
                        ChannelShared::close_from_loop(&target);
                    });
                }
            });
            init.state.lock().unwrap_or_else(|e| e.into_inner()).closing = Some(receiver);
        });

        Self { shared }
    }
}

impl Channel for BasicChannel {
    type SendBuffer = Bytes;
    type RecvBuffer = BytesMut;
    type RecvReturn = BytesMut;

    fn send(&self, buffer: Bytes, callback: SendCallback) -> Result<Descriptor, WeftError> {
        let shared = Arc::clone(&self.shared);
        self.shared
            .context
            .event_loop()
            .run_in_loop(move || ChannelShared::send_from_loop(&shared, buffer, callback))?
    }

    fn recv(&self, descriptor: Descriptor, buffer: BytesMut, callback: RecvCallback<BytesMut>) {
        let shared = Arc::clone(&self.shared);
        self.shared.context.event_loop().defer(move || {
            ChannelShared::recv_from_loop(&shared, descriptor, buffer, callback);
        });
    }

    fn set_id(&self, id: String) {
        let shared = Arc::clone(&self.shared);
        self.shared.context.event_loop().defer(move || {
            let mut state = shared.state.lock().unwrap_or_else(|e| e.into_inner());
            trace!(channel = %state.id, new_id = %id, "channel was renamed");
            state.id = id;
        });
    }

    fn close(&self) {
        let shared = Arc::clone(&self.shared);
        self.shared.context.event_loop().defer(move || {
            ChannelShared::close_from_loop(&shared);
        });
    }
}

impl Drop for BasicChannel {
    fn drop(&mut self) {
        Channel::close(self);
    }
}

impl ChannelShared {
    fn send_from_loop(
        shared: &Arc<Self>,
        payload: Bytes,
        callback: SendCallback,
    ) -> Result<Descriptor, WeftError> {
        debug_assert!(shared.context.event_loop().in_loop());
        let mut state = shared.state.lock().unwrap_or_else(|e| e.into_inner());

        let pre_error = state.error.as_result().err();
        let sequence = state.send_ops.emplace_back(|sequence| SendOp {
            sequence,
            state: SendState::Uninitialized,
            callback: Some(callback),
            payload: Some(payload),
            done_writing_payload: false,
        });
        trace!(channel = %state.id, sequence, "received a send request");
        Self::advance_send(&mut state, shared, sequence);

        match pre_error {
            Some(error) => Err(error),
            None => Ok(Descriptor::new()),
        }
    }

    fn recv_from_loop(
        shared: &Arc<Self>,
        _descriptor: Descriptor,
        buffer: BytesMut,
        callback: RecvCallback<BytesMut>,
    ) {
        debug_assert!(shared.context.event_loop().in_loop());
        let mut state = shared.state.lock().unwrap_or_else(|e| e.into_inner());

        let sequence = state.recv_ops.emplace_back(|sequence| RecvOp {
            sequence,
            state: RecvState::Uninitialized,
            callback: Some(callback),
            buffer: Some(buffer),
            payload: None,
            done_reading_payload: false,
        });
        trace!(channel = %state.id, sequence, "received a recv request");
        Self::advance_recv(&mut state, shared, sequence);
    }

    fn close_from_loop(shared: &Arc<Self>) {
        debug_assert!(shared.context.event_loop().in_loop());
        let mut state = shared.state.lock().unwrap_or_else(|e| e.into_inner());
        Self::set_error_from_loop(&mut state, shared, channel_closed());
    }

    /// 首错落槽并执行错误收尾；后续错误被忽略。
    fn set_error_from_loop(state: &mut ChannelState, shared: &Arc<Self>, error: WeftError) {
        if !state.error.set(error) {
            return;
        }
        debug!(channel = %state.id, error = %state.error.error().unwrap(), "channel is handling an error");

        Self::advance_send_all(state, shared);
        Self::advance_recv_all(state, shared);

        state.connection.close();
        state.closing = None;
        if state.enrolled {
            state.enrolled = false;
            shared.context.unenroll();
        }
    }

    // ---- 发送方向 ----

    fn advance_send(state: &mut ChannelState, shared: &Arc<Self>, sequence: u64) {
        let mut ops = mem::take(&mut state.send_ops);
        ops.advance(sequence, |op, prev| {
            Self::advance_one_send(state, shared, op, prev)
        });
        state.send_ops = ops;
    }

    fn advance_send_all(state: &mut ChannelState, shared: &Arc<Self>) {
        let mut ops = mem::take(&mut state.send_ops);
        ops.advance_all(|op, prev| Self::advance_one_send(state, shared, op, prev));
        state.send_ops = ops;
    }

    fn advance_one_send(
        state: &mut ChannelState,
        shared: &Arc<Self>,
        op: &mut SendOp,
        prev: Option<SendState>,
    ) -> bool {
        let error_set = state.error.is_set();
        let done_writing = op.done_writing_payload;
        let mut moved = false;

        moved |= attempt(
            op,
            SendState::Uninitialized,
            SendState::Finished,
            error_set && prev_at_least(prev, SendState::Finished),
            |op| Self::call_send_callback(state, shared, op),
        );

        // 帧序即操作序：发起写必须排在前驱之后。
        moved |= attempt(
            op,
            SendState::Uninitialized,
            SendState::WritingPayload,
            !error_set && prev_at_least(prev, SendState::WritingPayload),
            |op| Self::write_payload(state, shared, op),
        );

        moved |= attempt(
            op,
            SendState::WritingPayload,
            SendState::Finished,
            done_writing && prev_at_least(prev, SendState::Finished),
            |op| Self::call_send_callback(state, shared, op),
        );

        moved
    }

    fn write_payload(state: &mut ChannelState, shared: &Arc<Self>, op: &mut SendOp) {
        let payload = op.payload.take().unwrap_or_default();
        let sequence = op.sequence;
        trace!(channel = %state.id, sequence, len = payload.len(), "writing payload");

        let weak = Arc::downgrade(shared);
        state.connection.write(
            payload,
            Box::new(move |result| {
                if let Some(shared) = weak.upgrade() {
                    let target = Arc::clone(&shared);
                    shared.context.event_loop().defer(move || {
                        Self::on_payload_written(&target, sequence, result);
                    });
                }
            }),
        );
    }

    fn on_payload_written(shared: &Arc<Self>, sequence: u64, result: Result<(), WeftError>) {
        let mut state = shared.state.lock().unwrap_or_else(|e| e.into_inner());
        trace!(channel = %state.id, sequence, "done writing payload");
        if let Err(error) = result {
            Self::set_error_from_loop(&mut state, shared, error);
        }
        if let Some(op) = state.send_ops.get_mut(sequence) {
            op.done_writing_payload = true;
        }
        Self::advance_send(&mut state, shared, sequence);
    }

    fn call_send_callback(state: &mut ChannelState, shared: &Arc<Self>, op: &mut SendOp) {
        let result = state.error.as_result();
        trace!(channel = %state.id, sequence = op.sequence, "calling a send callback");
        if let Some(callback) = op.callback.take() {
            shared.context.event_loop().defer(move || callback(result));
        }
    }

    // ---- 接收方向 ----

    fn advance_recv(state: &mut ChannelState, shared: &Arc<Self>, sequence: u64) {
        let mut ops = mem::take(&mut state.recv_ops);
        ops.advance(sequence, |op, prev| {
            Self::advance_one_recv(state, shared, op, prev)
        });
        state.recv_ops = ops;
    }

    fn advance_recv_all(state: &mut ChannelState, shared: &Arc<Self>) {
        let mut ops = mem::take(&mut state.recv_ops);
        ops.advance_all(|op, prev| Self::advance_one_recv(state, shared, op, prev));
        state.recv_ops = ops;
    }

    fn advance_one_recv(
        state: &mut ChannelState,
        shared: &Arc<Self>,
        op: &mut RecvOp,
        prev: Option<RecvState>,
    ) -> bool {
        let error_set = state.error.is_set();
        let done_reading = op.done_reading_payload;
        let mut moved = false;

        moved |= attempt(
            op,
            RecvState::Uninitialized,
            RecvState::Finished,
            error_set && prev_at_least(prev, RecvState::Finished),
            |op| Self::call_recv_callback(state, shared, op),
        );

        moved |= attempt(
            op,
            RecvState::Uninitialized,
            RecvState::ReadingPayload,
            !error_set && prev_at_least(prev, RecvState::ReadingPayload),
            |op| Self::read_payload(state, shared, op),
        );

        moved |= attempt(
            op,
            RecvState::ReadingPayload,
            RecvState::Finished,
            done_reading && prev_at_least(prev, RecvState::Finished),
            |op| Self::complete_recv(state, shared, op),
        );

        moved
    }

    fn read_payload(state: &mut ChannelState, shared: &Arc<Self>, op: &mut RecvOp) {
        let sequence = op.sequence;
        trace!(channel = %state.id, sequence, "reading payload");

        let weak = Arc::downgrade(shared);
        state.connection.read(Box::new(move |result| {
            if let Some(shared) = weak.upgrade() {
                let target = Arc::clone(&shared);
                shared.context.event_loop().defer(move || {
                    Self::on_payload_read(&target, sequence, result);
                });
            }
        }));
    }

    fn on_payload_read(shared: &Arc<Self>, sequence: u64, result: Result<Bytes, WeftError>) {
        let mut state = shared.state.lock().unwrap_or_else(|e| e.into_inner());
        trace!(channel = %state.id, sequence, "done reading payload");
        match result {
            Err(error) => Self::set_error_from_loop(&mut state, shared, error),
            Ok(payload) => {
                let expected = state
                    .recv_ops
                    .get_mut(sequence)
                    .and_then(|op| op.buffer.as_ref().map(BytesMut::len));
                if expected == Some(payload.len()) {
                    if let Some(op) = state.recv_ops.get_mut(sequence) {
                        op.payload = Some(payload);
                    }
                } else if let Some(expected) = expected {
                    let error = WeftError::new(
                        codes::PROTOCOL_VIOLATION,
                        format!(
                            "payload of {} bytes does not match the {} byte destination",
                            payload.len(),
                            expected
                        ),
                    );
                    Self::set_error_from_loop(&mut state, shared, error);
                }
            }
        }
        if let Some(op) = state.recv_ops.get_mut(sequence) {
            op.done_reading_payload = true;
        }
        Self::advance_recv(&mut state, shared, sequence);
    }

    fn complete_recv(state: &mut ChannelState, shared: &Arc<Self>, op: &mut RecvOp) {
        let result = match state.error.as_result() {
            Ok(()) => {
                let mut buffer = op.buffer.take().unwrap_or_default();
                let payload = op.payload.take().unwrap_or_default();
                buffer[..].copy_from_slice(&payload);
                Ok(buffer)
            }
            Err(error) => Err(error),
        };
        trace!(channel = %state.id, sequence = op.sequence, "calling a recv callback");
        if let Some(callback) = op.callback.take() {
            shared.context.event_loop().defer(move || callback(result));
        }
    }

    fn call_recv_callback(state: &mut ChannelState, shared: &Arc<Self>, op: &mut RecvOp) {
        let result = state.error.as_result();
        trace!(channel = %state.id, sequence = op.sequence, "calling a recv callback");
        if let Some(callback) = op.callback.take() {
            shared
                .context
                .event_loop()
                .defer(move || callback(result.map(|_| BytesMut::new())));
        }
    }
}
