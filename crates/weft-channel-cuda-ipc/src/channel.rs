use std::mem;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tracing::{debug, trace};

use weft_core::{
    attempt, channel_closed, prev_at_least, Channel, ClosingReceiver, Connection, Descriptor,
    ErrorSlot, OpQueue, Operation, RecvCallback, SendCallback, WeftError,
};

use crate::cuda::{self, CudaEvent, CudaStream, PrimaryContext};
use crate::wire;
use crate::{ContextInner, CudaBuffer};

/// CUDA IPC 通道：跨进程事件/显存句柄交换 + 设备间异步拷贝。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 两个进程各自持有一条 GPU 流，搬运必须在不阻塞任何一侧 CPU 的前提下完成：
///   发送方在自己的流上记录**起始事件**并随描述符转交其 IPC 句柄；
///   接收方让本地流等待起始事件、发起设备间拷贝、记录**停止事件**，
///   把停止事件句柄经 reply 控制流送回；发送方让自己的流等待停止事件，
///   使后续用户工作排在对端拷贝之后；最后以 ack 控制流告知"不再需要停止事件"。
///
/// ## 逻辑解析（How）
/// - 发送：UNINITIALIZED → READING_REPLY → FINISHED。
///   进入 READING_REPLY 需要前驱已发起回执读（保证 reply 流上的读序 = 操作序）；
///   完结需要回执已读到且前驱已完结，动作依序为
///   等待停止事件、触发回调、写确认（保证 ack 流上的写序 = 操作序）。
/// - 接收：UNINITIALIZED → READING_ACK → FINISHED。
///   进入 READING_ACK 打包了全部实质动作：等待起始事件 + 拷贝 + 记录停止事件、
///   触发回调、写回执并发起确认读。最后一个转移没有动作——它唯一的目的
///   是把记录（连同其中的停止事件）留到对端确认不再等待之后再退场。
/// - 描述符在提交现场同步产出：记录起始事件、查询分配基址与缓冲标识、
///   打开显存 IPC 句柄，全程不触碰控制流。
/// - 错误纪律：完成回调报错 → 首错落槽 → 两个方向排空 → 关闭两条控制流 →
///   注销登记。转移动作自身不回写错误槽；设备调用失败记入暂存错误，
///   由推进外层在队列复位后统一落槽，避免在引擎内部重入。
///
/// ## 契约说明（What）
/// - 回调严格按方向内序号触发、恰好一次；错误槽单调；`close` 幂等；
/// - 同一分配的显存 IPC 句柄按分配标识缓存于上下文，随上下文拆除统一释放。
pub struct CudaIpcChannel {
    shared: Arc<ChannelShared>,
}

struct ChannelShared {
    context: Arc<ContextInner>,
    state: Mutex<ChannelState>,
}

struct ChannelState {
    id: String,
    reply_connection: Arc<dyn Connection>,
    ack_connection: Arc<dyn Connection>,
    error: ErrorSlot,
    /// 转移动作内发生的设备错误暂存于此，推进收尾时统一落槽。
    pending_error: Option<WeftError>,
    send_ops: OpQueue<SendOp>,
    recv_ops: OpQueue<RecvOp>,
    closing: Option<ClosingReceiver>,
    enrolled: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
enum SendState {
    Uninitialized,
    ReadingReply,
    Finished,
}

struct SendOp {
    sequence: u64,
    state: SendState,
    callback: Option<SendCallback>,
    device: Option<Arc<PrimaryContext>>,
    stream: CudaStream,
    /// 起始事件由本操作独占，退场即销毁。
    start_ev: Option<CudaEvent>,
    /// 对端停止事件的 IPC 句柄，事件本体活在对端。
    stop_ev_handle: Option<Bytes>,
    done_reading_reply: bool,
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
    ReadingAck,
    Finished,
}

struct RecvOp {
    sequence: u64,
    state: RecvState,
    callback: Option<RecvCallback<()>>,
    device: Option<Arc<PrimaryContext>>,
    ptr: u64,
    length: usize,
    stream: CudaStream,
    allocation_id: String,
    remote_handle: Bytes,
    offset: u64,
    start_ev_handle: Bytes,
    /// 本地停止事件必须活到对端确认为止（见 READING_ACK → FINISHED）。
    stop_ev: Option<CudaEvent>,
    done_reading_ack: bool,
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

impl CudaIpcChannel {
    pub(crate) fn new(
        context: Arc<ContextInner>,
        reply_connection: Arc<dyn Connection>,
        ack_connection: Arc<dyn Connection>,
        id: String,
    ) -> Self {
        context.core.enroll();
        let shared = Arc::new(ChannelShared {
            context,
            state: Mutex::new(ChannelState {
                id,
                reply_connection,
                ack_connection,
                error: ErrorSlot::new(),
                pending_error: None,
                send_ops: OpQueue::new(),
                recv_ops: OpQueue::new(),
                closing: None,
                enrolled: true,
            }),
        });

        let init = Arc::clone(&shared);
        shared.context.core.event_loop().defer(move || {
            let weak = Arc::downgrade(&init);
            let receiver = init.context.core.closing().subscribe(move || {
                if let Some(shared) = weak.upgrade() {
                    let target = Arc::clone(&shared);
                    shared.context.core.event_loop().defer(move || {
                        ChannelShared::close_from_loop(&target);
                    });
                }
            });
            init.state.lock().unwrap_or_else(|e| e.into_inner()).closing = Some(receiver);
        });

        Self { shared }
    }
}

impl Channel for CudaIpcChannel {
    type SendBuffer = CudaBuffer;
    type RecvBuffer = CudaBuffer;
    type RecvReturn = ();

    fn send(&self, buffer: CudaBuffer, callback: SendCallback) -> Result<Descriptor, WeftError> {
        let shared = Arc::clone(&self.shared);
        self.shared
            .context
            .core
            .event_loop()
            .run_in_loop(move || ChannelShared::send_from_loop(&shared, buffer, callback))?
    }

    fn recv(&self, descriptor: Descriptor, buffer: CudaBuffer, callback: RecvCallback<()>) {
        let shared = Arc::clone(&self.shared);
        self.shared.context.core.event_loop().defer(move || {
            ChannelShared::recv_from_loop(&shared, descriptor, buffer, callback);
        });
    }

    fn set_id(&self, id: String) {
        let shared = Arc::clone(&self.shared);
        self.shared.context.core.event_loop().defer(move || {
            let mut state = shared.state.lock().unwrap_or_else(|e| e.into_inner());
            trace!(channel = %state.id, new_id = %id, "channel was renamed");
            state.id = id;
        });
    }

    fn close(&self) {
        let shared = Arc::clone(&self.shared);
        self.shared.context.core.event_loop().defer(move || {
            ChannelShared::close_from_loop(&shared);
        });
    }
}

impl Drop for CudaIpcChannel {
    fn drop(&mut self) {
        Channel::close(self);
    }
}

/// 描述符产出所需的发送侧资源。
struct PreparedSend {
    device: Arc<PrimaryContext>,
    start_ev: CudaEvent,
    descriptor: Bytes,
}

impl ChannelShared {
    // ---- 提交 ----

    fn send_from_loop(
        shared: &Arc<Self>,
        buffer: CudaBuffer,
        callback: SendCallback,
    ) -> Result<Descriptor, WeftError> {
        debug_assert!(shared.context.core.event_loop().in_loop());
        let mut state = shared.state.lock().unwrap_or_else(|e| e.into_inner());

        if let Some(error) = state.error.as_result().err() {
            Self::emplace_doomed_send(&mut state, shared, buffer.stream, callback);
            return Err(error);
        }

        match Self::prepare_send(&shared.context, &buffer) {
            Ok(prepared) => {
                let sequence = state.send_ops.emplace_back(|sequence| SendOp {
                    sequence,
                    state: SendState::Uninitialized,
                    callback: Some(callback),
                    device: Some(prepared.device),
                    stream: buffer.stream,
                    start_ev: Some(prepared.start_ev),
                    stop_ev_handle: None,
                    done_reading_reply: false,
                });
                trace!(channel = %state.id, sequence, length = buffer.length, "received a send request");
                Self::advance_send(&mut state, shared, sequence);
                Ok(prepared.descriptor)
            }
            Err(error) => {
                Self::set_error_from_loop(&mut state, shared, error.clone());
                Self::emplace_doomed_send(&mut state, shared, buffer.stream, callback);
                Err(error)
            }
        }
    }

    /// 记录起始事件并就地产出描述符；不触碰控制流。
    fn prepare_send(
        context: &Arc<ContextInner>,
        buffer: &CudaBuffer,
    ) -> Result<PreparedSend, WeftError> {
        let device_idx = cuda::device_for_pointer(buffer.ptr)?;
        let device = context.device(device_idx)?;

        let start_ev = CudaEvent::new_interprocess(Arc::clone(&device))?;
        start_ev.record(buffer.stream)?;

        let (base, _len) = cuda::address_range(&device, buffer.ptr)?;
        let offset = buffer.ptr - base;
        let buffer_id = cuda::buffer_id(&device, base)?;
        let handle = cuda::ipc_mem_handle(&device, buffer.ptr)?;

        let descriptor = wire::Descriptor {
            allocation_id: format!(
                "{}_{buffer_id}",
                context.core.process_identifier()
            ),
            handle: Bytes::copy_from_slice(&handle),
            offset,
            start_ev_handle: Bytes::copy_from_slice(start_ev.serialized_handle()),
        }
        .encode();

        Ok(PreparedSend {
            device,
            start_ev,
            descriptor,
        })
    }

    fn emplace_doomed_send(
        state: &mut ChannelState,
        shared: &Arc<Self>,
        stream: CudaStream,
        callback: SendCallback,
    ) {
        let sequence = state.send_ops.emplace_back(|sequence| SendOp {
            sequence,
            state: SendState::Uninitialized,
            callback: Some(callback),
            device: None,
            stream,
            start_ev: None,
            stop_ev_handle: None,
            done_reading_reply: false,
        });
        trace!(channel = %state.id, sequence, "received a send request on an errored channel");
        Self::advance_send(state, shared, sequence);
    }

    fn recv_from_loop(
        shared: &Arc<Self>,
        descriptor: Descriptor,
        buffer: CudaBuffer,
        callback: RecvCallback<()>,
    ) {
        debug_assert!(shared.context.core.event_loop().in_loop());
        let mut state = shared.state.lock().unwrap_or_else(|e| e.into_inner());

        if state.error.is_set() {
            Self::emplace_doomed_recv(&mut state, shared, &buffer, callback);
            return;
        }

        let decoded = wire::Descriptor::decode(descriptor);
        let setup = decoded.and_then(|descriptor| {
            let device_idx = cuda::device_for_pointer(buffer.ptr)?;
            let device = shared.context.device(device_idx)?;
            let stop_ev = CudaEvent::new_interprocess(Arc::clone(&device))?;
            Ok((descriptor, device, stop_ev))
        });

        match setup {
            Ok((descriptor, device, stop_ev)) => {
                let sequence = state.recv_ops.emplace_back(|sequence| RecvOp {
                    sequence,
                    state: RecvState::Uninitialized,
                    callback: Some(callback),
                    device: Some(device),
                    ptr: buffer.ptr,
                    length: buffer.length,
                    stream: buffer.stream,
                    allocation_id: descriptor.allocation_id,
                    remote_handle: descriptor.handle,
                    offset: descriptor.offset,
                    start_ev_handle: descriptor.start_ev_handle,
                    stop_ev: Some(stop_ev),
                    done_reading_ack: false,
                });
                trace!(channel = %state.id, sequence, length = buffer.length, "received a recv request");
                Self::advance_recv(&mut state, shared, sequence);
            }
            Err(error) => {
                Self::set_error_from_loop(&mut state, shared, error);
                Self::emplace_doomed_recv(&mut state, shared, &buffer, callback);
            }
        }
    }

    fn emplace_doomed_recv(
        state: &mut ChannelState,
        shared: &Arc<Self>,
        buffer: &CudaBuffer,
        callback: RecvCallback<()>,
    ) {
        let sequence = state.recv_ops.emplace_back(|sequence| RecvOp {
            sequence,
            state: RecvState::Uninitialized,
            callback: Some(callback),
            device: None,
            ptr: buffer.ptr,
            length: buffer.length,
            stream: buffer.stream,
            allocation_id: String::new(),
            remote_handle: Bytes::new(),
            offset: 0,
            start_ev_handle: Bytes::new(),
            stop_ev: None,
            done_reading_ack: false,
        });
        trace!(channel = %state.id, sequence, "received a recv request on an errored channel");
        Self::advance_recv(state, shared, sequence);
    }

    // ---- 错误纪律 ----

    fn close_from_loop(shared: &Arc<Self>) {
        debug_assert!(shared.context.core.event_loop().in_loop());
        let mut state = shared.state.lock().unwrap_or_else(|e| e.into_inner());
        Self::set_error_from_loop(&mut state, shared, channel_closed());
    }

    fn set_error_from_loop(state: &mut ChannelState, shared: &Arc<Self>, error: WeftError) {
        if !state.error.set(error) {
            return;
        }
        debug!(channel = %state.id, error = %state.error.error().unwrap(), "channel is handling an error");

        Self::advance_send_all(state, shared);
        Self::advance_recv_all(state, shared);

        state.reply_connection.close();
        state.ack_connection.close();
        state.closing = None;
        if state.enrolled {
            state.enrolled = false;
            shared.context.core.unenroll();
        }
    }

    /// 转移动作内的设备错误在队列复位后统一落槽。
    fn flush_pending_error(state: &mut ChannelState, shared: &Arc<Self>) {
        if let Some(error) = state.pending_error.take() {
            Self::set_error_from_loop(state, shared, error);
        }
    }

    fn record_pending_error(state: &mut ChannelState, error: WeftError) {
        if state.pending_error.is_none() {
            state.pending_error = Some(error);
        }
    }

    /// 动作与回调观测到的当前结果：暂存错误优先于错误槽。
    fn current_result(state: &ChannelState) -> Result<(), WeftError> {
        match &state.pending_error {
            Some(error) => Err(error.clone()),
            None => state.error.as_result(),
        }
    }

    // ---- 发送方向 ----

    fn advance_send(state: &mut ChannelState, shared: &Arc<Self>, sequence: u64) {
        let mut ops = mem::take(&mut state.send_ops);
        ops.advance(sequence, |op, prev| {
            Self::advance_one_send(state, shared, op, prev)
        });
        state.send_ops = ops;
        Self::flush_pending_error(state, shared);
    }

    fn advance_send_all(state: &mut ChannelState, shared: &Arc<Self>) {
        let mut ops = mem::take(&mut state.send_ops);
        ops.advance_all(|op, prev| Self::advance_one_send(state, shared, op, prev));
        state.send_ops = ops;
        Self::flush_pending_error(state, shared);
    }

    fn advance_one_send(
        state: &mut ChannelState,
        shared: &Arc<Self>,
        op: &mut SendOp,
        prev: Option<SendState>,
    ) -> bool {
        let error_set = state.error.is_set();
        let done_reading_reply = op.done_reading_reply;
        let mut moved = false;

        moved |= attempt(
            op,
            SendState::Uninitialized,
            SendState::Finished,
            error_set && prev_at_least(prev, SendState::Finished),
            |op| Self::call_send_callback(state, shared, op),
        );

        // 必须排在前驱之后发起，保证 reply 控制流上的读序可预测。
        moved |= attempt(
            op,
            SendState::Uninitialized,
            SendState::ReadingReply,
            !error_set && prev_at_least(prev, SendState::ReadingReply),
            |op| Self::read_reply(state, shared, op),
        );

        moved |= attempt(
            op,
            SendState::ReadingReply,
            SendState::Finished,
            error_set && done_reading_reply && prev_at_least(prev, SendState::Finished),
            |op| Self::call_send_callback(state, shared, op),
        );

        // 必须排在前驱之后发起，保证 ack 控制流上的写序可预测。
        moved |= attempt(
            op,
            SendState::ReadingReply,
            SendState::Finished,
            !error_set && done_reading_reply && prev_at_least(prev, SendState::Finished),
            |op| {
                Self::wait_on_stop_event(state, op);
                Self::call_send_callback(state, shared, op);
                Self::write_ack(state, shared, op);
            },
        );

        moved
    }

    fn read_reply(state: &mut ChannelState, shared: &Arc<Self>, op: &mut SendOp) {
        let sequence = op.sequence;
        trace!(channel = %state.id, sequence, "reading reply notification");

        let weak = Arc::downgrade(shared);
        state.reply_connection.read(Box::new(move |result| {
            if let Some(shared) = weak.upgrade() {
                let target = Arc::clone(&shared);
                shared.context.core.event_loop().defer(move || {
                    Self::on_reply_read(&target, sequence, result);
                });
            }
        }));
    }

    fn on_reply_read(shared: &Arc<Self>, sequence: u64, result: Result<Bytes, WeftError>) {
        let mut state = shared.state.lock().unwrap_or_else(|e| e.into_inner());
        trace!(channel = %state.id, sequence, "done reading reply notification");
        match result.and_then(wire::Reply::decode) {
            Err(error) => Self::set_error_from_loop(&mut state, shared, error),
            Ok(reply) => {
                if !state.error.is_set() {
                    if let Some(op) = state.send_ops.get_mut(sequence) {
                        op.stop_ev_handle = Some(reply.stop_ev_handle);
                    }
                }
            }
        }
        if let Some(op) = state.send_ops.get_mut(sequence) {
            op.done_reading_reply = true;
        }
        Self::advance_send(&mut state, shared, sequence);
    }

    /// 让发送方的流等待对端的停止事件：用户后续排队的工作由此排在拷贝之后。
    fn wait_on_stop_event(state: &mut ChannelState, op: &mut SendOp) {
        let (Some(device), Some(handle)) = (op.device.clone(), op.stop_ev_handle.clone()) else {
            return;
        };
        let outcome = CudaEvent::open(device, &handle).and_then(|stop_ev| stop_ev.wait(op.stream));
        if let Err(error) = outcome {
            Self::record_pending_error(state, error);
        }
    }

    fn call_send_callback(state: &mut ChannelState, shared: &Arc<Self>, op: &mut SendOp) {
        let result = Self::current_result(state);
        trace!(channel = %state.id, sequence = op.sequence, "calling a send callback");
        if let Some(callback) = op.callback.take() {
            shared.context.core.event_loop().defer(move || callback(result));
        }
    }

    fn write_ack(state: &mut ChannelState, shared: &Arc<Self>, op: &mut SendOp) {
        let sequence = op.sequence;
        trace!(channel = %state.id, sequence, "writing ack notification");

        let weak = Arc::downgrade(shared);
        state.ack_connection.write(
            wire::Ack.encode(),
            Box::new(move |result| {
                if let Some(shared) = weak.upgrade() {
                    let target = Arc::clone(&shared);
                    shared.context.core.event_loop().defer(move || {
                        let mut state = target.state.lock().unwrap_or_else(|e| e.into_inner());
                        trace!(channel = %state.id, sequence, "done writing ack notification");
                        if let Err(error) = result {
                            Self::set_error_from_loop(&mut state, &target, error);
                        }
                    });
                }
            }),
        );
    }

    // ---- 接收方向 ----

    fn advance_recv(state: &mut ChannelState, shared: &Arc<Self>, sequence: u64) {
        let mut ops = mem::take(&mut state.recv_ops);
        ops.advance(sequence, |op, prev| {
            Self::advance_one_recv(state, shared, op, prev)
        });
        state.recv_ops = ops;
        Self::flush_pending_error(state, shared);
    }

    fn advance_recv_all(state: &mut ChannelState, shared: &Arc<Self>) {
        let mut ops = mem::take(&mut state.recv_ops);
        ops.advance_all(|op, prev| Self::advance_one_recv(state, shared, op, prev));
        state.recv_ops = ops;
        Self::flush_pending_error(state, shared);
    }

    fn advance_one_recv(
        state: &mut ChannelState,
        shared: &Arc<Self>,
        op: &mut RecvOp,
        prev: Option<RecvState>,
    ) -> bool {
        let error_set = state.error.is_set();
        let done_reading_ack = op.done_reading_ack;
        let mut moved = false;

        moved |= attempt(
            op,
            RecvState::Uninitialized,
            RecvState::Finished,
            error_set && prev_at_least(prev, RecvState::Finished),
            |op| Self::call_recv_callback(state, shared, op),
        );

        // 必须排在前驱之后发起，保证 reply 流上的写序与 ack 流上的读序可预测。
        moved |= attempt(
            op,
            RecvState::Uninitialized,
            RecvState::ReadingAck,
            !error_set && prev_at_least(prev, RecvState::ReadingAck),
            |op| {
                Self::wait_on_start_event_and_copy_and_record_stop_event(state, shared, op);
                Self::call_recv_callback(state, shared, op);
                Self::write_reply_and_read_ack(state, shared, op);
            },
        );

        // 没有动作：仅把记录（连同停止事件）留到对端确认之后。
        moved |= attempt(
            op,
            RecvState::ReadingAck,
            RecvState::Finished,
            done_reading_ack,
            |_| {},
        );

        moved
    }

    fn wait_on_start_event_and_copy_and_record_stop_event(
        state: &mut ChannelState,
        shared: &Arc<Self>,
        op: &mut RecvOp,
    ) {
        let Some(device) = op.device.clone() else {
            return;
        };
        trace!(channel = %state.id, sequence = op.sequence, "copying payload");

        let outcome = (|| -> Result<(), WeftError> {
            let start_ev = CudaEvent::open(Arc::clone(&device), &op.start_ev_handle)?;
            start_ev.wait(op.stream)?;

            let base =
                shared
                    .context
                    .open_ipc_handle(&op.allocation_id, &op.remote_handle, &device)?;
            cuda::memcpy_dtod_async(&device, op.ptr, base + op.offset, op.length, op.stream)?;

            if let Some(stop_ev) = &op.stop_ev {
                stop_ev.record(op.stream)?;
            }
            Ok(())
        })();

        match outcome {
            Ok(()) => trace!(channel = %state.id, sequence = op.sequence, "done copying payload"),
            Err(error) => Self::record_pending_error(state, error),
        }
    }

    fn call_recv_callback(state: &mut ChannelState, shared: &Arc<Self>, op: &mut RecvOp) {
        let result = Self::current_result(state);
        trace!(channel = %state.id, sequence = op.sequence, "calling a recv callback");
        if let Some(callback) = op.callback.take() {
            shared.context.core.event_loop().defer(move || callback(result));
        }
    }

    fn write_reply_and_read_ack(state: &mut ChannelState, shared: &Arc<Self>, op: &mut RecvOp) {
        let sequence = op.sequence;
        let stop_ev_handle = op
            .stop_ev
            .as_ref()
            .map(|stop_ev| Bytes::copy_from_slice(stop_ev.serialized_handle()))
            .unwrap_or_default();

        trace!(channel = %state.id, sequence, "writing reply notification");
        let weak = Arc::downgrade(shared);
        state.reply_connection.write(
            wire::Reply { stop_ev_handle }.encode(),
            Box::new(move |result| {
                if let Some(shared) = weak.upgrade() {
                    let target = Arc::clone(&shared);
                    shared.context.core.event_loop().defer(move || {
                        let mut state = target.state.lock().unwrap_or_else(|e| e.into_inner());
                        trace!(channel = %state.id, sequence, "done writing reply notification");
                        if let Err(error) = result {
                            Self::set_error_from_loop(&mut state, &target, error);
                        }
                    });
                }
            }),
        );

        trace!(channel = %state.id, sequence, "reading ack notification");
        let weak = Arc::downgrade(shared);
        state.ack_connection.read(Box::new(move |result| {
            if let Some(shared) = weak.upgrade() {
                let target = Arc::clone(&shared);
                shared.context.core.event_loop().defer(move || {
                    Self::on_ack_read(&target, sequence, result);
                });
            }
        }));
    }

    fn on_ack_read(shared: &Arc<Self>, sequence: u64, result: Result<Bytes, WeftError>) {
        let mut state = shared.state.lock().unwrap_or_else(|e| e.into_inner());
        trace!(channel = %state.id, sequence, "done reading ack notification");
        match result.and_then(wire::Ack::decode) {
            Err(error) => Self::set_error_from_loop(&mut state, shared, error),
            Ok(wire::Ack) => {}
        }
        if let Some(op) = state.recv_ops.get_mut(sequence) {
            op.done_reading_ack = true;
        }
        Self::advance_recv(&mut state, shared, sequence);
    }
}
