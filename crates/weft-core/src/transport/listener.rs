use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{debug, trace};

use crate::closing::ClosingReceiver;
use crate::context::ContextCore;
use crate::error::{listener_closed, ErrorSlot, WeftError};

/// accept 回调：恰好调用一次，成功携带新连接。
pub type AcceptCallback<C> = Box<dyn FnOnce(Result<C, WeftError>) + Send + 'static>;

/// 监听器后端需要实现的最小接口。
///
/// # 契约说明（What）
/// - `accept_impl` 收到的回调已经被样板包裹：后端只须保证**每个回调恰好被调用一次、
///   并且按交付顺序调用**——样板内置的序号断言会校验这一点。
/// - `handle_error_impl` 在错误置位后恰好调用一次：后端必须让所有仍悬挂的
///   accept 回调以该错误收尾，并释放监听资源。
/// - 全部方法都在监听器所属的事件循环线程上被调用。
pub trait ListenerBackend: Send + 'static {
    /// 后端交付的连接类型。
    type Conn: Send + 'static;

    /// 处理一个 accept 请求。
    fn accept_impl(&mut self, callback: AcceptCallback<Self::Conn>);

    /// 返回当前绑定地址。
    fn addr_impl(&self) -> String;

    /// 错误收尾：排空悬挂的 accept 并释放资源。
    fn handle_error_impl(&mut self, error: &WeftError);
}

/// 监听器样板：把 accept 请求经事件循环串行化、签发序号并强制 FIFO 回调序。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 各传输后端的监听逻辑各不相同，但"按提交顺序交付连接、关闭后以统一错误排空"
///   的纪律完全一致；样板把这层纪律收拢，后端只实现 [`ListenerBackend`] 的三个钩子。
///
/// ## 逻辑解析（How）
/// - `accept` 投递到循环：签发序号、以序号断言包裹用户回调，错误已置位时立即以
///   错误收尾，否则转交 `accept_impl`；
/// - `close` 把 `listener.closed` 写入粘性错误槽，触发 `handle_error_impl`，
///   后端据此排空悬挂回调；重复关闭是空操作；
/// - 上下文关闭广播等价于一次 `close`；
/// - `addr` 经 `run_in_loop` 同步取值，`set_id` 仅改日志标识。
///
/// ## 契约说明（What）
/// - **不变量**：accept 回调严格按序号递增触发（调试构建中由断言守护）；
///   每个回调恰好触发一次；错误槽一旦置位不再改写。
/// - 句柄析构等价于 `close`，确保上下文 `join` 不因遗忘的监听器而悬挂。
pub struct Listener<B: ListenerBackend> {
    shared: Arc<ListenerShared<B>>,
}

struct ListenerShared<B: ListenerBackend> {
    context: Arc<ContextCore>,
    state: Mutex<ListenerState<B>>,
}

struct ListenerState<B: ListenerBackend> {
    id: String,
    backend: B,
    error: ErrorSlot,
    next_accept_sequence: u64,
    next_callback_to_call: Arc<AtomicU64>,
    closing: Option<ClosingReceiver>,
    enrolled: bool,
}

impl<B: ListenerBackend> Listener<B> {
    /// 创建监听器并在循环上完成初始化（登记上下文、订阅关闭广播）。
    pub fn new(context: Arc<ContextCore>, backend: B, id: String) -> Self {
        context.enroll();
        let shared = Arc::new(ListenerShared {
            context,
            state: Mutex::new(ListenerState {
                id,
                backend,
                error: ErrorSlot::new(),
                next_accept_sequence: 0,
                next_callback_to_call: Arc::new(AtomicU64::new(0)),
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
                    shared
                        .context
                        .event_loop()
                        .defer(move || ListenerShared::close_from_loop(&target));
                }
            });
            init.state.lock().unwrap_or_else(|e| e.into_inner()).closing = Some(receiver);
        });

        Self { shared }
    }

    /// 排队一个 accept 请求；连接按提交顺序经回调交付。
    pub fn accept(&self, callback: AcceptCallback<B::Conn>) {
        let shared = Arc::clone(&self.shared);
        self.shared.context.event_loop().defer(move || {
            ListenerShared::accept_from_loop(&shared, callback);
        });
    }

    /// 同步查询当前绑定地址。
    pub fn addr(&self) -> Result<String, WeftError> {
        let shared = Arc::clone(&self.shared);
        self.shared.context.event_loop().run_in_loop(move || {
            let state = shared.state.lock().unwrap_or_else(|e| e.into_inner());
            state.backend.addr_impl()
        })
    }

    /// 重命名，仅影响日志。
    pub fn set_id(&self, id: String) {
        let shared = Arc::clone(&self.shared);
        self.shared.context.event_loop().defer(move || {
            let mut state = shared.state.lock().unwrap_or_else(|e| e.into_inner());
            trace!(listener = %state.id, new_id = %id, "listener was renamed");
            state.id = id;
        });
    }

    /// 关闭监听器；悬挂的 accept 以 `listener.closed` 收尾。幂等。
    pub fn close(&self) {
        let shared = Arc::clone(&self.shared);
        self.shared.context.event_loop().defer(move || {
            ListenerShared::close_from_loop(&shared);
        });
    }
}

impl<B: ListenerBackend> Drop for Listener<B> {
    fn drop(&mut self) {
        self.close();
    }
}

impl<B: ListenerBackend> ListenerShared<B> {
    fn accept_from_loop(shared: &Arc<Self>, callback: AcceptCallback<B::Conn>) {
        debug_assert!(shared.context.event_loop().in_loop());
        let mut state = shared.state.lock().unwrap_or_else(|e| e.into_inner());

        let sequence = state.next_accept_sequence;
        state.next_accept_sequence += 1;
        trace!(listener = %state.id, sequence, "received an accept request");

        let expected = Arc::clone(&state.next_callback_to_call);
        let id = state.id.clone();
        let wrapped: AcceptCallback<B::Conn> = Box::new(move |result| {
            let turn = expected.fetch_add(1, Ordering::SeqCst);
            debug_assert_eq!(
                turn, sequence,
                "accept callbacks must fire in sequence order"
            );
            trace!(listener = %id, sequence, "calling an accept callback");
            callback(result);
        });

        if let Some(error) = state.error.error() {
            let error = error.clone();
            drop(state);
            wrapped(Err(error));
            return;
        }

        state.backend.accept_impl(wrapped);
    }

    fn close_from_loop(shared: &Arc<Self>) {
        debug_assert!(shared.context.event_loop().in_loop());
        let mut state = shared.state.lock().unwrap_or_else(|e| e.into_inner());

        let error = listener_closed();
        if !state.error.set(error.clone()) {
            return;
        }
        debug!(listener = %state.id, "listener is closing");

        state.backend.handle_error_impl(&error);
        state.closing = None;
        if state.enrolled {
            state.enrolled = false;
            drop(state);
            shared.context.unenroll();
        }
    }
}
