use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::mpsc;
use std::sync::{Arc, Condvar, Mutex, OnceLock};
use std::thread;

use tracing::{error, trace};

use crate::error::{codes, WeftError};

type Task = Box<dyn FnOnce() + Send + 'static>;

/// 单线程事件循环：上下文内全部可变状态的串行化器。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 通道与监听器的队列、错误槽、控制流 I/O 发起点都只允许从一个线程触碰，
///   以循环线程替代细粒度锁，使状态机推进天然串行、无竞态可言。
/// - 异步完成（传输回调、设备事件）不在循环上阻塞，而是把"推进一步"封装成任务投递回循环。
///
/// ## 体系定位（Architecture）
/// - 每个上下文独占一个循环；通道/监听器通过上下文借用它，自己不创建线程。
/// - 公开方法分两类：投递即返回的 `defer`（send/recv/close/accept 等），
///   与同步求值的 `run_in_loop`（addr、描述符计算等查询型路径）。
///
/// ## 契约说明（What）
/// - `defer`：任务按提交顺序在循环线程执行；`join` 之后的投递被丢弃并记录日志。
/// - `run_in_loop`：若调用方已在循环线程则直接执行，否则阻塞等待任务完成；
///   循环已汇合时返回 `loop.closed` 错误。
/// - `in_loop`：断言辅助，供 `debug_assert!` 在关键入口校验线程纪律。
/// - `join`：幂等；先排空既有任务再汇合线程，禁止从循环线程自身调用。
///
/// ## 风险提示（Trade-offs）
/// - 任务内的 panic 会被捕获并记录，而不是撕毁整个循环；回调方失约不应拖垮对端在途操作。
/// - `run_in_loop` 在循环线程上直接执行意味着它与已投递任务之间没有全序，调用方不应依赖两者的相对顺序。
pub struct EventLoop {
    inner: Arc<LoopInner>,
}

struct LoopInner {
    state: Mutex<LoopState>,
    cv: Condvar,
    thread: Mutex<Option<thread::JoinHandle<()>>>,
    thread_id: OnceLock<thread::ThreadId>,
}

struct LoopState {
    queue: VecDeque<Task>,
    closed: bool,
}

impl EventLoop {
    /// 创建并启动事件循环线程，`name` 仅用于线程命名与日志。
    pub fn new(name: &str) -> Result<Self, WeftError> {
        let inner = Arc::new(LoopInner {
            state: Mutex::new(LoopState {
                queue: VecDeque::new(),
                closed: false,
            }),
            cv: Condvar::new(),
            thread: Mutex::new(None),
            thread_id: OnceLock::new(),
        });

        let thread_inner = Arc::clone(&inner);
        let handle = thread::Builder::new()
            .name(format!("weft-loop-{name}"))
            .spawn(move || {
                let _ = thread_inner.thread_id.set(thread::current().id());
                thread_inner.run();
            })
            .map_err(|err| WeftError::wrap(codes::LOOP_SPAWN, "failed to spawn loop thread", err))?;
        *inner.thread.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);

        Ok(Self { inner })
    }

    /// 当前线程是否为循环线程。
    pub fn in_loop(&self) -> bool {
        self.inner.thread_id.get() == Some(&thread::current().id())
    }

    /// 投递一个任务到循环，按提交顺序执行。
    pub fn defer(&self, task: impl FnOnce() + Send + 'static) {
        let mut state = self.inner.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.closed {
            trace!("event loop already joined, dropping deferred task");
            return;
        }
        state.queue.push_back(Box::new(task));
        self.inner.cv.notify_one();
    }

    /// 在循环上同步执行任务并取回返回值。
    ///
    /// # 逻辑解析（How）
    /// 1. 调用方已在循环线程时直接执行，避免自投递造成死锁；
    /// 2. 否则包装为任务投递，经由一次性通道回传结果并阻塞等待。
    pub fn run_in_loop<R, F>(&self, task: F) -> Result<R, WeftError>
    where
        R: Send + 'static,
        F: FnOnce() -> R + Send + 'static,
    {
        if self.in_loop() {
            return Ok(task());
        }
        let (tx, rx) = mpsc::channel();
        self.defer(move || {
            let _ = tx.send(task());
        });
        rx.recv()
            .map_err(|_| WeftError::new(codes::LOOP_CLOSED, "event loop is no longer running"))
    }

    /// 排空任务并汇合循环线程；幂等。
    pub fn join(&self) {
        debug_assert!(
            !self.in_loop(),
            "EventLoop::join must not be called from the loop thread"
        );
        {
            let mut state = self.inner.state.lock().unwrap_or_else(|e| e.into_inner());
            state.closed = true;
            self.inner.cv.notify_one();
        }
        let handle = self
            .inner
            .thread
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }
}

impl LoopInner {
    fn run(self: Arc<Self>) {
        loop {
            let task = {
                let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
                loop {
                    if let Some(task) = state.queue.pop_front() {
                        break task;
                    }
                    if state.closed {
                        return;
                    }
                    state = self.cv.wait(state).unwrap_or_else(|e| e.into_inner());
                }
            };
            if catch_unwind(AssertUnwindSafe(task)).is_err() {
                // 回调失约不属于通道契约的一部分；记录后继续推进其余任务。
                error!("a deferred task panicked on the event loop");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn deferred_tasks_run_in_submission_order() {
        let event_loop = EventLoop::new("test").unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));
        for i in 0..16 {
            let log = Arc::clone(&log);
            event_loop.defer(move || log.lock().unwrap().push(i));
        }
        event_loop.join();
        assert_eq!(*log.lock().unwrap(), (0..16).collect::<Vec<_>>());
    }

    #[test]
    fn run_in_loop_returns_value_and_runs_on_loop_thread() {
        let event_loop = EventLoop::new("test").unwrap();
        let value = event_loop
            .run_in_loop(|| thread::current().name().map(str::to_owned))
            .unwrap();
        assert_eq!(value.as_deref(), Some("weft-loop-test"));
        event_loop.join();
    }

    #[test]
    fn run_in_loop_after_join_reports_closed() {
        let event_loop = EventLoop::new("test").unwrap();
        event_loop.join();
        let err = event_loop.run_in_loop(|| 1).unwrap_err();
        assert_eq!(err.code(), codes::LOOP_CLOSED);
    }

    #[test]
    fn panicking_task_does_not_kill_the_loop() {
        let event_loop = EventLoop::new("test").unwrap();
        let ran = Arc::new(AtomicUsize::new(0));
        event_loop.defer(|| panic!("task failure"));
        let ran2 = Arc::clone(&ran);
        event_loop.defer(move || {
            ran2.fetch_add(1, Ordering::SeqCst);
        });
        event_loop.join();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn join_is_idempotent() {
        let event_loop = EventLoop::new("test").unwrap();
        event_loop.join();
        event_loop.join();
    }
}
