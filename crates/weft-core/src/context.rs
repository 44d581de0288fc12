use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use tracing::debug;

use crate::closing::ClosingEmitter;
use crate::error::WeftError;
use crate::event_loop::EventLoop;

static CONTEXT_COUNTER: AtomicU64 = AtomicU64::new(0);

/// 上下文公共骨架：循环、关闭广播、进程标识与存活对象登记表。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 传输上下文与通道上下文的生命周期骨架完全一致：独占一个事件循环、
///   在关闭时广播、在 `join` 时等待全部对象退场后汇合循环。
///   把这层骨架收拢到一个结构里，后端上下文只需在其上挂接自己的资源（套接字、设备句柄缓存）。
///
/// ## 契约说明（What）
/// - `enroll`/`unenroll` 成对出现：对象初始化时登记，错误处理完成时注销；
///   `join` 阻塞直至登记数归零，再汇合循环，保证在途回调全部落地。
/// - `close` 幂等，仅首次触发关闭广播；广播回调由各对象转写为自身错误。
/// - `process_identifier` 进程内稳定、跨上下文互异，供分配标识拼装使用。
///
/// ## 风险提示（Trade-offs）
/// - `join` 之前必须先关闭（或等待自然完结）所有对象，否则登记数不归零将一直阻塞；
///   该契约由调用方的拆除顺序保证。
pub struct ContextCore {
    id: Mutex<String>,
    process_identifier: String,
    event_loop: EventLoop,
    closing: ClosingEmitter,
    registry: Registry,
    closed: AtomicBool,
}

impl ContextCore {
    /// 创建骨架；`kind` 仅参与默认标识与循环线程命名。
    pub fn new(kind: &str) -> Result<Arc<Self>, WeftError> {
        let serial = CONTEXT_COUNTER.fetch_add(1, Ordering::Relaxed);
        let id = format!("{kind}.{serial}");
        Ok(Arc::new(Self {
            event_loop: EventLoop::new(&id)?,
            process_identifier: format!("{}:{}", std::process::id(), serial),
            id: Mutex::new(id),
            closing: ClosingEmitter::new(),
            registry: Registry::new(),
            closed: AtomicBool::new(false),
        }))
    }

    pub fn event_loop(&self) -> &EventLoop {
        &self.event_loop
    }

    pub fn closing(&self) -> &ClosingEmitter {
        &self.closing
    }

    /// 进程内稳定的上下文标识，参与分配标识的拼装。
    pub fn process_identifier(&self) -> &str {
        &self.process_identifier
    }

    /// 读取日志用标识。
    pub fn id(&self) -> String {
        self.id.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// 重命名，仅影响日志。
    pub fn set_id(&self, id: String) {
        *self.id.lock().unwrap_or_else(|e| e.into_inner()) = id;
    }

    /// 登记一个存活对象。
    pub fn enroll(&self) {
        self.registry.enroll();
    }

    /// 注销一个存活对象。
    pub fn unenroll(&self) {
        self.registry.unenroll();
    }

    /// 触发上下文关闭广播；幂等。
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(context = %self.id(), "context is closing");
        self.closing.close();
    }

    /// 关闭并等待全部对象退场，随后汇合事件循环。
    pub fn join(&self) {
        self.close();
        self.registry.wait_empty();
        self.event_loop.join();
        debug!(context = %self.id(), "context joined");
    }
}

/// 存活对象计数器，`join` 的阻塞依据。
struct Registry {
    count: Mutex<usize>,
    cv: Condvar,
}

impl Registry {
    fn new() -> Self {
        Self {
            count: Mutex::new(0),
            cv: Condvar::new(),
        }
    }

    fn enroll(&self) {
        let mut count = self.count.lock().unwrap_or_else(|e| e.into_inner());
        *count += 1;
    }

    fn unenroll(&self) {
        let mut count = self.count.lock().unwrap_or_else(|e| e.into_inner());
        debug_assert!(*count > 0, "unenroll without a matching enroll");
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.cv.notify_all();
        }
    }

    fn wait_empty(&self) {
        let mut count = self.count.lock().unwrap_or_else(|e| e.into_inner());
        while *count > 0 {
            count = self.cv.wait(count).unwrap_or_else(|e| e.into_inner());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn join_waits_for_enrolled_objects() {
        let core = ContextCore::new("test").unwrap();
        core.enroll();
        let done = Arc::new(AtomicUsize::new(0));
        let done2 = Arc::clone(&done);
        let core2 = Arc::clone(&core);
        let waiter = std::thread::spawn(move || {
            core2.join();
            done2.fetch_add(1, Ordering::SeqCst);
        });
        std::thread::sleep(std::time::Duration::from_millis(50));
        assert_eq!(done.load(Ordering::SeqCst), 0);
        core.unenroll();
        waiter.join().unwrap();
        assert_eq!(done.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn close_is_idempotent_and_fires_closing() {
        let core = ContextCore::new("test").unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        let _recv = core.closing().subscribe(move || {
            h.fetch_add(1, Ordering::SeqCst);
        });
        core.close();
        core.close();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        core.join();
    }

    #[test]
    fn process_identifiers_are_distinct_per_context() {
        let a = ContextCore::new("test").unwrap();
        let b = ContextCore::new("test").unwrap();
        assert_ne!(a.process_identifier(), b.process_identifier());
        a.join();
        b.join();
    }
}
