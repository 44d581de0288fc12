use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, Weak};

/// 一次性关闭广播的发射端。
///
/// # 设计背景（Why）
/// - 上下文关闭是全局事件，而每个通道/监听器各自持有粘性错误槽；
///   广播把"上下文在关"翻译成每个存活对象的一次关闭通知，由对象转写为自身错误。
///
/// # 契约说明（What）
/// - `close` 仅首次调用生效：逐一执行全部已登记的回调，之后清空登记表。
/// - 广播已触发后再 `subscribe`，回调立即在调用方线程执行（对象通常在回调里仅做一次 `defer`）。
/// - [`ClosingReceiver`] 析构时自动退订，正常关闭的对象不会再收到迟来的广播。
///
/// # 风险提示（Trade-offs）
/// - 回调在发射端调用方线程执行，登记方必须只做投递、不做任何需要循环线程纪律的操作。
pub struct ClosingEmitter {
    inner: Arc<Mutex<EmitterInner>>,
}

struct EmitterInner {
    fired: bool,
    next_token: u64,
    subscribers: BTreeMap<u64, Box<dyn FnOnce() + Send + 'static>>,
}

impl ClosingEmitter {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(EmitterInner {
                fired: false,
                next_token: 0,
                subscribers: BTreeMap::new(),
            })),
        }
    }

    /// 登记一个关闭回调，返回的接收端负责退订。
    pub fn subscribe(&self, callback: impl FnOnce() + Send + 'static) -> ClosingReceiver {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if inner.fired {
            drop(inner);
            callback();
            return ClosingReceiver {
                emitter: Weak::new(),
                token: 0,
            };
        }
        let token = inner.next_token;
        inner.next_token += 1;
        inner.subscribers.insert(token, Box::new(callback));
        ClosingReceiver {
            emitter: Arc::downgrade(&self.inner),
            token,
        }
    }

    /// 触发广播；幂等。
    pub fn close(&self) {
        let drained = {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            if inner.fired {
                return;
            }
            inner.fired = true;
            std::mem::take(&mut inner.subscribers)
        };
        for (_, callback) in drained {
            callback();
        }
    }
}

impl Default for ClosingEmitter {
    fn default() -> Self {
        Self::new()
    }
}

/// 关闭广播的接收端；析构即退订。
pub struct ClosingReceiver {
    emitter: Weak<Mutex<EmitterInner>>,
    token: u64,
}

impl Drop for ClosingReceiver {
    fn drop(&mut self) {
        if let Some(inner) = self.emitter.upgrade() {
            let mut inner = inner.lock().unwrap_or_else(|e| e.into_inner());
            inner.subscribers.remove(&self.token);
        }
    }
}
