//! 监听器样板的契约测试。
//!
//! 用一个内存后端替代真实传输：accept 回调先积压在后端的待决队列里，
//! 由测试线程扮演"到来的连接"逐个交付。样板承诺的序号纪律、
//! 关闭排空与关闭后短路在这里逐条验证。

use std::collections::VecDeque;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use weft_core::{codes, AcceptCallback, ContextCore, Listener, ListenerBackend, WeftError};

struct MockBackend {
    pending: Arc<Mutex<VecDeque<AcceptCallback<u32>>>>,
    addr: String,
}

impl ListenerBackend for MockBackend {
    type Conn = u32;

    fn accept_impl(&mut self, callback: AcceptCallback<u32>) {
        self.pending
            .lock()
            .unwrap()
            .push_back(callback);
    }

    fn addr_impl(&self) -> String {
        self.addr.clone()
    }

    fn handle_error_impl(&mut self, error: &WeftError) {
        let drained: Vec<_> = self.pending.lock().unwrap().drain(..).collect();
        for callback in drained {
            callback(Err(error.clone()));
        }
    }
}

struct Harness {
    context: Arc<ContextCore>,
    listener: Listener<MockBackend>,
    pending: Arc<Mutex<VecDeque<AcceptCallback<u32>>>>,
}

fn harness() -> Harness {
    let context = ContextCore::new("mock").unwrap();
    let pending = Arc::new(Mutex::new(VecDeque::new()));
    let backend = MockBackend {
        pending: Arc::clone(&pending),
        addr: "mock://0".to_owned(),
    };
    let listener = Listener::new(Arc::clone(&context), backend, "listener.0".to_owned());
    Harness {
        context,
        listener,
        pending,
    }
}

impl Harness {
    /// 等待先前投递的循环任务全部落地。
    fn flush(&self) {
        self.context.event_loop().run_in_loop(|| ()).unwrap();
    }

    /// 扮演一个到来的连接。
    fn deliver(&self, conn: u32) {
        let callback = self.pending.lock().unwrap().pop_front().unwrap();
        callback(Ok(conn));
    }
}

#[test]
fn accept_callbacks_fire_in_submission_order() {
    let h = harness();
    let (tx, rx) = mpsc::channel();
    for tag in 0..3u32 {
        let tx = tx.clone();
        h.listener.accept(Box::new(move |result| {
            tx.send((tag, result.unwrap())).unwrap();
        }));
    }
    h.flush();
    for conn in [10, 11, 12] {
        h.deliver(conn);
    }
    let delivered: Vec<_> = (0..3).map(|_| rx.recv().unwrap()).collect();
    assert_eq!(delivered, vec![(0, 10), (1, 11), (2, 12)]);
    h.listener.close();
    h.context.join();
}

#[test]
fn close_drains_pending_accepts_in_order() {
    let h = harness();
    let (tx, rx) = mpsc::channel();
    for tag in 0..2u32 {
        let tx = tx.clone();
        h.listener.accept(Box::new(move |result| {
            tx.send((tag, result.unwrap_err().code())).unwrap();
        }));
    }
    h.flush();
    h.listener.close();
    assert_eq!(rx.recv().unwrap(), (0, codes::LISTENER_CLOSED));
    assert_eq!(rx.recv().unwrap(), (1, codes::LISTENER_CLOSED));
    h.context.join();
}

#[test]
fn accept_after_close_short_circuits() {
    let h = harness();
    h.listener.close();
    h.flush();
    let (tx, rx) = mpsc::channel();
    h.listener.accept(Box::new(move |result| {
        tx.send(result.unwrap_err().code()).unwrap();
    }));
    assert_eq!(
        rx.recv_timeout(Duration::from_secs(5)).unwrap(),
        codes::LISTENER_CLOSED
    );
    assert!(h.pending.lock().unwrap().is_empty());
    h.context.join();
}

#[test]
fn addr_reports_backend_address() {
    let h = harness();
    assert_eq!(h.listener.addr().unwrap(), "mock://0");
    h.listener.close();
    h.context.join();
}

#[test]
fn context_close_converts_into_listener_error() {
    let h = harness();
    let (tx, rx) = mpsc::channel();
    h.listener.accept(Box::new(move |result| {
        tx.send(result.unwrap_err().code()).unwrap();
    }));
    h.flush();
    h.context.close();
    assert_eq!(
        rx.recv_timeout(Duration::from_secs(5)).unwrap(),
        codes::LISTENER_CLOSED
    );
    h.context.join();
}
