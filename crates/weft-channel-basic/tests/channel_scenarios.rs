//! 主机内存通道的端到端场景。
//!
//! 测试骨架沿用"队列当期约"的写法：回调把结果推进 mpsc，测试线程阻塞取回。
//! 传输用真实 TCP（回环地址），两侧各有独立的通道上下文，
//! 描述符像真实部署一样由测试线程带外转交。

use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};

use weft_channel_basic::{BasicChannel, BasicContext};
use weft_core::{codes, Channel, Descriptor, WeftError};
use weft_transport_tcp::{TcpConnection, TcpContext};

const WAIT: Duration = Duration::from_secs(5);

struct Harness {
    transport: TcpContext,
    sender_context: BasicContext,
    receiver_context: BasicContext,
    sender: BasicChannel,
    receiver: BasicChannel,
}

fn harness() -> Harness {
    let transport = TcpContext::new().unwrap();
    let listener = transport.listen("tcp://127.0.0.1:0").unwrap();
    let addr = listener.addr().unwrap();

    let (tx, rx) = mpsc::channel();
    listener.accept(Box::new(move |result| {
        tx.send(result).unwrap();
    }));
    let outbound = transport.connect(&addr).unwrap();
    let inbound: Arc<TcpConnection> = rx.recv_timeout(WAIT).unwrap().unwrap();
    listener.close();

    let sender_context = BasicContext::new().unwrap();
    let receiver_context = BasicContext::new().unwrap();
    let sender = sender_context.create_channel(outbound);
    let receiver = receiver_context.create_channel(inbound);

    Harness {
        transport,
        sender_context,
        receiver_context,
        sender,
        receiver,
    }
}

impl Harness {
    fn teardown(self) {
        self.sender.close();
        self.receiver.close();
        self.sender_context.join();
        self.receiver_context.join();
        self.transport.join();
    }
}

/// 提交发送并把完成结果转成可阻塞等待的队列。
fn send_with_queue(
    channel: &BasicChannel,
    payload: Bytes,
) -> (Result<Descriptor, WeftError>, mpsc::Receiver<Result<(), WeftError>>) {
    let (tx, rx) = mpsc::channel();
    let descriptor = channel.send(
        payload,
        Box::new(move |result| {
            let _ = tx.send(result);
        }),
    );
    (descriptor, rx)
}

/// 提交接收并把完成结果转成可阻塞等待的队列。
fn recv_with_queue(
    channel: &BasicChannel,
    descriptor: Descriptor,
    length: usize,
) -> mpsc::Receiver<Result<BytesMut, WeftError>> {
    let (tx, rx) = mpsc::channel();
    channel.recv(
        descriptor,
        BytesMut::zeroed(length),
        Box::new(move |result| {
            let _ = tx.send(result);
        }),
    );
    rx
}

#[test]
fn happy_path_small_host_transfer() {
    let h = harness();
    let data: Vec<u8> = (0..=255u8).collect();

    let (descriptor, send_rx) = send_with_queue(&h.sender, Bytes::from(data.clone()));
    let recv_rx = recv_with_queue(&h.receiver, descriptor.unwrap(), data.len());

    send_rx.recv_timeout(WAIT).unwrap().unwrap();
    let buffer = recv_rx.recv_timeout(WAIT).unwrap().unwrap();
    assert_eq!(buffer.as_ref(), data.as_slice());

    h.teardown();
}

#[test]
fn callbacks_fire_in_submission_order_under_concurrency() {
    let h = harness();
    let payloads = [&b"A"[..], b"B", b"C"];

    // 三个发送在任何一个完成之前全部提交；描述符按序转交。
    let mut descriptors = Vec::new();
    let mut send_queues = Vec::new();
    for payload in payloads {
        let (descriptor, rx) = send_with_queue(&h.sender, Bytes::copy_from_slice(payload));
        descriptors.push(descriptor.unwrap());
        send_queues.push(rx);
    }

    let (tx, order_rx) = mpsc::channel();
    for (tag, descriptor) in descriptors.into_iter().enumerate() {
        let tx = tx.clone();
        h.receiver.recv(
            descriptor,
            BytesMut::zeroed(1),
            Box::new(move |result| {
                tx.send((tag, result.unwrap())).unwrap();
            }),
        );
    }

    for rx in send_queues {
        rx.recv_timeout(WAIT).unwrap().unwrap();
    }
    let received: Vec<_> = (0..3).map(|_| order_rx.recv_timeout(WAIT).unwrap()).collect();
    assert_eq!(received[0], (0, BytesMut::from(&b"A"[..])));
    assert_eq!(received[1], (1, BytesMut::from(&b"B"[..])));
    assert_eq!(received[2], (2, BytesMut::from(&b"C"[..])));

    h.teardown();
}

#[test]
fn close_fails_inflight_recv_with_channel_closed() {
    let h = harness();

    // 没有任何负载在路上：接收保持在途，随后整通道关闭。
    let recv_rx = recv_with_queue(&h.receiver, Descriptor::new(), 16);
    h.receiver.close();

    let err = recv_rx.recv_timeout(WAIT).unwrap().unwrap_err();
    assert_eq!(err.code(), codes::CHANNEL_CLOSED);

    h.teardown();
}

#[test]
fn submissions_after_close_complete_with_the_channel_error_in_order() {
    let h = harness();
    h.sender.close();

    let (tx, rx) = mpsc::channel();
    for tag in 0..2u32 {
        let tx = tx.clone();
        let descriptor = h.sender.send(
            Bytes::from_static(b"late"),
            Box::new(move |result| {
                tx.send((tag, result.unwrap_err().code())).unwrap();
            }),
        );
        // 同步路径同样报告通道错误，但操作并未被静默丢弃。
        assert_eq!(descriptor.unwrap_err().code(), codes::CHANNEL_CLOSED);
    }
    assert_eq!(rx.recv_timeout(WAIT).unwrap(), (0, codes::CHANNEL_CLOSED));
    assert_eq!(rx.recv_timeout(WAIT).unwrap(), (1, codes::CHANNEL_CLOSED));

    h.teardown();
}

#[test]
fn peer_teardown_fails_recv_on_the_other_side() {
    let h = harness();

    // 一次正常往返证明链路健康。
    let (descriptor, send_rx) = send_with_queue(&h.sender, Bytes::from_static(b"ok"));
    let recv_rx = recv_with_queue(&h.receiver, descriptor.unwrap(), 2);
    send_rx.recv_timeout(WAIT).unwrap().unwrap();
    recv_rx.recv_timeout(WAIT).unwrap().unwrap();

    // 发送端关闭后，对端的控制连接随之消失，新的接收必须以错误收尾。
    h.sender.close();
    let recv_rx = recv_with_queue(&h.receiver, Descriptor::new(), 4);
    let err = recv_rx.recv_timeout(WAIT).unwrap().unwrap_err();
    assert_eq!(err.code(), codes::CONNECTION_EOF);

    h.teardown();
}

#[test]
fn length_mismatch_is_a_sticky_protocol_error() {
    let h = harness();

    let (descriptor, send_rx) = send_with_queue(&h.sender, Bytes::from_static(b"abc"));
    // 目标缓冲五个字节，帧只有三个字节：协议违例。
    let recv_rx = recv_with_queue(&h.receiver, descriptor.unwrap(), 5);
    send_rx.recv_timeout(WAIT).unwrap().unwrap();
    let err = recv_rx.recv_timeout(WAIT).unwrap().unwrap_err();
    assert_eq!(err.code(), codes::PROTOCOL_VIOLATION);

    // 错误槽是粘性的：之后的接收立即以同一错误完成。
    let recv_rx = recv_with_queue(&h.receiver, Descriptor::new(), 5);
    let err = recv_rx.recv_timeout(WAIT).unwrap().unwrap_err();
    assert_eq!(err.code(), codes::PROTOCOL_VIOLATION);

    h.teardown();
}

#[test]
fn close_drains_queued_recvs_in_submission_order() {
    let h = harness();

    let (tx, rx) = mpsc::channel();
    for tag in 0..3u32 {
        let tx = tx.clone();
        h.receiver.recv(
            Descriptor::new(),
            BytesMut::zeroed(8),
            Box::new(move |result| {
                tx.send((tag, result.unwrap_err().code())).unwrap();
            }),
        );
    }
    h.receiver.close();

    for expected in 0..3u32 {
        assert_eq!(
            rx.recv_timeout(WAIT).unwrap(),
            (expected, codes::CHANNEL_CLOSED)
        );
    }

    h.teardown();
}

#[test]
fn context_close_converts_into_channel_error() {
    let h = harness();

    let recv_rx = recv_with_queue(&h.receiver, Descriptor::new(), 8);
    h.receiver_context.close();

    let err = recv_rx.recv_timeout(WAIT).unwrap().unwrap_err();
    assert_eq!(err.code(), codes::CHANNEL_CLOSED);

    h.teardown();
}
