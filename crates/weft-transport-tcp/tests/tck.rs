//! TCP 传输契约测试。
//!
//! 覆盖成帧连接的 FIFO 完成序、失败排空与监听器的按序交付——
//! 这些是通道状态机能够在其上保序运转的全部前提。

use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use weft_core::{codes, Connection, WeftError};
use weft_transport_tcp::{TcpConnection, TcpContext, TcpOptions};

const WAIT: Duration = Duration::from_secs(5);

/// 建立一对互联的成帧连接。
fn connection_pair(context: &TcpContext) -> (Arc<TcpConnection>, Arc<TcpConnection>) {
    let listener = context.listen("tcp://127.0.0.1:0").unwrap();
    let addr = listener.addr().unwrap();

    let (tx, rx) = mpsc::channel();
    listener.accept(Box::new(move |result| {
        tx.send(result).unwrap();
    }));

    let outbound = context.connect(&addr).unwrap();
    let inbound = rx.recv_timeout(WAIT).unwrap().unwrap();
    listener.close();
    (inbound, outbound)
}

fn read_with_queue(conn: &Arc<TcpConnection>) -> mpsc::Receiver<Result<Bytes, WeftError>> {
    let (tx, rx) = mpsc::channel();
    conn.read(Box::new(move |result| {
        let _ = tx.send(result);
    }));
    rx
}

#[test]
fn frames_round_trip_in_both_directions() {
    let context = TcpContext::new().unwrap();
    let (inbound, outbound) = connection_pair(&context);

    let rx = read_with_queue(&inbound);
    outbound.write(Bytes::from_static(b"ping"), Box::new(|result| result.unwrap()));
    assert_eq!(rx.recv_timeout(WAIT).unwrap().unwrap().as_ref(), b"ping");

    let rx = read_with_queue(&outbound);
    inbound.write(Bytes::from_static(b"pong"), Box::new(|result| result.unwrap()));
    assert_eq!(rx.recv_timeout(WAIT).unwrap().unwrap().as_ref(), b"pong");

    inbound.close();
    outbound.close();
    context.join();
}

#[test]
fn reads_complete_in_issue_order() {
    let context = TcpContext::new().unwrap();
    let (inbound, outbound) = connection_pair(&context);

    let (tx, rx) = mpsc::channel();
    for tag in 0..3u32 {
        let tx = tx.clone();
        inbound.read(Box::new(move |result| {
            tx.send((tag, result.unwrap())).unwrap();
        }));
    }
    for payload in [&b"a"[..], b"b", b"c"] {
        outbound.write(Bytes::copy_from_slice(payload), Box::new(|result| result.unwrap()));
    }

    let got: Vec<_> = (0..3).map(|_| rx.recv_timeout(WAIT).unwrap()).collect();
    assert_eq!(
        got,
        vec![
            (0, Bytes::from_static(b"a")),
            (1, Bytes::from_static(b"b")),
            (2, Bytes::from_static(b"c")),
        ]
    );

    inbound.close();
    outbound.close();
    context.join();
}

#[test]
fn peer_shutdown_fails_pending_and_later_reads() {
    let context = TcpContext::new().unwrap();
    let (inbound, outbound) = connection_pair(&context);

    let rx = read_with_queue(&inbound);
    outbound.close();
    let err = rx.recv_timeout(WAIT).unwrap().unwrap_err();
    assert_eq!(err.code(), codes::CONNECTION_EOF);

    // 失败后续读也以错误收尾，而不是悬挂。
    let rx = read_with_queue(&inbound);
    let err = rx.recv_timeout(WAIT).unwrap().unwrap_err();
    assert_eq!(err.code(), codes::CONNECTION_EOF);

    inbound.close();
    context.join();
}

#[test]
fn local_close_interrupts_inflight_reads() {
    let context = TcpContext::new().unwrap();
    let (inbound, outbound) = connection_pair(&context);

    let rx = read_with_queue(&inbound);
    inbound.close();
    let err = rx.recv_timeout(WAIT).unwrap().unwrap_err();
    assert_eq!(err.code(), codes::CONNECTION_CLOSED);

    let rx = read_with_queue(&inbound);
    let err = rx.recv_timeout(WAIT).unwrap().unwrap_err();
    assert_eq!(err.code(), codes::CONNECTION_CLOSED);

    outbound.close();
    context.join();
}

#[test]
fn oversized_frames_are_rejected() {
    let context = TcpContext::with_options(TcpOptions::new().with_max_frame_len(8)).unwrap();
    let (inbound, outbound) = connection_pair(&context);

    let rx = read_with_queue(&inbound);
    outbound.write(
        Bytes::from_static(b"way past the configured limit"),
        Box::new(|_| {}),
    );
    let err = rx.recv_timeout(WAIT).unwrap().unwrap_err();
    assert_eq!(err.code(), codes::PROTOCOL_FRAME_TOO_LARGE);

    inbound.close();
    outbound.close();
    context.join();
}

#[test]
fn accepts_are_delivered_in_submission_order() {
    let context = TcpContext::new().unwrap();
    let listener = context.listen("tcp://127.0.0.1:0").unwrap();
    let addr = listener.addr().unwrap();

    let (tx, rx) = mpsc::channel();
    for tag in 0..2u32 {
        let tx = tx.clone();
        listener.accept(Box::new(move |result| {
            tx.send((tag, result.map(|_| ()))).unwrap();
        }));
    }
    let c0 = context.connect(&addr).unwrap();
    let c1 = context.connect(&addr).unwrap();

    assert!(matches!(rx.recv_timeout(WAIT).unwrap(), (0, Ok(()))));
    assert!(matches!(rx.recv_timeout(WAIT).unwrap(), (1, Ok(()))));

    c0.close();
    c1.close();
    listener.close();
    context.join();
}

#[test]
fn listener_close_drains_pending_accepts_in_order() {
    let context = TcpContext::new().unwrap();
    let listener = context.listen("tcp://127.0.0.1:0").unwrap();

    let (tx, rx) = mpsc::channel();
    for tag in 0..2u32 {
        let tx = tx.clone();
        listener.accept(Box::new(move |result| {
            tx.send((tag, result.unwrap_err().code())).unwrap();
        }));
    }
    listener.close();

    assert_eq!(rx.recv_timeout(WAIT).unwrap(), (0, codes::LISTENER_CLOSED));
    assert_eq!(rx.recv_timeout(WAIT).unwrap(), (1, codes::LISTENER_CLOSED));
    context.join();
}
