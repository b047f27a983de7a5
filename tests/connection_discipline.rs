//! # Connection Operation Discipline
//!
//! Single-outstanding receive/send, zero-byte receive, payload bounds,
//! arena backpressure and submit/completion failures, all driven through
//! a single reactor over the in-memory provider.

use socket2::{Domain, Socket, Type};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tcp_x::types::OperationContext;
use tcp_x::{
    AcceptedSocket, CompletionResult, CompletionStatus, Connection, ConnectionState, EngineError,
    EngineSettings, MemoryProvider, Reactor,
};

const ECONNRESET: i32 = 104;

fn settings(segment_count: u32) -> EngineSettings {
    EngineSettings {
        reactor_count: Some(1),
        segment_length: 512,
        segment_count,
        completion_queue_depth: 256,
        drain_batch: 64,
        poll_interval_ms: 5,
        pin_reactors: false,
        ..EngineSettings::default()
    }
}

fn accepted() -> AcceptedSocket {
    AcceptedSocket {
        socket: Socket::new(Domain::IPV4, Type::STREAM, None).unwrap(),
        peer: Some("10.0.0.7:40000".parse().unwrap()),
    }
}

fn reactor(provider: &Arc<MemoryProvider>, segment_count: u32) -> Reactor {
    Reactor::start(0, provider.clone(), &settings(segment_count), None).unwrap()
}

async fn eventually(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
}

#[tokio::test]
async fn test_second_receive_is_rejected_without_disturbing_first() {
    let provider = Arc::new(MemoryProvider::new());
    let reactor = reactor(&provider, 16);
    let conn = Arc::new(reactor.admit(accepted()).unwrap());
    let id = conn.id();

    let first = tokio::spawn({
        let conn = conn.clone();
        async move { conn.receive().await }
    });
    eventually("first receive submitted", || provider.pending_receives(id) == 1).await;

    match conn.receive().await {
        Err(EngineError::AlreadyPending(kind)) => assert_eq!(kind.to_string(), "receive"),
        other => panic!("expected AlreadyPending, got {:?}", other),
    }
    assert_eq!(provider.pending_receives(id), 1);

    assert!(provider.deliver(id, b"payload"));
    let data = first.await.unwrap().unwrap();
    assert_eq!(&data[..], b"payload");
    assert_eq!(reactor.arena_checked_out(), 0);
    assert_eq!(reactor.outstanding_operations(), 0);

    // The slot is free again.
    provider.deliver(id, b"more");
    assert_eq!(&conn.receive().await.unwrap()[..], b"more");
}

#[tokio::test]
async fn test_dropped_receive_loses_no_data() {
    let provider = Arc::new(MemoryProvider::new());
    let reactor = reactor(&provider, 16);
    let conn = reactor.admit(accepted()).unwrap();
    let id = conn.id();

    let timed_out = tokio::time::timeout(Duration::from_millis(20), conn.receive()).await;
    assert!(timed_out.is_err());
    assert_eq!(provider.pending_receives(id), 1);

    // Completes with nobody waiting on it.
    provider.deliver(id, b"hello");
    eventually("completion observed", || reactor.outstanding_operations() == 0).await;
    assert_eq!(reactor.arena_checked_out(), 0);
    provider.deliver(id, b"world");

    assert_eq!(&conn.receive().await.unwrap()[..], b"hello");
    assert_eq!(&conn.receive().await.unwrap()[..], b"world");
    assert_eq!(conn.state(), ConnectionState::Open);
}

#[tokio::test]
async fn test_receive_retry_picks_up_in_flight_operation() {
    let provider = Arc::new(MemoryProvider::new());
    let reactor = reactor(&provider, 16);
    let conn = reactor.admit(accepted()).unwrap();
    let id = conn.id();

    for _ in 0..2 {
        // Times out again rather than failing with AlreadyPending.
        let retry = tokio::time::timeout(Duration::from_millis(20), conn.receive()).await;
        assert!(retry.is_err());
    }
    assert_eq!(provider.pending_receives(id), 1);
    assert_eq!(reactor.outstanding_operations(), 1);

    let (data, ()) = tokio::join!(conn.receive(), async {
        tokio::time::sleep(Duration::from_millis(10)).await;
        provider.deliver(id, b"late");
    });
    assert_eq!(&data.unwrap()[..], b"late");
    assert_eq!(reactor.arena_checked_out(), 0);
    assert_eq!(reactor.outstanding_operations(), 0);
}

#[tokio::test]
async fn test_zero_byte_receive_closes_receive_side() {
    let provider = Arc::new(MemoryProvider::new());
    let reactor = reactor(&provider, 16);
    let conn = reactor.admit(accepted()).unwrap();

    provider.peer_close(conn.id());
    let eof = conn.receive().await.unwrap();
    assert!(eof.is_empty());
    assert_eq!(conn.state(), ConnectionState::PeerClosed);

    assert!(matches!(conn.receive().await, Err(EngineError::ConnectionClosed)));
    assert!(matches!(conn.receive().await, Err(EngineError::ConnectionClosed)));

    // Half-closed: the send side still works.
    provider.set_auto_complete_sends(true);
    assert_eq!(conn.send(b"bye").await.unwrap(), 3);
    assert_eq!(provider.transmitted(conn.id()), b"bye");
}

#[tokio::test]
async fn test_send_waits_for_its_completion() {
    let provider = Arc::new(MemoryProvider::new());
    let reactor = reactor(&provider, 16);
    let conn = Arc::new(reactor.admit(accepted()).unwrap());
    let id = conn.id();

    let send = tokio::spawn({
        let conn = conn.clone();
        async move { conn.send(b"hello").await }
    });
    eventually("send submitted", || provider.pending_sends(id) == 1).await;
    assert!(matches!(
        conn.send(b"again").await,
        Err(EngineError::AlreadyPending(_))
    ));
    assert_eq!(reactor.arena_checked_out(), 1);

    let sent = provider.complete_sends(id);
    assert_eq!(sent, vec![b"hello".to_vec()]);
    assert_eq!(send.await.unwrap().unwrap(), 5);
    assert_eq!(reactor.arena_checked_out(), 0);
}

#[tokio::test]
async fn test_payload_bounds_and_send_all() {
    let provider = Arc::new(MemoryProvider::new());
    provider.set_auto_complete_sends(true);
    let reactor = reactor(&provider, 16);
    let conn = reactor.admit(accepted()).unwrap();
    assert_eq!(conn.max_send(), 512);

    let big = vec![0xAB; 513];
    match conn.send(&big).await {
        Err(EngineError::PayloadTooLarge { len, max }) => assert_eq!((len, max), (513, 512)),
        other => panic!("expected PayloadTooLarge, got {:?}", other),
    }
    assert_eq!(conn.state(), ConnectionState::Open);

    let payload: Vec<u8> = (0..1546u32).map(|i| (i % 251) as u8).collect();
    assert_eq!(conn.send_all(&payload).await.unwrap(), payload.len());
    assert_eq!(provider.transmitted(conn.id()), payload);
    assert_eq!(conn.send(b"").await.unwrap(), 0);
}

#[tokio::test]
async fn test_empty_send_reports_connection_state() {
    let provider = Arc::new(MemoryProvider::new());
    let reactor = reactor(&provider, 4);
    let conn = reactor.admit(accepted()).unwrap();

    provider.peer_close(conn.id());
    assert!(conn.receive().await.unwrap().is_empty());
    assert_eq!(conn.send(b"").await.unwrap(), 0);

    conn.disconnect();
    assert_eq!(conn.state(), ConnectionState::Closed);
    assert!(matches!(conn.send(b"").await, Err(EngineError::ConnectionClosed)));
    assert!(matches!(
        conn.send(&[0u8; 513]).await,
        Err(EngineError::PayloadTooLarge { .. })
    ));
    assert_eq!(provider.pending_sends(conn.id()), 0);
}

#[tokio::test]
async fn test_exhausted_arena_is_backpressure_not_disconnect() {
    let provider = Arc::new(MemoryProvider::new());
    let reactor = reactor(&provider, 1);
    let a = Arc::new(reactor.admit(accepted()).unwrap());
    let b = reactor.admit(accepted()).unwrap();

    let pending = tokio::spawn({
        let a = a.clone();
        async move { a.receive().await }
    });
    eventually("segment held", || reactor.arena_checked_out() == 1).await;

    match b.receive().await {
        Err(EngineError::PoolExhausted { capacity }) => assert_eq!(capacity, 1),
        other => panic!("expected PoolExhausted, got {:?}", other),
    }
    assert_eq!(b.state(), ConnectionState::Open);

    provider.deliver(a.id(), b"x");
    assert_eq!(&pending.await.unwrap().unwrap()[..], b"x");

    provider.deliver(b.id(), b"y");
    assert_eq!(&b.receive().await.unwrap()[..], b"y");
}

#[tokio::test]
async fn test_submit_failure_disconnects_and_releases() {
    let provider = Arc::new(MemoryProvider::new());
    let reactor = reactor(&provider, 4);
    let conn = reactor.admit(accepted()).unwrap();

    provider.fail_submissions(true);
    assert!(matches!(
        conn.receive().await,
        Err(EngineError::Platform { op: "submit_receive", .. })
    ));
    assert_eq!(conn.state(), ConnectionState::Closed);
    assert_eq!(reactor.arena_checked_out(), 0);
    assert_eq!(reactor.outstanding_operations(), 0);
    assert_eq!(reactor.connection_count(), 0);
    assert_eq!(provider.open_request_queues(), 0);

    provider.fail_submissions(false);
    assert!(matches!(conn.receive().await, Err(EngineError::ConnectionClosed)));
}

#[tokio::test]
async fn test_failed_completion_surfaces_native_code() {
    let provider = Arc::new(MemoryProvider::new());
    let reactor = reactor(&provider, 4);
    let conn = Arc::new(reactor.admit(accepted()).unwrap());
    let id = conn.id();

    let pending = tokio::spawn({
        let conn = conn.clone();
        async move { conn.receive().await }
    });
    eventually("receive submitted", || provider.pending_receives(id) == 1).await;

    // First operation on a connection carries context 1.
    provider.inject(
        reactor.completion_queue(),
        CompletionResult {
            connection: id,
            context: OperationContext(1),
            bytes_transferred: 0,
            status: CompletionStatus::Failed(ECONNRESET),
        },
    );

    match pending.await.unwrap() {
        Err(EngineError::Platform { op, code }) => {
            assert_eq!(op, "receive");
            assert_eq!(code, ECONNRESET);
        }
        other => panic!("expected Platform error, got {:?}", other),
    }
    eventually("connection retired", || reactor.connection_count() == 0).await;
    assert_eq!(conn.state(), ConnectionState::Closed);
    assert_eq!(reactor.arena_checked_out(), 0);
}

#[tokio::test]
async fn test_drop_disconnects() {
    let provider = Arc::new(MemoryProvider::new());
    let reactor = reactor(&provider, 4);
    let conn: Connection = reactor.admit(accepted()).unwrap();
    assert_eq!(conn.peer_addr(), Some("10.0.0.7:40000".parse().unwrap()));
    assert_eq!(conn.reactor_id(), 0);
    assert_eq!(reactor.connection_count(), 1);

    drop(conn);
    assert_eq!(reactor.connection_count(), 0);
    assert_eq!(provider.open_request_queues(), 0);
}
