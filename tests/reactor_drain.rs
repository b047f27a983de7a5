//! # Reactor Drain & Lifetime
//!
//! Completion routing, orphaned entries, connection records that outlive a
//! disconnect until their last completion, queue corruption, and shutdown
//! quiescence.

use socket2::{Domain, Socket, Type};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tcp_x::{
    AcceptedSocket, CancelMode, CompletionResult, CompletionStatus, ConnectionId, ConnectionState,
    EngineError, EngineSettings, MemoryProvider, Reactor, ReactorFault, ReactorState,
};
use tcp_x::types::OperationContext;
use tokio::sync::mpsc;

fn settings() -> EngineSettings {
    EngineSettings {
        reactor_count: Some(1),
        segment_length: 1024,
        segment_count: 32,
        completion_queue_depth: 256,
        drain_batch: 16,
        poll_interval_ms: 5,
        pin_reactors: false,
        ..EngineSettings::default()
    }
}

fn accepted() -> AcceptedSocket {
    AcceptedSocket {
        socket: Socket::new(Domain::IPV4, Type::STREAM, None).unwrap(),
        peer: None,
    }
}

async fn eventually(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
}

#[tokio::test]
async fn test_one_receive_drains_exactly_one_entry() {
    let t = Instant::now();
    let provider = Arc::new(MemoryProvider::new());
    let reactor = Reactor::start(0, provider.clone(), &settings(), None).unwrap();
    let conn = Arc::new(reactor.admit(accepted()).unwrap());
    let id = conn.id();

    let pending = tokio::spawn({
        let conn = conn.clone();
        async move { conn.receive().await }
    });
    eventually("receive submitted", || provider.pending_receives(id) == 1).await;
    assert_eq!(provider.nonempty_drains(), 0);

    provider.deliver(id, b"exactly-once");
    let data = pending.await.unwrap().unwrap();

    assert_eq!(&data[..], b"exactly-once");
    assert_eq!(provider.nonempty_drains(), 1);
    assert_eq!(reactor.orphaned_completions(), 0);
    assert_eq!(reactor.outstanding_operations(), 0);

    println!("test_one_receive_drains_exactly_one_entry: Testing Overhead = {:?}", t.elapsed());
}

#[tokio::test]
async fn test_completion_for_unknown_connection_is_dropped() {
    let provider = Arc::new(MemoryProvider::new());
    let reactor = Reactor::start(0, provider.clone(), &settings(), None).unwrap();
    let conn = reactor.admit(accepted()).unwrap();

    provider.inject(
        reactor.completion_queue(),
        CompletionResult {
            connection: ConnectionId(u32::MAX - 1),
            context: OperationContext(1),
            bytes_transferred: 10,
            status: CompletionStatus::Success,
        },
    );
    // Right connection, context nobody submitted.
    provider.inject(
        reactor.completion_queue(),
        CompletionResult {
            connection: conn.id(),
            context: OperationContext(77),
            bytes_transferred: 10,
            status: CompletionStatus::Success,
        },
    );

    eventually("orphans counted", || reactor.orphaned_completions() == 2).await;
    assert_eq!(reactor.arena_checked_out(), 0);
    assert_eq!(conn.state(), ConnectionState::Open);
}

#[tokio::test]
async fn test_disconnect_keeps_record_until_last_completion() {
    let provider = Arc::new(MemoryProvider::with_cancel_mode(CancelMode::Deferred));
    let reactor = Reactor::start(0, provider.clone(), &settings(), None).unwrap();
    let conn = Arc::new(reactor.admit(accepted()).unwrap());
    let id = conn.id();

    let pending = tokio::spawn({
        let conn = conn.clone();
        async move { conn.receive().await }
    });
    eventually("receive submitted", || provider.pending_receives(id) == 1).await;

    conn.disconnect();
    assert_eq!(conn.state(), ConnectionState::Closing);

    // Cancellation has not landed yet: nothing may be freed.
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(reactor.connection_count(), 1);
    assert_eq!(reactor.arena_checked_out(), 1);
    assert_eq!(reactor.outstanding_operations(), 1);
    assert_eq!(provider.open_request_queues(), 1);
    assert!(matches!(conn.receive().await, Err(EngineError::ConnectionClosed)));

    provider.flush_cancellations();
    assert!(matches!(pending.await.unwrap(), Err(EngineError::ConnectionClosed)));

    eventually("record retired", || reactor.connection_count() == 0).await;
    assert_eq!(conn.state(), ConnectionState::Closed);
    assert_eq!(reactor.arena_checked_out(), 0);
    assert_eq!(reactor.outstanding_operations(), 0);
    assert_eq!(provider.open_request_queues(), 0);
}

#[tokio::test]
async fn test_failure_after_disconnect_retires_record() {
    const ECONNRESET: i32 = 104;
    let provider = Arc::new(MemoryProvider::with_cancel_mode(CancelMode::Deferred));
    let reactor = Reactor::start(0, provider.clone(), &settings(), None).unwrap();
    let conn = Arc::new(reactor.admit(accepted()).unwrap());
    let id = conn.id();

    let pending = tokio::spawn({
        let conn = conn.clone();
        async move { conn.receive().await }
    });
    eventually("receive submitted", || provider.pending_receives(id) == 1).await;

    conn.disconnect();
    assert_eq!(conn.state(), ConnectionState::Closing);

    // The reset beats the cancellation.
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
        Err(EngineError::Platform { op: "receive", code }) => assert_eq!(code, ECONNRESET),
        other => panic!("expected the native failure, got {:?}", other),
    }

    eventually("record retired", || reactor.connection_count() == 0).await;
    assert_eq!(conn.state(), ConnectionState::Closed);
    assert_eq!(reactor.arena_checked_out(), 0);
    assert_eq!(reactor.outstanding_operations(), 0);
    assert_eq!(provider.open_request_queues(), 0);

    let (done_tx, done_rx) = std::sync::mpsc::channel();
    std::thread::spawn(move || {
        reactor.stop();
        let _ = done_tx.send(reactor.state());
    });
    assert_eq!(
        done_rx.recv_timeout(Duration::from_secs(5)).expect("stop returned"),
        ReactorState::Stopped
    );
}

#[tokio::test]
async fn test_send_success_after_disconnect_retires_record() {
    let provider = Arc::new(MemoryProvider::with_cancel_mode(CancelMode::Deferred));
    provider.set_auto_complete_sends(false);
    let reactor = Reactor::start(0, provider.clone(), &settings(), None).unwrap();
    let conn = Arc::new(reactor.admit(accepted()).unwrap());
    let id = conn.id();

    let pending = tokio::spawn({
        let conn = conn.clone();
        async move { conn.send(b"bye").await }
    });
    eventually("send submitted", || provider.pending_sends(id) == 1).await;

    conn.disconnect();
    assert_eq!(conn.state(), ConnectionState::Closing);

    // The send went out before the cancellation could reach it.
    assert_eq!(provider.complete_sends(id), vec![b"bye".to_vec()]);
    assert_eq!(pending.await.unwrap().unwrap(), 3);

    eventually("record retired", || reactor.connection_count() == 0).await;
    assert_eq!(conn.state(), ConnectionState::Closed);
    assert_eq!(reactor.arena_checked_out(), 0);
    assert_eq!(reactor.outstanding_operations(), 0);
    assert_eq!(provider.open_request_queues(), 0);

    // The stale cancellation went away with the request queue.
    provider.flush_cancellations();
    reactor.stop();
    assert_eq!(reactor.state(), ReactorState::Stopped);
}

#[tokio::test]
async fn test_queue_corruption_fails_every_connection_and_reports() {
    let provider = Arc::new(MemoryProvider::new());
    let (faults_tx, mut faults_rx) = mpsc::unbounded_channel::<ReactorFault>();
    let reactor = Reactor::start(3, provider.clone(), &settings(), Some(faults_tx)).unwrap();
    let busy = Arc::new(reactor.admit(accepted()).unwrap());
    let idle = reactor.admit(accepted()).unwrap();

    let pending = tokio::spawn({
        let busy = busy.clone();
        async move { busy.receive().await }
    });
    eventually("receive submitted", || provider.pending_receives(busy.id()) == 1).await;

    provider.corrupt(reactor.completion_queue());

    match pending.await.unwrap() {
        Err(EngineError::QueueCorrupted { reactor }) => assert_eq!(reactor, 3),
        other => panic!("expected QueueCorrupted, got {:?}", other),
    }
    let fault = faults_rx.recv().await.unwrap();
    assert_eq!(fault, ReactorFault { reactor: 3, connections: 2 });

    assert!(matches!(
        idle.receive().await,
        Err(EngineError::QueueCorrupted { reactor: 3 })
    ));
    assert_eq!(idle.state(), ConnectionState::Closed);

    eventually("reactor stopped", || reactor.state() == ReactorState::Stopped).await;
    assert_eq!(reactor.arena_checked_out(), 0);
    assert_eq!(reactor.outstanding_operations(), 0);
    assert_eq!(reactor.connection_count(), 0);
    assert!(matches!(reactor.admit(accepted()), Err(EngineError::Stopped)));

    // Queue dropped, arena memory abandoned rather than handed back.
    assert_eq!(provider.open_completion_queues(), 0);
    assert_eq!(provider.open_request_queues(), 0);
    assert_eq!(provider.deregistrations(), 0);
}

#[tokio::test]
async fn test_stop_waits_for_outstanding_operations() {
    let provider = Arc::new(MemoryProvider::with_cancel_mode(CancelMode::Deferred));
    let reactor = Reactor::start(0, provider.clone(), &settings(), None).unwrap();
    let conn = Arc::new(reactor.admit(accepted()).unwrap());
    let id = conn.id();

    let pending = tokio::spawn({
        let conn = conn.clone();
        async move { conn.receive().await }
    });
    eventually("receive submitted", || provider.pending_receives(id) == 1).await;

    let flusher = {
        let provider = provider.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            provider.flush_cancellations();
        })
    };

    let t = Instant::now();
    reactor.stop();
    assert!(t.elapsed() >= Duration::from_millis(40), "stop returned before the cancel landed");
    flusher.join().unwrap();

    assert_eq!(reactor.state(), ReactorState::Stopped);
    assert_eq!(reactor.outstanding_operations(), 0);
    assert_eq!(reactor.arena_checked_out(), 0);
    assert_eq!(reactor.connection_count(), 0);
    assert_eq!(provider.open_completion_queues(), 0);
    assert_eq!(provider.registered_buffers(), 0);
    assert_eq!(provider.deregistrations(), 1);
    assert!(matches!(pending.await.unwrap(), Err(EngineError::ConnectionClosed)));

    reactor.stop();
    assert!(matches!(reactor.admit(accepted()), Err(EngineError::Stopped)));
}

#[test]
fn test_drain_respects_batch_cap() {
    let provider = Arc::new(MemoryProvider::new());
    let reactor = Reactor::start(0, provider.clone(), &settings(), None).unwrap();
    let cq = reactor.completion_queue();

    // 40 orphans with a cap of 16: at least three dequeues, all entries seen.
    for i in 0..40 {
        provider.inject(
            cq,
            CompletionResult {
                connection: ConnectionId(u32::MAX - 1),
                context: OperationContext(i),
                bytes_transferred: 0,
                status: CompletionStatus::Success,
            },
        );
    }
    let deadline = Instant::now() + Duration::from_secs(5);
    while reactor.orphaned_completions() < 40 {
        assert!(Instant::now() < deadline, "timed out draining");
        std::thread::sleep(Duration::from_millis(1));
    }
    assert!(provider.nonempty_drains() >= 3);
    reactor.stop();
}
