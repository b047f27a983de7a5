//! # io_uring Loopback
//!
//! Real kernel path: a supervisor on 127.0.0.1 with the io_uring provider
//! echoes what a blocking client writes. Skipped where io_uring is
//! unavailable (old kernels, seccomp-restricted containers).

use std::io::{Read, Write};
use std::net::TcpStream;
use std::time::{Duration, Instant};
use tcp_x::{Connection, EngineSettings, Supervisor, UringProvider};

#[test]
fn test_echo_over_loopback() {
    if !UringProvider::is_supported() {
        println!("test_echo_over_loopback: io_uring unavailable, skipping");
        return;
    }
    let t = Instant::now();

    let settings = EngineSettings {
        host: "127.0.0.1".to_string(),
        port: 0,
        reactor_count: Some(1),
        segment_length: 1024,
        segment_count: 64,
        completion_queue_depth: 256,
        poll_interval_ms: 5,
        pin_reactors: false,
        ..EngineSettings::default()
    };

    let supervisor = match Supervisor::builder(settings).start(|conn: Connection| async move {
        loop {
            match conn.receive().await {
                Ok(chunk) if chunk.is_empty() => break,
                Ok(chunk) => {
                    if conn.send_all(&chunk).await.is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    }) {
        Ok(supervisor) => supervisor,
        Err(e) => {
            println!("test_echo_over_loopback: engine failed to start ({}), skipping", e);
            return;
        }
    };
    let addr = supervisor.local_addr().unwrap();

    let mut client = TcpStream::connect(addr).unwrap();
    client.set_read_timeout(Some(Duration::from_secs(5))).unwrap();

    for round in 0..16u32 {
        let msg = format!("round-{}:{}", round, "x".repeat(round as usize * 37));
        client.write_all(msg.as_bytes()).unwrap();
        let mut echoed = vec![0u8; msg.len()];
        client.read_exact(&mut echoed).unwrap();
        assert_eq!(echoed, msg.as_bytes());
    }

    drop(client);
    supervisor.stop();
    assert_eq!(supervisor.outstanding_operations(), 0);
    for reactor in supervisor.reactors() {
        assert_eq!(reactor.arena_checked_out(), 0);
        assert_eq!(reactor.connection_count(), 0);
    }

    println!("test_echo_over_loopback: Testing Overhead = {:?}", t.elapsed());
}
