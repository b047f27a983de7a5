//! Echo server on top of the io_uring provider.
//!
//! Usage: `cargo run --example echo_server [settings.toml]`

use tcp_x::{EngineSettings, Supervisor};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let settings = match std::env::args().nth(1) {
        Some(path) => EngineSettings::from_file(path)?,
        None => EngineSettings::default(),
    };

    let supervisor = Supervisor::builder(settings).start(|conn| async move {
        tracing::debug!("{:?} accepted", conn);
        loop {
            match conn.receive().await {
                Ok(chunk) if chunk.is_empty() => break,
                Ok(chunk) => {
                    if let Err(e) = conn.send_all(&chunk).await {
                        tracing::warn!("{}: echo failed: {}", conn.id(), e);
                        break;
                    }
                }
                Err(e) => {
                    tracing::debug!("{}: receive ended: {}", conn.id(), e);
                    break;
                }
            }
        }
    })?;

    println!("echo server listening on {:?}", supervisor.local_addr());

    let mut faults = supervisor.take_faults();
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        Some(fault) = async { faults.as_mut()?.recv().await } => {
            tracing::error!("reactor {} lost its completion queue ({} connections closed)", fault.reactor, fault.connections);
        }
    }

    supervisor.stop();
    Ok(())
}
