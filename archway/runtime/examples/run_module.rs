//! Example: running a guest module through the archway runner.
//!
//! ```text
//! cargo run --example run_module -- <module.wasm|module.wat> [payload...]
//! ```
//!
//! Each payload is published as one event. The guest's `stdout://` is the
//! terminal, and `file://` URLs resolve inside the current directory.

use std::sync::Arc;
use std::time::Duration;

use archway_bus::Broker;
use archway_runtime::{Event, Runner, RunnerConfig};
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let args: Vec<String> = std::env::args().collect();
    if args.len() < 2 {
        eprintln!("Usage: {} <module> [payload...]", args[0]);
        eprintln!("\nThe module must export `cwa_main` and may import");
        eprintln!("open/read/write/flush/close/env_get from \"dagger\".");
        std::process::exit(1);
    }

    let module = std::fs::read(&args[1])?;
    let payloads = &args[2..];

    let config = RunnerConfig {
        jail_root: Some(std::env::current_dir()?),
        ..RunnerConfig::default()
    };
    let runner = Arc::new(Runner::new(Broker::new(), config)?);
    let cancel = CancellationToken::new();
    let manager = Arc::clone(&runner).start(cancel.clone());

    runner.create("example", "example.events", module);
    let created = tokio::time::Instant::now() + Duration::from_secs(10);
    let handle = loop {
        if let Some(handle) = runner.handler("example") {
            break handle;
        }
        if tokio::time::Instant::now() > created {
            cancel.cancel();
            manager.await?;
            return Err("handler was not created; see the log for the link failure".into());
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    };

    for (i, payload) in payloads.iter().enumerate() {
        runner.publish_event(
            "example.events",
            Event::new(format!("event-{}", i), payload.clone().into_bytes()),
        );
    }

    let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
    while handle.executions() < payloads.len() as u64 {
        if tokio::time::Instant::now() > deadline {
            eprintln!("timed out waiting for the guest");
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    println!(
        "\nRan {} invocation(s); counters: {:?}",
        handle.executions(),
        runner.metrics().snapshot()
    );

    cancel.cancel();
    manager.await?;
    Ok(())
}
