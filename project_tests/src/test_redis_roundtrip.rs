//! # Live Redis Round Trip
//!
//! Runs the channel bridge against a real Redis server and checks that:
//!
//! 1. payloads published to a channel come back byte-identical and in order,
//! 2. two transports attached to one relay both see every message,
//! 3. a cancelled subscription stops receiving while others continue.
//!
//! ```text
//! cargo run -p project_tests --bin test_redis_roundtrip -- --redis-url redis://127.0.0.1:6379/
//! ```

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms, unused_qualifications)]

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use clap::Parser;
use tokio::time::timeout;

use lib_common::connections::RedisBroker;
use lib_common::{ChannelBridge, Payload};

const WAIT: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[clap(about = "Round-trips payloads through a live Redis channel")]
struct Args {
    #[clap(long, env = "BRIDGE_REDIS_URL", default_value = "redis://127.0.0.1:6379/")]
    redis_url: String,

    #[clap(long, default_value = "project_tests:roundtrip")]
    channel: String,

    #[clap(long, default_value_t = 20)]
    count: usize,
}

fn setup_logging() -> Result<()> {
    fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "{}[{}][{}] {}",
                chrono::Local::now().format("[%H:%M:%S]"),
                record.target(),
                record.level(),
                message
            ))
        })
        .level(log::LevelFilter::Info)
        .chain(std::io::stdout())
        .apply()?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_logging()?;
    let args = Args::parse();

    let broker = RedisBroker::connect(&args.redis_url)
        .await
        .with_context(|| format!("connecting to {}", args.redis_url))?;
    let bridge = ChannelBridge::new(Arc::new(broker));

    println!("--- Starting Redis Round Trip ---");

    // --- TEST 1: ordered, byte-identical delivery ---
    let (first, mut first_rx) = bridge.subscribe_stream(&args.channel).await?;
    let (second, mut second_rx) = bridge.subscribe_stream(&args.channel).await?;
    // Give the pub/sub connections time to register with the server.
    tokio::time::sleep(Duration::from_millis(200)).await;

    let sent: Vec<Payload> = (0..args.count)
        .map(|i| Payload::from(format!(r#"{{"seq":{},  "pad":"{}"}}"#, i, "x".repeat(i))))
        .collect();
    for payload in &sent {
        bridge.publish(&args.channel, payload).await?;
    }
    for (i, expected) in sent.iter().enumerate() {
        let got = timeout(WAIT, first_rx.recv()).await.context("waiting on first subscriber")?;
        match got {
            Some(bytes) if bytes.as_ref() == expected.as_bytes() => {}
            other => bail!("message {} differs: {:?}", i, other),
        }
    }
    println!("✅ TEST 1 Passed: {} payloads arrived intact and in order", args.count);

    // --- TEST 2: cancelling one subscription leaves the other alone ---
    first.cancel();
    for _ in 0..args.count {
        timeout(WAIT, second_rx.recv()).await.context("draining second subscriber")?;
    }
    bridge.publish(&args.channel, &Payload::from("after-cancel")).await?;
    match timeout(WAIT, second_rx.recv()).await? {
        Some(bytes) if bytes.as_ref() == b"after-cancel" => {}
        other => bail!("second subscriber missed a message: {:?}", other),
    }
    // The cancelled queue only closes; nothing published after the cancel reaches it.
    if let Some(bytes) = timeout(WAIT, first_rx.recv()).await.context("waiting on cancelled subscriber")? {
        bail!("cancelled subscriber still received {:?}", bytes);
    }
    println!("✅ TEST 2 Passed: cancellation is per subscription");
    drop(second);

    // --- TEST 3: one relay, two transports ---
    let relay = bridge.relay(&args.channel).await?;
    let mut alice = relay.connect("alice");
    let mut bob = relay.connect("bob");
    tokio::time::sleep(Duration::from_millis(200)).await;

    alice.send(Bytes::from_static(b"from alice")).await?;
    for link in [&mut alice, &mut bob] {
        match timeout(WAIT, link.recv()).await? {
            Some(bytes) if bytes.as_ref() == b"from alice" => {}
            other => bail!("transport {} got {:?}", link.id(), other),
        }
    }
    println!("✅ TEST 3 Passed: relay delivered to {} transports", relay.transport_count());

    println!("--- All Round Trip Tests Passed ---");
    Ok(())
}
