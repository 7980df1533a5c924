//! # Dispatcher Demo
//!
//! Purpose: Exercise the asynchronous surface against a live store: a few
//! writes and reads, then a subscription fed by the synchronous publisher.
//!
//! Usage: `kvbridge-demo [host] [port] [password]` or
//! `kvbridge-demo --config path/to/config.json`.

use std::env;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use kvbridge_dispatch::{ClientConfig, Dispatcher, DispatcherConfig, IntervalTicker};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 6379;
const TICK_INTERVAL: Duration = Duration::from_millis(16);
const DEMO_CHANNEL: &str = "kvbridge-demo";
const MESSAGE_COUNT: usize = 5;

fn load_config() -> Result<DispatcherConfig> {
    let mut args = env::args().skip(1);
    match args.next() {
        Some(flag) if flag == "--config" => {
            let path = args.next().context("--config needs a path")?;
            DispatcherConfig::from_json_file(&path)
                .with_context(|| format!("loading {}", path))
        }
        host => {
            let host = host.unwrap_or_else(|| DEFAULT_HOST.to_string());
            let port = args
                .next()
                .map(|raw| raw.parse::<u16>())
                .transpose()
                .context("port must be a number")?
                .unwrap_or(DEFAULT_PORT);
            let password = args.next().unwrap_or_default();
            Ok(DispatcherConfig::new(ClientConfig::new(host, port, password)))
        }
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = load_config()?;
    let dispatcher = Arc::new(Dispatcher::new(config).context("starting dispatcher")?);
    dispatcher.connect().context("connecting synchronous facade")?;

    let ticker = IntervalTicker::start(TICK_INTERVAL);
    dispatcher.attach(&ticker);

    let done = Arc::new(AtomicUsize::new(0));

    let counter = Arc::clone(&done);
    dispatcher.async_set_str("kvbridge:demo:greeting", "hello", move |ok| {
        info!(ok, "set greeting");
        counter.fetch_add(1, Ordering::SeqCst);
    });
    let counter = Arc::clone(&done);
    dispatcher.async_get_int("kvbridge:demo:never-set", move |ok, value| {
        info!(ok, value, "read unset counter");
        counter.fetch_add(1, Ordering::SeqCst);
    });
    let counter = Arc::clone(&done);
    dispatcher.async_hmset(
        "kvbridge:demo:hash",
        &[("lang", "rust"), ("kind", "demo")],
        move |ok| {
            info!(ok, "hmset");
            counter.fetch_add(1, Ordering::SeqCst);
        },
    );
    let counter = Arc::clone(&done);
    dispatcher.async_hgetall("kvbridge:demo:hash", move |ok, fields| {
        info!(ok, fields = ?fields, "hgetall");
        counter.fetch_add(1, Ordering::SeqCst);
    });

    let received = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&received);
    dispatcher
        .subscribe(DEMO_CHANNEL, move |channel, message| {
            info!(channel, message, "message");
            seen.fetch_add(1, Ordering::SeqCst);
        })
        .context("subscribing")?;
    for idx in 0..MESSAGE_COUNT {
        dispatcher
            .publish(DEMO_CHANNEL, &format!("message {}", idx))
            .context("publishing")?;
    }

    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline
        && (done.load(Ordering::SeqCst) < 4 || received.load(Ordering::SeqCst) < MESSAGE_COUNT)
    {
        thread::sleep(TICK_INTERVAL);
    }
    if received.load(Ordering::SeqCst) < MESSAGE_COUNT {
        warn!(received = received.load(Ordering::SeqCst), "not every message arrived");
    }

    dispatcher.unsubscribe(DEMO_CHANNEL);
    ticker.stop();
    dispatcher.shutdown();
    info!(stats = ?dispatcher.stats(), "done");
    Ok(())
}
