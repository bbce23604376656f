//! # Pool Probe
//!
//! Purpose: Smoke-test a store endpoint through the pooled template using the
//! same settings file an application would ship.
//!
//! Usage: `poolkv-probe [settings.toml]`. Logging follows `RUST_LOG`.

use std::env;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tracing::info;
use tracing_subscriber::EnvFilter;

use poolkv_client::{ConnectionFactory, ExecutionTemplate, Settings};

const PROBE_KEY: &str = "poolkv:probe";
const PROBE_TTL: Duration = Duration::from_secs(30);

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    if let Err(err) = run() {
        eprintln!("poolkv-probe failed: {err:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let settings = match env::args().nth(1) {
        Some(path) => Settings::load(&path).with_context(|| format!("loading {path}"))?,
        None => Settings::default(),
    };

    let factory = ConnectionFactory::new(settings.pool).context("building pool")?;
    factory.start().context("starting pool")?;
    let template = ExecutionTemplate::new(factory.clone())
        .with_db_index(settings.template.db_index)
        .context("configuring template")?;

    let outcome = probe(&template);
    let stats = factory.stats();
    println!(
        "pool: idle={} active={} total={} max={} opened={} discarded={}",
        stats.idle, stats.active, stats.total, stats.max_size, stats.opened, stats.discarded
    );

    // Report the probe failure first; teardown errors are secondary.
    let stopped = factory.stop().context("stopping pool");
    outcome?;
    stopped
}

fn probe(template: &ExecutionTemplate) -> Result<()> {
    let started = Instant::now();
    let pong = template.ping().context("PING")?;
    info!(reply = %pong, elapsed = ?started.elapsed(), "endpoint reachable");

    let value = format!("probe-{}", std::process::id());
    template
        .set_with_ttl(PROBE_KEY, &value, PROBE_TTL)
        .context("SET probe key")?;
    let read_back = template.get(PROBE_KEY).context("GET probe key")?;
    anyhow::ensure!(
        read_back.as_deref() == Some(value.as_str()),
        "probe key read back as {read_back:?}, expected {value:?}"
    );
    let ttl = template.ttl(PROBE_KEY).context("TTL probe key")?;
    println!("probe ok: {pong}, ttl={}s, round trip {:?}", ttl.as_seconds(), started.elapsed());
    Ok(())
}
