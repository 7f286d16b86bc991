//! Realtime listener binary.
//!
//! Loads a session context, runs the realtime engine against the edge chat
//! endpoint and prints every consumer event as one JSON line on stdout.
//! On Ctrl-C or a terminal event the engine is stopped and the session file
//! is rewritten with the updated sync cursor.

use anyhow::Context;
use clap::Parser;
use msgr_delta::Event;
use msgr_health::{HealthSnapshot, RiskTier};
use msgr_session::{Engine, HttpAccountProbe, NoServices, SessionServices, WsConnector};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

mod config;
mod logging;

use config::{load_session, save_session, ListenConfig};
use logging::ListenLogFormatter;

/// Listen to a Messenger session's realtime channel
#[derive(Parser, Debug)]
#[command(name = "msgr-listen", version, about = "Realtime Messenger listener")]
struct Args {
    /// Configuration file path
    #[arg(long, default_value = "msgr.yaml")]
    config: PathBuf,

    /// Session file (JSON); overrides `session_file` from the config
    #[arg(long)]
    session: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Risk tier (low, medium, high); overrides the session file
    #[arg(long)]
    risk_tier: Option<RiskTier>,

    /// Health snapshot logging interval, e.g. 60s
    #[arg(long, default_value = "60s")]
    stats_interval: humantime::Duration,
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let env_filter = EnvFilter::new("warn")
        .add_directive(format!("msgr_listen={}", args.log_level).parse()?)
        .add_directive(format!("msgr_session={}", args.log_level).parse()?)
        .add_directive(format!("msgr_delta={}", args.log_level).parse()?)
        .add_directive(format!("msgr_health={}", args.log_level).parse()?)
        .add_directive(format!("msgr_wire={}", args.log_level).parse()?);

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .event_format(ListenLogFormatter::new("msgr-listen"))
        .init();

    info!("Starting msgr-listen v{}", env!("CARGO_PKG_VERSION"));

    let config = ListenConfig::load_from_file(&args.config)?;
    let session_path = args.session.clone().unwrap_or_else(|| config.session_file.clone());

    let mut ctx = load_session(&session_path)?;
    config.session.apply(&mut ctx);
    if let Some(tier) = args.risk_tier {
        ctx.risk_tier = tier;
    }
    component_info!(
        "session",
        "Session for user {} loaded from {:?} (seq {}, tier {})",
        ctx.user_id,
        session_path,
        ctx.cursor.last_seq_id,
        ctx.risk_tier
    );

    let services: Arc<dyn SessionServices> = if config.account_probe {
        Arc::new(HttpAccountProbe::new().context("failed to build the account probe")?)
    } else {
        Arc::new(NoServices)
    };

    let (handle, mut events) = Engine::start(
        ctx,
        config.engine.clone(),
        Arc::new(WsConnector::new()),
        services,
    );

    let stats_interval: Duration = args.stats_interval.into();
    let mut stats = tokio::time::interval(stats_interval.max(Duration::from_secs(1)));
    stats.tick().await;

    let mut stdout = std::io::stdout();
    loop {
        tokio::select! {
            event = events.next_event() => {
                let Some(event) = event else {
                    component_info!("engine", "Event stream ended");
                    break;
                };
                component_debug!("engine", "Event {}", event.kind());
                print_event(&mut stdout, &event)?;
                if event.is_terminal() {
                    component_warn!("engine", "Listening ended: {}", event.kind());
                }
            }
            _ = stats.tick() => log_health(&handle.health()),
            _ = tokio::signal::ctrl_c() => {
                component_info!("engine", "Interrupted, stopping");
                break;
            }
        }
    }

    drop(events);
    let ctx = handle.stop().await.context("engine did not stop cleanly")?;
    if let Err(e) = save_session(&session_path, &ctx) {
        component_error!("session", "Could not save session to {:?}: {:#}", session_path, e);
        return Err(e);
    }
    component_info!(
        "session",
        "Session saved to {:?} (seq {})",
        session_path,
        ctx.cursor.last_seq_id
    );
    Ok(())
}

fn print_event(out: &mut impl Write, event: &Event) -> anyhow::Result<()> {
    let line = serde_json::to_string(event)?;
    writeln!(out, "{}", line)?;
    out.flush()?;
    Ok(())
}

fn log_health(health: &HealthSnapshot) {
    let line = format!(
        "state={} healthy={} idle={}ms reconnects={} failures={} backoff={}ms messages={} errors={} acks={}/{} ack_avg={:?}ms",
        health.state,
        health.healthy,
        health.idle_ms,
        health.reconnect_count,
        health.consecutive_failures,
        health.backoff_ms,
        health.messages,
        health.errors,
        health.acks.acks,
        health.acks.sends,
        health.acks.avg_ack_latency_ms.map(|ms| ms.round() as u64),
    );
    if health.healthy {
        component_info!("health", "{}", line);
    } else {
        component_warn!("health", "{}", line);
    }
}
