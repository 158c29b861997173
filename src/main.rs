// Copyright 2026 BadCompany
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

// Main entry point for the oneedge edge agent
use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::info;

use oneedge_agent::agent::trigger::HangupListener;
use oneedge_agent::agent::{self, state_dir, Agent, AgentContext};
use oneedge_agent::config::{AgentConfig, IdentitySourceKind};
use oneedge_agent::identity::IdentityManager;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    /// MQTT broker address (host:port)
    #[arg(long, global = true)]
    broker: Option<String>,

    /// MQTT topic for telemetry
    #[arg(long, global = true)]
    topic: Option<String>,

    /// Agent state directory (default ~/.oneedge)
    #[arg(long, global = true)]
    state_dir: Option<PathBuf>,

    /// Directory holding svid.pem, svid_key.pem and svid_bundle.pem
    #[arg(long, global = true)]
    svid_dir: Option<PathBuf>,

    /// Where SVIDs come from: pem-dir or workload-api
    #[arg(long, global = true)]
    identity_source: Option<String>,

    /// Log format: text or json
    #[arg(long, global = true)]
    log_format: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the agent (default)
    Run,
    /// Ask the running agent to refresh its SVID now
    Rotate,
    /// Fetch the current SVID once and print it
    Svid {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Install panic hook
    install_panic_hook();

    // Load config, CLI flags overlay the environment
    let mut config = match &cli.state_dir {
        Some(dir) => AgentConfig::from_env_with_state_dir(dir.clone()),
        None => AgentConfig::from_env().unwrap_or_else(|e| {
            eprintln!(
                "Warning: Failed to load config from env, using defaults: {}",
                e
            );
            AgentConfig::default()
        }),
    };
    if let Some(broker) = cli.broker {
        config.broker = broker;
    }
    if let Some(topic) = cli.topic {
        config.topic = topic;
    }
    if let Some(dir) = cli.svid_dir {
        config.svid_dir = dir;
    }
    if let Some(kind) = cli.identity_source {
        config.identity_source = IdentitySourceKind::parse_safe(&kind);
    }
    if let Some(format) = cli.log_format {
        config.log_format = format;
    }

    if let Err(e) = init_tracing(&config) {
        eprintln!("Failed to init tracing: {}", e);
    }

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => run(config).await,
        Command::Rotate => rotate(&config),
        Command::Svid { json } => show_svid(config, json).await,
    }
}

async fn run(config: AgentConfig) -> anyhow::Result<()> {
    // Before the PID file exists, so `rotate` can never hit the default action.
    let hangup = HangupListener::install();

    state_dir::ensure(&config.state_dir)
        .with_context(|| format!("prepare state dir {}", config.state_dir.display()))?;
    let pid_file = state_dir::PidFile::acquire(&config.pid_file_path())?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        source = config.identity_source.as_str(),
        "starting oneedge-agent"
    );

    let ctx = AgentContext::new(config);
    tokio::spawn(cancel_on_shutdown_signal(ctx.shutdown.clone()));

    let result = match agent::build_source(&ctx.config) {
        Ok(source) => match Agent::new(ctx, source) {
            Ok(agent) => agent.with_hangup(hangup).run().await,
            Err(e) => Err(e),
        },
        Err(e) => Err(e),
    };

    pid_file.release();
    result.map_err(Into::into)
}

fn rotate(config: &AgentConfig) -> anyhow::Result<()> {
    state_dir::ensure(&config.state_dir)?;
    let marker = config.rotate_marker_path();
    state_dir::touch_marker(&marker)
        .with_context(|| format!("touch {}", marker.display()))?;
    println!("Rotate marker touched: {}", marker.display());

    match state_dir::read_pid(&config.pid_file_path()) {
        Ok(pid) => {
            if send_hangup(pid)? {
                println!("Sent SIGHUP to agent (pid {})", pid);
            } else {
                println!(
                    "Warning: no process with pid {} (stale pid file); the marker is picked up on the next poll",
                    pid
                );
            }
        }
        Err(e) => println!(
            "Agent PID unavailable ({}); the marker is picked up on the next poll",
            e
        ),
    }
    Ok(())
}

/// Returns false when no process with `pid` exists.
#[cfg(unix)]
fn send_hangup(pid: i32) -> anyhow::Result<bool> {
    use nix::errno::Errno;
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    match kill(Pid::from_raw(pid), Signal::SIGHUP) {
        Ok(()) => Ok(true),
        Err(Errno::ESRCH) => Ok(false),
        Err(e) => Err(e).with_context(|| format!("signal pid {}", pid)),
    }
}

#[cfg(not(unix))]
fn send_hangup(_pid: i32) -> anyhow::Result<bool> {
    Ok(false)
}

async fn show_svid(config: AgentConfig, json: bool) -> anyhow::Result<()> {
    let source = agent::build_source(&config)?;
    let manager = IdentityManager::new(
        source,
        config.timing.watch_retry_interval,
        &tracing::Span::none(),
    );
    let fetched = manager.fetch(config.timing.startup_timeout).await;
    manager.close().await;
    let cred = fetched.context("fetch SVID")?;

    let now = chrono::Utc::now();
    let ttl = cred.remaining_ttl(now);
    if json {
        let out = serde_json::json!({
            "spiffe_id": cred.spiffe_id().to_string(),
            "trust_domain": cred.trust_domain().to_string(),
            "not_after": cred.not_after().to_rfc3339(),
            "ttl_seconds": ttl.as_secs(),
            "fingerprint": cred.fingerprint(),
            "client_id": cred.client_id(),
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else {
        println!("SPIFFE ID:    {}", cred.spiffe_id());
        println!("Trust domain: {}", cred.trust_domain());
        println!("Not after:    {}", cred.not_after().to_rfc3339());
        println!("TTL:          {}s", ttl.as_secs());
        println!("Fingerprint:  {}", cred.fingerprint());
        println!("Client ID:    {}", cred.client_id());
    }
    Ok(())
}

async fn cancel_on_shutdown_signal(token: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => info!("received SIGINT"),
                    _ = term.recv() => info!("received SIGTERM"),
                }
            }
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
    token.cancel();
}

fn install_panic_hook() {
    std::panic::set_hook(Box::new(|panic_info| {
        let location = panic_info
            .location()
            .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
            .unwrap_or_else(|| "unknown".to_string());

        let message = if let Some(s) = panic_info.payload().downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = panic_info.payload().downcast_ref::<String>() {
            s.clone()
        } else {
            "Unknown panic".to_string()
        };

        eprintln!("PANIC: {} at {}", message, location);
    }));
}

fn init_tracing(config: &AgentConfig) -> Result<(), Box<dyn std::error::Error>> {
    use tracing_subscriber::fmt;
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .unwrap_or_else(|_| EnvFilter::new("oneedge_agent=debug,info"));

    let subscriber = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_writer(std::io::stderr);

    if config.log_format == "json" {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    Ok(())
}
