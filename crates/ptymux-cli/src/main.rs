//! ptymux: drive one interactive terminal program line by line.
//!
//! Every stdin line is sent to the session as one request and the framed,
//! sanitized answer is printed. Lines starting with `:` are local commands.

mod config;

use anyhow::Context;
use clap::Parser;
use config::{CliConfig, Overrides};
use ptymux_core::{CredentialEnv, SendError, SessionRegistry};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, error, info, warn};

/// ptymux: interactive PTY session driver
#[derive(Parser, Debug)]
#[command(name = "ptymux", version, about = "Drive an interactive terminal program line by line")]
struct Cli {
    /// Config file path
    #[arg(long, default_value = "~/.ptymux/config.toml")]
    config: String,

    /// Session id
    #[arg(long, default_value = "default")]
    id: String,

    /// Per-request timeout in seconds
    #[arg(long)]
    timeout: Option<u64>,

    /// Environment for the child, KEY=VALUE (repeatable). Values are never logged.
    #[arg(short, long = "env", value_parser = parse_env)]
    env: Vec<(String, String)>,

    /// Variable that must be set before the child is started (repeatable)
    #[arg(long = "require-env")]
    require_env: Vec<String>,

    /// Alternative executable to try if the command does not resolve (repeatable)
    #[arg(long = "fallback")]
    fallbacks: Vec<String>,

    /// Working directory for the child
    #[arg(long)]
    cwd: Option<PathBuf>,

    /// Keep an in-memory transcript (dump with `:transcript`)
    #[arg(long)]
    transcript: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Program and arguments, e.g. `ptymux -- kubectl-ai --quiet`
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    command: Vec<String>,
}

fn parse_env(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((name, value)) if !name.is_empty() => Ok((name.to_string(), value.to_string())),
        _ => Err("expected KEY=VALUE".to_string()),
    }
}

/// Interval between idle-session sweeps.
const GC_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Logs go to stderr; stdout carries only answers.
    use tracing_subscriber::EnvFilter;
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), id = %cli.id, "starting ptymux");

    let config_path = PathBuf::from(&cli.config);
    let cfg = CliConfig::load(
        Some(&config_path),
        Overrides {
            command: cli.command,
            fallbacks: cli.fallbacks,
            working_dir: cli.cwd,
            require_env: cli.require_env,
            send_timeout_secs: cli.timeout,
            transcript: cli.transcript,
        },
    )
    .context("failed to load config")?;

    let env: CredentialEnv = cli.env.into_iter().collect();
    debug!(vars = ?env, "credential environment");

    let timeout = cfg.session.send_timeout();
    let registry =
        Arc::new(SessionRegistry::new(cfg.session.clone()).context("invalid framing rules")?);
    registry
        .create(&cli.id, &cfg.launch, &env)
        .await
        .with_context(|| format!("failed to start session {}", cli.id))?;

    let gc = {
        let registry = Arc::clone(&registry);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(GC_INTERVAL);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                registry.gc().await;
            }
        })
    };

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        let line = tokio::select! {
            line = lines.next_line() => line,
            _ = &mut shutdown => {
                info!("received shutdown signal");
                break;
            }
        };
        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                error!(error = %e, "failed to read stdin");
                break;
            }
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        match line {
            ":quit" | ":exit" => break,
            ":status" => {
                let sessions = registry.list().await;
                println!("{}", serde_json::to_string_pretty(&sessions)?);
            }
            ":transcript" => match registry.get(&cli.id).await {
                Some(session) => print!("{}", session.transcript_jsonl()),
                None => eprintln!("no session {}", cli.id),
            },
            ":interrupt" => match registry.get(&cli.id).await {
                Some(session) => {
                    if let Err(e) = session.interrupt().await {
                        eprintln!("interrupt failed: {e}");
                    }
                }
                None => eprintln!("no session {}", cli.id),
            },
            ":stop" => {
                registry.stop(&cli.id).await;
                break;
            }
            text => {
                // Restarts the child if it crashed since the last request.
                if let Err(e) = registry.create(&cli.id, &cfg.launch, &env).await {
                    error!(session_id = %cli.id, error = %e, "failed to start session");
                    continue;
                }
                tokio::select! {
                    result = registry.send(&cli.id, text, timeout) => match result {
                        Ok(answer) => println!("{answer}"),
                        Err(e @ SendError::ProcessDied) => {
                            warn!(session_id = %cli.id, "child died; it will be restarted on the next line");
                            eprintln!("error: {e}");
                        }
                        Err(e) => eprintln!("error: {e}"),
                    },
                    _ = &mut shutdown => {
                        info!("received shutdown signal");
                        break;
                    }
                }
            }
        }
    }

    gc.abort();
    registry.shutdown().await;
    info!("ptymux stopped");
    Ok(())
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(s) => s,
                Err(e) => {
                    warn!(error = %e, "failed to install SIGTERM handler");
                    ctrl_c.await.ok();
                    return;
                }
            };
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
