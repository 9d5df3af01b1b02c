// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

mod plugins;

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use telemetry_agent::config::{load_config, AgentConfig};
use telemetry_agent::models::{InputConfig, OutputConfig};
use telemetry_agent::{Agent, AgentError, FlushTrigger};

const CONFIG_PATH_ENV: &str = "TELEMETRY_AGENT_CONFIG";
const DEFAULT_CONFIG_PATH: &str = "telemetry-agent.yaml";
const ONCE_SERVICE_WAIT: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command(name = "telemetry-agentd")]
#[command(version, about = "Runs the telemetry agent pipeline", long_about = None)]
struct Args {
    /// Path to the YAML configuration file
    #[arg(env = CONFIG_PATH_ENV, default_value = DEFAULT_CONFIG_PATH)]
    config_path: PathBuf,

    /// Gather once, flush and exit
    #[arg(long)]
    once: bool,
}

fn init_logging(config: &AgentConfig) -> Result<(), String> {
    let env_filter = format!("h2=off,hyper=off,{}", config.log_level.as_ref().to_lowercase());
    let filter = EnvFilter::try_new(env_filter)
        .map_err(|e| format!("could not parse log level in configuration: {e}"))?;
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_level(true)
        .with_thread_names(false)
        .with_thread_ids(false)
        .with_line_number(false)
        .with_file(false)
        .with_target(true)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| format!("setting default subscriber failed: {e}"))
}

/// SIGINT and SIGTERM cancel the run; SIGUSR1 requests a flush.
#[cfg(unix)]
fn spawn_signal_handler(cancel: CancellationToken, flush: FlushTrigger) {
    use tokio::signal::unix::{signal, SignalKind};

    tokio::spawn(async move {
        let (mut term, mut usr1) = match (
            signal(SignalKind::terminate()),
            signal(SignalKind::user_defined1()),
        ) {
            (Ok(term), Ok(usr1)) => (term, usr1),
            (Err(e), _) | (_, Err(e)) => {
                error!("[agent] Failed to install signal handlers: {e}");
                return;
            }
        };
        loop {
            tokio::select! {
                result = tokio::signal::ctrl_c() => {
                    if let Err(e) = result {
                        error!("[agent] Failed to listen for Ctrl+C: {e}");
                    }
                    info!("[agent] Received interrupt, shutting down");
                    cancel.cancel();
                    return;
                }
                _ = term.recv() => {
                    info!("[agent] Received SIGTERM, shutting down");
                    cancel.cancel();
                    return;
                }
                _ = usr1.recv() => {
                    info!("[agent] Received SIGUSR1, flushing outputs");
                    flush.flush();
                }
            }
        }
    });
}

#[cfg(not(unix))]
fn spawn_signal_handler(cancel: CancellationToken, _flush: FlushTrigger) {
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("[agent] Failed to listen for Ctrl+C: {e}");
        }
        info!("[agent] Received interrupt, shutting down");
        cancel.cancel();
    });
}

fn build_agent(config: AgentConfig) -> Result<Agent, AgentError> {
    let mut agent = Agent::new(config);
    agent.add_input(Box::new(plugins::Heartbeat::new()), InputConfig::new("heartbeat"))?;
    agent.add_output(Box::<plugins::Stdout>::default(), OutputConfig::new("stdout"))?;
    Ok(agent)
}

#[tokio::main]
pub async fn main() {
    let args = Args::parse();

    let config = match load_config(&args.config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("telemetry-agentd: {e}");
            std::process::exit(1);
        }
    };
    if let Err(e) = init_logging(&config) {
        eprintln!("telemetry-agentd: {e}");
        std::process::exit(1);
    }
    debug!("Logging subsystem enabled");
    info!(
        "[agent] Loaded configuration from {}",
        args.config_path.display()
    );

    let agent = match build_agent(config) {
        Ok(agent) => agent,
        Err(e) => {
            error!("[agent] {e}");
            std::process::exit(1);
        }
    };

    let result = if args.once {
        agent.once(ONCE_SERVICE_WAIT).await
    } else {
        let cancel = CancellationToken::new();
        spawn_signal_handler(cancel.clone(), agent.flush_trigger());
        agent.run(cancel).await
    };

    if let Err(e) = result {
        error!("[agent] {e}");
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Args::command().debug_assert();
    }

    #[test]
    fn test_once_with_config_path() {
        let args = Args::try_parse_from(["telemetry-agentd", "--once", "/etc/agent.yaml"]).unwrap();
        assert!(args.once);
        assert_eq!(args.config_path, PathBuf::from("/etc/agent.yaml"));
    }

    #[test]
    fn test_unknown_flag_is_rejected() {
        assert!(Args::try_parse_from(["telemetry-agentd", "--twice"]).is_err());
    }
}
