use std::path::Path;
use std::sync::Arc;

use anyhow::{Result, bail};
use clap::Parser;
use ircmq_relay::broker::MqttBroker;
use ircmq_relay::config::{self, Args, Config};
use ircmq_relay::relay::Relay;
use ircmq_relay::shutdown::{self, ShutdownCoordinator};
use ircmq_relay::supervisor::{Escalation, Supervisor};
use ircmq_sdk::client::ConnectConfig;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Must run before anything below reads the environment.
    config::load_env_file(Path::new(".env"))?;

    // Use JSON logs in production (IRCMQ_LOG_JSON=1), human-readable otherwise
    let json_logs = std::env::var("IRCMQ_LOG_JSON").unwrap_or_default() == "1";
    let filter = EnvFilter::from_default_env()
        .add_directive("ircmq_relay=info".parse()?)
        .add_directive("ircmq_sdk=info".parse()?);
    if json_logs {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_file(true)
            .with_line_number(true)
            .init();
    }

    let args = Args::parse();
    let config = Config::load(&args.config_path)?;

    if let Err(failures) = config::validate_all(&config.connections) {
        for (i, e) in &failures {
            tracing::error!(connection = i, "{e}");
        }
        bail!(
            "{} of {} connections failed validation",
            failures.len(),
            config.connections.len()
        );
    }
    if config.connections.is_empty() {
        tracing::warn!("no connections configured in {}", args.config_path.display());
    }

    let broker = Arc::new(MqttBroker::connect(&args.mqtt_broker).await?);

    let mut dial = ConnectConfig::new(args.irc_server.clone());
    dial.tls_insecure = args.irc_insecure;

    let mut supervisor = Supervisor::new();
    let mut coordinator = ShutdownCoordinator::new();
    for conn in config.connections {
        let relay = Relay::new(conn, broker.clone()).with_debug(args.debug);
        let dial = dial.clone();
        let handle = supervisor.handle();
        coordinator.spawn(move |stop| relay.run(dial, stop, handle));
    }
    tracing::info!(connections = coordinator.len(), "relay running. Ctrl+C to stop.");

    tokio::select! {
        res = shutdown::interrupted() => {
            res?;
            tracing::info!("interrupt received");
            coordinator.shutdown().await;
            broker.disconnect().await;
            Ok(())
        }
        escalation = supervisor.next_escalation() => match escalation {
            Escalation::Restart { nick } => {
                tracing::warn!(connection = %nick, "restarting process");
                let err = supervisor.restart().await;
                tracing::error!(error = %err, "re-exec failed");
                std::process::exit(1);
            }
            Escalation::Fatal { nick, reason } => {
                tracing::error!(connection = %nick, %reason, "fatal stream error");
                std::process::exit(1);
            }
        },
    }
}
