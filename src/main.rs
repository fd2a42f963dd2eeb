use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use serde_json::{json, Value};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use rabbit_bus::common::{
    operation_fn, ChannelConfig, ConnectionManager, EventPublisher, LapinConnector,
    RequestResponseCoordinator, Worker,
};
use rabbit_bus::config::{self, BrokerConfig};

const USAGE: &str = "usage: rabbit_bus [worker | publish <type> <json> | call <operation> <json> | init-config <path>]";

enum Command {
    Worker,
    Publish { event_type: String, payload: Value },
    Call { operation: String, data: Value },
    InitConfig { path: String },
}

fn parse_json(raw: Option<String>) -> Result<Value> {
    match raw {
        Some(raw) => serde_json::from_str(&raw).with_context(|| format!("Invalid JSON: {}", raw)),
        None => Ok(json!({})),
    }
}

fn parse_args(mut args: impl Iterator<Item = String>) -> Result<Command> {
    let command = args.next();
    match command.as_deref() {
        None | Some("worker") => Ok(Command::Worker),
        Some("publish") => Ok(Command::Publish {
            event_type: args.next().ok_or_else(|| anyhow!(USAGE))?,
            payload: parse_json(args.next())?,
        }),
        Some("call") => Ok(Command::Call {
            operation: args.next().ok_or_else(|| anyhow!(USAGE))?,
            data: parse_json(args.next())?,
        }),
        Some("init-config") => Ok(Command::InitConfig {
            path: args.next().ok_or_else(|| anyhow!(USAGE))?,
        }),
        Some(other) => bail!("Unknown command '{}'\n{}", other, USAGE),
    }
}

fn connect(config: &BrokerConfig) -> ConnectionManager {
    let connector = LapinConnector::new(
        ChannelConfig::from_settings(&config.channel),
        config.connection.connect_timeout(),
    )
    .with_heartbeat(config.connection.heartbeat_seconds);
    ConnectionManager::new(config, Arc::new(connector))
}

async fn run_worker(config: &BrokerConfig) -> Result<()> {
    let connection = connect(config);
    let publisher = EventPublisher::new(connection.clone(), config);
    if let Err(e) = publisher.initialize().await {
        error!(error = %e, "Event topology incomplete, continuing");
    }

    let coordinator = RequestResponseCoordinator::new(connection.clone(), config);
    coordinator.start().await;

    let worker = Worker::new(connection.clone(), config);
    worker.register(
        "echo",
        operation_fn(|request| async move { Ok::<_, anyhow::Error>(request.data) }),
    );
    worker.start().await;

    info!("Worker running, press Ctrl-C to stop");
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;

    info!("Shutting down");
    worker.stop();
    coordinator.shutdown();
    connection.close().await;
    Ok(())
}

async fn run_publish(config: &BrokerConfig, event_type: &str, payload: Value) -> Result<()> {
    let connection = connect(config);
    let publisher = EventPublisher::new(connection.clone(), config);
    publisher.initialize().await?;

    let accepted = publisher.publish(event_type, payload).await;
    connection.close().await;
    if !accepted {
        bail!("Event '{}' was not accepted by the broker", event_type);
    }
    info!(event_type, "Event published");
    Ok(())
}

async fn run_call(config: &BrokerConfig, operation: &str, data: Value) -> Result<()> {
    let connection = connect(config);
    let coordinator = RequestResponseCoordinator::new(connection.clone(), config);
    coordinator.start().await;

    let outcome = coordinator.send_request(operation, data, None, None).await;
    coordinator.shutdown();
    connection.close().await;

    let result = outcome.map_err(|e| {
        if e.is_unknown_outcome() {
            anyhow!("{} (outcome unknown, the operation may still have run)", e)
        } else {
            anyhow!(e)
        }
    })?;
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let command = parse_args(std::env::args().skip(1))?;
    if let Command::InitConfig { path } = &command {
        config::create_default_config_file(Path::new(path))?;
        info!(path = %path, "Wrote default configuration");
        return Ok(());
    }

    let config = config::load_config()?;
    info!(
        hosts = ?config.connection.candidate_hosts(),
        source = %config.source,
        "Configuration loaded"
    );

    match command {
        Command::Worker => run_worker(&config).await,
        Command::Publish {
            event_type,
            payload,
        } => run_publish(&config, &event_type, payload).await,
        Command::Call { operation, data } => run_call(&config, &operation, data).await,
        Command::InitConfig { .. } => Ok(()),
    }
}
