//! CLI for MiniMQ
//!
//! Subcommands:
//! - `server`: run the broker
//! - `produce`: send one JSON payload to a topic
//! - `consume`: print messages from a topic until interrupted
//! - `request`: send a request and wait for its reply

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use minimq::broker::Broker;
use minimq::client::{Consumer, DeliveryContext, Producer};
use minimq::config::{Settings, load_config, load_config_from};
use minimq::transport;
use minimq::utils::error::HandlerError;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "minimq", version, about = "A small persistent message broker")]
struct Cli {
    /// Path to a TOML config file (defaults to config/default.toml if present)
    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Subcommand)]
enum Command {
    /// Start the broker
    Server,
    /// Send a JSON payload to a topic and print the message id
    Produce {
        #[arg(long)]
        topic: String,
        #[arg(long)]
        payload: String,
    },
    /// Print every message arriving on a topic until Ctrl-C
    Consume {
        #[arg(long)]
        topic: String,
    },
    /// Send a request and print the reply
    Request {
        #[arg(long)]
        topic: String,
        #[arg(long)]
        payload: String,
        #[arg(long, default_value_t = 10_000)]
        timeout_ms: u64,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let settings = match &cli.config {
        Some(path) => load_config_from(path),
        None => load_config(),
    };
    let settings = match settings {
        Ok(settings) => settings,
        Err(e) => {
            minimq::utils::logging::init("info");
            error!("Failed to load configuration: {e}");
            std::process::exit(2);
        }
    };
    minimq::utils::logging::init(&settings.logging.level);

    let result = match cli.command {
        Command::Server => run_server(settings).await,
        Command::Produce { topic, payload } => run_produce(settings, &topic, &payload).await,
        Command::Consume { topic } => run_consume(settings, topic).await,
        Command::Request {
            topic,
            payload,
            timeout_ms,
        } => run_request(settings, &topic, &payload, timeout_ms).await,
    };

    if let Err(e) = result {
        error!("{e}");
        std::process::exit(1);
    }
}

async fn run_server(settings: Settings) -> Result<(), Box<dyn std::error::Error>> {
    let broker = Arc::new(Broker::open(&settings.broker)?);
    let listener = transport::bind(&settings.server).await?;
    let cancel = CancellationToken::new();

    let scanner = broker.spawn_redelivery_scanner(cancel.child_token());
    let server = {
        let broker = Arc::clone(&broker);
        let cancel = cancel.child_token();
        tokio::spawn(async move { transport::serve(listener, broker, &settings.broker, cancel).await })
    };

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received. Exiting gracefully.");
    cancel.cancel();

    server.await??;
    scanner.await?;
    let stats = broker.stats();
    info!(
        "Broker stopped with {} queued and {} in-flight message(s)",
        stats.queued, stats.in_flight
    );
    Ok(())
}

async fn run_produce(
    settings: Settings,
    topic: &str,
    payload: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let payload: Value = serde_json::from_str(payload)?;
    let producer = Producer::connect(&settings.client);
    let id = producer.send(topic, &payload).await?;
    println!("{id}");
    Ok(())
}

async fn run_consume(settings: Settings, topic: String) -> Result<(), Box<dyn std::error::Error>> {
    let mut consumer = Consumer::connect(&settings.client);
    consumer.register_listener(topic, |payload: Value, ctx: DeliveryContext| async move {
        println!("[{}] {}: {payload}", ctx.topic, ctx.message_id);
        Ok::<(), HandlerError>(())
    });
    consumer.start()?;

    tokio::signal::ctrl_c().await?;
    consumer.stop().await;
    Ok(())
}

async fn run_request(
    settings: Settings,
    topic: &str,
    payload: &str,
    timeout_ms: u64,
) -> Result<(), Box<dyn std::error::Error>> {
    let payload: Value = serde_json::from_str(payload)?;
    let producer = Producer::connect(&settings.client);
    let reply: Value = producer
        .request_reply(topic, &payload, Duration::from_millis(timeout_ms))
        .await?;
    println!("{reply}");
    Ok(())
}
