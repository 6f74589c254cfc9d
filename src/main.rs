use anyhow::Result;
use std::sync::Arc;
use tracing::{error, info};

use ripple::filter::{EventFilter, Filter};
use ripple::transport::TcpTransport;
use ripple::{ClientConfig, RealtimeClient};

/// Tails a topic: connects, subscribes with per-kind filters, and logs every
/// change notification until ctrl-c.
#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing subscriber
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ripple=info".into()),
        )
        .init();

    let config = ClientConfig::from_env();
    let topic = std::env::args().nth(1).unwrap_or_else(|| "public".to_string());

    info!(url = %config.url, topic = %topic, "ripple starting");

    let client = RealtimeClient::new(config, Arc::new(TcpTransport));
    client.on_open(|| info!("socket open"));
    client.on_close(|| info!("socket closed"));
    client.on_error(|e| error!(error = %e, "socket error"));

    let channel = client.channel(&topic);
    channel
        .on(Filter::event(EventFilter::Insert), |msg| {
            info!(schema = %msg.schema, table = %msg.table, payload = %serde_json::Value::Object(msg.payload.clone()), "INSERT");
        })
        .on(Filter::event(EventFilter::Update), |msg| {
            info!(schema = %msg.schema, table = %msg.table, payload = %serde_json::Value::Object(msg.payload.clone()), "UPDATE");
        })
        .on(Filter::event(EventFilter::Delete), |msg| {
            info!(schema = %msg.schema, table = %msg.table, payload = %serde_json::Value::Object(msg.payload.clone()), "DELETE");
        });
    channel.on_error(|e| error!(error = %e, "channel error"));
    channel.on_close(|| info!("channel closed"));
    channel.subscribe(|state, _err| info!(state = %state, "channel state"));

    client.connect();

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    channel.unsubscribe();
    client.disconnect();

    Ok(())
}
