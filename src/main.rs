use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use wt_mqtt_bridge::{Bridge, BridgeConfig, MqttUpstream, ServerBuilder};

#[tokio::main]
async fn main() -> Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = BridgeConfig::parse();

    // Certificate or bind failures here are fatal; everything after this
    // point is isolated per session or per stream.
    let server = ServerBuilder::new()
        .with_addr(config.listen_addr())
        .with_pem_files(&config.cert_file, &config.key_file)
        .context("loading TLS certificate and key")?
        .build()
        .context("binding WebTransport endpoint")?;

    let upstream = MqttUpstream::new(config.upstream()?).context("configuring broker upstream")?;

    tracing::info!(
        "WebTransport listening on udp://{}",
        config.listen_addr()
    );
    tracing::info!(
        "forwarding QUIC streams to {}:{} (ALPN=mqtt)",
        config.mqtt_host,
        config.mqtt_port
    );

    Bridge::new(server, upstream).run().await?;
    Ok(())
}
