use std::fs;
use std::io::BufReader;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;

use crate::UpstreamConfig;

/// Startup configuration, from flags or the environment.
///
/// The environment names match the container deployment, where the bridge
/// sits next to the broker on a Docker network.
#[derive(Parser, Debug, Clone)]
#[command(name = "wt-mqtt-bridge", about = "WebTransport to QUIC bridge for MQTT v5")]
pub struct BridgeConfig {
    /// Address to listen on for WebTransport sessions.
    #[arg(long, env = "BRIDGE_HOST", default_value = "0.0.0.0")]
    pub host: IpAddr,

    /// UDP port for the WebTransport endpoint.
    #[arg(long, env = "BRIDGE_PORT", default_value_t = 1027)]
    pub port: u16,

    /// TLS certificate chain, PEM.
    #[arg(long, env = "BRIDGE_CERT_FILE", default_value = "/certs/fullchain.pem")]
    pub cert_file: PathBuf,

    /// TLS private key, PEM.
    #[arg(long, env = "BRIDGE_KEY_FILE", default_value = "/certs/privkey.pem")]
    pub key_file: PathBuf,

    /// Broker hostname.
    #[arg(long, env = "MQTT_HOST", default_value = "emqx")]
    pub mqtt_host: String,

    /// Broker QUIC port.
    #[arg(long, env = "MQTT_QUIC_PORT", default_value_t = 14567)]
    pub mqtt_port: u16,

    /// SNI to present to the broker; defaults to the broker hostname.
    #[arg(long, env = "MQTT_SNI")]
    pub mqtt_sni: Option<String>,

    /// CA bundle (PEM) to verify the broker certificate against. Without
    /// one the broker certificate is not verified at all.
    #[arg(long, env = "MQTT_CA_FILE")]
    pub mqtt_ca_file: Option<PathBuf>,

    /// Skip broker certificate verification even when a CA bundle is set.
    #[arg(long, env = "MQTT_NO_VERIFY", default_value_t = false)]
    pub mqtt_no_verify: bool,
}

impl BridgeConfig {
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }

    pub fn upstream(&self) -> anyhow::Result<UpstreamConfig> {
        let mut roots = rustls::RootCertStore::empty();
        if let Some(path) = &self.mqtt_ca_file {
            let file = fs::File::open(path)
                .with_context(|| format!("opening CA bundle {}", path.display()))?;
            let mut reader = BufReader::new(file);
            for cert in rustls_pemfile::certs(&mut reader) {
                roots
                    .add(cert?)
                    .with_context(|| format!("bad certificate in {}", path.display()))?;
            }
            if roots.is_empty() {
                anyhow::bail!("no CA certificates found in {}", path.display());
            }
        }

        // Verification is only possible against a configured CA bundle;
        // without one the broker certificate is accepted as-is, like the
        // deployment this replaces did.
        let no_verify = self.mqtt_no_verify || self.mqtt_ca_file.is_none();
        if no_verify {
            tracing::warn!("broker certificate verification is disabled");
        }

        Ok(UpstreamConfig {
            host: self.mqtt_host.clone(),
            port: self.mqtt_port,
            sni: self.mqtt_sni.clone(),
            no_verify,
            roots,
        })
    }
}
