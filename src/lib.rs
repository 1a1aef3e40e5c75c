//! A bridge between browser WebTransport sessions and an MQTT broker's QUIC
//! listener.
//!
//! Browsers cannot open raw QUIC connections, but they can open
//! [WebTransport](https://caniuse.com/webtransport) sessions, which are
//! layered on top of HTTP/3 and QUIC. Brokers such as EMQX accept MQTT
//! directly over QUIC with the `mqtt` ALPN. This crate bridges the two:
//! it terminates WebTransport sessions, and for every bidirectional stream a
//! client opens, dials one fresh QUIC connection to the broker and pumps
//! bytes in both directions without interpreting them.
//!
//! The crate also ships a minimal MQTT v5 codec ([`packet`]) and a native
//! client ([`MqttClient`]) speaking that codec over WebTransport, mirroring
//! what a browser client does with the JavaScript `WebTransport` API.
//!
//! # Limitations
//!
//! WebTransport is able to be pooled with HTTP/3 and multiple WebTransport
//! sessions. This crate avoids that complexity, doing the bare minimum to
//! support a single WebTransport session that owns the entire QUIC
//! connection. Likewise the relay is protocol-oblivious: it never parses,
//! validates, or reorders the MQTT bytes it carries.

mod bridge;
mod client;
mod config;
mod connect;
mod error;
mod mqtt_client;
pub mod packet;
mod recv;
mod relay;
mod send;
mod server;
mod session;
mod settings;
mod upstream;
pub mod varint;

#[cfg(test)]
mod tests;

pub use bridge::*;
pub use client::*;
pub use config::*;
pub use connect::*;
pub use error::*;
pub use mqtt_client::*;
pub use recv::*;
pub use relay::*;
pub use send::*;
pub use server::*;
pub use session::*;
pub use settings::*;
pub use upstream::*;

/// The HTTP/3 ALPN is required when negotiating the WebTransport-facing QUIC connection.
pub const ALPN_H3: &str = "h3";

/// The ALPN the broker expects on its QUIC listener.
pub const ALPN_MQTT: &str = "mqtt";

/// Re-export the http crate because it's in the public API.
pub use http;
/// Re-export quinn because connections and streams are in the public API.
pub use quinn;
