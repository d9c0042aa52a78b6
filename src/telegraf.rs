//! A [`MetricsSink`] for a Telegraf `socket_listener` accepting line protocol over UDP.

use std::io;

use tokio::net::{lookup_host, UdpSocket};

use crate::report::{Measurement, MetricsSink};

/// Telegraf on the same host
pub const DEFAULT_ADDR: &str = "127.0.0.1:8094";

pub struct TelegrafSink {
    socket: UdpSocket,
}

impl TelegrafSink {
    /// Bind a local socket and aim it at the collector at `addr` (`host:port`).
    pub async fn connect(addr: &str) -> io::Result<Self> {
        let target = lookup_host(addr)
            .await?
            .next()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("cannot resolve {addr}")))?;
        let local = if target.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
        let socket = UdpSocket::bind(local).await?;
        socket.connect(target).await?;
        Ok(Self { socket })
    }
}

impl MetricsSink for TelegrafSink {
    async fn record(&mut self, measurement: &Measurement) {
        let mut line = measurement.to_line_protocol();
        line.push('\n');
        if let Err(err) = self.socket.send(line.as_bytes()).await {
            tracing::warn!(%err, measurement = %measurement.name, "failed to send measurement");
        }
    }
}
