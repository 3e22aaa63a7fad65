//! Connection negotiation: IDENTIFY exchange, then optional TLS and
//! compression upgrades in that order.
//!
//! The handshake is modeled as an explicit state machine. Each upgrade
//! consumes the previous transport and yields the next one, so a half-upgraded
//! stream can never leak out; callers get either a fully negotiated
//! `Framed<Transport, FrameCodec>` or an error.

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tokio_util::codec::Framed;
use tracing::debug;

use crate::config::ClientConfig;
use crate::error::RiverqError;
use crate::protocol::{Command, Compression, Frame, FrameCodec, MAGIC};

/// Negotiated transport: plain TCP or TLS over TCP
#[derive(Debug)]
pub enum Transport {
    Plain(TcpStream),
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl AsyncRead for Transport {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Transport::Plain(s) => Pin::new(s).poll_read(cx, buf),
            Transport::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Transport {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            Transport::Plain(s) => Pin::new(s).poll_write(cx, buf),
            Transport::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Transport::Plain(s) => Pin::new(s).poll_flush(cx),
            Transport::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Transport::Plain(s) => Pin::new(s).poll_shutdown(cx),
            Transport::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

#[derive(Debug, Serialize)]
struct IdentifyRequest<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    client_id: Option<&'a str>,
    hostname: String,
    feature_negotiation: bool,
    heartbeat_interval: u64,
    tls_v1: bool,
    snappy: bool,
    deflate: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    deflate_level: Option<u32>,
}

/// Feature flags the broker echoes back after IDENTIFY
#[derive(Debug, Default, Deserialize)]
pub struct IdentifyResponse {
    #[serde(default)]
    pub tls_v1: bool,
    #[serde(default)]
    pub snappy: bool,
    #[serde(default)]
    pub deflate: bool,
    #[serde(default)]
    pub version: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NegotiateState {
    Identified,
    TlsInstalled,
    CompressionInstalled,
}

/// Connect to `host:port` and run the full handshake: magic, IDENTIFY, then
/// TLS and compression upgrades as granted by the broker.
pub async fn connect(
    host: &str,
    port: u16,
    config: &ClientConfig,
) -> Result<Framed<Transport, FrameCodec>, RiverqError> {
    let addr = format!("{host}:{port}");
    let stream = timeout(config.connect_timeout, TcpStream::connect(&addr))
        .await
        .map_err(|_| RiverqError::timeout(config.connect_timeout.as_millis() as u64))?
        .map_err(|e| RiverqError::connection(format!("connect to {addr}: {e}")))?;
    stream
        .set_nodelay(true)
        .map_err(|e| RiverqError::connection(format!("set_nodelay on {addr}: {e}")))?;
    negotiate(stream, host, config).await
}

async fn negotiate(
    mut stream: TcpStream,
    host: &str,
    config: &ClientConfig,
) -> Result<Framed<Transport, FrameCodec>, RiverqError> {
    stream.write_all(MAGIC).await?;

    let mut framed = Framed::new(Transport::Plain(stream), FrameCodec::new());

    let identify = IdentifyRequest {
        client_id: config.client_id.as_deref(),
        hostname: hostname(),
        feature_negotiation: true,
        heartbeat_interval: config.heartbeat_interval.as_millis() as u64,
        tls_v1: config.tls.enabled,
        snappy: config.compression.snappy,
        deflate: config.compression.deflate,
        deflate_level: config
            .compression
            .deflate
            .then_some(config.compression.deflate_level),
    };
    let payload = serde_json::to_vec(&identify)
        .map_err(|e| RiverqError::negotiation(format!("encode identify: {e}")))?;
    framed.send(Command::Identify(Bytes::from(payload))).await?;

    let response = read_response(&mut framed, config).await?;
    let granted: IdentifyResponse = if response.as_ref() == b"OK" {
        // Feature negotiation disabled server-side; everything stays plain.
        IdentifyResponse::default()
    } else {
        serde_json::from_slice(&response)
            .map_err(|e| RiverqError::negotiation(format!("parse identify response: {e}")))?
    };
    debug!(
        host,
        tls = granted.tls_v1,
        snappy = granted.snappy,
        deflate = granted.deflate,
        version = %granted.version,
        "identify negotiated"
    );

    if config.tls.enabled && !granted.tls_v1 {
        return Err(RiverqError::negotiation(format!(
            "broker {host} did not grant TLS"
        )));
    }

    let mut state = NegotiateState::Identified;

    if granted.tls_v1 {
        framed = upgrade_tls(framed, host, config).await?;
        state = NegotiateState::TlsInstalled;
        // The broker sends a fresh OK inside the TLS session.
        expect_ok(&mut framed, config, "tls").await?;
    }

    if granted.snappy || granted.deflate {
        let compression = if granted.snappy {
            Compression::Snappy
        } else {
            Compression::Deflate {
                level: config.compression.deflate_level,
            }
        };
        framed.codec_mut().set_compression(compression);
        state = NegotiateState::CompressionInstalled;
        // And another OK, now on the compressed stream.
        expect_ok(&mut framed, config, "compression").await?;
    }

    debug!(host, ?state, "negotiation complete");
    Ok(framed)
}

async fn upgrade_tls(
    framed: Framed<Transport, FrameCodec>,
    host: &str,
    config: &ClientConfig,
) -> Result<Framed<Transport, FrameCodec>, RiverqError> {
    let tls_config: Arc<rustls::ClientConfig> = config
        .tls
        .client_config
        .clone()
        .ok_or_else(|| RiverqError::negotiation("TLS granted but no client configuration"))?;

    let parts = framed.into_parts();
    if !parts.read_buf.is_empty() {
        return Err(RiverqError::negotiation(
            "unexpected data buffered before TLS handshake",
        ));
    }
    let stream = match parts.io {
        Transport::Plain(s) => s,
        Transport::Tls(_) => return Err(RiverqError::negotiation("TLS already installed")),
    };

    let server_name = config
        .tls
        .server_name
        .clone()
        .unwrap_or_else(|| host.to_string());
    let server_name = rustls::pki_types::ServerName::try_from(server_name)
        .map_err(|e| RiverqError::negotiation(format!("invalid TLS server name: {e}")))?;

    let connector = TlsConnector::from(tls_config);
    let tls_stream = timeout(config.connect_timeout, connector.connect(server_name, stream))
        .await
        .map_err(|_| RiverqError::timeout(config.connect_timeout.as_millis() as u64))?
        .map_err(|e| RiverqError::negotiation(format!("TLS handshake with {host}: {e}")))?;

    Ok(Framed::new(
        Transport::Tls(Box::new(tls_stream)),
        parts.codec,
    ))
}

async fn read_response(
    framed: &mut Framed<Transport, FrameCodec>,
    config: &ClientConfig,
) -> Result<Bytes, RiverqError> {
    let frame = timeout(config.request_timeout, framed.next())
        .await
        .map_err(|_| RiverqError::timeout(config.request_timeout.as_millis() as u64))?
        .ok_or_else(|| RiverqError::negotiation("connection closed during handshake"))??;
    match frame {
        Frame::Response(body) => Ok(body),
        Frame::Error(err) => Err(RiverqError::negotiation(format!(
            "broker rejected handshake: {} {}",
            err.code, err.detail
        ))),
        Frame::Message(_) => Err(RiverqError::negotiation(
            "message frame during handshake",
        )),
    }
}

async fn expect_ok(
    framed: &mut Framed<Transport, FrameCodec>,
    config: &ClientConfig,
    stage: &str,
) -> Result<(), RiverqError> {
    let body = read_response(framed, config).await?;
    if body.as_ref() == b"OK" {
        Ok(())
    } else {
        Err(RiverqError::negotiation(format!(
            "expected OK after {stage} upgrade, got {:?}",
            String::from_utf8_lossy(&body)
        )))
    }
}

fn hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "riverq-client".to_string())
}
