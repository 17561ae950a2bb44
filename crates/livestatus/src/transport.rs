// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Opens byte streams to Livestatus sockets.

use std::io;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, UnixStream};
use tokio_rustls::TlsConnector;
use tracing::debug;

use crate::error::LivestatusError;
use crate::tls::{client_config, TlsSettings};
use crate::url::SocketUrl;

/// First per-attempt connect timeout when a connection timeout is configured.
const INITIAL_CONNECT_INTERVAL: Duration = Duration::from_millis(100);
const CONNECT_BACKOFF_FACTOR: f64 = 1.5;

pub trait LivestatusStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> LivestatusStream for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

pub type BoxedStream = Box<dyn LivestatusStream>;

/// Socket factory for one site.
#[derive(Debug, Clone)]
pub struct Connector {
    url: SocketUrl,
    tls: Option<TlsSettings>,
}

impl Connector {
    pub fn new(url: SocketUrl, tls: Option<TlsSettings>) -> Self {
        Self { url, tls }
    }

    pub fn url(&self) -> &SocketUrl {
        &self.url
    }

    /// Opens a new stream.
    ///
    /// With a `timeout`, failed attempts are retried with a growing per-attempt
    /// timeout for as long as there is substantially more time left than the
    /// next attempt would take.
    pub async fn connect(&self, timeout: Option<Duration>) -> Result<BoxedStream, LivestatusError> {
        let tls = match &self.tls {
            Some(_) if self.url.is_unix() => {
                return Err(LivestatusError::Config(format!(
                    "Cannot use TLS on unix socket '{}'",
                    self.url
                )))
            }
            Some(settings) => Some(TlsConnector::from(client_config(settings)?)),
            None => None,
        };

        let Some(timeout) = timeout else {
            return self
                .connect_once(tls.as_ref())
                .await
                .map_err(|e| self.connect_error(e));
        };

        let started = Instant::now();
        let mut interval = INITIAL_CONNECT_INTERVAL;
        loop {
            let err = match tokio::time::timeout(interval, self.connect_once(tls.as_ref())).await {
                Ok(Ok(stream)) => return Ok(stream),
                Ok(Err(e)) => e,
                Err(_) => io::Error::new(io::ErrorKind::TimedOut, "timed out"),
            };
            let time_left = timeout.saturating_sub(started.elapsed());
            if time_left <= interval {
                return Err(self.connect_error(err));
            }
            debug!(
                "Connecting to {} failed ({err}), retrying in {:.2}s",
                self.url,
                interval.as_secs_f64()
            );
            tokio::time::sleep(interval).await;
            interval = interval.mul_f64(CONNECT_BACKOFF_FACTOR);
        }
    }

    async fn connect_once(&self, tls: Option<&TlsConnector>) -> io::Result<BoxedStream> {
        let (host, tcp) = match &self.url {
            SocketUrl::Unix(path) => return Ok(Box::new(UnixStream::connect(path).await?)),
            SocketUrl::Tcp { host, port } => (host, TcpStream::connect((host.as_str(), *port)).await?),
            SocketUrl::Tcp6 { host, port } => {
                let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host.as_str(), *port))
                    .await?
                    .filter(SocketAddr::is_ipv6)
                    .collect();
                if addrs.is_empty() {
                    return Err(io::Error::new(
                        io::ErrorKind::AddrNotAvailable,
                        format!("no IPv6 address for {host}"),
                    ));
                }
                (host, TcpStream::connect(&addrs[..]).await?)
            }
        };
        tcp.set_nodelay(true)?;

        match tls {
            None => Ok(Box::new(tcp)),
            Some(connector) => {
                let server_name = ServerName::try_from(host.clone())
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
                Ok(Box::new(connector.connect(server_name, tcp).await?))
            }
        }
    }

    fn connect_error(&self, err: io::Error) -> LivestatusError {
        LivestatusError::Socket(format!("Cannot connect to '{}': {err}", self.url))
    }
}
