// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Scripted in-process Livestatus server for tests

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, UnixListener};
use tokio::task::JoinHandle;

use crate::protocol::RESPONSE_HEADER_LEN;
use crate::url::SocketUrl;

/// What the server does with one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Answers with a `fixed16` header, status code and body.
    Status(u16, String),
    /// Writes raw bytes and keeps the connection open.
    Raw(Vec<u8>),
    /// Closes the connection without answering.
    Close,
    /// Answers normally, then closes the connection.
    ThenClose(Box<Reply>),
    /// Waits before answering.
    Delayed(Duration, Box<Reply>),
}

impl Reply {
    /// A `200` answer with the given payload.
    pub fn ok(body: impl Into<String>) -> Self {
        Self::Status(200, body.into())
    }

    pub fn status(code: u16, body: impl Into<String>) -> Self {
        Self::Status(code, body.into())
    }
}

/// Renders a `ResponseHeader: fixed16` response.
pub fn fixed16(code: u16, body: &str) -> Vec<u8> {
    let mut out = format!("{code:03} {:>11}\n", body.len()).into_bytes();
    debug_assert_eq!(out.len(), RESPONSE_HEADER_LEN);
    out.extend_from_slice(body.as_bytes());
    out
}

type Handler = Arc<dyn Fn(&str) -> Reply + Send + Sync>;

#[derive(Default)]
struct Recorded {
    requests: Mutex<Vec<String>>,
    connections: AtomicUsize,
}

/// A Livestatus server answering through a handler closure.
///
/// The handler gets each query without its terminating blank line. `COMMAND`
/// requests are recorded but never answered, as with the real core.
pub struct MockLivestatus {
    url: SocketUrl,
    recorded: Arc<Recorded>,
    task: JoinHandle<()>,
    _dir: Option<tempfile::TempDir>,
}

impl MockLivestatus {
    /// Listens on a fresh Unix socket in a temporary directory.
    pub async fn unix(handler: impl Fn(&str) -> Reply + Send + Sync + 'static) -> Self {
        Self::unix_named("live", handler).await
    }

    /// Like [`unix`](Self::unix), with control over the socket's file name.
    pub async fn unix_named(
        name: &str,
        handler: impl Fn(&str) -> Reply + Send + Sync + 'static,
    ) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(name);
        let listener = UnixListener::bind(&path).unwrap();
        let recorded = Arc::new(Recorded::default());
        let handler: Handler = Arc::new(handler);

        let task = tokio::spawn({
            let recorded = recorded.clone();
            async move {
                while let Ok((stream, _)) = listener.accept().await {
                    recorded.connections.fetch_add(1, Ordering::SeqCst);
                    tokio::spawn(serve(stream, handler.clone(), recorded.clone()));
                }
            }
        });

        Self {
            url: SocketUrl::Unix(path),
            recorded,
            task,
            _dir: Some(dir),
        }
    }

    /// Listens on an ephemeral localhost TCP port.
    pub async fn tcp(handler: impl Fn(&str) -> Reply + Send + Sync + 'static) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let recorded = Arc::new(Recorded::default());
        let handler: Handler = Arc::new(handler);

        let task = tokio::spawn({
            let recorded = recorded.clone();
            async move {
                while let Ok((stream, _)) = listener.accept().await {
                    recorded.connections.fetch_add(1, Ordering::SeqCst);
                    tokio::spawn(serve(stream, handler.clone(), recorded.clone()));
                }
            }
        });

        Self {
            url: SocketUrl::Tcp {
                host: "127.0.0.1".into(),
                port,
            },
            recorded,
            task,
            _dir: None,
        }
    }

    pub fn url(&self) -> &SocketUrl {
        &self.url
    }

    /// All requests received so far, in arrival order.
    pub fn requests(&self) -> Vec<String> {
        self.recorded.requests.lock().unwrap().clone()
    }

    /// Number of accepted connections.
    pub fn connections(&self) -> usize {
        self.recorded.connections.load(Ordering::SeqCst)
    }

    /// Stops accepting; open connections keep being served.
    pub fn stop(&self) {
        self.task.abort();
    }
}

impl Drop for MockLivestatus {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve(stream: impl AsyncRead + AsyncWrite + Unpin, handler: Handler, recorded: Arc<Recorded>) {
    let (reader, mut writer) = tokio::io::split(stream);
    let mut reader = BufReader::new(reader);
    while let Ok(Some(request)) = read_request(&mut reader).await {
        recorded.requests.lock().unwrap().push(request.clone());
        if request.starts_with("COMMAND ") {
            continue;
        }

        let mut reply = handler(&request);
        let mut close = false;
        let bytes = loop {
            match reply {
                Reply::Status(code, body) => break fixed16(code, &body),
                Reply::Raw(bytes) => break bytes,
                Reply::Close => return,
                Reply::ThenClose(inner) => {
                    close = true;
                    reply = *inner;
                }
                Reply::Delayed(delay, inner) => {
                    tokio::time::sleep(delay).await;
                    reply = *inner;
                }
            }
        };
        if writer.write_all(&bytes).await.is_err() || writer.flush().await.is_err() {
            return;
        }
        if close {
            return;
        }
    }
}

/// Reads one blank-line terminated request.
async fn read_request(reader: &mut (impl AsyncBufRead + Unpin)) -> std::io::Result<Option<String>> {
    let mut request = String::new();
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line).await? == 0 {
            return Ok(None);
        }
        if line == "\n" {
            if request.is_empty() {
                continue;
            }
            return Ok(Some(request));
        }
        request.push_str(&line);
    }
}
