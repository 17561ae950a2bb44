// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Connection to a single Livestatus socket.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info};

use crate::command::{unix_seconds, ExternalCommand};
use crate::encoding::{append_header, combine_query, strip_cache_headers};
use crate::error::LivestatusError;
use crate::helpers::Livestatus;
use crate::pool::ConnectionPool;
use crate::protocol::{frame_request, parse_payload, ResponseHeader, RESPONSE_HEADER_LEN};
use crate::query::{OutputFormat, Query};
use crate::site::{SiteConfig, SiteId};
use crate::tls::{omd_root, TlsSettings};
use crate::transport::{BoxedStream, Connector};
use crate::url::SocketUrl;
use crate::value::{Response, Value};

/// Upper bound for reading a response body once its header arrived.
pub const BODY_READ_TIMEOUT: Duration = Duration::from_secs(30);
/// Pause before reconnecting after the peer dropped the connection.
const RECONNECT_DELAY: Duration = Duration::from_millis(100);

static USER_ID: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[\w$][-@.+\w$]*$").unwrap());

/// Rejects user ids that can't be sent in an `AuthUser:` header.
pub fn validate_user_id(user: &str) -> Result<(), LivestatusError> {
    if USER_ID.is_match(user) {
        Ok(())
    } else {
        Err(LivestatusError::Config(format!("Invalid user ID {user:?}")))
    }
}

/// A connection to one Livestatus socket.
///
/// The socket is opened lazily by the first request unless [`connect`]
/// is called explicitly. A persisting connection hands its stream back to
/// its [`ConnectionPool`] when dropped, and picks an idle one up from there
/// when connecting.
///
/// [`connect`]: Self::connect
pub struct SingleSiteConnection {
    connector: Connector,
    site: SiteId,
    pool: Arc<ConnectionPool>,
    persist: bool,
    allow_cache: bool,
    timeout: Option<Duration>,
    prepend_site: bool,
    limit: Option<usize>,
    added_headers: String,
    auth_users: HashMap<String, String>,
    auth_header: String,
    output_format: OutputFormat,
    stream: Option<BoxedStream>,
    // Set between sending a request and fully reading its response
    in_flight: bool,
    successfully_persisted: bool,
}

impl SingleSiteConnection {
    pub fn new(url: SocketUrl) -> Self {
        Self {
            connector: Connector::new(url, None),
            site: SiteId::default(),
            pool: ConnectionPool::global(),
            persist: false,
            allow_cache: false,
            timeout: None,
            prepend_site: false,
            limit: None,
            added_headers: String::new(),
            auth_users: HashMap::new(),
            auth_header: String::new(),
            output_format: OutputFormat::default(),
            stream: None,
            in_flight: false,
            successfully_persisted: false,
        }
    }

    /// Connection to the local core of the site given by `$OMD_ROOT`.
    pub fn local() -> Result<Self, LivestatusError> {
        let url = SocketUrl::Unix(omd_root()?.join("tmp/run/live"));
        Ok(Self::new(url).with_site(SiteId::new("local")))
    }

    /// Builds the connection for a configured site.
    ///
    /// Temporary connections never persist, whatever the site says.
    pub fn for_site(site: &SiteId, config: &SiteConfig, temporary: bool) -> Self {
        Self::new(config.socket.clone())
            .with_site(site.clone())
            .with_persist(config.persist && !temporary)
            .with_cache(config.cache)
            .with_tls(config.tls.settings())
            .with_timeout(config.timeout())
    }

    pub fn with_site(mut self, site: SiteId) -> Self {
        self.site = site;
        self
    }

    pub fn with_persist(mut self, persist: bool) -> Self {
        self.persist = persist;
        self
    }

    pub fn with_cache(mut self, allow_cache: bool) -> Self {
        self.allow_cache = allow_cache;
        self
    }

    pub fn with_tls(mut self, tls: Option<TlsSettings>) -> Self {
        self.connector = Connector::new(self.connector.url().clone(), tls);
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Uses `pool` instead of the process-wide pool.
    pub fn with_pool(mut self, pool: Arc<ConnectionPool>) -> Self {
        self.pool = pool;
        self
    }

    pub fn url(&self) -> &SocketUrl {
        self.connector.url()
    }

    pub fn site(&self) -> &SiteId {
        &self.site
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    /// Whether the current stream was taken over from the pool.
    pub fn successfully_persisted(&self) -> bool {
        self.successfully_persisted
    }

    pub fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.timeout = timeout;
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Adds a header line sent with every query.
    pub fn add_header(&mut self, header: &str) {
        self.added_headers.push_str(header.trim_end_matches('\n'));
        self.added_headers.push('\n');
    }

    /// Inserts an empty site column in front of every row.
    pub fn set_prepend_site(&mut self, prepend_site: bool) {
        self.prepend_site = prepend_site;
    }

    pub fn set_limit(&mut self, limit: Option<usize>) {
        self.limit = limit;
    }

    pub fn set_output_format(&mut self, format: OutputFormat) {
        self.output_format = format;
    }

    pub fn output_format(&self) -> OutputFormat {
        self.output_format
    }

    fn pool_key(&self) -> String {
        self.url().to_string()
    }

    /// Opens the socket, reusing a persisted stream if there is one.
    pub async fn connect(&mut self) -> Result<(), LivestatusError> {
        self.release_stream();
        if self.persist {
            if let Some(stream) = self.pool.take(&self.pool_key()) {
                self.stream = Some(stream);
                self.successfully_persisted = true;
                return Ok(());
            }
        }

        self.successfully_persisted = false;
        debug!("Connecting to site {} at {}", self.site, self.url());
        self.stream = Some(self.connector.connect(self.timeout).await?);
        Ok(())
    }

    /// Lets go of the open stream. An idle persisted stream goes back to the pool.
    fn release_stream(&mut self) {
        if let Some(stream) = self.stream.take() {
            if self.persist && !self.in_flight {
                self.pool.put(self.pool_key(), stream);
            }
        }
        self.in_flight = false;
    }

    /// Closes the socket. A persisted stream is dropped from the pool as well.
    pub fn disconnect(&mut self) {
        self.stream = None;
        self.in_flight = false;
        if self.persist {
            self.successfully_persisted = false;
            self.pool.evict(&self.pool_key());
        }
    }

    /// Output format `query` is sent with: JSON whenever the query allows it.
    pub fn effective_output_format(&self, query: &Query) -> OutputFormat {
        if query.supports_json_format() {
            OutputFormat::Json
        } else {
            self.output_format
        }
    }

    /// Renders the complete request text for `query`, without the final blank line.
    pub fn build_query(&self, query: &Query, add_headers: &str) -> Result<String, LivestatusError> {
        // A newline inside the auth header would smuggle in further headers
        if self.auth_header.trim_end_matches('\n').contains('\n') {
            return Err(LivestatusError::Query(
                "Refusing to build query with invalid AuthUser header.".into(),
            ));
        }

        let mut text = query.to_string();
        if !self.allow_cache {
            text = strip_cache_headers(&text);
        }

        let localtime = format!("Localtime: {}", unix_seconds(SystemTime::now()));
        let output_format = format!(
            "OutputFormat: {}",
            self.effective_output_format(query).as_header_value()
        );
        Ok(combine_query(
            &text,
            &[
                self.auth_header.as_str(),
                self.added_headers.as_str(),
                &localtime,
                &output_format,
                "KeepAlive: on",
                "ResponseHeader: fixed16",
                add_headers,
            ],
        ))
    }

    async fn write_frame(&mut self, frame: &[u8]) -> io::Result<()> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))?;
        self.in_flight = true;
        stream.write_all(frame).await?;
        stream.flush().await
    }

    /// Sends a request, reconnecting and resending once if the write fails.
    pub async fn send_query(&mut self, text: &str) -> Result<(), LivestatusError> {
        if self.stream.is_none() {
            self.connect().await?;
        }

        let frame = frame_request(text);
        if let Err(err) = self.write_frame(&frame).await {
            debug!("Sending to {} failed ({err}), reconnecting", self.url());
            self.disconnect();
            self.connect().await?;
            if let Err(err) = self.write_frame(&frame).await {
                self.disconnect();
                return Err(LivestatusError::Socket(format!("RC1:{err}")));
            }
        }
        Ok(())
    }

    async fn receive_data(
        &mut self,
        size: usize,
        timeout: Option<Duration>,
        ctx: &str,
    ) -> Result<Vec<u8>, LivestatusError> {
        let Some(stream) = self.stream.as_mut() else {
            return Err(LivestatusError::Socket(format!(
                "Socket to '{}' is not connected",
                self.connector.url()
            )));
        };

        // Grows with the data instead of trusting the announced size up front
        let mut data = Vec::with_capacity(size.min(64 * 1024));
        let read = match timeout {
            Some(after) => tokio::time::timeout(after, stream.take(size as u64).read_to_end(&mut data))
                .await
                .map_err(|_| LivestatusError::Timeout {
                    ctx: ctx.to_owned(),
                    after,
                })?,
            None => stream.take(size as u64).read_to_end(&mut data).await,
        };
        let read = read.map_err(|e| LivestatusError::io(ctx, e))?;
        if read < size {
            return Err(LivestatusError::SocketClosed);
        }
        Ok(data)
    }

    /// Reads one response. Status errors come back typed; the stream stays
    /// usable after them.
    async fn read_response(&mut self) -> Result<Vec<u8>, LivestatusError> {
        let raw = self
            .receive_data(RESPONSE_HEADER_LEN, self.timeout, "reading response header")
            .await?;
        let mut header = [0; RESPONSE_HEADER_LEN];
        header.copy_from_slice(&raw);
        let header = match ResponseHeader::parse(&header) {
            Ok(header) => header,
            Err(err) => {
                self.disconnect();
                return Err(err);
            }
        };

        let body = self
            .receive_data(header.length, Some(BODY_READ_TIMEOUT), "reading response body")
            .await?;
        self.in_flight = false;
        header.check(&body)?;
        Ok(body)
    }

    /// Reads the response to `query_text`, which was just sent.
    ///
    /// If the connection breaks, TCP connections reconnect and send
    /// `query_text` again: once without a timeout, otherwise until the
    /// timeout has passed. Unix sockets are usually served by a local proxy
    /// that only hangs up for a reason, so they aren't retried.
    pub async fn receive_raw_response(&mut self, query_text: &str) -> Result<Vec<u8>, LivestatusError> {
        let mut retry_until: Option<Instant> = None;
        loop {
            let err = match self.read_response().await {
                Ok(body) => return Ok(body),
                Err(err) if err.is_connection_lost() => err,
                Err(err) => return Err(err),
            };

            self.disconnect();
            if self.url().is_unix() {
                return Err(LivestatusError::Socket("Unix socket was closed by peer".into()));
            }

            let now = Instant::now();
            match retry_until {
                Some(deadline) if deadline <= now => {
                    return Err(LivestatusError::Socket(err.to_string()))
                }
                Some(_) => {}
                None => retry_until = Some(now + self.timeout.unwrap_or_default()),
            }

            info!("Lost connection to {} ({err}), retrying", self.url());
            tokio::time::sleep(RECONNECT_DELAY).await;
            self.connect().await?;
            self.send_query(query_text).await?;
        }
    }

    /// Decodes a successful response body. Undecodable output closes the
    /// connection since the stream position can't be trusted anymore.
    pub fn parse_raw_response(
        &mut self,
        raw: &[u8],
        format: OutputFormat,
    ) -> Result<Response, LivestatusError> {
        parse_payload(raw, format).map_err(|err| {
            self.disconnect();
            err
        })
    }

    async fn do_query(&mut self, query: &Query, add_headers: &str) -> Result<Response, LivestatusError> {
        let format = self.effective_output_format(query);
        let text = self.build_query(query, add_headers)?;
        self.send_query(&text).await?;
        let raw = match self.receive_raw_response(&text).await {
            Err(err @ LivestatusError::Query(_)) => {
                self.disconnect();
                return Err(err);
            }
            other => other?,
        };
        self.parse_raw_response(&raw, format)
    }

    /// Sends an external command. The core doesn't answer commands.
    ///
    /// A `[timestamp] ` prefix is added unless `command` starts with `[`.
    pub async fn command(&mut self, command: &str) -> Result<(), LivestatusError> {
        let command = command.trim_end_matches('\n');
        let text = if command.starts_with('[') {
            format!("COMMAND {command}")
        } else {
            format!("COMMAND [{}] {command}", unix_seconds(SystemTime::now()))
        };
        debug!("Sending command to site {}: {text}", self.site);

        if self.stream.is_none() {
            self.connect().await?;
        }
        if let Err(err) = self.write_frame(&frame_request(&text)).await {
            self.disconnect();
            return Err(LivestatusError::Socket(err.to_string()));
        }
        self.in_flight = false;
        Ok(())
    }

    pub async fn send_external_command(&mut self, command: &ExternalCommand) -> Result<(), LivestatusError> {
        self.command(&command.to_string()).await
    }

    /// Sets the user for authorization domain `domain`. An empty user
    /// removes the domain's entry.
    pub fn set_auth_user(&mut self, domain: &str, user: &str) -> Result<(), LivestatusError> {
        if user.is_empty() {
            self.auth_users.remove(domain);
            return Ok(());
        }
        validate_user_id(user)?;
        self.auth_users.insert(domain.to_owned(), user.to_owned());
        Ok(())
    }

    /// Sends future queries as the user of authorization domain `domain`.
    pub fn set_auth_domain(&mut self, domain: &str) {
        self.auth_header = match self.auth_users.get(domain) {
            Some(user) => format!("AuthUser: {user}\n"),
            None => String::new(),
        };
    }
}

#[async_trait]
impl Livestatus for SingleSiteConnection {
    async fn query(&mut self, query: &Query, add_headers: &str) -> Result<Response, LivestatusError> {
        let limited;
        let add_headers = match self.limit {
            Some(limit) => {
                limited = append_header(add_headers, &format!("Limit: {limit}"));
                &limited
            }
            None => add_headers,
        };

        let mut response = self.do_query(query, add_headers).await?;
        if self.prepend_site {
            for row in &mut response {
                row.insert(0, Value::Str(String::new()));
            }
        }
        Ok(response)
    }
}

impl Drop for SingleSiteConnection {
    fn drop(&mut self) {
        self.release_stream();
    }
}

impl fmt::Debug for SingleSiteConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SingleSiteConnection")
            .field("site", &self.site)
            .field("url", self.url())
            .field("persist", &self.persist)
            .field("connected", &self.stream.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::error::ErrorKind;
    use crate::query::QuerySpecification;
    use crate::testing::{MockLivestatus, Reply};

    fn header_lines(request: &str) -> Vec<&str> {
        request.lines().collect()
    }

    #[tokio::test]
    async fn sends_framed_query_with_standard_headers() {
        let mock = MockLivestatus::unix(|_| Reply::ok("[['web01', 0], ['db01', 1]]\n")).await;
        let mut conn = SingleSiteConnection::new(mock.url().clone()).with_pool(ConnectionPool::new());
        conn.set_auth_user("read", "admin").unwrap();
        conn.set_auth_domain("read");

        let rows = conn
            .query(&Query::new("GET hosts\nColumns: name state\n"), "ColumnHeaders: off\n")
            .await
            .unwrap();
        assert_eq!(rows, vec![vec!["web01".into(), Value::Int(0)], vec!["db01".into(), Value::Int(1)]]);

        let requests = mock.requests();
        let lines = header_lines(&requests[0]);
        assert_eq!(lines[..3], ["GET hosts", "Columns: name state", "AuthUser: admin"]);
        assert!(lines[3].starts_with("Localtime: "));
        assert_eq!(
            lines[4..],
            [
                "OutputFormat: python3",
                "KeepAlive: on",
                "ResponseHeader: fixed16",
                "ColumnHeaders: off"
            ]
        );
    }

    #[tokio::test]
    async fn structured_queries_use_json() {
        let mock = MockLivestatus::unix(|request| {
            assert!(request.contains("OutputFormat: json\n"));
            Reply::ok(r#"[["web01", null, true]]"#)
        })
        .await;
        let mut conn = SingleSiteConnection::new(mock.url().clone()).with_pool(ConnectionPool::new());
        let query: Query = QuerySpecification::new("hosts")
            .columns(["name", "alias", "accept_passive_checks"])
            .into();

        let rows = conn.query(&query, "").await.unwrap();
        assert_eq!(rows[0], vec!["web01".into(), Value::None, Value::Bool(true)]);
        assert_eq!(conn.output_format(), OutputFormat::Python3);
    }

    #[tokio::test]
    async fn applies_limit_and_prepends_empty_site() {
        let mock = MockLivestatus::unix(|_| Reply::ok("[['a'], ['b']]")).await;
        let mut conn = SingleSiteConnection::new(mock.url().clone()).with_pool(ConnectionPool::new());
        conn.set_limit(Some(2));
        conn.set_prepend_site(true);

        let rows = conn.query(&Query::new("GET hosts\nColumns: name\n"), "").await.unwrap();
        assert_eq!(rows[1], vec![Value::Str(String::new()), "b".into()]);
        assert!(mock.requests()[0].starts_with("GET hosts\nColumns: name\n"));
        assert!(mock.requests()[0].ends_with("\nLimit: 2\n"));
    }

    #[tokio::test]
    async fn limit_is_a_separate_header_line() {
        let mock = MockLivestatus::unix(|_| Reply::ok("[]")).await;
        let mut conn = SingleSiteConnection::new(mock.url().clone()).with_pool(ConnectionPool::new());
        conn.set_limit(Some(5));

        conn.query(&Query::new("GET hosts"), "ColumnHeaders: off").await.unwrap();
        let lines = header_lines(&mock.requests()[0]).len();
        let request = &mock.requests()[0];
        assert!(request.starts_with("GET hosts\nLocaltime: "));
        assert!(request.ends_with("\nColumnHeaders: off\nLimit: 5\n"));
        assert_eq!(lines, 7);
    }

    #[tokio::test]
    async fn strips_cache_headers_unless_allowed() {
        let mock = MockLivestatus::unix(|_| Reply::ok("[]")).await;
        let query = Query::new("GET hosts\nCache: reload\nColumns: name\n");

        let mut conn = SingleSiteConnection::new(mock.url().clone()).with_pool(ConnectionPool::new());
        conn.query(&query, "").await.unwrap();
        let mut caching = SingleSiteConnection::new(mock.url().clone())
            .with_cache(true)
            .with_pool(ConnectionPool::new());
        caching.query(&query, "").await.unwrap();

        let requests = mock.requests();
        assert!(!requests[0].contains("Cache:"));
        assert!(requests[1].contains("Cache: reload\n"));
    }

    #[tokio::test]
    async fn status_errors_keep_connection_usable() {
        let mock = MockLivestatus::unix(|request| {
            if request.starts_with("GET hostz") {
                Reply::status(404, "Invalid GET request, no such table 'hostz'")
            } else {
                Reply::ok("[[1]]")
            }
        })
        .await;
        let mut conn = SingleSiteConnection::new(mock.url().clone()).with_pool(ConnectionPool::new());

        let err = conn.query(&Query::new("GET hostz\n"), "").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TableNotFound);
        assert!(conn.is_connected());

        conn.query(&Query::new("GET hosts\n"), "").await.unwrap();
        assert_eq!(mock.connections(), 1);
    }

    #[tokio::test]
    async fn query_errors_disconnect() {
        let mock = MockLivestatus::unix(|_| Reply::status(400, "Invalid header")).await;
        let mut conn = SingleSiteConnection::new(mock.url().clone()).with_pool(ConnectionPool::new());
        let err = conn.query(&Query::new("GET hosts\n"), "").await.unwrap_err();
        assert_eq!(err.to_string(), "400: Invalid header");
        assert!(!conn.is_connected());
    }

    #[tokio::test]
    async fn malformed_output_disconnects() {
        let mock = MockLivestatus::unix(|_| Reply::ok("[['unterminated")).await;
        let mut conn = SingleSiteConnection::new(mock.url().clone()).with_pool(ConnectionPool::new());
        let err = conn.query(&Query::new("GET hosts\n"), "").await.unwrap_err();
        assert_eq!(err.to_string(), "Malformed raw response output");
        assert!(!conn.is_connected());
    }

    #[tokio::test]
    async fn garbage_header_is_socket_error() {
        let mock = MockLivestatus::tcp(|_| Reply::Raw(b"HTTP/1.1 400 Bad Request\r\n\r\n".to_vec())).await;
        let mut conn = SingleSiteConnection::new(mock.url().clone()).with_pool(ConnectionPool::new());
        let err = conn.query(&Query::new("GET hosts\n"), "").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Socket);
        assert!(err.to_string().starts_with("Malformed response header"));
    }

    #[tokio::test]
    async fn tcp_reconnects_and_resends_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mock = MockLivestatus::tcp({
            let calls = calls.clone();
            move |_| match calls.fetch_add(1, Ordering::SeqCst) {
                0 => Reply::Close,
                _ => Reply::ok("[['ok']]"),
            }
        })
        .await;
        let mut conn = SingleSiteConnection::new(mock.url().clone()).with_pool(ConnectionPool::new());

        let rows = conn.query(&Query::new("GET status\n"), "").await.unwrap();
        assert_eq!(rows, vec![vec![Value::from("ok")]]);
        assert_eq!(mock.connections(), 2);
        let requests = mock.requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0], requests[1]);
    }

    #[tokio::test]
    async fn tcp_gives_up_after_one_retry_without_timeout() {
        let mock = MockLivestatus::tcp(|_| Reply::Close).await;
        let mut conn = SingleSiteConnection::new(mock.url().clone()).with_pool(ConnectionPool::new());
        let err = conn.query(&Query::new("GET status\n"), "").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Socket);
        assert_eq!(mock.requests().len(), 2);
    }

    #[tokio::test]
    async fn unix_sockets_are_not_retried() {
        let mock = MockLivestatus::unix(|_| Reply::Close).await;
        let mut conn = SingleSiteConnection::new(mock.url().clone()).with_pool(ConnectionPool::new());
        let err = conn.query(&Query::new("GET status\n"), "").await.unwrap_err();
        assert_eq!(err.to_string(), "Unix socket was closed by peer");
        assert_eq!(mock.requests().len(), 1);
    }

    #[tokio::test]
    async fn resends_on_stale_keepalive_connection() {
        let mock = MockLivestatus::tcp(|_| Reply::ThenClose(Box::new(Reply::ok("[[1]]")))).await;
        let mut conn = SingleSiteConnection::new(mock.url().clone()).with_pool(ConnectionPool::new());
        conn.query(&Query::new("GET status\n"), "").await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        conn.query(&Query::new("GET status\n"), "").await.unwrap();
        assert_eq!(mock.connections(), 2);
    }

    #[test]
    fn validates_user_ids() {
        validate_user_id("cmkadmin").unwrap();
        validate_user_id("$auto@host.example+1").unwrap();
        for user in ["in valid", "-lead", "evil\nAuthUser: root", ""] {
            let err = validate_user_id(user).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Config, "{user:?}");
        }
    }

    #[tokio::test]
    async fn tcp_retries_until_timeout_passes() {
        let mock = MockLivestatus::tcp(|_| Reply::Close).await;
        let timeout = Duration::from_millis(350);
        let mut conn = SingleSiteConnection::new(mock.url().clone())
            .with_timeout(Some(timeout))
            .with_pool(ConnectionPool::new());

        let start = Instant::now();
        let err = conn.query(&Query::new("GET status\n"), "").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Socket);
        assert!(start.elapsed() >= timeout);
        // One resend per 100ms pause until the deadline
        assert!(mock.requests().len() >= 4, "{:?}", mock.requests());
        assert!(!conn.is_connected());
    }

    #[tokio::test]
    async fn failed_write_reconnects_and_resends() {
        let mock = MockLivestatus::unix(|_| Reply::ThenClose(Box::new(Reply::ok("[[1]]")))).await;
        let mut conn = SingleSiteConnection::new(mock.url().clone()).with_pool(ConnectionPool::new());
        conn.query(&Query::new("GET status\n"), "").await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        // The peer hung up, so the write on the old socket fails right away
        let rows = conn.query(&Query::new("GET status\n"), "").await.unwrap();
        assert_eq!(rows, vec![vec![Value::Int(1)]]);
        assert_eq!(mock.connections(), 2);
        assert_eq!(mock.requests().len(), 2);
    }

    #[tokio::test]
    async fn second_failed_write_is_rc1_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("live");
        let listener = tokio::net::UnixListener::bind(&path).unwrap();
        let accepted = Arc::new(AtomicUsize::new(0));
        let server = tokio::spawn({
            let accepted = accepted.clone();
            async move {
                // Hang up on every client without reading
                while let Ok((stream, _)) = listener.accept().await {
                    accepted.fetch_add(1, Ordering::SeqCst);
                    drop(stream);
                }
            }
        });

        let mut conn = SingleSiteConnection::new(SocketUrl::Unix(path)).with_pool(ConnectionPool::new());
        // Larger than the socket buffer, so the write waits for the peer
        let text = format!("GET hosts\nFilter: name = {}\n", "x".repeat(8 << 20));
        let err = conn.send_query(&text).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Socket);
        assert!(err.to_string().starts_with("RC1:"), "{err}");
        assert_eq!(accepted.load(Ordering::SeqCst), 2);
        assert!(!conn.is_connected());
        server.abort();
    }

    #[tokio::test]
    async fn reconnecting_keeps_idle_persisted_stream() {
        let mock = MockLivestatus::unix(|_| Reply::ok("[[1]]")).await;
        let pool = ConnectionPool::new();
        let mut conn = SingleSiteConnection::new(mock.url().clone())
            .with_persist(true)
            .with_pool(pool.clone());
        conn.query(&Query::new("GET status\n"), "").await.unwrap();

        conn.connect().await.unwrap();
        assert!(conn.successfully_persisted());
        assert!(pool.is_empty());
        conn.query(&Query::new("GET status\n"), "").await.unwrap();
        assert_eq!(mock.connections(), 1);
    }

    #[tokio::test]
    async fn persisted_streams_are_reused() {
        let mock = MockLivestatus::unix(|_| Reply::ok("[[1]]")).await;
        let pool = ConnectionPool::new();
        let open = || {
            SingleSiteConnection::new(mock.url().clone())
                .with_persist(true)
                .with_pool(pool.clone())
        };

        let mut first = open();
        first.query(&Query::new("GET status\n"), "").await.unwrap();
        assert!(!first.successfully_persisted());
        drop(first);
        assert!(pool.contains(&mock.url().to_string()));

        let mut second = open();
        second.connect().await.unwrap();
        assert!(second.successfully_persisted());
        second.query(&Query::new("GET status\n"), "").await.unwrap();
        assert_eq!(mock.connections(), 1);

        second.disconnect();
        assert!(pool.is_empty());
    }

    #[tokio::test]
    async fn non_persisting_connections_leave_pool_alone() {
        let mock = MockLivestatus::unix(|_| Reply::ok("[[1]]")).await;
        let pool = ConnectionPool::new();
        let mut conn = SingleSiteConnection::new(mock.url().clone()).with_pool(pool.clone());
        conn.query(&Query::new("GET status\n"), "").await.unwrap();
        drop(conn);
        assert!(pool.is_empty());
    }

    #[tokio::test]
    async fn commands_get_timestamp_prefix() {
        let mock = MockLivestatus::unix(|_| Reply::ok("[]")).await;
        let mut conn = SingleSiteConnection::new(mock.url().clone()).with_pool(ConnectionPool::new());

        conn.command("[1700000000] SAVE_STATE\n").await.unwrap();
        conn.command("DISABLE_NOTIFICATIONS").await.unwrap();
        conn.send_external_command(&ExternalCommand::new("ACKNOWLEDGE_HOST_PROBLEM").arg("web01").arg(true))
            .await
            .unwrap();
        // Answered queries are served in order, so all commands have arrived
        conn.query(&Query::new("GET status\n"), "").await.unwrap();

        let requests = mock.requests();
        assert_eq!(requests[0], "COMMAND [1700000000] SAVE_STATE\n");
        assert!(requests[1].starts_with("COMMAND ["));
        assert!(requests[1].ends_with("] DISABLE_NOTIFICATIONS\n"));
        assert!(requests[2].ends_with("] ACKNOWLEDGE_HOST_PROBLEM;web01;1\n"));
    }

    #[test]
    fn validates_auth_users() {
        let mut conn = SingleSiteConnection::new(SocketUrl::Unix("/tmp/live".into()));
        conn.set_auth_user("read", "cmkadmin").unwrap();
        conn.set_auth_user("write", "a.b-c@example.com").unwrap();
        conn.set_auth_user("bad", "admin\nGET hosts").unwrap_err();
        conn.set_auth_user("bad", "-leading-dash").unwrap_err();

        conn.set_auth_domain("write");
        assert_eq!(conn.auth_header, "AuthUser: a.b-c@example.com\n");
        conn.set_auth_user("write", "").unwrap();
        conn.set_auth_domain("write");
        assert_eq!(conn.auth_header, "");
    }

    #[test]
    fn refuses_smuggled_auth_header() {
        let mut conn = SingleSiteConnection::new(SocketUrl::Unix("/tmp/live".into()));
        conn.auth_header = "AuthUser: a\nAuthUser: b\n".into();
        let err = conn.build_query(&Query::new("GET hosts"), "").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Query);
    }

    #[test]
    fn local_connection_uses_omd_root() {
        std::env::set_var(crate::tls::OMD_ROOT_ENV, "/omd/sites/mysite");
        let conn = SingleSiteConnection::local().unwrap();
        assert_eq!(conn.url().to_string(), "unix:/omd/sites/mysite/tmp/run/live");
        assert_eq!(conn.site().as_str(), "local");
    }
}
