// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Fan-out of queries across a set of sites.
//!
//! Sites that fail are moved to a dead-site table and aren't contacted again
//! by this connection. A site may name a status host: a host on another site
//! that monitors its server. Such a site is only contacted while its status
//! host is up.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use tracing::{debug, warn};

use crate::command::ExternalCommand;
use crate::connection::SingleSiteConnection;
use crate::encoding::append_header;
use crate::error::LivestatusError;
use crate::helpers::Livestatus;
use crate::pool::ConnectionPool;
use crate::query::{OutputFormat, Query};
use crate::site::{SiteConfig, SiteId, Sites};
use crate::value::{Response, Value};

/// Host state used when the status host hasn't been checked yet.
const STATE_PENDING: i64 = 3;
/// Host state used when the status host doesn't exist.
const STATE_MISSING: i64 = 4;

#[derive(Debug)]
pub enum DeadReason {
    Error(LivestatusError),
    /// The site's status host isn't up.
    StatusHost { state: i64, message: String },
}

impl DeadReason {
    fn status_host(state: i64, site: &SiteId, host: &str) -> Self {
        let message = match state {
            1 => "The remote monitoring host is down".to_owned(),
            2 => "The remote monitoring host is unreachable".to_owned(),
            STATE_PENDING => "The remote monitoring host's state it not yet determined".to_owned(),
            STATE_MISSING => format!("Invalid status host: site {site} has no host '{host}'"),
            other => format!("Error determining state of remote monitoring host: {other}"),
        };
        Self::StatusHost { state, message }
    }
}

impl fmt::Display for DeadReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Error(err) => write!(f, "{err}"),
            Self::StatusHost { message, .. } => f.write_str(message),
        }
    }
}

#[derive(Debug)]
pub struct DeadSite {
    pub config: SiteConfig,
    pub reason: DeadReason,
}

impl DeadSite {
    pub fn status_host_state(&self) -> Option<i64> {
        match self.reason {
            DeadReason::StatusHost { state, .. } => Some(state),
            DeadReason::Error(_) => None,
        }
    }
}

#[derive(Debug)]
struct ConnectedSite {
    id: SiteId,
    config: SiteConfig,
    connection: SingleSiteConnection,
}

/// Connections to several sites, queried as one.
#[derive(Debug)]
pub struct MultiSiteConnection {
    connections: Vec<ConnectedSite>,
    dead_sites: BTreeMap<SiteId, DeadSite>,
    only_sites: Option<Vec<SiteId>>,
    prepend_site: bool,
    limit: Option<usize>,
    parallelize: bool,
    pool: Arc<ConnectionPool>,
}

impl MultiSiteConnection {
    /// Connects to all `sites` whose status host, if any, is up.
    ///
    /// Status hosts may live on `disabled_sites`, which are connected to only
    /// for the status lookup.
    pub async fn connect(sites: &Sites, disabled_sites: &Sites) -> Result<Self, LivestatusError> {
        Self::connect_with_pool(sites, disabled_sites, ConnectionPool::global()).await
    }

    pub async fn connect_with_pool(
        sites: &Sites,
        disabled_sites: &Sites,
        pool: Arc<ConnectionPool>,
    ) -> Result<Self, LivestatusError> {
        let mut this = Self {
            connections: Vec::new(),
            dead_sites: BTreeMap::new(),
            only_sites: None,
            prepend_site: false,
            limit: None,
            parallelize: true,
            pool,
        };

        // Status site => hosts to look up there
        let mut status_hosts: BTreeMap<&SiteId, Vec<&str>> = BTreeMap::new();
        for config in sites.values() {
            if let Some((status_site, host)) = &config.status_host {
                let hosts = status_hosts.entry(status_site).or_default();
                if !hosts.contains(&host.as_str()) {
                    hosts.push(host);
                }
            }
        }

        let temporary: Vec<(&SiteId, &SiteConfig)> = status_hosts
            .keys()
            .filter_map(|site| disabled_sites.get_key_value(*site))
            .collect();
        this.connect_sites(temporary.iter().copied(), true).await;
        this.connect_sites(
            sites.iter().filter(|(_, config)| config.status_host.is_none()),
            false,
        )
        .await;

        let mut states: HashMap<(&SiteId, String), i64> = HashMap::new();
        for (status_site, hosts) in &status_hosts {
            let mut query = String::from("GET hosts\nColumns: name state has_been_checked last_time_up\n");
            for host in hosts {
                query.push_str(&format!("Filter: name = {host}\n"));
            }
            query.push_str(&format!("Or: {}\n", hosts.len()));

            this.set_only_sites(Some(vec![(*status_site).clone()]));
            let rows = this
                .query_table(&Query::new(query))
                .await
                .map_err(|e| LivestatusError::Config(e.to_string()))?;
            for row in rows {
                let (Some(name), Some(state), Some(checked)) = (
                    row.first().and_then(Value::as_str),
                    row.get(1).and_then(Value::as_i64),
                    row.get(2).and_then(Value::as_i64),
                ) else {
                    return Err(LivestatusError::Config(format!(
                        "Malformed status host row from site {status_site}: {row:?}"
                    )));
                };
                let state = if checked == 0 { STATE_PENDING } else { state };
                states.insert((*status_site, name.to_owned()), state);
            }
        }
        this.set_only_sites(None);

        for (site, _) in &temporary {
            if let Some(pos) = this.connections.iter().position(|c| c.id == **site) {
                this.connections.remove(pos);
            }
            this.dead_sites.remove(*site);
        }

        let mut reachable = Vec::new();
        for (id, config) in sites {
            let Some((status_site, host)) = &config.status_host else {
                continue;
            };
            let state = states
                .get(&(status_site, host.clone()))
                .copied()
                .unwrap_or(STATE_MISSING);
            if state == 0 {
                reachable.push((id, config));
            } else {
                let reason = DeadReason::status_host(state, status_site, host);
                debug!("Not connecting to site {id}: {reason}");
                this.dead_sites.insert(
                    id.clone(),
                    DeadSite {
                        config: config.clone(),
                        reason,
                    },
                );
            }
        }
        this.connect_sites(reachable.into_iter(), false).await;

        Ok(this)
    }

    async fn connect_sites<'a>(
        &mut self,
        sites: impl Iterator<Item = (&'a SiteId, &'a SiteConfig)>,
        temporary: bool,
    ) {
        let attempts = sites.map(|(id, config)| {
            let mut connection = SingleSiteConnection::for_site(id, config, temporary)
                .with_pool(self.pool.clone());
            async move {
                let result = connection.connect().await;
                (id, config, connection, result)
            }
        });

        for (id, config, connection, result) in join_all(attempts).await {
            match result {
                Ok(()) => self.connections.push(ConnectedSite {
                    id: id.clone(),
                    config: config.clone(),
                    connection,
                }),
                Err(err) => {
                    warn!("Site {id} is dead: {err}");
                    self.dead_sites.insert(
                        id.clone(),
                        DeadSite {
                            config: config.clone(),
                            reason: DeadReason::Error(err),
                        },
                    );
                }
            }
        }
    }

    /// Moves failed sites to the dead-site table.
    fn bury(&mut self, failures: Vec<(SiteId, LivestatusError)>) {
        for (id, err) in failures {
            let Some(pos) = self.connections.iter().position(|c| c.id == id) else {
                continue;
            };
            let mut site = self.connections.remove(pos);
            site.connection.disconnect();
            warn!("Site {id} is dead: {err}");
            self.dead_sites.insert(
                id,
                DeadSite {
                    config: site.config,
                    reason: DeadReason::Error(err),
                },
            );
        }
    }

    fn is_targeted(only_sites: &Option<Vec<SiteId>>, site: &SiteId) -> bool {
        only_sites.as_ref().map_or(true, |only| only.contains(site))
    }

    fn with_limit(add_headers: &str, limit: Option<usize>) -> String {
        match limit {
            Some(limit) => append_header(add_headers, &format!("Limit: {limit}")),
            None => add_headers.to_owned(),
        }
    }

    /// Sends the query to all targeted sites, then collects all answers.
    ///
    /// The limit applies to every site separately, so the result may hold
    /// more rows than the limit.
    pub async fn query_parallel(&mut self, query: &Query, add_headers: &str) -> Result<Response, LivestatusError> {
        let add_headers = Self::with_limit(add_headers, self.limit);
        let only_sites = &self.only_sites;
        let targeted = self
            .connections
            .iter_mut()
            .filter(|site| Self::is_targeted(only_sites, &site.id));

        let sent = join_all(targeted.map(|site| {
            let add_headers = add_headers.as_str();
            async move {
                let format = site.connection.effective_output_format(query);
                let sent = async {
                    let text = site.connection.build_query(query, add_headers)?;
                    site.connection.send_query(&text).await?;
                    Ok::<_, LivestatusError>(text)
                }
                .await;
                (site, format, sent)
            }
        }))
        .await;

        let mut failures = Vec::new();
        let mut pending = Vec::new();
        for (site, format, sent) in sent {
            match sent {
                Ok(text) => pending.push((site, format, text)),
                Err(err) => failures.push((site.id.clone(), err)),
            }
        }

        let received = join_all(pending.into_iter().map(|(site, format, text)| async move {
            let result = async {
                let raw = site.connection.receive_raw_response(&text).await?;
                site.connection.parse_raw_response(&raw, format)
            }
            .await;
            (site, result)
        }))
        .await;

        let mut response = Response::new();
        for (site, result) in received {
            match result {
                Ok(mut rows) => {
                    if self.prepend_site {
                        prepend(&mut rows, &site.id);
                    }
                    response.extend(rows);
                }
                Err(err) if query.is_suppressed(err.kind()) => {
                    debug!("Ignoring error from site {}: {err}", site.id);
                }
                Err(err) => failures.push((site.id.clone(), err)),
            }
        }

        self.bury(failures);
        Ok(response)
    }

    /// Queries the targeted sites one after another. The limit is shared:
    /// each site gets what the previous ones left over.
    pub async fn query_non_parallel(
        &mut self,
        query: &Query,
        add_headers: &str,
    ) -> Result<Response, LivestatusError> {
        let mut response = Response::new();
        let mut failures = Vec::new();
        let mut limit = self.limit;

        for site in &mut self.connections {
            if !Self::is_targeted(&self.only_sites, &site.id) {
                continue;
            }
            if limit == Some(0) {
                break;
            }

            let headers = Self::with_limit(add_headers, limit);
            match site.connection.query(query, &headers).await {
                Ok(mut rows) => {
                    if let Some(limit) = &mut limit {
                        *limit = limit.saturating_sub(rows.len());
                    }
                    if self.prepend_site {
                        prepend(&mut rows, &site.id);
                    }
                    response.extend(rows);
                }
                Err(err) if query.is_suppressed(err.kind()) => {
                    debug!("Ignoring error from site {}: {err}", site.id);
                }
                Err(err) => failures.push((site.id.clone(), err)),
            }
        }

        self.bury(failures);
        Ok(response)
    }

    /// Sends a command to one site.
    pub async fn command(&mut self, command: &str, site: &SiteId) -> Result<(), LivestatusError> {
        if let Some(dead) = self.dead_sites.get(site) {
            return Err(LivestatusError::Socket(format!(
                "Connection to site {site} is dead: {}",
                dead.reason
            )));
        }
        let connection = self.get_connection(site).ok_or_else(|| {
            LivestatusError::Config(format!("Cannot send command to unconfigured site '{site}'"))
        })?;
        connection.command(command).await
    }

    pub async fn send_external_command(
        &mut self,
        command: &ExternalCommand,
        site: &SiteId,
    ) -> Result<(), LivestatusError> {
        self.command(&command.to_string(), site).await
    }

    /// The connection to the local core: the first Unix socket that isn't a
    /// livestatus proxy.
    pub fn local_connection(&mut self) -> Result<&mut SingleSiteConnection, LivestatusError> {
        self.connections
            .iter_mut()
            .find(|site| site.connection.url().is_unix() && !site.config.socket.to_string().contains("liveproxy"))
            .map(|site| &mut site.connection)
            .ok_or_else(|| LivestatusError::Config("No livestatus connection to local host".into()))
    }

    pub fn get_connection(&mut self, site: &SiteId) -> Option<&mut SingleSiteConnection> {
        self.connections
            .iter_mut()
            .find(|connected| connected.id == *site)
            .map(|connected| &mut connected.connection)
    }

    pub fn alive_sites(&self) -> Vec<SiteId> {
        self.connections.iter().map(|site| site.id.clone()).collect()
    }

    pub fn dead_sites(&self) -> &BTreeMap<SiteId, DeadSite> {
        &self.dead_sites
    }

    /// Whether any connection reused a persisted stream.
    pub fn successfully_persisted(&self) -> bool {
        self.connections
            .iter()
            .any(|site| site.connection.successfully_persisted())
    }

    /// Restricts future queries to `sites`; `None` lifts the restriction.
    pub fn set_only_sites(&mut self, sites: Option<Vec<SiteId>>) {
        self.only_sites = sites.filter(|sites| !sites.is_empty());
    }

    /// Inserts the site id in front of every row.
    pub fn set_prepend_site(&mut self, prepend_site: bool) {
        self.prepend_site = prepend_site;
    }

    pub fn set_limit(&mut self, limit: Option<usize>) {
        self.limit = limit;
    }

    pub fn set_parallelize(&mut self, parallelize: bool) {
        self.parallelize = parallelize;
    }

    pub fn add_header(&mut self, header: &str) {
        for site in &mut self.connections {
            site.connection.add_header(header);
        }
    }

    pub fn set_output_format(&mut self, format: OutputFormat) {
        for site in &mut self.connections {
            site.connection.set_output_format(format);
        }
    }

    pub fn output_format(&self) -> OutputFormat {
        self.connections
            .first()
            .map(|site| site.connection.output_format())
            .unwrap_or_default()
    }

    pub fn set_auth_user(&mut self, domain: &str, user: &str) -> Result<(), LivestatusError> {
        for site in &mut self.connections {
            site.connection.set_auth_user(domain, user)?;
        }
        Ok(())
    }

    pub fn set_auth_domain(&mut self, domain: &str) {
        for site in &mut self.connections {
            site.connection.set_auth_domain(domain);
        }
    }

    /// Closes all sockets. The next query reconnects.
    pub fn disconnect(&mut self) {
        for site in &mut self.connections {
            site.connection.disconnect();
        }
    }
}

fn prepend(rows: &mut Response, site: &SiteId) {
    for row in rows {
        row.insert(0, Value::Str(site.to_string()));
    }
}

#[async_trait]
impl Livestatus for MultiSiteConnection {
    async fn query(&mut self, query: &Query, add_headers: &str) -> Result<Response, LivestatusError> {
        if self.parallelize {
            self.query_parallel(query, add_headers).await
        } else {
            self.query_non_parallel(query, add_headers).await
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use super::*;
    use crate::error::ErrorKind;
    use crate::testing::{MockLivestatus, Reply};
    use crate::url::SocketUrl;

    fn site(mock: &MockLivestatus) -> SiteConfig {
        SiteConfig::new(mock.url().clone())
    }

    fn sites(entries: impl IntoIterator<Item = (&'static str, SiteConfig)>) -> Sites {
        entries
            .into_iter()
            .map(|(id, config)| (SiteId::new(id), config))
            .collect()
    }

    async fn connect(sites: &Sites, disabled: &Sites) -> MultiSiteConnection {
        MultiSiteConnection::connect_with_pool(sites, disabled, ConnectionPool::new())
            .await
            .unwrap()
    }

    fn ids(names: &[&str]) -> Vec<SiteId> {
        names.iter().map(|name| SiteId::new(*name)).collect()
    }

    #[tokio::test]
    async fn queries_all_sites_and_prepends_ids() {
        let a = MockLivestatus::unix(|_| Reply::ok("[['a1'], ['a2']]")).await;
        let b = MockLivestatus::unix(|_| Reply::ok("[['b1']]")).await;
        let mut conn = connect(&sites([("a", site(&a)), ("b", site(&b))]), &Sites::new()).await;
        conn.set_prepend_site(true);
        conn.set_limit(Some(5));

        let rows = conn.query(&Query::new("GET hosts\nColumns: name\n"), "").await.unwrap();
        assert_eq!(
            rows,
            vec![
                vec!["a".into(), "a1".into()],
                vec!["a".into(), "a2".into()],
                vec!["b".into(), "b1".into()],
            ]
        );
        assert!(a.requests()[0].contains("\nLimit: 5\n"));
        assert!(b.requests()[0].contains("\nLimit: 5\n"));
        assert_eq!(conn.alive_sites(), ids(&["a", "b"]));
    }

    #[tokio::test]
    async fn failing_sites_are_buried() {
        let ok = MockLivestatus::unix(|_| Reply::ok("[['x']]")).await;
        let missing_table = MockLivestatus::unix(|_| Reply::status(404, "no such table")).await;
        let broken = MockLivestatus::unix(|_| Reply::status(400, "Invalid request")).await;
        let mut conn = connect(
            &sites([
                ("broken", site(&broken)),
                ("missing", site(&missing_table)),
                ("ok", site(&ok)),
            ]),
            &Sites::new(),
        )
        .await;

        let rows = conn.query(&Query::new("GET tablez\n"), "").await.unwrap();
        assert_eq!(rows, vec![vec![Value::from("x")]]);
        assert_eq!(conn.alive_sites(), ids(&["missing", "ok"]));

        let dead = &conn.dead_sites()["broken"];
        assert_eq!(dead.reason.to_string(), "400: Invalid request");
        assert_eq!(dead.status_host_state(), None);

        // Suppression can be switched off per query
        let query = Query::new("GET tablez\n").with_suppressed(vec![]);
        conn.query(&query, "").await.unwrap();
        assert_eq!(conn.alive_sites(), ids(&["ok"]));
    }

    #[tokio::test]
    async fn unreachable_sites_are_dead_from_the_start() {
        let ok = MockLivestatus::unix(|_| Reply::ok("[]")).await;
        let gone = SiteConfig::new(SocketUrl::Unix("/nonexistent/live".into()));
        let conn = connect(&sites([("gone", gone), ("ok", site(&ok))]), &Sites::new()).await;

        assert_eq!(conn.alive_sites(), ids(&["ok"]));
        let reason = conn.dead_sites()["gone"].reason.to_string();
        assert!(reason.starts_with("Cannot connect to 'unix:/nonexistent/live'"));
    }

    #[tokio::test]
    async fn only_sites_restricts_fan_out() {
        let a = MockLivestatus::unix(|_| Reply::ok("[['a']]")).await;
        let b = MockLivestatus::unix(|_| Reply::ok("[['b']]")).await;
        let mut conn = connect(&sites([("a", site(&a)), ("b", site(&b))]), &Sites::new()).await;

        conn.set_only_sites(Some(ids(&["b"])));
        let rows = conn.query(&Query::new("GET hosts\n"), "").await.unwrap();
        assert_eq!(rows, vec![vec![Value::from("b")]]);
        assert!(a.requests().is_empty());
        assert_eq!(conn.alive_sites(), ids(&["a", "b"]));
    }

    #[tokio::test]
    async fn sequential_queries_share_the_limit() {
        let a = MockLivestatus::unix(|_| Reply::ok("[['a1'], ['a2']]")).await;
        let b = MockLivestatus::unix(|_| Reply::ok("[['b1']]")).await;
        let c = MockLivestatus::unix(|_| Reply::ok("[['c1']]")).await;
        let mut conn = connect(
            &sites([("a", site(&a)), ("b", site(&b)), ("c", site(&c))]),
            &Sites::new(),
        )
        .await;
        conn.set_parallelize(false);
        conn.set_limit(Some(3));

        let rows = conn.query(&Query::new("GET hosts\n"), "").await.unwrap();
        assert_eq!(rows.len(), 3);
        assert!(a.requests()[0].contains("\nLimit: 3\n"));
        assert!(b.requests()[0].contains("\nLimit: 1\n"));
        assert!(c.requests().is_empty());
    }

    fn status_reply(request: &str) -> Reply {
        assert!(request.starts_with(
            "GET hosts\nColumns: name state has_been_checked last_time_up\n"
        ));
        Reply::ok(
            "[['up-host', 0, 1, 1700000000], ['down-host', 1, 1, 1600000000], \
             ['fresh-host', 0, 0, 0]]",
        )
    }

    fn with_status_host(mock: &MockLivestatus, host: &str) -> SiteConfig {
        SiteConfig {
            status_host: Some((SiteId::new("central"), host.to_owned())),
            ..site(mock)
        }
    }

    #[tokio::test]
    async fn status_hosts_gate_remote_sites() {
        let central = MockLivestatus::unix(status_reply).await;
        let remote = MockLivestatus::unix(|_| Reply::ok("[['remote']]")).await;

        let conn = connect(
            &sites([
                ("central", site(&central)),
                ("up", with_status_host(&remote, "up-host")),
                ("down", with_status_host(&remote, "down-host")),
                ("fresh", with_status_host(&remote, "fresh-host")),
                ("ghost", with_status_host(&remote, "ghost-host")),
            ]),
            &Sites::new(),
        )
        .await;

        assert_eq!(conn.alive_sites(), ids(&["central", "up"]));
        let reason = |id: &str| conn.dead_sites()[id].reason.to_string();
        assert_eq!(reason("down"), "The remote monitoring host is down");
        assert_eq!(
            reason("fresh"),
            "The remote monitoring host's state it not yet determined"
        );
        assert_eq!(
            reason("ghost"),
            "Invalid status host: site central has no host 'ghost-host'"
        );
        assert_eq!(conn.dead_sites()["ghost"].status_host_state(), Some(4));

        let request = &central.requests()[0];
        assert!(request.contains(
            "Filter: name = down-host\nFilter: name = fresh-host\nFilter: name = ghost-host\n\
             Filter: name = up-host\nOr: 4\n"
        ));
    }

    #[tokio::test]
    async fn disabled_status_sites_are_only_used_for_lookup() {
        let central = MockLivestatus::unix(status_reply).await;
        let remote = MockLivestatus::unix(|_| Reply::ok("[]")).await;

        let conn = connect(
            &sites([("remote", with_status_host(&remote, "up-host"))]),
            &sites([("central", site(&central))]),
        )
        .await;

        assert_eq!(conn.alive_sites(), ids(&["remote"]));
        assert!(conn.dead_sites().is_empty());
        assert_eq!(central.requests().len(), 1);
    }

    #[tokio::test]
    async fn malformed_status_rows_are_config_errors() {
        let central = MockLivestatus::unix(|_| Reply::ok("[['up-host', 0]]")).await;
        let remote = MockLivestatus::unix(|_| Reply::ok("[]")).await;

        let err = MultiSiteConnection::connect_with_pool(
            &sites([
                ("central", site(&central)),
                ("remote", with_status_host(&remote, "up-host")),
            ]),
            &Sites::new(),
            ConnectionPool::new(),
        )
        .await
        .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Config);
        assert!(err
            .to_string()
            .starts_with("Malformed status host row from site central: "));
        assert_eq!(remote.connections(), 0);
    }

    #[test]
    fn describes_every_status_host_state() {
        let site = SiteId::new("central");
        let message = |state| DeadReason::status_host(state, &site, "gw").to_string();
        assert_eq!(message(1), "The remote monitoring host is down");
        assert_eq!(message(2), "The remote monitoring host is unreachable");
        assert_eq!(
            message(3),
            "The remote monitoring host's state it not yet determined"
        );
        assert_eq!(message(4), "Invalid status host: site central has no host 'gw'");
        assert_eq!(
            message(7),
            "Error determining state of remote monitoring host: 7"
        );
        assert_eq!(
            DeadSite {
                config: SiteConfig::new("unix:/tmp/live".parse().unwrap()),
                reason: DeadReason::status_host(2, &site, "gw"),
            }
            .status_host_state(),
            Some(2)
        );
    }

    #[tokio::test]
    async fn sends_to_every_site_before_reading_answers() {
        let b_received = Arc::new(std::sync::Mutex::new(None));
        let delay = Duration::from_millis(300);

        let a = MockLivestatus::unix(move |_| {
            Reply::Delayed(delay, Box::new(Reply::ok("[['a']]")))
        })
        .await;
        let b = MockLivestatus::unix({
            let b_received = b_received.clone();
            move |_| {
                *b_received.lock().unwrap() = Some(Instant::now());
                Reply::ok("[['b']]")
            }
        })
        .await;
        let mut conn = connect(&sites([("a", site(&a)), ("b", site(&b))]), &Sites::new()).await;

        let start = Instant::now();
        let rows = conn.query(&Query::new("GET hosts\n"), "").await.unwrap();
        assert_eq!(rows, vec![vec![Value::from("a")], vec![Value::from("b")]]);
        assert!(start.elapsed() >= delay);

        // A sequential client would only reach b after a's delayed answer
        let b_at = b_received.lock().unwrap().unwrap();
        assert!(b_at.duration_since(start) < delay);
    }

    #[tokio::test]
    async fn commands_go_to_one_site() {
        let a = MockLivestatus::unix(|_| Reply::ok("[]")).await;
        let gone = SiteConfig::new(SocketUrl::Unix("/nonexistent/live".into()));
        let mut conn = connect(&sites([("a", site(&a)), ("gone", gone)]), &Sites::new()).await;

        conn.command("[1] SAVE_STATE", &SiteId::new("a")).await.unwrap();
        conn.query(&Query::new("GET status\n"), "").await.unwrap();
        assert_eq!(a.requests()[0], "COMMAND [1] SAVE_STATE\n");

        let err = conn.command("SAVE_STATE", &SiteId::new("gone")).await.unwrap_err();
        assert!(err
            .to_string()
            .starts_with("Connection to site gone is dead: Cannot connect to "));

        let err = conn.command("SAVE_STATE", &SiteId::new("nope")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Config);
        assert_eq!(err.to_string(), "Cannot send command to unconfigured site 'nope'");
    }

    #[tokio::test]
    async fn finds_local_connection() {
        let proxy = MockLivestatus::unix_named("liveproxy", |_| Reply::ok("[]")).await;
        let local = MockLivestatus::unix(|_| Reply::ok("[]")).await;
        let mut conn = connect(
            &sites([("a_remote", site(&proxy)), ("local", site(&local))]),
            &Sites::new(),
        )
        .await;
        assert_eq!(conn.alive_sites(), ids(&["a_remote", "local"]));
        assert_eq!(conn.local_connection().unwrap().url(), local.url());
        assert!(conn.get_connection(&SiteId::new("a_remote")).is_some());
        assert!(conn.get_connection(&SiteId::new("other")).is_none());

        let mut only_proxy = connect(&sites([("a_remote", site(&proxy))]), &Sites::new()).await;
        only_proxy.local_connection().unwrap_err();
    }

    #[tokio::test]
    async fn forwards_settings_to_all_sites() {
        let a = MockLivestatus::unix(|_| Reply::ok("[]")).await;
        let b = MockLivestatus::unix(|_| Reply::ok("[]")).await;
        let mut conn = connect(&sites([("a", site(&a)), ("b", site(&b))]), &Sites::new()).await;
        conn.set_auth_user("read", "guest").unwrap();
        conn.set_auth_domain("read");
        conn.add_header("Timelimit: 10");
        conn.set_auth_user("read", "in valid").unwrap_err();

        conn.query(&Query::new("GET hosts\n"), "").await.unwrap();
        for mock in [&a, &b] {
            let request = &mock.requests()[0];
            assert!(request.contains("AuthUser: guest\nTimelimit: 10\n"));
        }
        assert_eq!(conn.output_format(), OutputFormat::Python3);
        assert!(!conn.successfully_persisted());

        conn.disconnect();
        assert!(!conn.get_connection(&SiteId::new("a")).unwrap().is_connected());
        conn.query(&Query::new("GET hosts\n"), "").await.unwrap();
        assert_eq!(a.connections(), 2);
        assert_eq!(conn.alive_sites(), ids(&["a", "b"]));
    }
}
