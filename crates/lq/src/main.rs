// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

use std::io::{Read, Write};
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, CommandFactory, FromArgMatches, Parser};
use serde::Serialize;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use livestatus::{
    validate_user_id, ErrorKind, Livestatus, LivestatusError, MultiSiteConnection, OutputFormat,
    Query, SiteConfig, SiteId, Sites, SitesConfig, SocketUrl,
};

#[derive(Debug, Parser)]
#[command(
    version,
    about = "Run Livestatus queries against one or more monitoring sites.",
    long_about = "lq sends a Livestatus query (or an external command) to every configured site and prints the merged result as JSON."
)]
struct Arguments {
    #[arg(
        short,
        long,
        help = "Suppress non-error output and set the log level to WARN."
    )]
    quiet: bool,

    #[arg(
        short,
        long,
        action = ArgAction::Count,
        help = "Increase verbosity level, can be used multiple times."
    )]
    verbose: u8,

    #[arg(
        long,
        env = "LQ_CONFIG",
        value_name = "PATH",
        help = "TOML file listing the sites to query.",
        conflicts_with = "socket"
    )]
    config: Option<PathBuf>,

    #[arg(
        long,
        value_name = "URL",
        help = "Query a single socket, e.g. 'unix:/omd/sites/mysite/tmp/run/live' or 'tcp:host:6557'."
    )]
    socket: Option<SocketUrl>,

    #[arg(
        long,
        value_name = "SITE",
        action = ArgAction::Append,
        help = "Only query this site. Can be given multiple times."
    )]
    site: Vec<String>,

    #[arg(
        long,
        action = ArgAction::SetTrue,
        help = "Prepend the site id to every row."
    )]
    prepend_site: bool,

    #[arg(long, value_name = "ROWS", help = "Return at most this many rows in total.")]
    limit: Option<usize>,

    #[arg(
        long = "header",
        value_name = "LINE",
        action = ArgAction::Append,
        help = "Extra header line added to every query, e.g. 'Localtime: 1700000000'."
    )]
    headers: Vec<String>,

    #[arg(long, value_name = "USER", help = "Restrict results to objects this user may see.")]
    auth_user: Option<String>,

    #[arg(
        long,
        value_name = "DOMAIN",
        default_value = "read",
        help = "Auth domain used together with --auth-user."
    )]
    auth_domain: String,

    #[arg(
        long,
        action = ArgAction::SetTrue,
        help = "Query sites one after another instead of all at once."
    )]
    non_parallel: bool,

    #[arg(
        long,
        value_name = "COMMAND",
        help = "Send an external command, e.g. 'SCHEDULE_FORCED_HOST_CHECK;web01;1700000000', instead of a query.",
        conflicts_with = "query"
    )]
    command: Option<String>,

    #[arg(
        long,
        value_name = "SITE",
        help = "Site that receives --command. May be omitted when only one site is configured.",
        requires = "command"
    )]
    target_site: Option<String>,

    #[arg(
        long,
        action = ArgAction::SetTrue,
        help = "Ask the core for JSON instead of python3 literals."
    )]
    json_format: bool,

    #[arg(
        long,
        short = 'z',
        action = ArgAction::SetTrue,
        help = "Use compact (one-line) format for output."
    )]
    compact: bool,

    #[arg(help = "The query, e.g. 'GET hosts\\nColumns: name'. Read from stdin when omitted.")]
    query: Option<String>,
}

impl Arguments {
    fn build_config(&self) -> Result<Config> {
        let SitesConfig {
            sites,
            disabled_sites,
        } = match (&self.config, &self.socket) {
            (Some(path), _) => SitesConfig::load(path)?,
            (None, Some(url)) => SitesConfig {
                sites: Sites::from([(SiteId::default(), SiteConfig::new(url.clone()))]),
                ..Default::default()
            },
            (None, None) => bail!("either --config (or LQ_CONFIG) or --socket is required"),
        };
        if sites.is_empty() {
            bail!("no sites configured");
        }
        for site in &self.site {
            if !sites.contains_key(site.as_str()) {
                bail!("unknown site '{site}'");
            }
        }
        if let Some(user) = self.auth_user.as_deref().filter(|user| !user.is_empty()) {
            validate_user_id(user)?;
        }

        let target_site = match (&self.command, &self.target_site) {
            (None, _) => None,
            (Some(_), Some(site)) => Some(SiteId::from(site.as_str())),
            (Some(_), None) if sites.len() == 1 => sites.keys().next().cloned(),
            (Some(_), None) => bail!("--target-site is required when more than one site is configured"),
        };

        Ok(Config {
            sites,
            disabled_sites,
            only_sites: self.site.iter().map(|s| SiteId::from(s.as_str())).collect(),
            prepend_site: self.prepend_site,
            limit: self.limit,
            headers: self.headers.clone(),
            auth: self
                .auth_user
                .clone()
                .map(|user| (self.auth_domain.clone(), user)),
            parallelize: !self.non_parallel,
            output_format: if self.json_format {
                OutputFormat::Json
            } else {
                OutputFormat::Python3
            },
            action: match &self.command {
                Some(command) => Action::Command {
                    command: command.clone(),
                    site: target_site.unwrap_or_default(),
                },
                None => Action::Query(self.query.clone()),
            },
            fmt: JsonOutput {
                compact: self.compact,
            },
        })
    }
}

#[derive(Debug)]
struct Config {
    sites: Sites,
    disabled_sites: Sites,
    only_sites: Vec<SiteId>,
    prepend_site: bool,
    limit: Option<usize>,
    headers: Vec<String>,
    /// `(domain, user)`
    auth: Option<(String, String)>,
    parallelize: bool,
    output_format: OutputFormat,
    action: Action,
    fmt: JsonOutput,
}

#[derive(Debug)]
enum Action {
    /// `None` reads the query from stdin.
    Query(Option<String>),
    Command { command: String, site: SiteId },
}

#[derive(Debug, Clone, Copy)]
struct JsonOutput {
    compact: bool,
}

impl JsonOutput {
    fn write(&self, out: &mut impl Write, object: &impl Serialize) -> Result<()> {
        if self.compact {
            serde_json::to_writer(&mut *out, object)?;
        } else {
            serde_json::to_writer_pretty(&mut *out, object)?;
        }
        writeln!(out)?;
        Ok(())
    }
}

/// Unescapes `\n` as typed on a shell and ends the text with exactly one newline.
fn normalize_query(text: &str) -> String {
    let text = text.replace("\\n", "\n");
    let mut text = text.trim_end_matches('\n').to_owned();
    text.push('\n');
    text
}

/// Whether any site the query was meant for is still alive.
fn targeted_site_alive(connection: &MultiSiteConnection, only_sites: &[SiteId]) -> bool {
    let alive = connection.alive_sites();
    if only_sites.is_empty() {
        !alive.is_empty()
    } else {
        only_sites.iter().any(|site| alive.contains(site))
    }
}

/// Configuration problems exit with 2, everything else with 1.
fn exit_code(err: &anyhow::Error) -> i32 {
    match err.downcast_ref::<LivestatusError>() {
        Some(err) if err.kind() == ErrorKind::Config => 2,
        _ => 1,
    }
}

async fn connect(config: &Config) -> Result<MultiSiteConnection> {
    let mut connection = MultiSiteConnection::connect(&config.sites, &config.disabled_sites)
        .await
        .context("failed to set up site connections")?;

    // Connection failures are already reported while connecting
    for (site, dead) in connection.dead_sites() {
        if dead.status_host_state().is_some() {
            warn!("Site {site} is dead: {}", dead.reason);
        }
    }

    connection.set_only_sites(Some(config.only_sites.clone()));
    connection.set_prepend_site(config.prepend_site);
    connection.set_limit(config.limit);
    connection.set_parallelize(config.parallelize);
    connection.set_output_format(config.output_format);
    for header in &config.headers {
        connection.add_header(header);
    }
    if let Some((domain, user)) = &config.auth {
        connection.set_auth_user(domain, user)?;
        connection.set_auth_domain(domain);
    }
    Ok(connection)
}

async fn lq(config: &Config, out: &mut impl Write) -> Result<()> {
    let mut connection = connect(config).await?;

    match &config.action {
        Action::Command { command, site } => {
            connection
                .command(command, site)
                .await
                .with_context(|| format!("failed to send command to site '{site}'"))?;
            info!("Sent command to site '{site}'");
        }
        Action::Query(text) => {
            let text = match text {
                Some(text) => text.clone(),
                None => {
                    let mut text = String::new();
                    std::io::stdin()
                        .read_to_string(&mut text)
                        .context("failed to read query from stdin")?;
                    text
                }
            };
            if text.trim().is_empty() {
                bail!("empty query");
            }
            let query = Query::new(normalize_query(&text));
            let response = connection.query(&query, "").await?;
            if !targeted_site_alive(&connection, &config.only_sites) {
                bail!("no site answered the query");
            }
            config.fmt.write(out, &response)?;
        }
    }

    connection.disconnect();
    Ok(())
}

#[tokio::main]
async fn main() -> ! {
    let cmd = Arguments::command();
    let after_help = format!(
        "{}Examples:{}
# all hosts of the local site
lq --socket unix:/omd/sites/mysite/tmp/run/live 'GET hosts\\nColumns: name state'

# host problems across every site in sites.toml, tagged with the site id
echo -e 'GET hosts\\nColumns: name\\nFilter: state > 0' | lq --config sites.toml --prepend-site -z

# schedule a check on one site
lq --config sites.toml --target-site remote --command 'SCHEDULE_FORCED_HOST_CHECK;web01;1700000000'
",
        cmd.get_styles().get_header().render(),
        cmd.get_styles().get_header().render_reset()
    );
    let mut cmd = cmd.after_help(after_help);
    cmd.build();

    let mut matches = cmd.get_matches();
    let args = match Arguments::from_arg_matches_mut(&mut matches) {
        Ok(args) => args,
        Err(e) => {
            let e = e.format(&mut Arguments::command());
            e.exit();
        }
    };

    let subscriber = FmtSubscriber::builder()
        .with_writer(std::io::stderr)
        .with_max_level(match (args.quiet, args.verbose) {
            (true, _) => Level::WARN,
            (false, 0) => Level::INFO,
            (false, 1) => Level::DEBUG,
            (false, _) => Level::TRACE,
        })
        .finish();
    tracing::subscriber::set_global_default(subscriber).unwrap();

    let config = match args.build_config() {
        Ok(config) => config,
        Err(err) => {
            error!("{err:#}");
            std::process::exit(2);
        }
    };

    if let Err(err) = lq(&config, &mut std::io::stdout().lock()).await {
        error!("{err:#}");
        std::process::exit(exit_code(&err));
    } else {
        std::process::exit(0);
    }
}
