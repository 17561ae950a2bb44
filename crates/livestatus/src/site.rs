// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Site identifiers and per-site connection settings.

use std::borrow::Borrow;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::LivestatusError;
use crate::tls::TlsSettings;
use crate::url::SocketUrl;

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SiteId(String);

impl SiteId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SiteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SiteId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for SiteId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl Borrow<str> for SiteId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum TlsMode {
    #[default]
    PlainText,
    Encrypted {
        #[serde(default = "default_true")]
        verify: bool,
        #[serde(default)]
        ca_file_path: Option<PathBuf>,
    },
}

impl TlsMode {
    pub fn settings(&self) -> Option<TlsSettings> {
        match self {
            Self::PlainText => None,
            Self::Encrypted {
                verify,
                ca_file_path,
            } => Some(TlsSettings {
                verify: *verify,
                ca_file_path: ca_file_path.clone(),
            }),
        }
    }
}

/// How to reach one site.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SiteConfig {
    pub socket: SocketUrl,
    /// `[site, host]`: the host on `site` that monitors this site's server.
    /// The site is only contacted while that host is up.
    #[serde(default)]
    pub status_host: Option<(SiteId, String)>,
    /// Keep the connection open between uses.
    #[serde(default)]
    pub persist: bool,
    /// Whether `Cache:` headers are passed on to the core.
    #[serde(default)]
    pub cache: bool,
    #[serde(default)]
    pub tls: TlsMode,
    /// Seconds.
    #[serde(default)]
    pub timeout: Option<u64>,
}

impl SiteConfig {
    pub fn new(socket: SocketUrl) -> Self {
        Self {
            socket,
            status_host: None,
            persist: false,
            cache: false,
            tls: TlsMode::PlainText,
            timeout: None,
        }
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout.map(Duration::from_secs)
    }
}

pub type Sites = BTreeMap<SiteId, SiteConfig>;

/// Contents of a site configuration file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SitesConfig {
    #[serde(default)]
    pub sites: Sites,
    /// Sites that aren't queried, but may still host status hosts.
    #[serde(default)]
    pub disabled_sites: Sites,
}

impl SitesConfig {
    pub fn load(path: &Path) -> Result<Self, LivestatusError> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            LivestatusError::Config(format!(
                "Unable to read site configuration '{}': {e}",
                path.display()
            ))
        })?;
        toml::from_str(&text).map_err(|e| {
            LivestatusError::Config(format!(
                "Invalid site configuration '{}': {e}",
                path.display()
            ))
        })
    }
}
