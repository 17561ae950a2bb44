// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Livestatus socket URLs: `unix:<path>`, `tcp:<host>:<port>` and `tcp6:<host>:<port>`.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::LivestatusError;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum SocketUrl {
    Unix(PathBuf),
    Tcp { host: String, port: u16 },
    Tcp6 { host: String, port: u16 },
}

impl SocketUrl {
    pub fn is_unix(&self) -> bool {
        matches!(self, Self::Unix(_))
    }

    /// Host name used for TLS, `None` for Unix sockets.
    pub fn host(&self) -> Option<&str> {
        match self {
            Self::Unix(_) => None,
            Self::Tcp { host, .. } | Self::Tcp6 { host, .. } => Some(host),
        }
    }
}

impl FromStr for SocketUrl {
    type Err = LivestatusError;

    fn from_str(url: &str) -> Result<Self, Self::Err> {
        if let Some((family, rest)) = url.split_once(':') {
            match family {
                "unix" => return Ok(Self::Unix(rest.into())),
                "tcp" | "tcp6" => {
                    let (host, port) = rest
                        .rsplit_once(':')
                        .and_then(|(host, port)| Some((host, port.parse::<u16>().ok()?)))
                        .ok_or_else(|| {
                            LivestatusError::Config(format!(
                                "Invalid livestatus tcp URL '{rest}'. \
                                 Correct example is 'tcp:somehost:6557' or 'tcp6:somehost:6557'"
                            ))
                        })?;
                    let host = host.to_owned();
                    return Ok(if family == "tcp" {
                        Self::Tcp { host, port }
                    } else {
                        Self::Tcp6 { host, port }
                    });
                }
                _ => {}
            }
        }
        Err(LivestatusError::Config(format!(
            "Invalid livestatus URL '{url}'. Must begin with 'tcp:', 'tcp6:' or 'unix:'"
        )))
    }
}

impl TryFrom<String> for SocketUrl {
    type Error = LivestatusError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<SocketUrl> for String {
    fn from(value: SocketUrl) -> Self {
        value.to_string()
    }
}

impl fmt::Display for SocketUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unix(path) => write!(f, "unix:{}", path.display()),
            Self::Tcp { host, port } => write!(f, "tcp:{host}:{port}"),
            Self::Tcp6 { host, port } => write!(f, "tcp6:{host}:{port}"),
        }
    }
}
