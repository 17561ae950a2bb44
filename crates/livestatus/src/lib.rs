// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Client for the Livestatus query protocol of monitoring cores

pub mod command;
pub mod connection;
pub mod encoding;
pub mod error;
pub mod helpers;
pub mod lql;
pub mod multisite;
pub mod pool;
pub mod protocol;
pub mod pyliteral;
pub mod query;
pub mod site;
pub mod tls;
pub mod transport;
pub mod url;
pub mod value;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use command::{CommandArg, ExternalCommand};
pub use connection::{validate_user_id, SingleSiteConnection};
pub use error::{ErrorKind, LivestatusError};
pub use helpers::Livestatus;
pub use multisite::{DeadReason, DeadSite, MultiSiteConnection};
pub use query::{OutputFormat, Query, QuerySpecification};
pub use site::{SiteConfig, SiteId, Sites, SitesConfig, TlsMode};
pub use url::SocketUrl;
pub use value::{Response, Row, Value};
