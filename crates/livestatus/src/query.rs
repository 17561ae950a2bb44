// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

use std::fmt;

use crate::error::ErrorKind;

/// Wire encoding of response payloads, sent as the `OutputFormat:` header.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OutputFormat {
    #[default]
    Python3,
    Json,
}

impl OutputFormat {
    pub fn as_header_value(&self) -> &'static str {
        match self {
            Self::Python3 => "python3",
            Self::Json => "json",
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_header_value())
    }
}

/// Columns holding binary data. The core can't encode these as JSON, so
/// queries touching them have to use the Python format.
pub const BLOB_COLUMNS: &[&str] = &[
    "current_host_mk_inventory",
    "current_host_mk_inventory_gz",
    "current_host_structured_status",
    "current_service_robotmk_last_error_log",
    "current_service_robotmk_last_error_log_gz",
    "current_service_robotmk_last_log",
    "current_service_robotmk_last_log_gz",
    "host_mk_inventory",
    "host_mk_inventory_gz",
    "host_structured_status",
    "license_usage_history",
    "mk_inventory",
    "mk_inventory_gz",
    "robotmk_last_error_log",
    "robotmk_last_error_log_gz",
    "robotmk_last_log",
    "robotmk_last_log_gz",
    "service_robotmk_last_error_log",
    "service_robotmk_last_error_log_gz",
    "service_robotmk_last_log",
    "service_robotmk_last_log_gz",
    "structured_status",
];

/// A structured `GET` query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuerySpecification {
    pub table: String,
    pub columns: Vec<String>,
    /// Further header lines (filters, stats, ...), each terminated by `\n`.
    pub headers: String,
}

impl QuerySpecification {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            columns: Vec::new(),
            headers: String::new(),
        }
    }

    pub fn columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.columns = columns.into_iter().map(Into::into).collect();
        self
    }

    pub fn header(mut self, line: &str) -> Self {
        self.headers.push_str(line.trim_end_matches('\n'));
        self.headers.push('\n');
        self
    }

    pub fn supports_json_format(&self) -> bool {
        !self
            .columns
            .iter()
            .any(|column| BLOB_COLUMNS.contains(&column.as_str()))
    }
}

impl fmt::Display for QuerySpecification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "GET {}", self.table)?;
        if !self.columns.is_empty() {
            writeln!(f, "Columns: {}", self.columns.join(" "))?;
        }
        f.write_str(&self.headers)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum QueryBody {
    Text(String),
    Spec(QuerySpecification),
}

/// A query plus hints for how to handle it.
///
/// Errors whose kind is in `suppressed` are still returned by single-site
/// connections, but multi-site connections treat them as "this site had no
/// rows" instead of marking the site dead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query {
    body: QueryBody,
    suppressed: Vec<ErrorKind>,
}

impl Query {
    pub const DEFAULT_SUPPRESSED: &'static [ErrorKind] = &[ErrorKind::TableNotFound];

    pub fn new(text: impl Into<String>) -> Self {
        Self {
            body: QueryBody::Text(text.into()),
            suppressed: Self::DEFAULT_SUPPRESSED.to_vec(),
        }
    }

    pub fn with_suppressed(mut self, kinds: impl Into<Vec<ErrorKind>>) -> Self {
        self.suppressed = kinds.into();
        self
    }

    pub fn suppressed(&self) -> &[ErrorKind] {
        &self.suppressed
    }

    pub fn is_suppressed(&self, kind: ErrorKind) -> bool {
        self.suppressed.contains(&kind)
    }

    /// Only structured queries without blob columns can safely use JSON.
    pub fn supports_json_format(&self) -> bool {
        match &self.body {
            QueryBody::Text(_) => false,
            QueryBody::Spec(spec) => spec.supports_json_format(),
        }
    }
}

impl fmt::Display for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.body {
            QueryBody::Text(text) => f.write_str(text),
            QueryBody::Spec(spec) => spec.fmt(f),
        }
    }
}

impl From<&str> for Query {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for Query {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

impl From<&String> for Query {
    fn from(value: &String) -> Self {
        Self::new(value.as_str())
    }
}

impl From<QuerySpecification> for Query {
    fn from(value: QuerySpecification) -> Self {
        Self {
            body: QueryBody::Spec(value),
            suppressed: Self::DEFAULT_SUPPRESSED.to_vec(),
        }
    }
}

impl From<&Query> for Query {
    fn from(value: &Query) -> Self {
        value.clone()
    }
}
