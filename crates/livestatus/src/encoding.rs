// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Helpers for assembling query text safely.

use once_cell::sync::Lazy;
use regex::Regex;

/// Strips newlines from user-provided text before it is put into a query.
///
/// Removing only `\n\n` is not enough: `"\n \n"` would also end the current
/// query and start a new one.
pub fn lqencode(s: &str) -> String {
    s.replace('\n', "")
}

/// Quoting used for dict-valued columns.
pub fn quote_dict(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}

/// Removes all `Cache:` headers from a query.
pub fn strip_cache_headers(query: &str) -> String {
    static CACHE_HEADER: Lazy<Regex> = Lazy::new(|| Regex::new(r"\nCache:[^\n]*").unwrap());
    CACHE_HEADER.replace_all(query, "").into_owned()
}

/// Adds `line` to a block of header lines, which may lack its final newline.
pub fn append_header(headers: &str, line: &str) -> String {
    let headers = headers.trim_end_matches('\n');
    if headers.is_empty() {
        format!("{line}\n")
    } else {
        format!("{headers}\n{line}\n")
    }
}

/// Appends `headers` to `query`, skipping blank header entries and trailing whitespace.
pub fn combine_query<S: AsRef<str>>(query: &str, headers: &[S]) -> String {
    let query = query.trim_end_matches(['\n', ' ']);
    let headers = headers
        .iter()
        .map(AsRef::as_ref)
        .filter(|header| !header.trim().is_empty())
        .map(|header| header.trim_end_matches(['\n', ' ']))
        .collect::<Vec<_>>()
        .join("\n");
    let headers = headers.trim_matches(['\n', ' ']);

    if headers.is_empty() {
        query.to_owned()
    } else {
        format!("{query}\n{headers}")
    }
}
