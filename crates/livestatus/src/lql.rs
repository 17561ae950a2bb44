// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Builders for common query shapes.

use crate::encoding::lqencode;
use crate::error::LivestatusError;
use crate::helpers::Livestatus;
use crate::query::Query;
use crate::value::Value;

/// Default number of data points requested by [`get_rrd_data`].
pub const DEFAULT_RRD_ENTRIES: u32 = 400;

/// One `<filter> <value>` line per value, joined by `<join>: n` when there
/// is more than one value.
///
/// `lq_logic("Filter: name =", &["a", "b"], "Or")` gives
/// `"Filter: name = a\nFilter: name = b\nOr: 2\n"`.
pub fn lq_logic<S: AsRef<str>>(filter: &str, values: &[S], join: &str) -> String {
    let mut out: String = values
        .iter()
        .map(|value| format!("{filter} {}\n", lqencode(value.as_ref())))
        .collect();
    if values.len() > 1 {
        out.push_str(&format!("{join}: {}\n", values.len()));
    }
    out
}

/// Query for `columns` of the given hosts, or of one of their services.
///
/// `service` of `None` or `_HOST_` selects the host table.
pub fn livestatus_lql<S: AsRef<str>>(hosts: &[S], columns: &[&str], service: Option<&str>) -> String {
    let mut headers = format!("Columns: {}\n", columns.join(" "));
    headers.push_str(&lq_logic("Filter: host_name =", hosts, "Or"));
    let table = match service {
        None | Some("_HOST_") => "hosts",
        Some(service) => {
            headers.push_str(&lq_logic("Filter: service_description =", &[service], "Or"));
            "services"
        }
    };
    format!("GET {table}\n{headers}")
}

/// Historic metric values, one per `step` seconds in `[start, end)`.
#[derive(Debug, Clone, PartialEq)]
pub struct RrdResponse {
    pub start: i64,
    pub end: i64,
    pub step: i64,
    /// `None` where there is no data for a time slot.
    pub values: Vec<Option<f64>>,
}

impl RrdResponse {
    pub fn timestamps(&self) -> impl Iterator<Item = i64> {
        (self.start..self.end).step_by(self.step.max(1) as usize)
    }
}

/// Fetches RRD data of one service (or `_HOST_`) for the time range
/// `from..until`, in unix seconds.
///
/// Returns `None` when the core has no data, e.g. for unknown metrics.
pub async fn get_rrd_data<L: Livestatus + ?Sized>(
    connection: &mut L,
    host: &str,
    service: &str,
    rpn: &str,
    from: i64,
    until: i64,
    max_entries: u32,
) -> Result<Option<RrdResponse>, LivestatusError> {
    let point_range = [from.to_string(), until.to_string(), "1".into(), max_entries.to_string()]
        .map(|part| lqencode(&part))
        .join(":");
    let column = format!("rrddata:m1:{rpn}:{point_range}");
    let query = Query::new(livestatus_lql(&[host], &[&column], Some(service)));

    let response = connection.query_value(&query).await?;
    let malformed = || LivestatusError::Query(format!("Malformed RRD response: {response}"));
    let items = match &response {
        Value::None => return Ok(None),
        Value::List(items) | Value::Tuple(items) => items,
        _ => return Err(malformed()),
    };
    if items.is_empty() {
        return Ok(None);
    }
    let [start, end, step, values @ ..] = items.as_slice() else {
        return Err(malformed());
    };
    let as_int = |value: &Value| value.as_f64().map(|f| f as i64).ok_or_else(malformed);

    let step = as_int(step)?;
    if step == 0 {
        return Ok(None);
    }
    Ok(Some(RrdResponse {
        start: as_int(start)?,
        end: as_int(end)?,
        step,
        values: values.iter().map(Value::as_f64).collect(),
    }))
}
