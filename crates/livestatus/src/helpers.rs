// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

use std::collections::HashSet;

use async_trait::async_trait;

use crate::error::LivestatusError;
use crate::query::Query;
use crate::value::{Response, Row, Value};

const COLUMN_HEADERS_OFF: &str = "ColumnHeaders: off\n";
const COLUMN_HEADERS_ON: &str = "ColumnHeaders: on\n";

/// One row keyed by column name, in column order.
pub type AssocRow = Vec<(String, Value)>;

fn not_found(query: &Query) -> LivestatusError {
    LivestatusError::NotFound(format!("No matching entries found for query: {query}"))
}

fn zip_headers(headers: &Row, row: Row) -> AssocRow {
    headers
        .iter()
        .map(|header| match header {
            Value::Str(name) => name.clone(),
            other => other.to_string(),
        })
        .zip(row)
        .collect()
}

/// Anything that answers Livestatus queries.
///
/// Implementors only provide [`query`](Self::query); the rest are shortcuts
/// for common result shapes.
#[async_trait]
pub trait Livestatus: Send {
    async fn query(&mut self, query: &Query, add_headers: &str) -> Result<Response, LivestatusError>;

    /// The single cell of a one-row, one-column result.
    async fn query_value(&mut self, query: &Query) -> Result<Value, LivestatusError> {
        let response = self.query(query, COLUMN_HEADERS_OFF).await?;
        response
            .into_iter()
            .next()
            .and_then(|row| row.into_iter().next())
            .ok_or_else(|| not_found(query))
    }

    /// Like [`query_value`](Self::query_value), with a default for empty results.
    async fn query_value_or(&mut self, query: &Query, default: Value) -> Result<Value, LivestatusError> {
        match self.query_value(query).await {
            Err(LivestatusError::NotFound(_)) => Ok(default),
            other => other,
        }
    }

    async fn query_row(&mut self, query: &Query) -> Result<Row, LivestatusError> {
        let response = self.query(query, COLUMN_HEADERS_OFF).await?;
        response.into_iter().next().ok_or_else(|| not_found(query))
    }

    async fn query_row_assoc(&mut self, query: &Query) -> Result<AssocRow, LivestatusError> {
        let mut response = self.query(query, COLUMN_HEADERS_ON).await?.into_iter();
        match (response.next(), response.next()) {
            (Some(headers), Some(row)) => Ok(zip_headers(&headers, row)),
            _ => Err(not_found(query)),
        }
    }

    /// The first column of every row.
    async fn query_column(&mut self, query: &Query) -> Result<Vec<Value>, LivestatusError> {
        let response = self.query(query, COLUMN_HEADERS_OFF).await?;
        Ok(response
            .into_iter()
            .filter_map(|row| row.into_iter().next())
            .collect())
    }

    /// Distinct values of the first column, in no particular order.
    async fn query_column_unique(&mut self, query: &Query) -> Result<HashSet<Value>, LivestatusError> {
        Ok(self.query_column(query).await?.into_iter().collect())
    }

    async fn query_table(&mut self, query: &Query) -> Result<Response, LivestatusError> {
        self.query(query, COLUMN_HEADERS_OFF).await
    }

    /// Every row keyed by column name. The header row is not included.
    async fn query_table_assoc(&mut self, query: &Query) -> Result<Vec<AssocRow>, LivestatusError> {
        let mut response = self.query(query, COLUMN_HEADERS_ON).await?.into_iter();
        let Some(headers) = response.next() else {
            return Ok(Vec::new());
        };
        Ok(response.map(|row| zip_headers(&headers, row)).collect())
    }

    /// Column-wise sums of a `Stats:` query, typically answered by several sites.
    async fn query_summed_stats(
        &mut self,
        query: &Query,
        add_headers: &str,
    ) -> Result<Vec<Value>, LivestatusError> {
        let response = self.query(query, add_headers).await?;
        let columns = response.iter().map(Vec::len).min().unwrap_or(0);
        if response.is_empty() {
            return Err(LivestatusError::NotFound(
                "No matching entries found for query: Empty result to Stats-Query".into(),
            ));
        }

        (0..columns)
            .map(|column| {
                response.iter().try_fold(Value::Int(0), |sum, row| {
                    sum.checked_add(&row[column]).ok_or_else(|| {
                        LivestatusError::Query(format!(
                            "Cannot sum up non-numeric stats value {}",
                            row[column]
                        ))
                    })
                })
            })
            .collect()
    }
}
