// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum LivestatusError {
    #[error("{0}")]
    Socket(String),
    #[error("Read zero data from socket, remote peer closed connection.")]
    SocketClosed,
    #[error("while {ctx}: {source}")]
    Io {
        ctx: String,
        source: std::io::Error,
    },
    #[error("Timed out after {:.3}s while {ctx}", after.as_secs_f64())]
    Timeout { ctx: String, after: Duration },
    #[error("{0}")]
    Config(String),
    #[error("{0}")]
    Query(String),
    #[error("{0}")]
    NotFound(String),
    #[error("Not Found ({code}): {info:?}")]
    TableNotFound { code: u16, info: String },
    #[error("{0}")]
    PayloadTooLarge(String),
    #[error("SSL certificate verification failed. The remote certificate(s) might not be trusted. Technical error: {0}")]
    Certificate(String),
    #[error("{0}")]
    BadGateway(String),
}

/// Fieldless mirror of [`LivestatusError`], used to describe which errors a
/// query wants suppressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Socket,
    SocketClosed,
    Io,
    Timeout,
    Config,
    Query,
    NotFound,
    TableNotFound,
    PayloadTooLarge,
    Certificate,
    BadGateway,
}

impl LivestatusError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Socket(_) => ErrorKind::Socket,
            Self::SocketClosed => ErrorKind::SocketClosed,
            Self::Io { .. } => ErrorKind::Io,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Config(_) => ErrorKind::Config,
            Self::Query(_) => ErrorKind::Query,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::TableNotFound { .. } => ErrorKind::TableNotFound,
            Self::PayloadTooLarge(_) => ErrorKind::PayloadTooLarge,
            Self::Certificate(_) => ErrorKind::Certificate,
            Self::BadGateway(_) => ErrorKind::BadGateway,
        }
    }

    /// Whether the error means the transport broke, as opposed to the core
    /// answering with an error status.
    ///
    /// Connection-level errors trigger the reconnect-and-resend path.
    pub fn is_connection_lost(&self) -> bool {
        matches!(
            self,
            Self::SocketClosed | Self::Io { .. } | Self::Timeout { .. }
        )
    }

    pub(crate) fn io(ctx: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            ctx: ctx.into(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_not_found_renders_code_and_quoted_info() {
        let err = LivestatusError::TableNotFound {
            code: 404,
            info: "Invalid GET request, no such table 'hostz'".into(),
        };
        assert_eq!(
            err.to_string(),
            "Not Found (404): \"Invalid GET request, no such table 'hostz'\""
        );
        assert_eq!(err.kind(), ErrorKind::TableNotFound);
        assert!(!err.is_connection_lost());
    }

    #[test]
    fn io_errors_count_as_lost_connections() {
        let err = LivestatusError::io(
            "reading response header",
            std::io::Error::from(std::io::ErrorKind::BrokenPipe),
        );
        assert!(err.is_connection_lost());
        assert!(err.to_string().starts_with("while reading response header: "));
        assert!(LivestatusError::SocketClosed.is_connection_lost());
    }
}
