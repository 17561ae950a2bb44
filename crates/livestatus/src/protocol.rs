// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Framing of Livestatus requests and `ResponseHeader: fixed16` responses.

use crate::error::LivestatusError;
use crate::pyliteral;
use crate::query::OutputFormat;
use crate::value::{Response, Value};

/// Size of the `fixed16` response header: `CCC LLLLLLLLLLL\n`.
pub const RESPONSE_HEADER_LEN: usize = 16;

/// Requests and commands are terminated by an empty line.
pub fn frame_request(text: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(text.len() + 2);
    out.extend_from_slice(text.as_bytes());
    out.extend_from_slice(b"\n\n");
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseHeader {
    pub code: u16,
    pub length: usize,
}

impl ResponseHeader {
    pub fn parse(raw: &[u8; RESPONSE_HEADER_LEN]) -> Result<Self, LivestatusError> {
        let malformed = || {
            LivestatusError::Socket(format!(
                "Malformed response header {:?}. Livestatus TCP socket might be \
                 unreachable or wrong encryption settings are used.",
                String::from_utf8_lossy(raw)
            ))
        };
        let code = std::str::from_utf8(&raw[0..3])
            .ok()
            .and_then(|code| code.parse::<u16>().ok())
            .ok_or_else(malformed)?;
        let length = std::str::from_utf8(&raw[4..15])
            .ok()
            .and_then(|len| len.trim_start().parse::<usize>().ok())
            .ok_or_else(malformed)?;
        Ok(Self { code, length })
    }

    /// Maps the status code to an error, given the (error text) body.
    pub fn check(&self, body: &[u8]) -> Result<(), LivestatusError> {
        if self.code == 200 {
            return Ok(());
        }
        let info = String::from_utf8_lossy(body).into_owned();
        Err(match self.code {
            404 => LivestatusError::TableNotFound {
                code: self.code,
                info,
            },
            413 => LivestatusError::PayloadTooLarge(info),
            495 => LivestatusError::Certificate(info),
            502 => LivestatusError::BadGateway(info),
            code => LivestatusError::Query(format!("{code}: {info}")),
        })
    }
}

/// Decodes a successful response body into rows.
pub fn parse_payload(raw: &[u8], format: OutputFormat) -> Result<Response, LivestatusError> {
    let malformed = || LivestatusError::Query("Malformed raw response output".into());
    let text = std::str::from_utf8(raw).map_err(|_| malformed())?;
    let value = match format {
        OutputFormat::Python3 => pyliteral::parse(text).map_err(|_| malformed())?,
        OutputFormat::Json => serde_json::from_str::<serde_json::Value>(text)
            .map_err(|_| malformed())?
            .into(),
    };
    let Value::List(rows) = value else {
        return Err(malformed());
    };
    rows.into_iter()
        .map(|row| match row {
            Value::List(cells) | Value::Tuple(cells) => Ok(cells),
            _ => Err(malformed()),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn header(text: &str) -> [u8; RESPONSE_HEADER_LEN] {
        text.as_bytes().try_into().unwrap()
    }

    #[test]
    fn parses_fixed16_header() {
        let parsed = ResponseHeader::parse(&header("200          42\n")).unwrap();
        assert_eq!(parsed, ResponseHeader { code: 200, length: 42 });

        let parsed = ResponseHeader::parse(&header("404 00000000007\n")).unwrap();
        assert_eq!(parsed, ResponseHeader { code: 404, length: 7 });
    }

    #[test]
    fn rejects_garbage_headers() {
        let err = ResponseHeader::parse(&header("HTTP/1.1 400 Bad")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Socket);
        assert!(err.to_string().contains("Malformed response header"));
        ResponseHeader::parse(&[0x15; RESPONSE_HEADER_LEN]).unwrap_err();
    }

    #[test]
    fn maps_status_codes() {
        let check = |code| ResponseHeader { code, length: 0 }.check(b"oops").unwrap_err().kind();
        assert!(ResponseHeader { code: 200, length: 0 }.check(b"").is_ok());
        assert_eq!(check(404), ErrorKind::TableNotFound);
        assert_eq!(check(413), ErrorKind::PayloadTooLarge);
        assert_eq!(check(495), ErrorKind::Certificate);
        assert_eq!(check(502), ErrorKind::BadGateway);
        assert_eq!(check(400), ErrorKind::Query);

        let err = ResponseHeader { code: 452, length: 0 }.check(b"bad filter").unwrap_err();
        assert_eq!(err.to_string(), "452: bad filter");
    }

    #[test]
    fn parses_payload_in_both_formats() {
        let py = parse_payload(b"[['a', 1], ['b', None]]\n", OutputFormat::Python3).unwrap();
        let json = parse_payload(b"[[\"a\", 1], [\"b\", null]]\n", OutputFormat::Json).unwrap();
        assert_eq!(py, json);
        assert_eq!(py.len(), 2);
        assert_eq!(py[1], vec![Value::Str("b".into()), Value::None]);
    }

    #[test]
    fn rejects_non_tabular_payloads() {
        for raw in [&b"{'a': 1}"[..], b"[1, 2]", b"[[1]", b"\xff\xfe"] {
            let err = parse_payload(raw, OutputFormat::Python3).unwrap_err();
            assert_eq!(err.to_string(), "Malformed raw response output");
        }
    }

    #[test]
    fn frames_requests_with_blank_line() {
        assert_eq!(frame_request("GET hosts"), b"GET hosts\n\n");
    }
}
