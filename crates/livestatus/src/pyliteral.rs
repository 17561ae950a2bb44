// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Decoder for the Python literal subset produced by `OutputFormat: python3`.
//!
//! Supports lists, tuples, dicts, `str` and `bytes` literals, ints, floats,
//! `None`, `True` and `False`. Anything else is rejected.

use thiserror::Error;

use crate::value::Value;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid python literal at byte {position}: {message}")]
pub struct PyLiteralError {
    pub position: usize,
    pub message: String,
}

/// Parses a complete document; trailing non-whitespace is an error.
pub fn parse(input: &str) -> Result<Value, PyLiteralError> {
    let mut parser = Parser {
        input: input.as_bytes(),
        text: input,
        pos: 0,
    };
    let value = parser.value(0)?;
    parser.skip_ws();
    if parser.pos != parser.input.len() {
        return Err(parser.error("trailing characters"));
    }
    Ok(value)
}

const MAX_DEPTH: usize = 256;

struct Parser<'a> {
    input: &'a [u8],
    text: &'a str,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn error(&self, message: impl Into<String>) -> PyLiteralError {
        PyLiteralError {
            position: self.pos,
            message: message.into(),
        }
    }

    fn peek(&self) -> Option<u8> {
        self.input.get(self.pos).copied()
    }

    fn skip_ws(&mut self) {
        while let Some(b' ' | b'\t' | b'\n' | b'\r') = self.peek() {
            self.pos += 1;
        }
    }

    fn value(&mut self, depth: usize) -> Result<Value, PyLiteralError> {
        if depth > MAX_DEPTH {
            return Err(self.error("nesting too deep"));
        }
        self.skip_ws();
        match self.peek() {
            None => Err(self.error("unexpected end of input")),
            Some(b'[') => {
                self.pos += 1;
                Ok(Value::List(self.sequence(b']', depth)?))
            }
            Some(b'(') => {
                self.pos += 1;
                Ok(Value::Tuple(self.sequence(b')', depth)?))
            }
            Some(b'{') => {
                self.pos += 1;
                self.dict(depth)
            }
            Some(b'\'' | b'"') => Ok(Value::Str(self.string()?)),
            Some(b'b' | b'B')
                if matches!(self.input.get(self.pos + 1), Some(b'\'' | b'"')) =>
            {
                self.pos += 1;
                Ok(Value::Bytes(self.bytes()?))
            }
            Some(b'u' | b'U')
                if matches!(self.input.get(self.pos + 1), Some(b'\'' | b'"')) =>
            {
                self.pos += 1;
                Ok(Value::Str(self.string()?))
            }
            Some(b'-' | b'+' | b'.' | b'0'..=b'9') => self.number(),
            Some(c) if c.is_ascii_alphabetic() || c == b'_' => self.name(),
            Some(_) => Err(self.error("unexpected character")),
        }
    }

    fn sequence(&mut self, close: u8, depth: usize) -> Result<Vec<Value>, PyLiteralError> {
        let mut items = Vec::new();
        loop {
            self.skip_ws();
            if self.peek() == Some(close) {
                self.pos += 1;
                return Ok(items);
            }
            items.push(self.value(depth + 1)?);
            self.skip_ws();
            match self.peek() {
                Some(b',') => self.pos += 1,
                Some(c) if c == close => {
                    self.pos += 1;
                    return Ok(items);
                }
                _ => return Err(self.error("expected ',' or closing bracket")),
            }
        }
    }

    fn dict(&mut self, depth: usize) -> Result<Value, PyLiteralError> {
        let mut pairs = Vec::new();
        loop {
            self.skip_ws();
            if self.peek() == Some(b'}') {
                self.pos += 1;
                return Ok(Value::Dict(pairs));
            }
            let key = self.value(depth + 1)?;
            self.skip_ws();
            if self.peek() != Some(b':') {
                return Err(self.error("expected ':' in dict"));
            }
            self.pos += 1;
            let value = self.value(depth + 1)?;
            pairs.push((key, value));
            self.skip_ws();
            match self.peek() {
                Some(b',') => self.pos += 1,
                Some(b'}') => {
                    self.pos += 1;
                    return Ok(Value::Dict(pairs));
                }
                _ => return Err(self.error("expected ',' or '}' in dict")),
            }
        }
    }

    fn name(&mut self) -> Result<Value, PyLiteralError> {
        let start = self.pos;
        while let Some(c) = self.peek() {
            if c.is_ascii_alphanumeric() || c == b'_' {
                self.pos += 1;
            } else {
                break;
            }
        }
        match &self.text[start..self.pos] {
            "None" => Ok(Value::None),
            "True" => Ok(Value::Bool(true)),
            "False" => Ok(Value::Bool(false)),
            other => {
                self.pos = start;
                Err(self.error(format!("unknown name {other:?}")))
            }
        }
    }

    fn number(&mut self) -> Result<Value, PyLiteralError> {
        let start = self.pos;
        if let Some(b'-' | b'+') = self.peek() {
            self.pos += 1;
        }
        let mut is_float = false;
        while let Some(c) = self.peek() {
            match c {
                b'0'..=b'9' => {}
                b'.' => is_float = true,
                b'e' | b'E' => {
                    is_float = true;
                    if let Some(b'-' | b'+') = self.input.get(self.pos + 1) {
                        self.pos += 1;
                    }
                }
                _ => break,
            }
            self.pos += 1;
        }
        let literal = &self.text[start..self.pos];
        let parsed = if is_float {
            literal.parse::<f64>().ok().map(Value::Float)
        } else {
            match literal.parse::<i64>() {
                Ok(i) => Some(Value::Int(i)),
                // Python ints are unbounded; degrade gracefully
                Err(_) => literal.parse::<f64>().ok().map(Value::Float),
            }
        };
        parsed.ok_or_else(|| PyLiteralError {
            position: start,
            message: format!("invalid number {literal:?}"),
        })
    }

    /// Reads the opening quote and returns it.
    fn open_quote(&mut self) -> Result<u8, PyLiteralError> {
        match self.peek() {
            Some(q @ (b'\'' | b'"')) => {
                self.pos += 1;
                Ok(q)
            }
            _ => Err(self.error("expected quote")),
        }
    }

    fn hex_escape(&mut self, digits: usize) -> Result<u32, PyLiteralError> {
        let hex = self
            .text
            .get(self.pos..self.pos + digits)
            .ok_or_else(|| self.error("truncated escape"))?;
        let code = u32::from_str_radix(hex, 16).map_err(|_| self.error("invalid hex escape"))?;
        self.pos += digits;
        Ok(code)
    }

    fn octal_escape(&mut self, first: u8) -> u32 {
        let mut code = (first - b'0') as u32;
        for _ in 0..2 {
            match self.peek() {
                Some(c @ b'0'..=b'7') => {
                    code = code * 8 + (c - b'0') as u32;
                    self.pos += 1;
                }
                _ => break,
            }
        }
        code
    }

    fn string(&mut self) -> Result<String, PyLiteralError> {
        let quote = self.open_quote()?;
        let mut out = String::new();
        let mut pending_high: Option<u32> = None;
        loop {
            let Some(c) = self.peek() else {
                return Err(self.error("unterminated string"));
            };
            if c == quote {
                self.pos += 1;
                if pending_high.is_some() {
                    out.push(char::REPLACEMENT_CHARACTER);
                }
                return Ok(out);
            }
            if c != b'\\' {
                if pending_high.take().is_some() {
                    out.push(char::REPLACEMENT_CHARACTER);
                }
                // Copy the whole UTF-8 sequence starting here
                let ch = self.text[self.pos..]
                    .chars()
                    .next()
                    .ok_or_else(|| self.error("unterminated string"))?;
                if ch == '\n' {
                    return Err(self.error("newline in string literal"));
                }
                out.push(ch);
                self.pos += ch.len_utf8();
                continue;
            }

            self.pos += 1;
            let Some(esc) = self.peek() else {
                return Err(self.error("unterminated escape"));
            };
            self.pos += 1;
            let code = match esc {
                b'u' => self.hex_escape(4)?,
                b'U' => self.hex_escape(8)?,
                b'x' => self.hex_escape(2)?,
                b'0'..=b'7' => self.octal_escape(esc),
                _ => {
                    if pending_high.take().is_some() {
                        out.push(char::REPLACEMENT_CHARACTER);
                    }
                    match esc {
                        b'\\' => out.push('\\'),
                        b'\'' => out.push('\''),
                        b'"' => out.push('"'),
                        b'n' => out.push('\n'),
                        b'r' => out.push('\r'),
                        b't' => out.push('\t'),
                        b'a' => out.push('\x07'),
                        b'b' => out.push('\x08'),
                        b'f' => out.push('\x0c'),
                        b'v' => out.push('\x0b'),
                        b'\n' => {}
                        other => {
                            // Unknown escapes are kept verbatim
                            out.push('\\');
                            self.pos -= 1;
                            let ch = self.text[self.pos..].chars().next().unwrap_or(other as char);
                            out.push(ch);
                            self.pos += ch.len_utf8();
                        }
                    }
                    continue;
                }
            };
            match (pending_high.take(), code) {
                (Some(high), 0xDC00..=0xDFFF) => {
                    let combined = 0x10000 + ((high - 0xD800) << 10) + (code - 0xDC00);
                    out.push(char::from_u32(combined).unwrap_or(char::REPLACEMENT_CHARACTER));
                }
                (previous, 0xD800..=0xDBFF) => {
                    if previous.is_some() {
                        out.push(char::REPLACEMENT_CHARACTER);
                    }
                    pending_high = Some(code);
                }
                (previous, code) => {
                    if previous.is_some() {
                        out.push(char::REPLACEMENT_CHARACTER);
                    }
                    out.push(char::from_u32(code).unwrap_or(char::REPLACEMENT_CHARACTER));
                }
            }
        }
    }

    fn bytes(&mut self) -> Result<Vec<u8>, PyLiteralError> {
        let quote = self.open_quote()?;
        let mut out = Vec::new();
        loop {
            let Some(c) = self.peek() else {
                return Err(self.error("unterminated bytes literal"));
            };
            self.pos += 1;
            if c == quote {
                return Ok(out);
            }
            if c != b'\\' {
                if !c.is_ascii() || c == b'\n' {
                    return Err(self.error("bytes can only contain ASCII literal characters"));
                }
                out.push(c);
                continue;
            }
            let Some(esc) = self.peek() else {
                return Err(self.error("unterminated escape"));
            };
            self.pos += 1;
            match esc {
                b'x' => out.push(self.hex_escape(2)? as u8),
                b'0'..=b'7' => out.push(self.octal_escape(esc) as u8),
                b'\\' => out.push(b'\\'),
                b'\'' => out.push(b'\''),
                b'"' => out.push(b'"'),
                b'n' => out.push(b'\n'),
                b'r' => out.push(b'\r'),
                b't' => out.push(b'\t'),
                b'a' => out.push(0x07),
                b'b' => out.push(0x08),
                b'f' => out.push(0x0c),
                b'v' => out.push(0x0b),
                b'\n' => {}
                other => {
                    out.push(b'\\');
                    out.push(other);
                }
            }
        }
    }
}
