// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Typed external commands.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::encoding::lqencode;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandArg {
    Int(i64),
    Str(String),
    Bool(bool),
    Time(SystemTime),
}

impl From<i64> for CommandArg {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<&str> for CommandArg {
    fn from(value: &str) -> Self {
        Self::Str(value.to_owned())
    }
}

impl From<String> for CommandArg {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

impl From<bool> for CommandArg {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<SystemTime> for CommandArg {
    fn from(value: SystemTime) -> Self {
        Self::Time(value)
    }
}

pub(crate) fn unix_seconds(time: SystemTime) -> i64 {
    match time.duration_since(UNIX_EPOCH) {
        Ok(after) => after.as_secs() as i64,
        Err(before) => -(before.duration().as_secs() as i64),
    }
}

impl fmt::Display for CommandArg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(i) => write!(f, "{i}"),
            Self::Str(s) => f.write_str(&lqencode(s)),
            Self::Bool(b) => write!(f, "{}", *b as u8),
            Self::Time(t) => write!(f, "{}", unix_seconds(*t)),
        }
    }
}

/// An external command such as `SCHEDULE_FORCED_SVC_CHECK`.
///
/// Renders as `NAME;arg1;arg2`, ready to be passed to `command()`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalCommand {
    pub name: String,
    pub args: Vec<CommandArg>,
}

impl ExternalCommand {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<CommandArg>) -> Self {
        self.args.push(arg.into());
        self
    }
}

impl fmt::Display for ExternalCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{};", self.name)?;
        for (i, arg) in self.args.iter().enumerate() {
            if i > 0 {
                f.write_str(";")?;
            }
            write!(f, "{arg}")?;
        }
        Ok(())
    }
}
