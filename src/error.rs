// SPDX-FileCopyrightText: 2023 Stefan Hackenberg <mail@stefan-hackenberg.de>
//
// SPDX-License-Identifier: MIT

use std::{error::Error, fmt};

#[derive(Debug)]
pub enum SimError {
    /// `sets * associativity * line_size != size` or a non power of two field.
    InvalidGeometry(String),
    /// `reference` was called without reference and without line.
    MissingReferenceInputs,
    /// `update_cl` was given both or neither of its sources.
    ConflictingUpdateSources,
    /// The reference pool has handed out all of its records.
    PoolExhausted(usize),
    UnknownScheme(u8),
    /// A reference names a core the hierarchy was not built for.
    UnknownCore(usize),
    InvalidTopology(String),
    TraceParse { line: u64, reason: String },
    IoError(std::io::Error),
    ConfigError(serde_json::Error),
}

impl fmt::Display for SimError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl From<std::io::Error> for SimError {
    fn from(e: std::io::Error) -> Self {
        Self::IoError(e)
    }
}

impl From<serde_json::Error> for SimError {
    fn from(e: serde_json::Error) -> Self {
        Self::ConfigError(e)
    }
}

impl Error for SimError {}
