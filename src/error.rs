// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use std::fmt;

/// Errors that can occur while operating the storage substrate or an index.
#[derive(Debug)]
pub enum Error {
    /// I/O error (file open, mmap, read, write).
    Io(std::io::Error),

    /// A precondition was violated by the caller: an allocate/write/read/rewind
    /// size or offset fell outside what the structure allows, or a `checkout`
    /// version was out of range. The operation aborts before any state changes.
    PreconditionViolation(String),

    /// On-disk metadata (a pool header or a manifest record) could not be
    /// parsed, or a block referenced a pool id the manager has no record of.
    Corrupt(String),

    /// A block id was referenced that the manager does not know about.
    UnknownBlock(u64),

    /// A pool id was referenced that the manager does not know about.
    UnknownPool(u32),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "I/O error: {e}"),
            Self::PreconditionViolation(msg) => write!(f, "precondition violated: {msg}"),
            Self::Corrupt(msg) => write!(f, "corrupt on-disk state: {msg}"),
            Self::UnknownBlock(id) => write!(f, "unknown block id: {id}"),
            Self::UnknownPool(id) => write!(f, "unknown pool id: {id}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

/// Storage engine result.
pub type Result<T> = std::result::Result<T, Error>;
