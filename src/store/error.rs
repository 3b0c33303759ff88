use snafu::prelude::*;
use std::path::PathBuf;
use std::string::FromUtf8Error;

pub type Result<T, E = Error> = core::result::Result<T, E>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display("IO error: {}", source))]
    IoGeneral { source: std::io::Error },
    #[snafu(display("Error creating {}: {}", path.display(), source))]
    IoCreate {
        source: std::io::Error,
        path: PathBuf,
    },
    #[snafu(display("Error writing to {}: {}", path.display(), source))]
    IoWrite {
        source: std::io::Error,
        path: PathBuf,
    },
    #[snafu(display("Error reading {}: {}", path.display(), source))]
    IoRead {
        source: std::io::Error,
        path: PathBuf,
    },
    #[snafu(display("Error reading directory {}: {}", path.display(), source))]
    IoReadDir {
        source: std::io::Error,
        path: PathBuf,
    },
    #[snafu(display("Failed to move {} to {}: {}", from.display(), to.display(), source))]
    IoMove {
        source: std::io::Error,
        from: PathBuf,
        to: PathBuf,
    },
    #[snafu(display("Failed to delete {}: {}", path.display(), source))]
    IoDelete {
        source: std::io::Error,
        path: PathBuf,
    },
    #[snafu(display("Failed to stat {}: {}", path.display(), source))]
    IoStat {
        source: std::io::Error,
        path: PathBuf,
    },
    #[snafu(display("Error walking files: {}", source))]
    WalkFile { source: walkdir::Error },
    #[snafu(display("Computed digest {actual} does not match expected digest {expected}"))]
    DigestMismatch { expected: String, actual: String },
    #[snafu(display("Implementation {id} is already in the store"))]
    AlreadyInStore { id: String },
    #[snafu(display("Implementation {id} was not found in the store"))]
    NotFound { id: String },
    #[snafu(display("No entry matches path '{path}'"))]
    PathNotFound { path: String },
    #[snafu(display("Unsupported kind: {kind}"))]
    UnsupportedKind { kind: String },
    #[snafu(display("Invalid path '{path}': {details}"))]
    InvalidPath { path: String, details: String },
    #[snafu(display("Access denied writing to {}", path.display()))]
    AccessDenied { path: PathBuf },
    #[snafu(display("Operation cancelled"))]
    Cancelled,
    #[snafu(display("Network access is required but the store is offline"))]
    Offline,
    #[snafu(display("Invalid implementation identifier: {value}"))]
    InvalidIdentifier { value: String },
    #[snafu(display("Manifest line {num} is invalid: {details}"))]
    InvalidManifestLine { num: usize, details: String },
    #[snafu(display("Download of {url} failed: {reason}"))]
    Http { url: String, reason: String },
    #[snafu(display("Failed to decode string: {source}"))]
    InvalidString { source: FromUtf8Error },
}

impl Error {
    /// True for failures that a fetcher may retry against another
    /// retrieval method or a mirror.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::IoGeneral { .. }
                | Error::IoRead { .. }
                | Error::IoWrite { .. }
                | Error::Http { .. }
        )
    }
}
