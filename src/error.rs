//! Error types shared by the archive transforms and the HTTP server.

use std::io;
use thiserror::Error;

/// Result type for archive transforms.
pub type DiffResult<T> = Result<T, DiffError>;

/// Errors raised while building an index, scanning, serving or merging a diff.
#[derive(Error, Debug)]
pub enum DiffError {
    /// The requested source archive does not exist.
    #[error("source archive not found: {0}")]
    NotFound(String),

    /// The requested archive name escapes the archive root.
    #[error("invalid archive path: {0}")]
    InvalidPath(String),

    /// The source archive cannot be read as gzip-compressed tar.
    #[error("cannot read archive: {0}")]
    InvalidArchive(#[source] io::Error),

    /// An index entry does not carry a well-formed content hash.
    #[error("malformed index entry {name}: {reason}")]
    MalformedIndex { name: String, reason: String },

    /// The request body is not a gzip-compressed bitmap.
    #[error("malformed presence bitmap: {0}")]
    MalformedBitmap(String),

    /// A counter value points past the end of the bitmap.
    #[error(
        "presence bitmap out of bounds: file #{counter} needs byte {byte_index} but bitmap has {len} bytes"
    )]
    BitmapOutOfBounds {
        counter: u64,
        byte_index: u64,
        len: usize,
    },

    /// The source archive changed between the index and the diff request.
    #[error("archive changed since index was generated (expected {expected}, found {actual})")]
    ArchiveChanged { expected: String, actual: String },

    /// The diff archive does not match what the local scan asked for.
    #[error("malformed diff response: {0}")]
    MalformedResponse(String),

    /// I/O error while writing output.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl DiffError {
    /// Returns true if the request itself was at fault (4xx).
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            DiffError::NotFound(_)
                | DiffError::InvalidPath(_)
                | DiffError::MalformedBitmap(_)
                | DiffError::ArchiveChanged { .. }
        )
    }

    /// Returns true if the server failed to produce a response (5xx).
    pub fn is_server_error(&self) -> bool {
        !self.is_client_error()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_classification() {
        assert!(DiffError::NotFound("a.tgz".into()).is_client_error());
        assert!(DiffError::MalformedBitmap("empty".into()).is_client_error());
        assert!(DiffError::BitmapOutOfBounds {
            counter: 8,
            byte_index: 1,
            len: 1
        }
        .is_server_error());
        assert!(DiffError::InvalidArchive(io::Error::other("bad gzip")).is_server_error());
    }

    #[test]
    fn out_of_bounds_display() {
        let err = DiffError::BitmapOutOfBounds {
            counter: 17,
            byte_index: 2,
            len: 2,
        };
        let msg = err.to_string();
        assert!(msg.contains("#17"));
        assert!(msg.contains("byte 2"));
        assert!(msg.contains("2 bytes"));
    }
}
