//! Shared protocol constants for the index/diff exchange

// Source URLs and destination archives carry this suffix
pub const ARCHIVE_SUFFIX: &str = ".tgz";

// Default daemon address
pub const DEFAULT_PORT: u16 = 8090;
pub const DEFAULT_BIND: &str = "0.0.0.0:8090";

// Both index and diff responses, and the bitmap request body
pub const CONTENT_TYPE: &str = "application/octet-stream";

// Whole-archive digest handed out on GET and echoed back on POST
pub const FINGERPRINT_HEADER: &str = "x-archive-fingerprint";

// Response chunk size for streamed archives (1MB)
pub const DEFAULT_CHUNK_SIZE: usize = 1024 * 1024;

// Chunks in flight between the blocking transform and the HTTP body
pub const CHANNEL_DEPTH: usize = 16;

pub mod timeouts {
    // Blanket read/write deadline applied at the transport (seconds)
    pub const IO_SECS: u64 = 600;

    // Connection establishment timeout for the client (seconds)
    pub const CONNECT_SECS: u64 = 30;
}
