//! Error types and result handling for mongo-capture.
//!
//! This module defines the main error type [`Error`] and a convenience
//! [`Result`] type alias used throughout the crate.
//!
//! # Example
//!
//! ```rust
//! use mongo_capture::{Error, Result};
//!
//! fn load_catalog() -> Result<()> {
//!     Err(Error::Config("catalog has no streams".to_string()))
//! }
//!
//! match load_catalog() {
//!     Ok(()) => println!("Loaded"),
//!     Err(e) if e.is_configuration() => eprintln!("Fix the configuration: {}", e),
//!     Err(e) => eprintln!("Other error: {}", e),
//! }
//! ```

use thiserror::Error;

/// The main error type for mongo-capture operations.
///
/// Configuration errors are fatal and detectable before any state is
/// advanced; see [`Error::is_configuration`].
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error, typically from the config file or the catalog.
    #[error("Configuration error: {0}")]
    Config(String),

    /// MongoDB driver error.
    #[error("MongoDB error: {0}")]
    Mongo(#[from] mongodb::error::Error),

    /// JSON serialization error when encoding messages or state.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O error, typically from state file operations or stdout.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The catalog asks for a replication method the engine does not know.
    #[error("Unsupported replication method {method:?} for stream {stream}")]
    UnsupportedReplicationMethod {
        /// Stream identifier
        stream: String,
        /// Method as written in the catalog
        method: String,
    },

    /// The stream projection is unusable.
    #[error("Invalid projection for stream {stream}: {message}")]
    InvalidProjection {
        /// Stream identifier
        stream: String,
        /// What is wrong with it
        message: String,
    },

    /// A bookmark value has a type that cannot be stored as a typed bookmark.
    #[error("Unsupported replication key type: {key_type}")]
    UnsupportedKeyType {
        /// Name of the offending type
        key_type: String,
    },

    /// A persisted bookmark could not be read back.
    #[error("Invalid bookmark {key}: {message}")]
    InvalidBookmark {
        /// Bookmark key
        key: String,
        /// Description of the problem
        message: String,
    },

    /// A datetime value outside every representable range.
    #[error("Error syncing collection {stream}, object ID {id} - {message}")]
    InvalidDateTime {
        /// Stream identifier
        stream: String,
        /// `_id` of the document carrying the value
        id: String,
        /// Field path and value
        message: String,
    },

    /// Invalid or malformed oplog entry.
    #[error("Invalid oplog entry: {message}")]
    InvalidLogEntry {
        /// Description of what was invalid
        message: String,
    },

    /// The server has no oplog to read from.
    #[error("Oplog unavailable: {message}")]
    OplogUnavailable {
        /// Description of what was missing
        message: String,
    },

    /// The server returned data that contradicts the query it was sent.
    #[error("Assertion failed: {message}")]
    Assertion {
        /// Description of the violated expectation
        message: String,
    },
}

impl Error {
    /// Returns `true` for errors caused by configuration rather than by the
    /// environment or the data.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Error::Config(_)
                | Error::UnsupportedReplicationMethod { .. }
                | Error::InvalidProjection { .. }
                | Error::UnsupportedKeyType { .. }
        )
    }
}

/// A convenient Result type alias for mongo-capture operations.
///
/// This is equivalent to `std::result::Result<T, mongo_capture::Error>`.
pub type Result<T> = std::result::Result<T, Error>;
