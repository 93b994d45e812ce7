//! Error types for the caching layer

use crate::types::StreamId;
use thiserror::Error;

/// Main error type for the caching layer
#[derive(Error, Debug)]
pub enum Error {
    /// Upstream time-series service error
    #[error("Upstream error: {0}")]
    Source(#[from] SourceError),

    /// Cache backend error
    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    /// Stream index error
    #[error("Index error: {0}")]
    Index(#[from] IndexError),

    /// Collection lookup or adapter error
    #[error("Collection error: {0}")]
    Collection(#[from] CollectionError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// General error
    #[error("{0}")]
    General(String),
}

/// Upstream service errors
///
/// Any of these aborts the whole request: no partial result is returned
/// and nothing is cached. Query timeouts reported by the upstream are not
/// errors; they travel as data inside a successful response.
#[derive(Error, Debug)]
pub enum SourceError {
    /// Upstream unreachable or connection lost mid-response
    #[error("Connection error: {0}")]
    Connection(String),

    /// Malformed or undecodable frame
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Socket IO failure
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A well-formed frame arrived that does not answer the request
    #[error("Unexpected message: expected {expected}, got {actual}")]
    UnexpectedMessage {
        /// Message type the client was waiting for
        expected: String,
        /// Message type that arrived
        actual: String,
    },
}

/// Cache backend errors
///
/// Produced only by `CacheBackend` implementations. The block cache logs
/// and swallows them so a failing backend degrades performance, never
/// correctness.
#[derive(Error, Debug)]
pub enum CacheError {
    /// Backend unreachable or rejected the command
    #[error("Backend error: {0}")]
    Backend(String),

    /// Backend did not answer within the command timeout
    #[error("Cache operation timed out")]
    Timeout,

    /// Cached payload could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Stream index errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IndexError {
    /// A stream lacks one of the collection's configured property keys
    #[error("Missing stream property: {key}")]
    MissingProperty {
        /// The absent key
        key: String,
    },

    /// A selection names a value that is not present in the index
    #[error("Invalid selection {value} for property {key}")]
    InvalidSelection {
        /// Property being selected
        key: String,
        /// Value that was not found
        value: String,
    },

    /// Stream id already indexed under a different property tuple
    #[error("Stream {id} is already indexed with different properties")]
    DuplicateStream {
        /// The conflicting stream id
        id: StreamId,
    },
}

/// Collection lookup and adapter errors
#[derive(Error, Debug)]
pub enum CollectionError {
    /// No upstream collection or adapter with this name
    #[error("Unknown collection: {0}")]
    UnknownCollection(String),

    /// A group description could not be parsed by the adapter
    #[error("Invalid group description: {0}")]
    InvalidGroup(String),

    /// The adapter has no column set for the requested detail level
    #[error("Unsupported detail level: {0}")]
    UnsupportedDetail(String),

    /// The collection has no usable stream index yet
    #[error("Collection not ready: {0}")]
    NotReady(String),
}

/// Validation errors
///
/// Error type for configuration and input validation
#[derive(Error, Debug)]
pub enum ValidationError {
    /// Value is out of allowed range
    #[error("{field} value {value} is out of range [{min}, {max}]")]
    OutOfRange {
        /// Field name being validated
        field: String,
        /// The invalid value
        value: String,
        /// Minimum allowed value
        min: String,
        /// Maximum allowed value
        max: String,
    },

    /// Required field is missing
    #[error("Missing required field: {0}")]
    MissingField(String),

    /// Invalid format
    #[error("Invalid format for {field}: {message}")]
    InvalidFormat {
        /// Field name being validated
        field: String,
        /// Description of the format error
        message: String,
    },
}

impl From<ValidationError> for Error {
    fn from(e: ValidationError) -> Self {
        Error::Configuration(e.to_string())
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(e: serde_json::Error) -> Self {
        CacheError::Serialization(e.to_string())
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_error_converts() {
        let err: Error = SourceError::Protocol("bad frame".to_string()).into();
        assert!(matches!(err, Error::Source(SourceError::Protocol(_))));
        assert_eq!(err.to_string(), "Upstream error: Protocol error: bad frame");
    }

    #[test]
    fn test_validation_error_becomes_configuration() {
        let err: Error = ValidationError::MissingField("upstream.host".to_string()).into();
        assert!(matches!(err, Error::Configuration(_)));
    }
}
