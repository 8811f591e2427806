//! Error handling for the cspp-trie library
//!
//! Every fallible operation returns [`Result`], whose error side is [`PatriciaError`].
//! Duplicate keys and exhausted arenas during concurrent inserts are not errors; they are
//! reported through [`crate::fsa::InsertOutcome`].

use thiserror::Error;

/// Main error type for the cspp-trie library
#[derive(Error, Debug)]
pub enum PatriciaError {
    /// I/O related errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid data format or argument
    #[error("Invalid data: {message}")]
    InvalidData {
        /// Error message describing the issue
        message: String,
    },

    /// A persisted trie image failed header validation
    #[error("Corrupted trie image: {reason}")]
    CorruptedImage {
        /// What did not match
        reason: String,
    },

    /// Memory allocation failures
    #[error("Memory allocation failed: requested {size} bytes")]
    OutOfMemory {
        /// Number of bytes requested
        size: usize,
    },

    /// Configuration or parameter errors
    #[error("Invalid configuration: {message}")]
    Configuration {
        /// Configuration error message
        message: String,
    },

    /// Mutation attempted on a trie that was switched to read-only
    #[error("Trie is read-only: {operation}")]
    ReadOnly {
        /// The rejected operation
        operation: String,
    },

    /// Resource already in use or locked
    #[error("Resource busy: {resource}")]
    ResourceBusy {
        /// Description of the busy resource
        resource: String,
    },

    /// Feature not supported on this platform or level
    #[error("Not supported: {feature}")]
    NotSupported {
        /// Description of the unsupported feature
        feature: String,
    },
}

impl PatriciaError {
    /// Create an invalid data error
    pub fn invalid_data<S: Into<String>>(message: S) -> Self {
        Self::InvalidData {
            message: message.into(),
        }
    }

    /// Create a corrupted image error
    pub fn corrupted_image<S: Into<String>>(reason: S) -> Self {
        Self::CorruptedImage {
            reason: reason.into(),
        }
    }

    /// Create an out of memory error
    pub fn out_of_memory(size: usize) -> Self {
        Self::OutOfMemory { size }
    }

    /// Create a configuration error
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create a read-only error
    pub fn read_only<S: Into<String>>(operation: S) -> Self {
        Self::ReadOnly {
            operation: operation.into(),
        }
    }

    /// Create a resource busy error
    pub fn resource_busy<S: Into<String>>(resource: S) -> Self {
        Self::ResourceBusy {
            resource: resource.into(),
        }
    }

    /// Create a not supported error
    pub fn not_supported<S: Into<String>>(feature: S) -> Self {
        Self::NotSupported {
            feature: feature.into(),
        }
    }

    /// Create an I/O error from a message
    pub fn io_error<S: Into<String>>(message: S) -> Self {
        Self::Io(std::io::Error::new(std::io::ErrorKind::Other, message.into()))
    }

    /// Check if this is a recoverable error
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Io(_) => true,
            Self::OutOfMemory { .. } => true,
            Self::ResourceBusy { .. } => true,
            Self::InvalidData { .. } => false,
            Self::CorruptedImage { .. } => false,
            Self::Configuration { .. } => false,
            Self::ReadOnly { .. } => false,
            Self::NotSupported { .. } => false,
        }
    }

    /// Get the error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            Self::Io(_) => "io",
            Self::InvalidData { .. } => "data",
            Self::CorruptedImage { .. } => "image",
            Self::OutOfMemory { .. } => "memory",
            Self::Configuration { .. } => "config",
            Self::ReadOnly { .. } => "readonly",
            Self::ResourceBusy { .. } => "resource",
            Self::NotSupported { .. } => "unsupported",
        }
    }
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, PatriciaError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = PatriciaError::invalid_data("test message");
        assert_eq!(err.category(), "data");
        assert!(!err.is_recoverable());
    }

    #[test]
    fn test_error_categories() {
        let io_err = PatriciaError::Io(std::io::Error::new(std::io::ErrorKind::NotFound, "test"));
        assert_eq!(io_err.category(), "io");
        assert!(io_err.is_recoverable());

        let image_err = PatriciaError::corrupted_image("bad magic");
        assert_eq!(image_err.category(), "image");
        assert!(!image_err.is_recoverable());

        let mem_err = PatriciaError::out_of_memory(4096);
        assert!(mem_err.is_recoverable());
    }

    #[test]
    fn test_error_display() {
        let err = PatriciaError::corrupted_image("block length 13 is not a multiple of 4");
        assert_eq!(
            err.to_string(),
            "Corrupted trie image: block length 13 is not a multiple of 4"
        );

        let err = PatriciaError::read_only("insert");
        assert!(err.to_string().contains("insert"));
    }

    #[test]
    fn test_io_conversion() {
        fn open_missing() -> Result<std::fs::File> {
            Ok(std::fs::File::open("/definitely/not/here/cspp.trie")?)
        }
        let err = open_missing().unwrap_err();
        assert_eq!(err.category(), "io");
    }
}
