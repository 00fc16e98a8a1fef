use thiserror::Error;

/// Main error type for docsplit
#[derive(Error, Debug)]
pub enum DocsplitError {
    /// Database-related errors
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// File system I/O errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Format metadata could not be read (page count, text sample)
    #[error("Introspection error: {0}")]
    Introspection(String),

    /// Disk or permission failure while writing parts; fatal to the split
    #[error("Write error: {0}")]
    Write(String),

    /// Converter failure or timeout for a single part
    #[error("Part processing error: {0}")]
    PartProcessing(String),

    /// Completed part contents could not be assembled into one result
    #[error("Aggregation error: {0}")]
    Aggregation(String),

    /// Status change not allowed by the state machine
    #[error("Invalid status transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    /// Document not found
    #[error("Document not found: {0}")]
    DocumentNotFound(String),

    /// Part not found
    #[error("Part not found: {0}")]
    PartNotFound(String),

    /// Converter transport errors
    #[error("Converter error: {0}")]
    Converter(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

/// Convenient Result type using DocsplitError
pub type Result<T> = std::result::Result<T, DocsplitError>;
