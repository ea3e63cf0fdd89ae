//! Error types for strata-analytics
//!
//! The taxonomy decides how far a failure reaches:
//! - configuration, template and metadata errors abort the whole run before
//!   anything is written
//! - population and swap errors are isolated to one subject's table
//! - validation hook errors are only logged

use thiserror::Error;

/// Result type alias for strata-analytics
pub type Result<T> = std::result::Result<T, AnalyticsError>;

/// Main error type for the analytics engine
#[derive(Error, Debug)]
pub enum AnalyticsError {
    /// Invalid or missing configuration (including a missing full-refresh watermark)
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// SQL template could not be rendered
    #[error("Template error: {0}")]
    Template(String),

    /// Metadata could not be loaded or is inconsistent
    #[error("Metadata error: {0}")]
    Metadata(String),

    /// Populating a staging table failed
    #[error("Population of '{table}' failed: {source}")]
    Population {
        table: String,
        #[source]
        source: strata_rdbc::Error,
    },

    /// A validation hook rejected a table
    #[error("Validation of '{table}' failed: {message}")]
    Validation { table: String, message: String },

    /// Promoting staging tables failed; the published table is unchanged
    #[error("Swap of '{table}' failed: {source}")]
    Swap {
        table: String,
        #[source]
        source: strata_rdbc::Error,
    },

    /// Another run holds the table
    #[error("Refresh already in progress for table '{table}'")]
    RefreshInProgress { table: String },

    /// The run was cancelled before this subject started
    #[error("Refresh cancelled")]
    Cancelled,

    /// Store error outside population and swap
    #[error(transparent)]
    Store(#[from] strata_rdbc::Error),
}

impl AnalyticsError {
    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    /// Create a template error
    pub fn template(message: impl Into<String>) -> Self {
        Self::Template(message.into())
    }

    /// Create a metadata error
    pub fn metadata(message: impl Into<String>) -> Self {
        Self::Metadata(message.into())
    }

    /// Whether this error belongs to the configuration class.
    ///
    /// Template errors are caught at generation time and count as
    /// configuration errors, as do store errors raised while validating
    /// identifiers or selecting a dialect.
    pub fn is_configuration(&self) -> bool {
        match self {
            Self::Configuration(_) | Self::Template(_) | Self::Metadata(_) => true,
            Self::Store(e) => e.category() == strata_rdbc::ErrorCategory::Configuration,
            _ => false,
        }
    }

    /// Whether the whole run must abort
    pub fn is_fatal(&self) -> bool {
        self.is_configuration()
    }
}
