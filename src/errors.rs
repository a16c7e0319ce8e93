use thiserror::Error;

#[derive(Error, Debug)]
pub enum AutobookError {
    #[error("Browser launch failed: {0}")]
    LaunchFailed(String),

    #[error("Navigation failed: {0}")]
    NavigationFailed(String),

    #[error("Snapshot failed: {0}")]
    SnapshotFailed(String),

    #[error("Element not found: {0}")]
    ElementNotFound(String),

    #[error("Stale element reference: {0}")]
    StaleElement(String),

    #[error("Invalid locator: {0}")]
    InvalidLocator(String),

    #[error("JavaScript execution failed: {0}")]
    JavaScriptFailed(String),

    #[error("Input failed: {0}")]
    InputFailed(String),

    #[error("Screenshot failed: {0}")]
    ScreenshotFailed(String),

    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    #[error("Missing {0} in environment")]
    MissingIdentityField(&'static str),

    #[error("Invalid {field}: {reason}")]
    InvalidIdentityField { field: &'static str, reason: String },

    #[error("Timeout error: {0}")]
    TimeoutError(String),

    #[error("Cancelled")]
    Cancelled,

    #[error("Session closed")]
    SessionClosed,

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Chrome error: {0}")]
    ChromeError(String),
}

pub type Result<T> = std::result::Result<T, AutobookError>;

impl AutobookError {
    pub fn from_any_error<E: std::fmt::Display>(err: E) -> Self {
        AutobookError::ChromeError(err.to_string())
    }

    /// Startup errors that must stop the process before the retry loop.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            AutobookError::ConfigurationError(_)
                | AutobookError::MissingIdentityField(_)
                | AutobookError::InvalidIdentityField { .. }
        )
    }
}

impl From<toml::de::Error> for AutobookError {
    fn from(err: toml::de::Error) -> Self {
        AutobookError::ConfigurationError(err.to_string())
    }
}
