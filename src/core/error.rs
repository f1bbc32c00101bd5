//! Error type system for the Mango plugin host
//!
//! Two layers of errors live here:
//! - `MangoError`, the crate-wide error returned by the registry, the
//!   manifest loader, the manager and the repository service
//! - `PluginError`, the call-time taxonomy surfaced by script-backed
//!   providers (timeouts, panics, script exceptions, rejected promises)

use std::error::Error as StdError;

/// Boxed cause carried by a `PluginError`
pub type BoxedCause = Box<dyn StdError + Send + Sync + 'static>;

/// Main error type for the plugin host
#[derive(Debug, thiserror::Error)]
pub enum MangoError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Plugin not found: {0}")]
    PluginNotFound(String),

    #[error("Plugin load failed: {0}")]
    PluginLoadError(String),

    #[error("Plugin {0} is already loaded")]
    PluginAlreadyLoaded(String),

    #[error("Plugin {0} is not loaded")]
    PluginNotLoaded(String),

    #[error("Invalid manifest: {0}")]
    ManifestError(String),

    #[error("Incompatible API version: {0}")]
    IncompatibleApiVersion(String),

    #[error("Provider with ID '{0}' already registered")]
    DuplicateProvider(String),

    #[error("Invalid version: {0}")]
    InvalidVersion(String),

    #[error(transparent)]
    Plugin(#[from] PluginError),

    #[error("Repository error: {0}")]
    RepositoryError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),
}

impl MangoError {
    /// Get the error type name, used in structured logs and CLI output
    pub fn error_type(&self) -> &'static str {
        match self {
            MangoError::ConfigError(_) => "ConfigError",
            MangoError::PluginNotFound(_) => "PluginNotFound",
            MangoError::PluginLoadError(_) => "PluginLoadError",
            MangoError::PluginAlreadyLoaded(_) => "PluginAlreadyLoaded",
            MangoError::PluginNotLoaded(_) => "PluginNotLoaded",
            MangoError::ManifestError(_) => "ManifestError",
            MangoError::IncompatibleApiVersion(_) => "IncompatibleApiVersion",
            MangoError::DuplicateProvider(_) => "DuplicateProvider",
            MangoError::InvalidVersion(_) => "InvalidVersion",
            MangoError::Plugin(_) => "PluginError",
            MangoError::RepositoryError(_) => "RepositoryError",
            MangoError::IoError(_) => "IoError",
            MangoError::NetworkError(_) => "NetworkError",
            MangoError::SerializationError(_) => "SerializationError",
        }
    }

    /// Check if this error is retryable by the caller
    ///
    /// Nothing inside the plugin core retries; consumers such as the
    /// download worker use this to decide on backoff.
    pub fn is_retryable(&self) -> bool {
        match self {
            MangoError::NetworkError(_) => true,
            MangoError::Plugin(e) => e.is_timeout,
            _ => false,
        }
    }

    /// The call-time plugin error, if this is one
    pub fn as_plugin_error(&self) -> Option<&PluginError> {
        match self {
            MangoError::Plugin(e) => Some(e),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for MangoError {
    fn from(err: serde_json::Error) -> Self {
        MangoError::SerializationError(err.to_string())
    }
}

impl From<reqwest::Error> for MangoError {
    fn from(err: reqwest::Error) -> Self {
        MangoError::NetworkError(err.to_string())
    }
}

/// Result type alias for operations that can fail with MangoError
pub type Result<T> = std::result::Result<T, MangoError>;

/// Error raised while calling into a script-backed plugin
#[derive(Debug, thiserror::Error)]
#[error("plugin {plugin_id}: function {function}: {message}{}", render_cause(.cause))]
pub struct PluginError {
    pub plugin_id: String,
    pub function: String,
    pub message: String,
    #[source]
    pub cause: Option<BoxedCause>,
    pub is_timeout: bool,
    pub is_panic: bool,
}

fn render_cause(cause: &Option<BoxedCause>) -> String {
    match cause {
        Some(cause) => format!(": {}", cause),
        None => String::new(),
    }
}

impl PluginError {
    pub fn new(
        plugin_id: impl Into<String>,
        function: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            plugin_id: plugin_id.into(),
            function: function.into(),
            message: message.into(),
            cause: None,
            is_timeout: false,
            is_panic: false,
        }
    }

    /// Mark this error as a timeout
    pub fn timeout(mut self) -> Self {
        self.is_timeout = true;
        self
    }

    /// Mark this error as a recovered panic
    pub fn panic(mut self) -> Self {
        self.is_panic = true;
        self
    }

    /// Attach the underlying error
    pub fn with_cause(mut self, cause: impl Into<BoxedCause>) -> Self {
        self.cause = Some(cause.into());
        self
    }

    /// Wrap a failed call the way provider adapters report it:
    /// `"<function> failed: <err>"` with the original kept as cause and its
    /// timeout/panic flags carried over.
    pub fn wrap(inner: PluginError, function: &str) -> Self {
        let message = format!("{} failed: {}", function, inner.message);
        let (is_timeout, is_panic) = (inner.is_timeout, inner.is_panic);
        Self {
            plugin_id: inner.plugin_id.clone(),
            function: function.to_string(),
            message,
            cause: Some(Box::new(inner)),
            is_timeout,
            is_panic,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plugin_error_display() {
        let err = PluginError::new("webtoons", "search", "execution error: boom");
        assert_eq!(
            err.to_string(),
            "plugin webtoons: function search: execution error: boom"
        );
    }

    #[test]
    fn test_plugin_error_display_with_cause() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err = PluginError::new("p", "getInfo", "failed").with_cause(io);
        assert_eq!(err.to_string(), "plugin p: function getInfo: failed: missing");
        assert!(err.source().is_some());
    }

    #[test]
    fn test_plugin_error_flags() {
        let err = PluginError::new("p", "search", "timeout").timeout();
        assert!(err.is_timeout);
        assert!(!err.is_panic);

        let err = PluginError::new("p", "search", "panic").panic();
        assert!(err.is_panic);
        assert!(!err.is_timeout);
    }

    #[test]
    fn test_wrap_keeps_cause_and_flags() {
        let inner = PluginError::new("p", "search", "timeout").timeout();
        let outer = PluginError::wrap(inner, "search");
        assert_eq!(outer.message, "search failed: timeout");
        assert!(outer.is_timeout);

        let cause = outer.source().expect("cause");
        let inner = cause.downcast_ref::<PluginError>().expect("plugin error cause");
        assert_eq!(inner.message, "timeout");
    }

    #[test]
    fn test_error_types() {
        assert_eq!(
            MangoError::PluginNotFound("test".into()).error_type(),
            "PluginNotFound"
        );
        assert_eq!(
            MangoError::DuplicateProvider("test".into()).error_type(),
            "DuplicateProvider"
        );
    }

    #[test]
    fn test_error_retryable() {
        assert!(MangoError::NetworkError("test".into()).is_retryable());
        assert!(MangoError::Plugin(PluginError::new("p", "f", "t").timeout()).is_retryable());
        assert!(!MangoError::Plugin(PluginError::new("p", "f", "x")).is_retryable());
        assert!(!MangoError::ManifestError("test".into()).is_retryable());
    }
}
