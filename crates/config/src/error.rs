use thiserror::Error;

/// Errors raised while loading, validating, or persisting the
/// configuration document.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The document (or a component's blob within it) could not be
    /// parsed as JSON.
    #[error("parse error: {0}")]
    Parse(#[from] serde_json::Error),

    /// A filesystem operation failed while loading or saving.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The remote `source` URL could not be fetched, or responded with a
    /// 3xx-or-worse status.
    #[error("fetching source {url} failed: {reason}")]
    FetchingSource { url: String, reason: String },

    /// The document fetched from a `source` URL itself declared a
    /// non-empty `source`; only one level of indirection is permitted.
    #[error("remote config document itself declares a source; only one level of redirection is permitted")]
    SourceRedirect,

    /// A registered component rejected the document during `Validate()`.
    #[error("validation failed for {section}.{name}: {reason}")]
    ValidationFailed {
        section: String,
        name: String,
        reason: String,
    },

    /// `RegisterComponent` was called twice for the same (section, name).
    #[error("component {section}.{name} is already registered")]
    AlreadyRegistered { section: String, name: String },
}
