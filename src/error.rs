use std::fmt::{self, Debug, Display, Formatter};
use std::sync::Arc;

/// The result of a memoized computation.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// An error produced while computing or retrieving a memoized value.
///
/// Errors are cached just like values, which is why this type is cheaply
/// clonable: every caller coalesced on the same computation receives a clone
/// of the same error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// The compute function failed.
    #[error("{source}")]
    Compute {
        source: Arc<dyn std::error::Error + Send + Sync>,
        /// Transient errors invalidate themselves after the method's
        /// `transient_error_invalidation_delay`.
        transient: bool,
    },

    /// The compute function panicked.
    #[error("computation panicked: {message}")]
    Panic { message: String },

    /// The computation was cancelled before it settled. Never cached.
    #[error("computation was cancelled")]
    Cancelled,

    /// A computation requested its own result.
    #[error("cyclic dependency on `{method}`")]
    Cycle { method: String },

    /// The call ran in a mode that does not compute.
    #[error("no value was computed for this call")]
    NotComputed,

    /// The cached output is not of the requested type.
    #[error("cached output is not a `{expected}`")]
    TypeMismatch { expected: &'static str },
}

impl Error {
    /// Wrap an application error.
    pub fn compute<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Compute { source: Arc::new(error), transient: false }
    }

    /// Wrap an application error that is expected to go away on its own.
    pub fn transient<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Compute { source: Arc::new(error), transient: true }
    }

    /// Create an error from a plain message.
    pub fn msg(message: impl Into<String>) -> Self {
        Self::compute(Message(message.into()))
    }

    /// Whether the error should expire on its own.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Compute { transient: true, .. })
    }

    /// Whether this is a cancellation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// A string-only error.
struct Message(String);

impl Debug for Message {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        Debug::fmt(&self.0, f)
    }
}

impl Display for Message {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for Message {}

/// An error in the static setup of memoized methods.
///
/// These are raised when methods or comparers are registered, never when a
/// memoized method is called.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("method `{method}`: argument {index} has unsupported type `{ty}`")]
    UnsupportedArgument { method: String, index: usize, ty: &'static str },

    #[error("method `{0}` is already registered")]
    DuplicateMethod(String),

    #[error("a comparer for `{0}` is already registered")]
    DuplicateComparer(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(Error::msg("disk on fire").to_string(), "disk on fire");
        assert_eq!(
            Error::Cycle { method: "files::read".into() }.to_string(),
            "cyclic dependency on `files::read`"
        );
        assert!(!Error::msg("x").is_transient());
        assert!(Error::transient(std::fmt::Error).is_transient());
        assert!(Error::Cancelled.is_cancelled());
    }
}
