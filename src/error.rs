use thiserror::Error;

/// Failure of a single `resolve` call.
///
/// Results of a shared in-flight fetch fan out to every waiter, so this type is `Clone` and
/// carries rendered messages rather than the underlying error values.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ResolveError {
    /// The remote could not be reached, timed out, or reported a server-side failure.
    #[error("remote unavailable: {0}")]
    RemoteUnavailable(String),

    /// The remote answered, but the payload could not be understood or failed validation.
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// The cache store could not be read or written.
    #[error("cache unavailable: {0}")]
    CacheUnavailable(String),

    /// The caller's input cannot name a cache entry. Raised before any store or remote access.
    #[error("invalid key: {0}")]
    InvalidKey(String),
}

impl ResolveError {
    pub fn remote_unavailable(reason: impl Into<String>) -> Self {
        Self::RemoteUnavailable(reason.into())
    }

    pub fn invalid_response(reason: impl Into<String>) -> Self {
        Self::InvalidResponse(reason.into())
    }

    pub fn invalid_key(reason: impl Into<String>) -> Self {
        Self::InvalidKey(reason.into())
    }

    pub fn is_remote_unavailable(&self) -> bool {
        matches!(self, Self::RemoteUnavailable(_))
    }

    pub fn is_invalid_response(&self) -> bool {
        matches!(self, Self::InvalidResponse(_))
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("store i/o failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("entry could not be encoded or decoded: {0}")]
    Serialization(String),
}

impl StoreError {
    pub(crate) fn poisoned(op: &'static str) -> Self {
        Self::Unavailable(format!("lock poisoned during {op}"))
    }
}

impl From<StoreError> for ResolveError {
    fn from(err: StoreError) -> Self {
        ResolveError::CacheUnavailable(err.to_string())
    }
}
