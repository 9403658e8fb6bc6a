/// Error raised by a [`HistoryStore`](super::HistoryStore), classified for retry.
///
/// **Retryable**: the store is temporarily unavailable (busy/locked database,
/// pool timeout, dropped connection). The runtime and client retry these with
/// `RuntimeOptions::store_retry` before surfacing them.
///
/// **Permanent**: retrying cannot help (unknown instance, malformed event,
/// outcome referencing a missing scheduling event, corrupted row).
///
/// ```rust
/// use duraflow::providers::ProviderError;
///
/// let busy = ProviderError::retryable("append", "database is locked");
/// assert!(busy.is_retryable());
///
/// let bad = ProviderError::permanent("append", "instance not found: i-1");
/// assert_eq!(bad.to_string(), "append: instance not found: i-1");
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderError {
    /// Store operation that failed (e.g. "append", "read")
    pub operation: String,
    pub message: String,
    pub retryable: bool,
}

impl ProviderError {
    pub fn retryable(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            message: message.into(),
            retryable: true,
        }
    }

    pub fn permanent(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            message: message.into(),
            retryable: false,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.retryable
    }
}

impl std::fmt::Display for ProviderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.operation, self.message)
    }
}

impl std::error::Error for ProviderError {}
