/// Resilience patterns for the catalog services
///
/// Currently provides bounded retry with exponential backoff and jitter.
/// Callers decide which failures are worth retrying; anything the
/// classifier rejects is returned immediately as a permanent failure.
///
/// # Example: object storage write
///
/// ```rust,no_run
/// use resilience::{with_retry, RetryConfig};
///
/// #[derive(Debug)]
/// enum PutError { Throttled, Forbidden }
///
/// impl std::fmt::Display for PutError {
///     fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
///         write!(f, "{:?}", self)
///     }
/// }
///
/// #[tokio::main]
/// async fn main() {
///     let result = with_retry(
///         &RetryConfig::default(),
///         |e: &PutError| matches!(e, PutError::Throttled),
///         || async { Ok::<_, PutError>(()) },
///     )
///     .await;
///     assert!(result.is_ok());
/// }
/// ```

pub mod retry;

pub use retry::{with_retry, RetryConfig, RetryError};
