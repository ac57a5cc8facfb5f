//! Bounded external calls.

use std::future::Future;
use std::time::Duration;

use crate::error::EnvelopeError;

/// Runs `fut` with a deadline. Elapsed deadlines become
/// [`EnvelopeError::Timeout`].
pub(crate) async fn with_timeout<F: Future>(
    operation: &'static str,
    limit: Duration,
    fut: F,
) -> Result<F::Output, EnvelopeError> {
    tokio::time::timeout(limit, fut)
        .await
        .map_err(|_| EnvelopeError::Timeout {
            operation,
            after: limit,
        })
}
