//! Async timeout helpers.

use crate::error::{ProtocolError, Result};
use std::future::Future;
use std::time::Duration;
use tokio::time::timeout;

/// Default deadline for connecting and sending
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default deadline for a daemon's response
pub const RESPONSE_TIMEOUT: Duration = Duration::from_secs(30);

/// Await `future`, mapping an elapsed deadline to [`ProtocolError::Timeout`].
pub async fn with_timeout_error<F, T>(future: F, duration: Duration) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match timeout(duration, future).await {
        Ok(result) => result,
        Err(_) => Err(ProtocolError::Timeout),
    }
}
