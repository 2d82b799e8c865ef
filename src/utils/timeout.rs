//! Deadlines shared by the client and server paths.

use std::future::Future;
use std::time::Duration;

use crate::error::{ProtocolError, Result};
use crate::utils::metrics::global_metrics;

/// Dialing a transport and completing the bind.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// A single call, from the first request fragment to the last response fragment.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Grace period for in-flight connections when a server stops.
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Run `fut` with a deadline, mapping expiry to [`ProtocolError::Timeout`].
pub async fn with_timeout<F, T>(duration: Duration, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(duration, fut).await {
        Ok(result) => result,
        Err(_) => {
            global_metrics().timeout();
            Err(ProtocolError::Timeout)
        }
    }
}
