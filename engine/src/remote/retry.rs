use super::RemoteError;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Run a remote call, retrying once after `delay` if the first attempt fails
/// with a transient error.
pub async fn with_single_retry<F, Fut, T>(
    operation_name: &str,
    delay: Duration,
    mut operation: F,
) -> Result<T, RemoteError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, RemoteError>>,
{
    match operation().await {
        Ok(value) => Ok(value),
        Err(err) if err.is_transient() => {
            debug!(operation = operation_name, error = %err, "transient failure, retrying once");
            sleep(delay).await;
            operation().await.map_err(|err| {
                warn!(operation = operation_name, error = %err, "retry failed");
                err
            })
        }
        Err(err) => Err(err),
    }
}
