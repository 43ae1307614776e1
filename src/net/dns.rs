//! Network-readiness wait: resolve a container hostname over the internal
//! network up to a bounded attempts x interval budget, closing the
//! DNS-propagation race called out in §4.2 step 8.

use std::time::Duration;

use tokio::net::lookup_host;
use tracing::debug;

use super::retry::{retry_with_backoff, RetryError};

/// Resolves `hostname:port`, retrying until it succeeds or the attempt
/// budget is exhausted. Reference budget: 15 attempts x 1s (§4.2).
pub async fn wait_for_dns(
    hostname: &str,
    port: u16,
    attempts: u32,
    interval: Duration,
) -> Result<(), RetryError<std::io::Error>> {
    let target = format!("{hostname}:{port}");
    retry_with_backoff("dns-readiness", attempts, interval, || {
        let target = target.clone();
        async move {
            let mut addrs = lookup_host(&target).await?;
            if addrs.next().is_some() {
                debug!(hostname = %target, "resolved");
                Ok(())
            } else {
                Err(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "no addresses returned",
                ))
            }
        }
    })
    .await
}
