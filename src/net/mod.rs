//! Bounded-retry/backoff helpers, DNS-readiness waits, and the shared HTTP
//! client reused by the lazy-start proxy, runtime-dispatch calls, and the
//! scheduler's dispatch-to-runtime calls. Grounded on `api::client::HttpClient`'s
//! retry/backoff shape, generalized away from the single panel-API use case.

mod dns;
mod retry;

pub use dns::wait_for_dns;
pub use retry::{retry_with_backoff, RetryError};

use std::time::Duration;

use reqwest::Client;

/// Build the shared `reqwest::Client` used across the controller process.
/// One client per process, reused for connection pooling, matching the
/// teacher's `HttpClient` constructor.
pub fn shared_http_client(timeout: Duration) -> Client {
    Client::builder()
        .timeout(timeout)
        .connect_timeout(Duration::from_secs(10))
        .pool_max_idle_per_host(16)
        .build()
        .expect("reqwest client configuration is static and always valid")
}
