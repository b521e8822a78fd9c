use crate::error::{Result, SyncError};
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Default per-request timeout for API calls.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Build the shared HTTP client used by all remote clients.
pub fn build_client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .user_agent(concat!("music-playlist-offline-sync/", env!("CARGO_PKG_VERSION")))
        .build()
        .expect("http client")
}

/// Enforces a minimum interval between calls to one resource. Shared
/// process-wide via `Arc`; callers `wait()` before each outbound request.
#[derive(Debug)]
pub struct Throttle {
    min_interval: Duration,
    last: Mutex<Option<Instant>>,
}

impl Throttle {
    pub fn new(min_interval: Duration) -> Self {
        Self { min_interval, last: Mutex::new(None) }
    }

    /// Sleeps until at least `min_interval` has passed since the previous
    /// caller was released, then stamps the clock. Holding the lock across
    /// the sleep serializes concurrent callers.
    pub async fn wait(&self) {
        let mut last = self.last.lock().await;
        if let Some(prev) = *last {
            let elapsed = prev.elapsed();
            if elapsed < self.min_interval {
                tokio::time::sleep(self.min_interval - elapsed).await;
            }
        }
        *last = Some(Instant::now());
    }
}

/// Retry an async operation with exponential backoff. `classify` decides
/// whether an error is worth retrying; terminal errors are returned as-is.
/// Delays are `base_delay * 2^attempt` with a little jitter, capped at 60 s.
pub async fn retry_with_backoff<T, F, Fut, C>(
    attempts: u32,
    base_delay: Duration,
    classify: C,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
    C: Fn(&SyncError) -> bool,
{
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) => {
                if attempt >= attempts || !classify(&e) {
                    return Err(e);
                }
                let exp = base_delay.as_millis() as u64 * (1u64 << (attempt - 1).min(5));
                let jitter = rand::thread_rng().gen_range(0..250);
                let wait = Duration::from_millis(exp.min(60_000) + jitter);
                log::warn!("attempt {} failed: {}. Retrying in {:?}...", attempt, e, wait);
                tokio::time::sleep(wait).await;
            }
        }
    }
}

/// Parse a Retry-After header value (seconds form only).
pub fn retry_after_secs(resp: &reqwest::Response) -> Option<u64> {
    resp.headers()
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<u64>().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn throttle_spaces_out_calls() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let throttle = Throttle::new(Duration::from_millis(50));
            let start = Instant::now();
            throttle.wait().await;
            throttle.wait().await;
            throttle.wait().await;
            assert!(start.elapsed() >= Duration::from_millis(100));
        });
    }

    #[test]
    fn retry_stops_on_terminal_error() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let calls = AtomicU32::new(0);
            let res: Result<()> = retry_with_backoff(
                3,
                Duration::from_millis(1),
                |e| e.is_transient(),
                || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err(SyncError::Download("terminal".into())) }
                },
            )
            .await;
            assert!(res.is_err());
            assert_eq!(calls.load(Ordering::SeqCst), 1);
        });
    }

    #[test]
    fn retry_retries_transient_then_succeeds() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let calls = AtomicU32::new(0);
            let res: Result<u32> = retry_with_backoff(
                3,
                Duration::from_millis(1),
                |e| e.is_transient(),
                || {
                    let n = calls.fetch_add(1, Ordering::SeqCst);
                    async move {
                        if n < 2 {
                            Err(SyncError::source_transient("503"))
                        } else {
                            Ok(n)
                        }
                    }
                },
            )
            .await;
            assert_eq!(res.unwrap(), 2);
            assert_eq!(calls.load(Ordering::SeqCst), 3);
        });
    }
}
