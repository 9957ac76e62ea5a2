//! Fail-open utilities for cleanup paths
//!
//! Use these for side effects that must never abort the caller, such as
//! metadata snapshots, activity logging and `checkout prune`. Stage
//! execution and gate evaluation must not fail open.

use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

use crate::Result;

const RETRY_STEP: Duration = Duration::from_millis(100);

/// Run an operation whose failure is logged and swallowed
///
/// Returns `None` if the operation failed.
///
/// ```no_run
/// use stagehand_core::fail_open::fail_open;
/// use stagehand_core::Result;
///
/// async fn write_snapshot() -> Result<()> {
///     Ok(())
/// }
///
/// async fn example() {
///     let written = fail_open("workspace_snapshot", || write_snapshot()).await;
///     assert!(written.is_some());
/// }
/// ```
pub async fn fail_open<F, Fut, T>(operation_name: &str, f: F) -> Option<T>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    match f().await {
        Ok(val) => Some(val),
        Err(e) => {
            warn!("{} failed (fail-open): {}", operation_name, e);
            None
        }
    }
}

/// Like [`fail_open`] but makes up to `attempts` tries, sleeping `100ms * try` in between
pub async fn fail_open_with_retries<F, Fut, T>(
    operation_name: &str,
    mut f: F,
    attempts: usize,
) -> Option<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match f().await {
            Ok(val) => return Some(val),
            Err(e) if attempt >= attempts => {
                warn!(
                    "{} failed after {} attempts (fail-open): {}",
                    operation_name, attempt, e
                );
                return None;
            }
            Err(e) => {
                debug!("{} failed (attempt {}/{}): {}", operation_name, attempt, attempts, e);
                tokio::time::sleep(RETRY_STEP * attempt as u32).await;
            }
        }
    }
}
