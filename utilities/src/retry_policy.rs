use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::result::Result;

/// Runs `f` until it succeeds or `max_retries` attempts failed, doubling the wait
/// between attempts starting from `base_delay`.
pub async fn retry_with_backoff<F, Fut, R>(
    mut f: F,
    max_retries: u8,
    base_delay: Duration,
) -> Result<R>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<R>>,
{
    let mut curr_try = 1;
    loop {
        match f().await {
            Ok(v) => {
                return Ok(v);
            }
            Err(e) => {
                warn!(error=%e,retry=%curr_try,"Error happened while running closure");
                if curr_try >= max_retries {
                    warn!("Reached max retries return error");
                    return Err(e);
                }
            }
        }
        let sleep_duration = base_delay * 2u32.pow(curr_try as u32 - 1);
        debug!(?sleep_duration, "Waiting before retry");
        sleep(sleep_duration).await;
        curr_try += 1;
    }
}
