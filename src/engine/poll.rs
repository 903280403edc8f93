// src/engine/poll.rs

//! Bounded polling for eventual-consistency waits.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tracing::trace;

use crate::errors::{EngineError, Result};

/// Call `check` every `interval` until it yields `Some`, failing with
/// [`EngineError::PollTimeout`] once `timeout` has elapsed.
///
/// The check runs at least once, even with a zero timeout. Check errors end
/// the wait immediately. A timeout too large to represent as a deadline means
/// waiting without one.
pub async fn poll_until<T, F, Fut>(
    what: &str,
    interval: Duration,
    timeout: Duration,
    mut check: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>>>,
{
    let deadline = Instant::now().checked_add(timeout);
    let mut attempts: u32 = 0;

    loop {
        attempts += 1;
        if let Some(value) = check().await? {
            return Ok(value);
        }

        let pause = match deadline {
            Some(deadline) => {
                let now = Instant::now();
                if now >= deadline {
                    return Err(EngineError::PollTimeout {
                        what: what.to_string(),
                        timeout,
                    });
                }
                interval.min(deadline - now)
            }
            None => interval,
        };

        trace!(%what, attempts, "condition not met yet");
        tokio::time::sleep(pause).await;
    }
}
