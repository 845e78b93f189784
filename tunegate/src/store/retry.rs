//! Bounded retry for contended store writes.
//!
//! SQLite permits one writer at a time; under WAL the losing writer gets
//! SQLITE_BUSY instead of queueing forever. Contended writes retry on a
//! short fixed schedule whose total, jitter included, stays under the
//! default heartbeat interval, so a congested store never masquerades as a
//! lost lease. Anything that is not contention fails on the first attempt.

use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;
use tracing::debug;

use crate::Result;

/// Pauses between attempts, in milliseconds.
const RETRY_SCHEDULE_MS: &[u64] = &[5, 20, 80, 320, 1280];

/// Run `op`, retrying on store contention until the schedule is spent.
pub async fn with_write_retries<T, F, Fut>(op_name: &'static str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut schedule = RETRY_SCHEDULE_MS.iter();
    loop {
        let err = match op().await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };
        if !err.is_store_contention() {
            return Err(err);
        }
        let Some(&pause_ms) = schedule.next() else {
            return Err(err);
        };
        // Up to +50% jitter keeps colliding writers from re-colliding.
        let pause = pause_ms + rand::random::<u64>() % (pause_ms / 2 + 1);
        debug!(
            op = op_name,
            pause_ms = pause,
            error = %err,
            "store write contended, retrying"
        );
        sleep(Duration::from_millis(pause)).await;
    }
}
