use std::time::{SystemTime, UNIX_EPOCH};
use tokio::time::Instant;

pub fn now_unix_ms() -> i64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(duration) => duration.as_millis().min(i64::MAX as u128) as i64,
        Err(_) => 0,
    }
}

/// Wall-clock milliseconds advanced by the monotonic tokio clock from a fixed
/// anchor. Deadlines derived from it cannot jump with system clock changes,
/// and paused-time tests drive it deterministically.
#[derive(Debug, Clone, Copy)]
pub struct WallClock {
    anchor_unix_ms: i64,
    anchor: Instant,
}

impl Default for WallClock {
    fn default() -> Self {
        Self::starting_at(now_unix_ms())
    }
}

impl WallClock {
    pub fn starting_at(anchor_unix_ms: i64) -> Self {
        Self {
            anchor_unix_ms,
            anchor: Instant::now(),
        }
    }

    pub fn now_ms(&self) -> i64 {
        let elapsed_ms = self.anchor.elapsed().as_millis().min(i64::MAX as u128) as i64;
        self.anchor_unix_ms.saturating_add(elapsed_ms)
    }
}
