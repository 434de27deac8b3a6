//! Wall-clock helpers.
//!
//! Heartbeats are compared at seconds resolution across processes, so the
//! registry and its clients share this one definition of "now".

use std::time::{SystemTime, UNIX_EPOCH};

/// Current unix time in whole seconds.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unix_now_is_current_era() {
        let now = unix_now();
        // After 2023-01-01, before 2100.
        assert!(now > 1_672_531_200);
        assert!(now < 4_102_444_800);
    }
}
