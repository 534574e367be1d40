//! Test Helper Functions and Utilities
//!
//! Fixtures shared by the pool scenarios: block JSON, fast pool settings and a polling wait.

use chainpool_core::config::PoolSettings;
use serde_json::{json, Value};
use std::time::{Duration, Instant};

/// Creates a `eth_getBlockByNumber` result for `block_number`.
#[must_use]
pub fn create_test_block(block_number: u64) -> Value {
    json!({
        "number": format!("0x{block_number:x}"),
        "hash": format!("0x{block_number:064x}"),
        "parentHash": format!("0x{:064x}", block_number.saturating_sub(1)),
        "timestamp": format!("0x{:x}", 1_700_000_000 + block_number * 12),
        "transactions": []
    })
}

/// Pool settings with millisecond timings so scenarios settle quickly.
#[must_use]
pub fn fast_settings() -> PoolSettings {
    PoolSettings {
        poll_interval_ms: 20,
        dial_timeout_ms: 500,
        call_timeout_ms: 500,
        sync_threshold: 5,
        unreachable_threshold: 5,
        dial_backoff_base_ms: 10,
        dial_backoff_max_ms: 50,
        dial_backoff_jitter: 0.0,
        invalid_chain_id_recheck_interval_ms: 50,
        ..PoolSettings::default()
    }
}

/// Polls `condition` every few milliseconds until it holds or `timeout` passes.
///
/// Returns whether the condition was met.
pub async fn wait_until<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_test_block() {
        let block = create_test_block(100);
        assert_eq!(block["number"], "0x64");
        assert!(block["timestamp"].as_str().is_some());
    }

    #[test]
    fn test_fast_settings_are_valid() {
        assert!(fast_settings().validate().is_ok());
    }

    #[tokio::test]
    async fn test_wait_until_times_out() {
        assert!(!wait_until(Duration::from_millis(20), || false).await);
        assert!(wait_until(Duration::from_millis(20), || true).await);
    }
}
