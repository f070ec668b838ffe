//! Request id generation
//!
//! Ids combine a millisecond timestamp with a random fraction, which keeps
//! them unique within a tunnel for the lifetime of a transaction while
//! staying a plain JSON number on the wire.

use rand::Rng;
use std::time::{SystemTime, UNIX_EPOCH};

/// Generate a fresh request id
pub fn next_request_id() -> u64 {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default();
    millis * 1000 + rand::thread_rng().gen_range(0..1000)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_ids_carry_timestamp() {
        let before = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_millis() as u64;
        let id = next_request_id();
        let after = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_millis() as u64;

        assert!(id / 1000 >= before);
        assert!(id / 1000 <= after);
    }

    #[test]
    fn test_ids_unique_across_milliseconds() {
        // Same-millisecond draws can collide on the random fraction (the
        // dispatcher retries those); across milliseconds they cannot.
        let mut seen = HashSet::new();
        for _ in 0..20 {
            assert!(seen.insert(next_request_id()));
            std::thread::sleep(std::time::Duration::from_millis(2));
        }
    }
}
