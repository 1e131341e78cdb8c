//! Identifier generation and wall-clock helpers.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use vigil_protocol::{CallId, MessageId};

/// Last identifier handed out by [`generate_id`].
static LAST_ID: AtomicU64 = AtomicU64::new(0);

/// Milliseconds since the Unix epoch.
#[must_use]
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

fn now_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros() as u64
}

/// Generate a strictly increasing identifier.
///
/// Identifiers track the microsecond clock but never repeat or go backwards,
/// even if the clock does.
#[must_use]
pub fn generate_id() -> u64 {
    let now = now_micros();
    let mut last = LAST_ID.load(Ordering::Relaxed);
    loop {
        let next = now.max(last + 1);
        match LAST_ID.compare_exchange_weak(last, next, Ordering::AcqRel, Ordering::Relaxed) {
            Ok(_) => return next,
            Err(actual) => last = actual,
        }
    }
}

/// Generate a message identifier.
#[must_use]
pub fn generate_message_id() -> MessageId {
    generate_id()
}

/// Generate a call identifier.
#[must_use]
pub fn generate_call_id() -> CallId {
    format!("call_{:x}", generate_id())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_strictly_increase() {
        let ids: Vec<u64> = (0..1_000).map(|_| generate_message_id()).collect();
        assert!(ids.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_ids_increase_across_threads() {
        let handles: Vec<_> = (0..4)
            .map(|_| std::thread::spawn(|| (0..500).map(|_| generate_id()).collect::<Vec<_>>()))
            .collect();

        let mut all: Vec<u64> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        let total = all.len();
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), total);
    }

    #[test]
    fn test_call_id_format() {
        assert!(generate_call_id().starts_with("call_"));
    }
}
