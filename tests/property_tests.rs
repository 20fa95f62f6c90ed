//! Property-based tests using proptest.
//!
//! These tests verify invariants that should hold for all inputs,
//! helping catch edge cases that unit tests might miss.

use proptest::prelude::*;
use replication_loader::backoff::{
    ConnectionFailureInfo, INITIAL_RETRY_DELAY, MAX_RETRY_DELAY,
};
use replication_loader::config::{Destination, TopologySnapshot};
use replication_loader::storage::{InMemoryStorage, StorageEngine};
use std::time::Duration;
use uuid::Uuid;

fn failure_info() -> ConnectionFailureInfo {
    ConnectionFailureInfo::new(Destination::for_testing("db", "node-2:10200"))
}

// =============================================================================
// Backoff Properties
// =============================================================================

proptest! {
    /// The pending delay never leaves [initial, cap], no matter how many
    /// failures accumulate.
    #[test]
    fn backoff_delay_stays_within_bounds(failures in 0usize..50) {
        let mut info = failure_info();
        for i in 0..failures {
            info.on_error(format!("failure {i}"));
            prop_assert!(info.next_delay() >= INITIAL_RETRY_DELAY);
            prop_assert!(info.next_delay() <= MAX_RETRY_DELAY);
        }
        prop_assert_eq!(info.error_count() as usize, failures);
    }

    /// The pending delay is monotonically non-decreasing across failures.
    #[test]
    fn backoff_delay_monotone(failures in 1usize..50) {
        let mut info = failure_info();
        let mut previous = Duration::ZERO;
        for i in 0..failures {
            info.on_error(format!("failure {i}"));
            prop_assert!(info.next_delay() >= previous);
            previous = info.next_delay();
        }
    }

    /// Reset restores the initial state regardless of prior history.
    #[test]
    fn backoff_reset_always_restores_initial(failures in 0usize..50) {
        let mut info = failure_info();
        for i in 0..failures {
            info.on_error(format!("failure {i}"));
        }
        info.reset();
        prop_assert_eq!(info.error_count(), 0);
        prop_assert_eq!(info.next_delay(), INITIAL_RETRY_DELAY);
    }
}

// =============================================================================
// Topology Comparison Properties
// =============================================================================

fn arb_destinations() -> impl Strategy<Value = Vec<Destination>> {
    prop::collection::vec(
        ("[a-c]{1,3}", "[a-z]{1,5}:[0-9]{2,4}", any::<bool>()).prop_map(
            |(database, url, disabled)| {
                let mut destination = Destination::for_testing(&database, &url);
                destination.disabled = disabled;
                destination
            },
        ),
        0..6,
    )
}

proptest! {
    /// Roster comparison is symmetric.
    #[test]
    fn connections_changed_symmetric(a in arb_destinations(), b in arb_destinations()) {
        let snap_a = TopologySnapshot {
            database_name: "db".to_string(),
            destinations: a,
            resolver: None,
        };
        let snap_b = TopologySnapshot {
            database_name: "db".to_string(),
            destinations: b,
            resolver: None,
        };
        prop_assert_eq!(
            snap_a.connections_changed(&snap_b),
            snap_b.connections_changed(&snap_a)
        );
    }

    /// Reordering the destination list is never a roster change.
    #[test]
    fn connections_changed_ignores_permutation(
        destinations in arb_destinations(),
        seed in any::<u64>(),
    ) {
        let original = TopologySnapshot {
            database_name: "db".to_string(),
            destinations: destinations.clone(),
            resolver: None,
        };
        let mut shuffled = destinations;
        if shuffled.len() > 1 {
            let rotation = (seed as usize) % shuffled.len();
            shuffled.rotate_left(rotation);
        }
        let rotated = TopologySnapshot {
            database_name: "db".to_string(),
            destinations: shuffled,
            resolver: None,
        };
        prop_assert!(!original.connections_changed(&rotated));
    }
}

// =============================================================================
// Storage Properties
// =============================================================================

proptest! {
    /// The change feed after any cutoff is strictly etag-ordered and never
    /// contains more than one entry per key.
    #[test]
    fn change_feed_ordered_and_deduplicated(
        writes in prop::collection::vec(("[a-e]", any::<u32>()), 1..40),
        cutoff in 0u64..10,
    ) {
        let rt = tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap();
        rt.block_on(async {
            let store = InMemoryStorage::new(Uuid::new_v4());
            for (key, value) in &writes {
                store.put(key, "docs", serde_json::json!({ "v": value }));
            }
            let changes = store.changes_after(cutoff, usize::MAX).await.unwrap();
            prop_assert!(changes.windows(2).all(|w| w[0].etag < w[1].etag));
            let mut keys: Vec<&str> = changes.iter().map(|c| c.key.as_str()).collect();
            keys.sort_unstable();
            keys.dedup();
            prop_assert_eq!(keys.len(), changes.len());
            prop_assert_eq!(store.last_etag().await.unwrap(), writes.len() as u64);
            Ok(())
        })?;
    }
}
