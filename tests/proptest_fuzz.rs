//! Property-based tests (fuzzing) for state substrate resilience.
//!
//! Uses proptest to generate random inputs and verify that queue order,
//! backoff bounds and local-file decoding hold for all of them.
//!
//! Run with: `cargo test --test proptest_fuzz`

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use proptest::prelude::*;
use serde_json::{json, Value};

use state_substrate::resilience::retry::backoff_delay;
use state_substrate::storage::local::decode_entry;
use state_substrate::{
    ConnectionConfig, ConnectionManager, HybridQueue, InMemoryRemote, LocalFallbackStore,
    MemoryConnector, QueueConfig,
};

// =============================================================================
// Strategies for generating test data
// =============================================================================

#[derive(Debug, Clone)]
enum QueueOp {
    Enqueue,
    Dequeue,
    Peek,
}

fn queue_op_strategy() -> impl Strategy<Value = QueueOp> {
    prop_oneof![
        5 => Just(QueueOp::Enqueue),
        3 => Just(QueueOp::Dequeue),
        1 => Just(QueueOp::Peek),
    ]
}

/// Generate arbitrary JSON values
fn arbitrary_json_strategy() -> impl Strategy<Value = Value> {
    let leaf = prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        any::<i64>().prop_map(|n| Value::Number(n.into())),
        ".*".prop_map(Value::String),
    ];

    leaf.prop_recursive(
        3,   // depth
        32,  // max nodes
        8,   // items per collection
        |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..8).prop_map(Value::Array),
                prop::collection::hash_map(".*", inner, 0..8)
                    .prop_map(|m| Value::Object(m.into_iter().collect())),
            ]
        },
    )
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

/// Replay `ops` against a small hybrid queue and a VecDeque model.
async fn replay_against_model(ops: Vec<QueueOp>, capacity: usize) -> Result<(), TestCaseError> {
    let dir = tempfile::tempdir().unwrap();
    let local = Arc::new(LocalFallbackStore::open(dir.path()).await);
    let connector = Arc::new(MemoryConnector::new(Arc::new(InMemoryRemote::new())));
    let manager = ConnectionManager::new(connector, ConnectionConfig::default(), local);
    manager.connect().await.unwrap();

    let config = QueueConfig {
        max_memory_length: capacity,
        ..QueueConfig::default()
    };
    let queue = HybridQueue::open("prop", manager.clone(), &config).await;
    let mut model: VecDeque<Value> = VecDeque::new();
    let mut next = 0u64;

    for op in ops {
        match op {
            QueueOp::Enqueue => {
                if queue.enqueue(json!(next)).await.is_ok() {
                    model.push_back(json!(next));
                }
                next += 1;
            }
            QueueOp::Dequeue => {
                let got = queue.dequeue().await.map(|i| i.payload);
                prop_assert_eq!(got, model.pop_front());
            }
            QueueOp::Peek => {
                let got = queue.peek().await.map(|i| i.payload);
                prop_assert_eq!(got.as_ref(), model.front());
            }
        }
        prop_assert_eq!(queue.len().await, model.len());
    }

    while let Some(expected) = model.pop_front() {
        prop_assert_eq!(queue.dequeue().await.map(|i| i.payload), Some(expected));
    }
    prop_assert!(queue.dequeue().await.is_none());
    manager.shutdown().await;
    Ok(())
}

// =============================================================================
// Queue Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    /// FIFO holds across any interleaving, including promotion and demotion
    #[test]
    fn prop_queue_fifo_under_interleaving(
        ops in prop::collection::vec(queue_op_strategy(), 1..120),
        capacity in 2usize..12,
    ) {
        runtime().block_on(replay_against_model(ops, capacity))?;
    }
}

// =============================================================================
// Backoff Properties
// =============================================================================

proptest! {
    /// No delay ever exceeds the cap, whatever the attempt number
    #[test]
    fn prop_backoff_never_exceeds_max(
        base_ms in 1u64..5_000,
        max_ms in 1u64..60_000,
        attempt in 0u32..200,
        jitter_ms in 0u64..5_000,
    ) {
        let max = Duration::from_millis(max_ms);
        let delay = backoff_delay(
            Duration::from_millis(base_ms),
            max,
            attempt,
            Duration::from_millis(jitter_ms),
        );
        prop_assert!(delay <= max);
    }

    /// Without jitter the delay is exactly min(max, base * 2^attempt)
    #[test]
    fn prop_backoff_exact_without_jitter(
        base_ms in 1u64..1_000,
        max_ms in 1u64..60_000,
        attempt in 0u32..20,
    ) {
        let base = Duration::from_millis(base_ms);
        let max = Duration::from_millis(max_ms);
        let expected = (base * 2u32.pow(attempt)).min(max);
        prop_assert_eq!(backoff_delay(base, max, attempt, Duration::ZERO), expected);
    }

    /// Delays never shrink as attempts grow (jitter off)
    #[test]
    fn prop_backoff_monotonic(base_ms in 1u64..1_000, max_ms in 1u64..60_000, attempt in 0u32..40) {
        let base = Duration::from_millis(base_ms);
        let max = Duration::from_millis(max_ms);
        prop_assert!(
            backoff_delay(base, max, attempt, Duration::ZERO)
                <= backoff_delay(base, max, attempt + 1, Duration::ZERO)
        );
    }
}

// =============================================================================
// Local File Decoding
// =============================================================================

proptest! {
    /// Arbitrary bytes never panic the decoder, only return Err
    #[test]
    fn fuzz_local_entry_from_random_bytes(bytes in prop::collection::vec(any::<u8>(), 0..4096)) {
        let _ = decode_entry("fuzz", &bytes);
    }

    /// Arbitrary JSON documents either decode or fail cleanly
    #[test]
    fn fuzz_local_entry_from_arbitrary_json(doc in arbitrary_json_strategy()) {
        let bytes = serde_json::to_vec(&doc).unwrap();
        let _ = decode_entry("fuzz", &bytes);
    }

    /// Any value wrapped in the on-disk shape decodes back to itself
    #[test]
    fn prop_local_entry_preserves_value(value in arbitrary_json_strategy(), ttl in proptest::option::of(any::<u64>())) {
        let doc = json!({"value": value.clone(), "ttl": ttl});
        let entry = decode_entry("k", &serde_json::to_vec(&doc).unwrap()).unwrap();
        prop_assert_eq!(entry.value, value);
        prop_assert_eq!(entry.ttl, ttl);
    }

    /// Truncating a valid file anywhere never panics
    #[test]
    fn fuzz_truncated_local_entry(value in arbitrary_json_strategy(), cut in 0usize..512) {
        let bytes = serde_json::to_vec(&json!({"value": value, "ttl": null})).unwrap();
        let end = cut.min(bytes.len());
        let _ = decode_entry("k", &bytes[..end]);
    }
}
