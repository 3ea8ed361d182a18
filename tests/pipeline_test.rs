//! Pipeline test without the network.
//!
//! Drives the in-process path end to end: raw stream chunks are decoded,
//! matched against tracked options, delivered through the aggregator, and
//! flushed into a recording store. Broker and upstream transport are covered
//! by their own module tests; this exercises how the pieces compose.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use pollwire::bus::VoteHandler;
use pollwire::store::{ResultStore, StoreError};
use pollwire::stream::decode::StreamDecoder;
use pollwire::stream::TrackedOptions;
use pollwire::tally::{FlushOutcome, TallyAggregator};

/// Store double that records applied increments and fails on command.
#[derive(Default)]
struct RecordingStore {
    applied: Mutex<Vec<(String, u64)>>,
    fail_options: Mutex<Vec<String>>,
}

impl RecordingStore {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn fail_on(&self, option: &str) {
        self.fail_options.lock().push(option.to_string());
    }

    fn clear_failures(&self) {
        self.fail_options.lock().clear();
    }

    fn applied_sorted(&self) -> Vec<(String, u64)> {
        let mut applied = self.applied.lock().clone();
        applied.sort();
        applied
    }
}

#[async_trait]
impl ResultStore for RecordingStore {
    async fn apply_increment(&self, option: &str, by: u64) -> Result<(), StoreError> {
        if self.fail_options.lock().iter().any(|o| o == option) {
            return Err(StoreError::Database(sqlx::Error::PoolClosed));
        }
        self.applied.lock().push((option.to_string(), by));
        Ok(())
    }
}

fn counts(pairs: &[(&str, u64)]) -> HashMap<String, u64> {
    pairs
        .iter()
        .map(|(option, count)| (option.to_string(), *count))
        .collect()
}

/// Feed raw body chunks through decode → match → record.
fn ingest_chunks(
    chunks: &[&[u8]],
    options: &TrackedOptions,
    handler: &dyn VoteHandler,
) -> Result<(), serde_json::Error> {
    let mut decoder = StreamDecoder::new();
    for chunk in chunks {
        for message in decoder.feed(chunk)? {
            for option in options.matches(&message.text) {
                handler.handle(option);
            }
        }
    }
    Ok(())
}

#[tokio::test]
async fn chunked_stream_lands_in_poll_results() {
    let store = RecordingStore::new();
    let aggregator = TallyAggregator::new(store.clone());
    let options = TrackedOptions::new(vec!["love".to_string(), "hate".to_string()]);

    // Messages split mid-object across chunks, the way a socket delivers
    // them. One mentions both options, one mentions none.
    let chunks: &[&[u8]] = &[
        br#"{"text":"I love cats"#,
        br#" and HATE mondays"}{"text":"noth"#,
        br#"ing relevant"}{"text":"more love"}"#,
    ];
    ingest_chunks(chunks, &options, &aggregator).unwrap();

    assert_eq!(
        aggregator.buffer().snapshot(),
        counts(&[("love", 2), ("hate", 1)])
    );

    assert_eq!(aggregator.flush().await, FlushOutcome::Flushed);
    assert!(aggregator.buffer().is_empty());
    assert_eq!(
        store.applied_sorted(),
        vec![("hate".to_string(), 1), ("love".to_string(), 2)]
    );
}

#[tokio::test]
async fn partial_flush_failure_resubmits_the_identical_batch() {
    let store = RecordingStore::new();
    let aggregator = TallyAggregator::new(store.clone());
    let options = TrackedOptions::new(vec!["a".to_string(), "b".to_string()]);

    let chunks: &[&[u8]] = &[br#"{"text":"a"}{"text":"b"}{"text":"a"}"#];
    ingest_chunks(chunks, &options, &aggregator).unwrap();
    assert_eq!(aggregator.buffer().snapshot(), counts(&[("a", 2), ("b", 1)]));

    // b fails: a:2 was applied, yet the whole batch stays pending.
    store.fail_on("b");
    assert_eq!(aggregator.flush().await, FlushOutcome::Partial);
    assert_eq!(aggregator.buffer().snapshot(), counts(&[("a", 2), ("b", 1)]));

    // The retry submits the unchanged batch, including the already-applied
    // a:2 — the over-count is the documented behavior, not an accident.
    store.clear_failures();
    assert_eq!(aggregator.flush().await, FlushOutcome::Flushed);
    assert_eq!(
        store.applied_sorted(),
        vec![
            ("a".to_string(), 2),
            ("a".to_string(), 2),
            ("b".to_string(), 1)
        ]
    );
    assert!(aggregator.buffer().is_empty());
}

#[tokio::test]
async fn delivery_order_never_changes_the_outcome() {
    let options = TrackedOptions::new(vec!["x".to_string(), "y".to_string(), "z".to_string()]);
    let orders: &[&[u8]] = &[
        br#"{"text":"x"}{"text":"x"}{"text":"y"}{"text":"z"}"#,
        br#"{"text":"z"}{"text":"y"}{"text":"x"}{"text":"x"}"#,
        br#"{"text":"y"}{"text":"x"}{"text":"z"}{"text":"x"}"#,
    ];

    let mut outcomes = Vec::new();
    for order in orders {
        let store = RecordingStore::new();
        let aggregator = TallyAggregator::new(store.clone());
        ingest_chunks(&[order], &options, &aggregator).unwrap();
        assert_eq!(aggregator.flush().await, FlushOutcome::Flushed);
        outcomes.push(store.applied_sorted());
    }

    assert_eq!(outcomes[0], outcomes[1]);
    assert_eq!(outcomes[1], outcomes[2]);
    assert_eq!(
        outcomes[0],
        vec![
            ("x".to_string(), 2),
            ("y".to_string(), 1),
            ("z".to_string(), 1)
        ]
    );
}

#[tokio::test]
async fn multi_option_messages_fan_out_into_separate_votes() {
    let store = RecordingStore::new();
    let aggregator = TallyAggregator::new(store.clone());
    let options = TrackedOptions::new(vec!["tea".to_string(), "coffee".to_string()]);

    let chunks: &[&[u8]] = &[br#"{"text":"Tea or COFFEE? both!"}"#];
    ingest_chunks(chunks, &options, &aggregator).unwrap();

    // One message, two tracked options, two distinct votes.
    assert_eq!(
        aggregator.buffer().snapshot(),
        counts(&[("tea", 1), ("coffee", 1)])
    );
}
