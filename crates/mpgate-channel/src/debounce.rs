//! Per-subject aggregation of rapid-fire text messages.
//!
//! Texts from one subject queue until the quiet interval passes with no new arrival, then
//! flush as one batch whose text joins the queued texts with newlines. One
//! [`InboundDebouncer`] exists per distinct quiet interval; [`DebouncerRegistry`] hands them
//! out.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::account::SharedAccount;
use crate::envelope::InboundEvent;

pub const COMMAND_MARKER: char = '/';

#[derive(Debug, Clone)]
pub struct DebounceItem {
    pub account: SharedAccount,
    pub event: InboundEvent,
    pub text: String,
}

#[derive(Debug, Clone)]
pub struct DebouncedBatch {
    pub key: String,
    pub combined_text: String,
    /// Most recent item; its metadata is used for dispatch.
    pub carrier: DebounceItem,
    pub item_count: usize,
}

impl DebouncedBatch {
    fn from_items(key: String, items: Vec<DebounceItem>) -> Option<Self> {
        let item_count = items.len();
        let combined_text = items
            .iter()
            .map(|item| item.text.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        let carrier = items.into_iter().last()?;
        Some(Self {
            key,
            combined_text,
            carrier,
            item_count,
        })
    }
}

#[async_trait]
pub trait DebounceSink: Send + Sync {
    async fn flush(&self, batch: DebouncedBatch);
}

/// Only plain text without a command marker and without a pending image is queued.
pub fn should_debounce(event: &InboundEvent, has_pending_image: bool) -> bool {
    if !event.is_text() || has_pending_image {
        return false;
    }
    event
        .content
        .as_deref()
        .is_some_and(|text| !text.trim_start().starts_with(COMMAND_MARKER))
}

#[derive(Debug, Default)]
struct DebounceState {
    next_generation: u64,
    queues: HashMap<String, PendingQueue>,
}

#[derive(Debug)]
struct PendingQueue {
    generation: u64,
    items: Vec<DebounceItem>,
}

#[derive(Debug)]
pub struct InboundDebouncer {
    quiet_interval: Duration,
    state: Arc<Mutex<DebounceState>>,
}

impl InboundDebouncer {
    pub fn new(quiet_interval: Duration) -> Self {
        Self {
            quiet_interval,
            state: Arc::new(Mutex::new(DebounceState::default())),
        }
    }

    /// Queues `item` under `key` and (re)arms the quiet timer for that key.
    pub fn enqueue(&self, key: &str, item: DebounceItem, sink: Arc<dyn DebounceSink>) {
        let generation = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            state.next_generation += 1;
            let generation = state.next_generation;
            let queue = state
                .queues
                .entry(key.to_string())
                .or_insert_with(|| PendingQueue {
                    generation,
                    items: Vec::new(),
                });
            queue.generation = generation;
            queue.items.push(item);
            generation
        };

        let state = Arc::clone(&self.state);
        let quiet_interval = self.quiet_interval;
        let key = key.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(quiet_interval).await;
            let items = {
                let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);
                let current = state
                    .queues
                    .get(&key)
                    .is_some_and(|queue| queue.generation == generation);
                if current {
                    state.queues.remove(&key).map(|queue| queue.items)
                } else {
                    None
                }
            };
            let Some(batch) = items.and_then(|items| DebouncedBatch::from_items(key, items)) else {
                return;
            };
            debug!(
                key = %batch.key,
                items = batch.item_count,
                "flushing debounced batch"
            );
            sink.flush(batch).await;
        });
    }

    /// Removes and returns whatever is queued for `key`, cancelling its timer.
    pub fn flush_now(&self, key: &str) -> Option<DebouncedBatch> {
        let items = self
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .queues
            .remove(key)?
            .items;
        DebouncedBatch::from_items(key.to_string(), items)
    }

    #[cfg(test)]
    fn pending_keys(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .queues
            .len()
    }
}

/// Shares one debouncer per distinct quiet interval.
#[derive(Debug, Default)]
pub struct DebouncerRegistry {
    debouncers: Mutex<HashMap<u64, Arc<InboundDebouncer>>>,
}

impl DebouncerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// `None` when debouncing is disabled (`quiet_ms == 0`).
    pub fn for_interval(&self, quiet_ms: u64) -> Option<Arc<InboundDebouncer>> {
        if quiet_ms == 0 {
            return None;
        }
        let mut debouncers = self
            .debouncers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let debouncer = debouncers.entry(quiet_ms).or_insert_with(|| {
            Arc::new(InboundDebouncer::new(Duration::from_millis(quiet_ms)))
        });
        Some(Arc::clone(debouncer))
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.debouncers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::test_support::account;

    #[derive(Default)]
    struct RecordingSink {
        batches: Mutex<Vec<DebouncedBatch>>,
    }

    impl RecordingSink {
        fn texts(&self) -> Vec<String> {
            self.batches
                .lock()
                .expect("batches")
                .iter()
                .map(|batch| batch.combined_text.clone())
                .collect()
        }
    }

    #[async_trait]
    impl DebounceSink for RecordingSink {
        async fn flush(&self, batch: DebouncedBatch) {
            self.batches.lock().expect("batches").push(batch);
        }
    }

    fn text_event(msg_id: &str, content: &str) -> InboundEvent {
        InboundEvent {
            from_id: "o-user".to_string(),
            to_id: "gh".to_string(),
            create_time: 1,
            msg_type: "text".to_string(),
            content: Some(content.to_string()),
            msg_id: Some(msg_id.to_string()),
            event: None,
            event_key: None,
            media_ref: None,
        }
    }

    fn item(msg_id: &str, text: &str) -> DebounceItem {
        DebounceItem {
            account: account("wx", "token"),
            event: text_event(msg_id, text),
            text: text.to_string(),
        }
    }

    #[test]
    fn unit_should_debounce_only_plain_text() {
        assert!(should_debounce(&text_event("1", "hello"), false));
        assert!(!should_debounce(&text_event("1", "/status"), false));
        assert!(!should_debounce(&text_event("1", "  /pair"), false));
        assert!(!should_debounce(&text_event("1", "hello"), true));
        let mut image = text_event("1", "x");
        image.msg_type = "image".to_string();
        assert!(!should_debounce(&image, false));
    }

    #[tokio::test(start_paused = true)]
    async fn functional_texts_inside_quiet_interval_flush_once_combined() {
        let sink = Arc::new(RecordingSink::default());
        let debouncer = InboundDebouncer::new(Duration::from_millis(1_000));

        debouncer.enqueue("wx:o-user", item("1", "a"), sink.clone());
        tokio::time::sleep(Duration::from_millis(600)).await;
        debouncer.enqueue("wx:o-user", item("2", "b"), sink.clone());
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert!(sink.texts().is_empty());

        tokio::time::sleep(Duration::from_millis(500)).await;
        tokio::task::yield_now().await;
        assert_eq!(sink.texts(), vec!["a\nb".to_string()]);
        let batches = sink.batches.lock().expect("batches");
        assert_eq!(batches[0].item_count, 2);
        assert_eq!(batches[0].carrier.event.msg_id.as_deref(), Some("2"));
        drop(batches);
        assert_eq!(debouncer.pending_keys(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn functional_subjects_are_flushed_independently() {
        let sink = Arc::new(RecordingSink::default());
        let debouncer = InboundDebouncer::new(Duration::from_millis(100));
        debouncer.enqueue("wx:a", item("1", "from a"), sink.clone());
        debouncer.enqueue("wx:b", item("2", "from b"), sink.clone());
        tokio::time::sleep(Duration::from_millis(150)).await;
        tokio::task::yield_now().await;
        let mut texts = sink.texts();
        texts.sort();
        assert_eq!(texts, vec!["from a".to_string(), "from b".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn regression_flush_now_cancels_pending_timer() {
        let sink = Arc::new(RecordingSink::default());
        let debouncer = InboundDebouncer::new(Duration::from_millis(100));
        debouncer.enqueue("wx:o-user", item("1", "queued"), sink.clone());

        let batch = debouncer.flush_now("wx:o-user").expect("batch");
        assert_eq!(batch.combined_text, "queued");
        assert!(debouncer.flush_now("wx:o-user").is_none());

        debouncer.enqueue("wx:o-user", item("2", "later"), sink.clone());
        tokio::time::sleep(Duration::from_millis(150)).await;
        tokio::task::yield_now().await;
        assert_eq!(sink.texts(), vec!["later".to_string()]);
    }

    #[test]
    fn unit_registry_shares_debouncer_per_interval() {
        let registry = DebouncerRegistry::new();
        assert!(registry.for_interval(0).is_none());
        let first = registry.for_interval(1_500).expect("debouncer");
        let second = registry.for_interval(1_500).expect("debouncer");
        assert!(Arc::ptr_eq(&first, &second));
        registry.for_interval(500).expect("debouncer");
        assert_eq!(registry.len(), 2);
    }
}
