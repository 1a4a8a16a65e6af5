//! Request history recording
//!
//! Every proxied exchange becomes one [`HttpItem`]. Records are queued to a
//! background task and written to a [`HistoryStore`]; persistence is best
//! effort and never delays the response path.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, warn};

/// One completed request/response exchange
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpItem {
    pub tracing_id: Option<u64>,
    pub method: String,
    pub url: String,
    pub request_raw: String,
    pub response_raw: String,
    pub code: u16,
    pub request_at: DateTime<Utc>,
    pub respond_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("History store unavailable: {0}")]
    Unavailable(String),
}

/// Destination for history records
#[async_trait]
pub trait HistoryStore: Send + Sync {
    async fn add(&self, item: HttpItem) -> Result<(), HistoryError>;
}

/// Keeps the most recent records in memory
#[derive(Debug)]
pub struct InMemoryHistoryStore {
    capacity: usize,
    items: RwLock<VecDeque<HttpItem>>,
}

impl InMemoryHistoryStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            items: RwLock::new(VecDeque::with_capacity(capacity.min(1024))),
        }
    }

    /// Snapshot of the stored records, oldest first
    pub async fn items(&self) -> Vec<HttpItem> {
        self.items.read().await.iter().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.items.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.items.read().await.is_empty()
    }
}

impl Default for InMemoryHistoryStore {
    fn default() -> Self {
        Self::new(1000)
    }
}

#[async_trait]
impl HistoryStore for InMemoryHistoryStore {
    async fn add(&self, item: HttpItem) -> Result<(), HistoryError> {
        let mut items = self.items.write().await;
        if items.len() == self.capacity {
            items.pop_front();
        }
        items.push_back(item);
        Ok(())
    }
}

/// Cloneable handle queueing records for a [`HistoryStore`].
///
/// Must be created inside a tokio runtime.
#[derive(Clone)]
pub struct HistoryRecorder {
    tx: mpsc::Sender<HttpItem>,
}

impl HistoryRecorder {
    pub fn new(store: Arc<dyn HistoryStore>, queue_size: usize) -> Self {
        let (tx, mut rx) = mpsc::channel::<HttpItem>(queue_size.max(1));

        tokio::spawn(async move {
            while let Some(item) = rx.recv().await {
                let tracing_id = item.tracing_id;
                if let Err(e) = store.add(item).await {
                    warn!("Failed to store history for request {:?}: {}", tracing_id, e);
                }
            }
            debug!("History recorder stopped");
        });

        Self { tx }
    }

    /// Queue a record; dropped with a warning if the queue is full
    pub fn record(&self, item: HttpItem) {
        if let Err(e) = self.tx.try_send(item) {
            warn!("Dropping history record: {}", e);
        }
    }
}

impl std::fmt::Debug for HistoryRecorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HistoryRecorder")
            .field("queued", &(self.tx.max_capacity() - self.tx.capacity()))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn item(code: u16) -> HttpItem {
        HttpItem {
            tracing_id: Some(code as u64),
            method: "GET".to_string(),
            url: "https://svc.example.com/".to_string(),
            request_raw: String::new(),
            response_raw: String::new(),
            code,
            request_at: Utc::now(),
            respond_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_in_memory_store_evicts_oldest() {
        let store = InMemoryHistoryStore::new(2);
        store.add(item(200)).await.unwrap();
        store.add(item(404)).await.unwrap();
        store.add(item(500)).await.unwrap();

        let codes: Vec<u16> = store.items().await.iter().map(|i| i.code).collect();
        assert_eq!(codes, vec![404, 500]);
    }

    /// Rejects informational codes and keeps the rest
    #[derive(Default)]
    struct FlakyStore {
        failures: AtomicUsize,
        inner: InMemoryHistoryStore,
    }

    #[async_trait]
    impl HistoryStore for FlakyStore {
        async fn add(&self, item: HttpItem) -> Result<(), HistoryError> {
            if item.code < 100 {
                self.failures.fetch_add(1, Ordering::SeqCst);
                return Err(HistoryError::Unavailable("disk full".to_string()));
            }
            self.inner.add(item).await
        }
    }

    #[tokio::test]
    async fn test_recorder_survives_failing_store() {
        let store = Arc::new(FlakyStore::default());
        let recorder = HistoryRecorder::new(store.clone(), 4);
        // Overflows the queue; only the first four are written, and all fail
        for code in 0..10 {
            recorder.record(item(code));
        }
        for _ in 0..100 {
            if store.failures.load(Ordering::SeqCst) == 4 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(store.failures.load(Ordering::SeqCst), 4);

        recorder.record(item(200));
        for _ in 0..100 {
            if !store.inner.is_empty().await {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let codes: Vec<u16> = store.inner.items().await.iter().map(|i| i.code).collect();
        assert_eq!(codes, vec![200]);
    }

    #[tokio::test]
    async fn test_recorder_writes_through() {
        let store = Arc::new(InMemoryHistoryStore::default());
        let recorder = HistoryRecorder::new(store.clone(), 16);

        recorder.record(item(201));

        for _ in 0..100 {
            if !store.is_empty().await {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(store.items().await[0].code, 201);
    }
}
