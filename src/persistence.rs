use std::{sync::Arc, time::Duration};

use anyhow::Context as _;
use tokio::{
    sync::{Mutex, mpsc},
    task::JoinHandle,
};

use crate::{history::PersistedHistory, storage::KeyValueArea};

pub const STORAGE_KEY: &str = "tabcapture.network.requests";
pub const DEFAULT_STORAGE_TIMEOUT_MS: u64 = 2000;

/// Whole-store load/save between the history store and a durable area.
///
/// At most one blocking storage call runs at a time. A call that outlives the
/// timeout is kept and awaited before the next one starts, so an older
/// snapshot can never land after a newer one.
#[derive(Debug, Clone)]
pub struct PersistenceBridge {
    area: Arc<dyn KeyValueArea>,
    timeout: Duration,
    overdue: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl PersistenceBridge {
    pub fn new(area: Arc<dyn KeyValueArea>, timeout: Duration) -> Self {
        Self {
            area,
            timeout,
            overdue: Arc::new(Mutex::new(None)),
        }
    }

    /// Loads the persisted store. Any failure is logged and yields an empty store.
    pub async fn load_all(&self) -> PersistedHistory {
        match self.try_load_all().await {
            Ok(persisted) => {
                tracing::debug!(tabs = persisted.len(), "loaded persisted capture history");
                persisted
            }
            Err(err) => {
                tracing::warn!("failed to load persisted capture history: {err:#}");
                PersistedHistory::new()
            }
        }
    }

    pub async fn try_load_all(&self) -> anyhow::Result<PersistedHistory> {
        let area = Arc::clone(&self.area);
        let raw = self
            .run_blocking("load", move || area.get(STORAGE_KEY))
            .await?;
        let Some(raw) = raw else {
            return Ok(PersistedHistory::new());
        };
        serde_json::from_str(&raw).context("parse persisted capture history")
    }

    /// Saves the whole store. Failures are logged; the in-memory store stays authoritative.
    pub async fn save_all(&self, persisted: &PersistedHistory) -> bool {
        match self.try_save_all(persisted).await {
            Ok(()) => true,
            Err(err) => {
                tracing::warn!("failed to save capture history: {err:#}");
                false
            }
        }
    }

    pub async fn try_save_all(&self, persisted: &PersistedHistory) -> anyhow::Result<()> {
        let raw = serde_json::to_string(persisted).context("serialize capture history")?;
        let area = Arc::clone(&self.area);
        self.run_blocking("save", move || area.set(STORAGE_KEY, &raw))
            .await
    }

    async fn run_blocking<T, F>(&self, operation: &'static str, task: F) -> anyhow::Result<T>
    where
        T: Send + 'static,
        F: FnOnce() -> anyhow::Result<T> + Send + 'static,
    {
        let mut overdue = self.overdue.lock().await;
        if let Some(previous) = overdue.take() {
            tracing::debug!(operation, "waiting for overdue storage task before starting");
            if let Err(err) = previous.await {
                tracing::warn!("overdue storage task did not finish cleanly: {err}");
            }
        }

        let mut join = tokio::task::spawn_blocking(task);
        match tokio::time::timeout(self.timeout, &mut join).await {
            Ok(joined) => joined.with_context(|| format!("join storage {operation} task"))?,
            Err(_) => {
                let timeout_ms = u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX);
                tracing::warn!(
                    operation,
                    timeout_ms,
                    "storage task timed out; next storage call waits for it"
                );
                *overdue = Some(tokio::spawn(async move {
                    if let Ok(Err(err)) = join.await {
                        tracing::warn!("overdue storage {operation} failed: {err:#}");
                    }
                }));
                anyhow::bail!("storage {operation} timed out after {timeout_ms}ms")
            }
        }
    }
}

/// Fire-and-forget save requests for the background writer.
#[derive(Debug, Clone)]
pub struct PersistenceHandle {
    tx: mpsc::UnboundedSender<PersistedHistory>,
}

impl PersistenceHandle {
    /// A handle paired with the receiving end, for callers that drive saves themselves.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<PersistedHistory>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn save(&self, persisted: PersistedHistory) {
        if self.tx.send(persisted).is_err() {
            tracing::warn!("capture history writer stopped; snapshot not persisted");
        }
    }
}

/// Spawns the writer task. Queued snapshots are coalesced so only the newest
/// one is written; the task flushes and exits once every handle is dropped.
pub fn spawn_writer(
    bridge: PersistenceBridge,
) -> (PersistenceHandle, tokio::task::JoinHandle<()>) {
    let (handle, mut rx) = PersistenceHandle::channel();
    let join = tokio::spawn(async move {
        while let Some(mut latest) = rx.recv().await {
            let mut coalesced = 0usize;
            while let Ok(next) = rx.try_recv() {
                latest = next;
                coalesced += 1;
            }
            if coalesced > 0 {
                tracing::trace!(coalesced, "coalesced queued history snapshots");
            }
            bridge.save_all(&latest).await;
        }
        tracing::debug!("capture history writer stopped");
    });
    (handle, join)
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            Arc,
            atomic::{AtomicBool, Ordering},
        },
        time::Duration,
    };

    use super::{PersistenceBridge, STORAGE_KEY, spawn_writer};
    use crate::{
        history::{HistoryStore, PersistedHistory, tests::entry},
        storage::{KeyValueArea, MemoryArea, SqliteArea},
    };

    #[derive(Debug)]
    struct FailingArea;

    impl KeyValueArea for FailingArea {
        fn get(&self, _key: &str) -> anyhow::Result<Option<String>> {
            anyhow::bail!("storage unavailable")
        }

        fn set(&self, _key: &str, _value: &str) -> anyhow::Result<()> {
            anyhow::bail!("storage unavailable")
        }
    }

    #[derive(Debug)]
    struct StuckArea;

    impl KeyValueArea for StuckArea {
        fn get(&self, _key: &str) -> anyhow::Result<Option<String>> {
            std::thread::sleep(Duration::from_millis(500));
            Ok(None)
        }

        fn set(&self, _key: &str, _value: &str) -> anyhow::Result<()> {
            std::thread::sleep(Duration::from_millis(500));
            Ok(())
        }
    }

    /// Stalls the first write past the bridge timeout, then behaves like `MemoryArea`.
    #[derive(Debug, Default)]
    struct SlowFirstWriteArea {
        inner: MemoryArea,
        stalled: AtomicBool,
    }

    impl KeyValueArea for SlowFirstWriteArea {
        fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
            self.inner.get(key)
        }

        fn set(&self, key: &str, value: &str) -> anyhow::Result<()> {
            if !self.stalled.swap(true, Ordering::SeqCst) {
                std::thread::sleep(Duration::from_millis(300));
            }
            self.inner.set(key, value)
        }
    }

    fn sample_history() -> PersistedHistory {
        let mut store = HistoryStore::new(10);
        store.append(7, entry("https://a.test/1", 3.0));
        store.append(7, entry("https://a.test/2", 4.0));
        store.append(9, entry("https://b.test/", 5.0));
        store.to_persisted()
    }

    #[tokio::test]
    async fn save_then_load_round_trips_through_sqlite() {
        let temp_dir = tempfile::tempdir().unwrap();
        let area = SqliteArea::open(temp_dir.path().join("capture.db")).unwrap();
        let bridge = PersistenceBridge::new(Arc::new(area), Duration::from_secs(5));

        let history = sample_history();
        assert!(bridge.save_all(&history).await);
        assert_eq!(bridge.load_all().await, history);
    }

    #[tokio::test]
    async fn missing_record_loads_as_empty_store() {
        let bridge = PersistenceBridge::new(Arc::new(MemoryArea::default()), Duration::from_secs(1));
        assert!(bridge.load_all().await.is_empty());
    }

    #[tokio::test]
    async fn malformed_record_loads_as_empty_store() {
        let area = MemoryArea::default();
        area.set(STORAGE_KEY, r#"{"7": "not a list"}"#).unwrap();
        let bridge = PersistenceBridge::new(Arc::new(area), Duration::from_secs(1));

        assert!(bridge.try_load_all().await.is_err());
        assert!(bridge.load_all().await.is_empty());
    }

    #[tokio::test]
    async fn storage_failures_are_not_fatal() {
        let bridge = PersistenceBridge::new(Arc::new(FailingArea), Duration::from_secs(1));
        assert!(bridge.load_all().await.is_empty());
        assert!(!bridge.save_all(&sample_history()).await);
    }

    #[tokio::test]
    async fn slow_storage_is_bounded_by_timeout() {
        let bridge = PersistenceBridge::new(Arc::new(StuckArea), Duration::from_millis(20));
        let err = bridge.try_load_all().await.unwrap_err();
        assert!(err.to_string().contains("timed out"), "unexpected error: {err}");
        assert!(!bridge.save_all(&sample_history()).await);
    }

    #[tokio::test]
    async fn writer_persists_newest_snapshot_and_flushes_on_drop() {
        let area = MemoryArea::default();
        let bridge = PersistenceBridge::new(Arc::new(area.clone()), Duration::from_secs(5));
        let (handle, join) = spawn_writer(bridge.clone());

        handle.save(PersistedHistory::new());
        let history = sample_history();
        handle.save(history.clone());
        drop(handle);
        join.await.unwrap();

        assert_eq!(bridge.load_all().await, history);
    }

    #[tokio::test]
    async fn timed_out_write_cannot_overwrite_newer_snapshot() {
        let area = Arc::new(SlowFirstWriteArea::default());
        let bridge = PersistenceBridge::new(area.clone(), Duration::from_millis(50));
        let (handle, join) = spawn_writer(bridge.clone());

        handle.save(sample_history());
        tokio::time::sleep(Duration::from_millis(20)).await;
        handle.save(PersistedHistory::new());
        drop(handle);
        join.await.unwrap();

        assert_eq!(bridge.load_all().await, PersistedHistory::new());
        assert!(area.inner.get(STORAGE_KEY).unwrap().is_some());
    }
}
