use std::sync::Arc;
use std::time::Instant;
use tokio::runtime::Handle;
use zbus::interface;

use crate::store::{Store, StoreError};
use vigil_core::pipeline::PipelineCounters;
use vigil_core::LabelDirectory;

pub const BUS_NAME: &str = "org.freedesktop.Vigil1";
pub const OBJECT_PATH: &str = "/org/freedesktop/Vigil1";

/// Admin interface for the Vigil daemon.
///
/// Bus name: org.freedesktop.Vigil1
/// Object path: /org/freedesktop/Vigil1
///
/// SQLite queries and label reloads run on the tokio blocking pool so a slow
/// disk never stalls the bus connection's executor.
pub struct VigilService {
    store: Arc<Store>,
    labels: Arc<LabelDirectory>,
    counters: Arc<PipelineCounters>,
    runtime: Handle,
    camera_device: String,
    threshold: f32,
    started: Instant,
}

impl VigilService {
    pub fn new(
        store: Arc<Store>,
        labels: Arc<LabelDirectory>,
        counters: Arc<PipelineCounters>,
        runtime: Handle,
        camera_device: String,
        threshold: f32,
    ) -> Self {
        Self {
            store,
            labels,
            counters,
            runtime,
            camera_device,
            threshold,
            started: Instant::now(),
        }
    }

    fn status_json(&self) -> serde_json::Value {
        serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "camera": self.camera_device,
            "uptime_secs": self.started.elapsed().as_secs(),
            "labels": self.labels.len(),
            "confidence_threshold": self.threshold,
            "pipeline": self.counters.snapshot(),
        })
    }

    /// Run a store request on the blocking pool.
    async fn with_store<T, F>(&self, request: F) -> zbus::fdo::Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Store) -> Result<T, StoreError> + Send + 'static,
    {
        let store = Arc::clone(&self.store);
        match self.runtime.spawn_blocking(move || request(&store)).await {
            Ok(result) => result.map_err(store_error),
            Err(e) => {
                tracing::error!(error = %e, "store task failed");
                Err(zbus::fdo::Error::Failed(e.to_string()))
            }
        }
    }
}

fn reload(labels: &LabelDirectory) -> Result<u32, vigil_core::DirectoryError> {
    let count = labels.reload()?;
    Ok(u32::try_from(count).unwrap_or(u32::MAX))
}

fn logs_json(store: &Store, limit: u32) -> Result<String, StoreError> {
    to_json(&store.recent_logs(limit)?)
}

fn analytics_json(store: &Store, days: u32) -> Result<String, StoreError> {
    let today = chrono::Utc::now().date_naive();
    to_json(&store.analytics(days, today)?)
}

fn blacklist_json(store: &Store) -> Result<String, StoreError> {
    to_json(&store.list_blacklist()?)
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String, StoreError> {
    // Store rows always serialize; an empty list is the safe fallback.
    Ok(serde_json::to_string(value).unwrap_or_else(|_| "[]".into()))
}

fn store_error(err: StoreError) -> zbus::fdo::Error {
    match err {
        StoreError::NotFound(_) | StoreError::EmptyName => {
            zbus::fdo::Error::InvalidArgs(err.to_string())
        }
        other => {
            tracing::error!(error = %other, "store request failed");
            zbus::fdo::Error::Failed(other.to_string())
        }
    }
}

#[interface(name = "org.freedesktop.Vigil1")]
impl VigilService {
    /// Re-read the label directory. Returns the number of identities loaded.
    async fn reload_labels(&self) -> zbus::fdo::Result<u32> {
        tracing::info!("reload_labels requested");
        let labels = Arc::clone(&self.labels);
        let result = self
            .runtime
            .spawn_blocking(move || reload(&labels))
            .await
            .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;
        result.map_err(|e| {
            tracing::warn!(error = %e, "label reload failed; keeping previous labels");
            zbus::fdo::Error::Failed(e.to_string())
        })
    }

    /// Return daemon status information as JSON.
    async fn status(&self) -> zbus::fdo::Result<String> {
        Ok(self.status_json().to_string())
    }

    /// Newest-first recognition log rows as JSON.
    async fn recent_logs(&self, limit: u32) -> zbus::fdo::Result<String> {
        self.with_store(move |store| logs_json(store, limit)).await
    }

    /// Per-day counts and top names over the last `days` days as JSON.
    async fn analytics(&self, days: u32) -> zbus::fdo::Result<String> {
        self.with_store(move |store| analytics_json(store, days)).await
    }

    async fn list_blacklist(&self) -> zbus::fdo::Result<String> {
        self.with_store(blacklist_json).await
    }

    /// Add an active blacklist entry. Empty `notes` means none.
    async fn add_blacklist(&self, name: &str, notes: &str) -> zbus::fdo::Result<i64> {
        tracing::info!(name, "add_blacklist requested");
        let (name, notes) = (name.to_string(), notes.to_string());
        self.with_store(move |store| store.add_blacklist(&name, Some(&notes)))
            .await
    }

    /// Flip an entry's active flag. Returns the new state.
    async fn toggle_blacklist(&self, id: i64) -> zbus::fdo::Result<bool> {
        tracing::info!(id, "toggle_blacklist requested");
        self.with_store(move |store| store.toggle_blacklist(id)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vigil_core::labels::LabelMapFile;
    use vigil_core::LogEntry;

    fn service(dir: &std::path::Path) -> VigilService {
        let labels_path = dir.join("label_map.json");
        std::fs::write(&labels_path, r#"{"0": "alice", "1": "bob"}"#).unwrap();
        let labels = Arc::new(LabelDirectory::new(Box::new(LabelMapFile::new(&labels_path))));
        VigilService::new(
            Arc::new(Store::open_in_memory().unwrap()),
            labels,
            Arc::default(),
            Handle::current(),
            "/dev/video0".into(),
            70.0,
        )
    }

    #[tokio::test]
    async fn test_reload_and_status() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(dir.path());
        assert_eq!(service.status_json()["labels"], 0);

        assert_eq!(service.reload_labels().await.unwrap(), 2);
        let status = service.status_json();
        assert_eq!(status["labels"], 2);
        assert_eq!(status["camera"], "/dev/video0");
        assert_eq!(status["pipeline"]["alerts"], 0);
    }

    #[tokio::test]
    async fn test_failed_reload_keeps_labels() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(dir.path());
        service.reload_labels().await.unwrap();
        std::fs::write(dir.path().join("label_map.json"), "not json").unwrap();
        assert!(service.reload_labels().await.is_err());
        assert_eq!(service.labels.len(), 2);
    }

    #[tokio::test]
    async fn test_logs_and_blacklist_json() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(dir.path());
        service
            .store
            .append_log(&LogEntry {
                name: "alice".into(),
                confidence: 41.0,
                timestamp: chrono::Utc::now(),
            })
            .unwrap();
        let logs: serde_json::Value =
            serde_json::from_str(&service.recent_logs(20).await.unwrap()).unwrap();
        assert_eq!(logs[0]["name"], "alice");

        let id = service.add_blacklist("mallory", "").await.unwrap();
        let list: serde_json::Value =
            serde_json::from_str(&service.list_blacklist().await.unwrap()).unwrap();
        assert_eq!(list[0]["id"], id);
        assert!(list[0]["notes"].is_null());

        assert!(!service.toggle_blacklist(id).await.unwrap());
        assert!(matches!(
            service.toggle_blacklist(id + 100).await,
            Err(zbus::fdo::Error::InvalidArgs(_))
        ));

        let stats: serde_json::Value =
            serde_json::from_str(&service.analytics(14).await.unwrap()).unwrap();
        assert_eq!(stats["daily"].as_array().unwrap().len(), 14);
        assert_eq!(stats["top_names"][0]["name"], "alice");
    }

    #[test]
    fn test_store_requests_run_off_the_calling_thread() {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .build()
            .unwrap();
        let dir = tempfile::tempdir().unwrap();
        let service = {
            let _guard = runtime.enter();
            service(dir.path())
        };

        // Awaited from a plain executor, the way the bus connection drives
        // handlers. The query itself runs on the runtime's blocking pool.
        let caller = std::thread::current().id();
        let store_thread = futures::executor::block_on(
            service.with_store(|_store| Ok(std::thread::current().id())),
        )
        .unwrap();
        assert_ne!(store_thread, caller);

        let logs = futures::executor::block_on(service.recent_logs(5)).unwrap();
        assert_eq!(logs, "[]");
    }

    #[test]
    fn test_store_error_mapping() {
        assert!(matches!(
            store_error(StoreError::NotFound(3)),
            zbus::fdo::Error::InvalidArgs(_)
        ));
    }
}
