use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use offset_common::RuntimeConfig;

#[derive(Debug, Default, Serialize, Deserialize)]
struct HistoryBlob {
    #[serde(default)]
    history: Vec<f32>,
}

/// JSON files under the data directory: `runtime.json` plus one
/// `learning/<slug>.json` per room.
#[derive(Clone)]
pub struct AppStore {
    runtime_path: Arc<PathBuf>,
    learning_dir: Arc<PathBuf>,
    lock: Arc<Mutex<()>>,
}

impl AppStore {
    pub fn from_env() -> Self {
        let data_dir = std::env::var("OFFSET_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./.local-offset"));
        Self::new(&data_dir)
    }

    pub fn new(data_dir: &Path) -> Self {
        Self {
            runtime_path: Arc::new(data_dir.join("runtime.json")),
            learning_dir: Arc::new(data_dir.join("learning")),
            lock: Arc::new(Mutex::new(())),
        }
    }

    pub async fn load_runtime_config(&self) -> anyhow::Result<RuntimeConfig> {
        let _guard = self.lock.lock().await;
        match tokio::fs::read(self.runtime_path.as_ref()).await {
            Ok(raw) => serde_json::from_slice::<RuntimeConfig>(&raw)
                .with_context(|| format!("invalid {}", self.runtime_path.display())),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(RuntimeConfig::default()),
            Err(err) => Err(err.into()),
        }
    }

    pub async fn save_runtime_config(&self, runtime: &RuntimeConfig) -> anyhow::Result<()> {
        let _guard = self.lock.lock().await;
        let payload = serde_json::to_vec_pretty(runtime)?;
        write_file(self.runtime_path.as_ref(), payload).await
    }

    pub async fn load_history(&self, slug: &str) -> anyhow::Result<Vec<f32>> {
        let path = self.history_path(slug);
        let _guard = self.lock.lock().await;
        match tokio::fs::read(&path).await {
            Ok(raw) => Ok(serde_json::from_slice::<HistoryBlob>(&raw)
                .with_context(|| format!("invalid {}", path.display()))?
                .history),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(Vec::new()),
            Err(err) => Err(err.into()),
        }
    }

    pub async fn save_history(&self, slug: &str, history: &[f32]) -> anyhow::Result<()> {
        let path = self.history_path(slug);
        let _guard = self.lock.lock().await;
        let payload = serde_json::to_vec_pretty(&HistoryBlob {
            history: history.to_vec(),
        })?;
        write_file(&path, payload).await
    }

    fn history_path(&self, slug: &str) -> PathBuf {
        self.learning_dir.join(format!("{slug}.json"))
    }
}

async fn write_file(path: &Path, payload: Vec<u8>) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    tokio::fs::write(path, payload)
        .await
        .with_context(|| format!("failed to write {}", path.display()))
}

#[cfg(test)]
mod tests {
    use offset_common::{RoomEntry, RoomOptions, RoomSettings};
    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    use super::*;

    #[tokio::test]
    async fn missing_files_load_as_defaults() {
        let dir = tempdir().unwrap();
        let store = AppStore::new(dir.path());

        let runtime = store.load_runtime_config().await.unwrap();
        assert!(runtime.rooms.is_empty());
        assert_eq!(runtime.timezone, "Europe/Berlin");
        assert!(store.load_history("office").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn history_survives_a_restart() {
        let dir = tempdir().unwrap();
        AppStore::new(dir.path())
            .save_history("living_room", &[1.5, 2.0])
            .await
            .unwrap();

        let reopened = AppStore::new(dir.path());
        assert_eq!(
            reopened.load_history("living_room").await.unwrap(),
            vec![1.5, 2.0]
        );

        let raw = std::fs::read_to_string(dir.path().join("learning/living_room.json")).unwrap();
        let blob: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(blob, serde_json::json!({ "history": [1.5, 2.0] }));
    }

    #[tokio::test]
    async fn runtime_config_round_trips_room_options() {
        let dir = tempdir().unwrap();
        let store = AppStore::new(dir.path());
        let mut runtime = RuntimeConfig::default();
        runtime.rooms.push(RoomEntry {
            data: RoomSettings::new("Office"),
            options: RoomOptions {
                tolerance: Some(0.5),
                ..RoomOptions::default()
            },
        });

        store.save_runtime_config(&runtime).await.unwrap();
        let loaded = store.load_runtime_config().await.unwrap();

        assert_eq!(loaded.rooms.len(), 1);
        assert_eq!(loaded.rooms[0].data.room_name, "Office");
        assert_eq!(loaded.rooms[0].options.tolerance, Some(0.5));
    }

    #[tokio::test]
    async fn corrupt_history_is_an_error() {
        let dir = tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("learning")).unwrap();
        std::fs::write(dir.path().join("learning/bath.json"), b"not json").unwrap();

        let store = AppStore::new(dir.path());
        assert!(store.load_history("bath").await.is_err());
    }
}
