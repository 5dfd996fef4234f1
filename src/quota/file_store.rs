//! A [`CounterStore`] persisted as a small JSON document.
//!
//! This is what the CLI uses by default, so that usage survives between
//! invocations without any server. Updates are serialized by an in-process
//! lock and written through a temporary file plus rename. Two processes
//! sharing one file can still race; use the Redis store for that.

use std::{collections::BTreeMap, io, time::Duration};

use chrono::Utc;
use tokio::{fs, sync::Mutex};

use crate::prelude::*;

use super::store::{CounterStore, StoreError, StoreResult};

/// On-disk layout.
#[derive(Debug, Default, Deserialize, Serialize)]
struct CounterFile {
    #[serde(default)]
    counters: BTreeMap<String, FileEntry>,
}

/// A single counter. `expires_at` is a Unix timestamp in seconds.
#[derive(Clone, Copy, Debug, Deserialize, Serialize)]
struct FileEntry {
    value: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    expires_at: Option<i64>,
}

impl FileEntry {
    fn is_live(&self, now: i64) -> bool {
        self.expires_at.is_none_or(|deadline| deadline > now)
    }
}

/// Counters stored in a JSON file.
#[derive(Debug)]
pub struct FileCounterStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileCounterStore {
    /// Use the file at `path`, which need not exist yet.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    /// The backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn load(&self) -> StoreResult<CounterFile> {
        let mut file = match fs::read(&self.path).await {
            Ok(bytes) => serde_json::from_slice::<CounterFile>(&bytes).map_err(|err| {
                StoreError::Corrupt(format!("{}: {err}", self.path.display()))
            })?,
            Err(err) if err.kind() == io::ErrorKind::NotFound => CounterFile::default(),
            Err(err) => {
                return Err(StoreError::Unavailable(format!(
                    "{}: {err}",
                    self.path.display()
                )));
            }
        };
        let now = Utc::now().timestamp();
        file.counters.retain(|_, entry| entry.is_live(now));
        Ok(file)
    }

    async fn save(&self, file: &CounterFile) -> StoreResult<()> {
        let json = serde_json::to_vec_pretty(file)
            .map_err(|err| StoreError::Corrupt(err.to_string()))?;
        let mut tmp_path = self.path.clone().into_os_string();
        tmp_path.push(".tmp");
        let tmp_path = PathBuf::from(tmp_path);
        let unavailable =
            |err: io::Error| StoreError::Unavailable(format!("{}: {err}", self.path.display()));
        fs::write(&tmp_path, json).await.map_err(unavailable)?;
        fs::rename(&tmp_path, &self.path).await.map_err(unavailable)?;
        Ok(())
    }
}

#[async_trait]
impl CounterStore for FileCounterStore {
    async fn get(&self, key: &str) -> StoreResult<u64> {
        let _guard = self.lock.lock().await;
        let file = self.load().await?;
        Ok(file.counters.get(key).map(|entry| entry.value).unwrap_or(0))
    }

    #[instrument(level = "trace", skip(self))]
    async fn incr(&self, key: &str) -> StoreResult<u64> {
        let _guard = self.lock.lock().await;
        let mut file = self.load().await?;
        let entry = file.counters.entry(key.to_owned()).or_insert(FileEntry {
            value: 0,
            expires_at: None,
        });
        entry.value += 1;
        let value = entry.value;
        self.save(&file).await?;
        Ok(value)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<()> {
        let _guard = self.lock.lock().await;
        let mut file = self.load().await?;
        let ttl_secs = i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX);
        if let Some(entry) = file.counters.get_mut(key) {
            entry.expires_at = Some(Utc::now().timestamp().saturating_add(ttl_secs));
            self.save(&file).await?;
        }
        Ok(())
    }

    async fn set(&self, key: &str, value: u64) -> StoreResult<()> {
        let _guard = self.lock.lock().await;
        let mut file = self.load().await?;
        file.counters.insert(
            key.to_owned(),
            FileEntry {
                value,
                expires_at: None,
            },
        );
        self.save(&file).await
    }
}
