use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Invalid slot name: {0:?}")]
    InvalidSlotName(String),
}

pub type Result<T> = std::result::Result<T, PersistenceError>;

/// Named JSON blobs (`input`, `signatures`, `prices-valid`, ...)
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// `Ok(None)` when the slot has never been written
    async fn load(&self, name: &str) -> Result<Option<Value>>;

    async fn save(&self, name: &str, value: &Value) -> Result<()>;
}

/// Load a slot and deserialize it
pub async fn load_json<T, S>(store: &S, name: &str) -> Result<Option<T>>
where
    T: DeserializeOwned,
    S: BlobStore + ?Sized,
{
    match store.load(name).await? {
        Some(value) => Ok(Some(serde_json::from_value(value)?)),
        None => Ok(None),
    }
}

/// Serialize a value and save it under `name`
pub async fn save_json<T, S>(store: &S, name: &str, value: &T) -> Result<()>
where
    T: Serialize + ?Sized,
    S: BlobStore + ?Sized,
{
    let value = serde_json::to_value(value)?;
    store.save(name, &value).await
}

fn validate_slot_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(PersistenceError::InvalidSlotName(name.to_string()))
    }
}

/// Stores each slot as pretty-printed `<dir>/<name>.json`.
///
/// Writes go to a temporary file in the same directory and are renamed into
/// place, so readers never observe a partial file.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    dir: PathBuf,
}

impl JsonFileStore {
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;
        info!("Using JSON file store at {}", dir.display());
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn slot_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}.json", name))
    }
}

#[async_trait]
impl BlobStore for JsonFileStore {
    async fn load(&self, name: &str) -> Result<Option<Value>> {
        validate_slot_name(name)?;
        let path = self.slot_path(name);

        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        debug!("Loaded {} ({} bytes)", path.display(), bytes.len());
        Ok(Some(serde_json::from_slice(&bytes)?))
    }

    async fn save(&self, name: &str, value: &Value) -> Result<()> {
        validate_slot_name(name)?;
        let path = self.slot_path(name);
        let tmp_path = self.dir.join(format!(".{}.{}.tmp", name, Uuid::new_v4()));

        let bytes = serde_json::to_vec_pretty(value)?;
        tokio::fs::write(&tmp_path, &bytes).await?;
        if let Err(e) = tokio::fs::rename(&tmp_path, &path).await {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(e.into());
        }

        debug!("Saved {} ({} bytes)", path.display(), bytes.len());
        Ok(())
    }
}

/// In-memory store for tests and dry runs
#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    slots: Mutex<HashMap<String, Value>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn with_slot(self, name: &str, value: Value) -> Self {
        self.slots.lock().await.insert(name.to_string(), value);
        self
    }

    pub async fn slot_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.slots.lock().await.keys().cloned().collect();
        names.sort();
        names
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn load(&self, name: &str) -> Result<Option<Value>> {
        validate_slot_name(name)?;
        Ok(self.slots.lock().await.get(name).cloned())
    }

    async fn save(&self, name: &str, value: &Value) -> Result<()> {
        validate_slot_name(name)?;
        self.slots.lock().await.insert(name.to_string(), value.clone());
        Ok(())
    }
}
