use std::fs;
use std::path::PathBuf;

use serde_json::json;

use crate::config::AppConfig;
use crate::logging::{LogLevel, Logger};

use super::{
    expand_home_path, MemoryQueueStore, PersistedJob, QueueStore, SledMode, SledQueueStore,
    StorageEngine, StorageError,
};

/// Engine-agnostic entry point the broker holds on to; selects the backend from config.
pub struct StorageFacade {
    engine: StorageEngine,
    data_path: Option<PathBuf>,
    backend: Box<dyn QueueStore>,
}

impl StorageFacade {
    pub fn initialize(app_config: &AppConfig, logger: &Logger) -> Result<Self, StorageError> {
        let Some(engine) = StorageEngine::parse(&app_config.storage.engine) else {
            return Err(StorageError::UnsupportedEngine {
                engine: app_config.storage.engine.clone(),
            });
        };

        let (backend, data_path): (Box<dyn QueueStore>, Option<PathBuf>) = match engine {
            StorageEngine::Memory => (Box::new(MemoryQueueStore::new()), None),
            StorageEngine::Sled => {
                let data_path = expand_home_path(&app_config.storage.path)?;
                let mode = app_config
                    .storage
                    .sled
                    .mode
                    .as_deref()
                    .map(|raw| {
                        SledMode::parse(raw).ok_or_else(|| StorageError::InvalidSledMode {
                            mode: raw.to_owned(),
                        })
                    })
                    .transpose()?;

                fs::create_dir_all(&data_path).map_err(|source| StorageError::CreateDataDir {
                    path: data_path.clone(),
                    source,
                })?;

                let store = SledQueueStore::open(
                    &data_path,
                    app_config.storage.sled.cache_capacity,
                    mode,
                )?;
                (Box::new(store), Some(data_path))
            }
        };

        logger.log(
            LogLevel::Info,
            Some("storage::init"),
            "Queue store initialized",
            Some(json!({
                "engine": engine.as_str(),
                "durable": engine.is_durable(),
                "configured_path": app_config.storage.path,
                "resolved_path": data_path.as_ref().map(|path| path.display().to_string()),
                "sled": {
                    "cache_capacity": app_config.storage.sled.cache_capacity,
                    "mode": app_config.storage.sled.mode
                }
            })),
        );

        Ok(Self {
            engine,
            data_path,
            backend,
        })
    }

    pub fn in_memory() -> Self {
        Self {
            engine: StorageEngine::Memory,
            data_path: None,
            backend: Box::new(MemoryQueueStore::new()),
        }
    }

    pub fn engine(&self) -> StorageEngine {
        self.engine
    }

    pub fn data_path(&self) -> Option<&PathBuf> {
        self.data_path.as_ref()
    }
}

impl QueueStore for StorageFacade {
    fn flush(&self) -> Result<(), StorageError> {
        self.backend.flush()
    }

    fn enqueue(&self, job: &PersistedJob) -> Result<(), StorageError> {
        self.backend.enqueue(job)
    }

    fn dequeue_next(&self, function_name: &str) -> Result<Option<PersistedJob>, StorageError> {
        self.backend.dequeue_next(function_name)
    }

    fn remove(&self, handle: &str) -> Result<(), StorageError> {
        self.backend.remove(handle)
    }

    fn functions(&self) -> Result<Vec<String>, StorageError> {
        self.backend.functions()
    }
}
