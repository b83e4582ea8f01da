mod backend;
mod engine;
mod error;
mod facade;
mod memory_backend;
mod path;
mod sled_backend;

pub use backend::{PersistedJob, QueueStore};
pub use engine::{SledMode, StorageEngine};
pub use error::StorageError;
pub use facade::StorageFacade;
pub use memory_backend::MemoryQueueStore;
use path::expand_home_path;
pub use sled_backend::SledQueueStore;

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use crate::config::AppConfig;
    use crate::logging::Logger;
    use crate::orchestrator::jobs::Priority;

    use super::{
        expand_home_path, MemoryQueueStore, PersistedJob, QueueStore, SledQueueStore,
        StorageEngine, StorageError, StorageFacade,
    };

    fn unique_temp_path(label: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!(
            "gearhop-storage-test-{label}-{}-{}",
            std::process::id(),
            Utc::now().timestamp_nanos_opt().unwrap_or_default()
        ))
    }

    fn record(handle: &str, function_name: &str, priority: Priority, sequence: u64) -> PersistedJob {
        PersistedJob {
            handle: handle.to_owned(),
            function_name: function_name.to_owned(),
            unique_key: None,
            priority,
            sequence,
            payload: format!("payload-{sequence}").into_bytes(),
            created_at: Utc::now(),
        }
    }

    fn drain(store: &dyn QueueStore, function_name: &str) -> Vec<String> {
        let mut handles = Vec::new();
        while let Some(job) = store.dequeue_next(function_name).expect("dequeue should work") {
            handles.push(job.handle);
        }
        handles
    }

    // Exercises ordering, hand-out bookkeeping and removal against any engine; `reopen`
    // must return a store over the same data with a fresh hand-out set.
    fn exercise_store<S: QueueStore>(store: S, reopen: impl FnOnce(S) -> S) {
        store.enqueue(&record("H:t:1", "resize", Priority::Normal, 1)).expect("enqueue");
        store.enqueue(&record("H:t:2", "resize", Priority::Low, 2)).expect("enqueue");
        store.enqueue(&record("H:t:3", "resize", Priority::High, 3)).expect("enqueue");
        store.enqueue(&record("H:t:4", "resize-large", Priority::High, 4)).expect("enqueue");

        // Records enqueued by this process are already held in memory.
        assert!(store.dequeue_next("resize").expect("dequeue").is_none());
        assert_eq!(
            store.functions().expect("functions"),
            vec!["resize".to_owned(), "resize-large".to_owned()]
        );

        store.remove("H:t:1").expect("remove");
        store.remove("H:t:missing").expect("removing an unknown handle is a no-op");
        store.flush().expect("flush");

        let store = reopen(store);
        assert_eq!(drain(&store, "resize"), vec!["H:t:3", "H:t:2"]);
        assert_eq!(drain(&store, "resize-large"), vec!["H:t:4"]);
        assert!(drain(&store, "unknown").is_empty());
    }

    #[test]
    fn memory_store_orders_by_tier_then_sequence() {
        exercise_store(MemoryQueueStore::new(), |store| {
            store.reopen();
            store
        });
    }

    #[test]
    fn sled_store_survives_reopen() {
        let path = unique_temp_path("sled-reopen");
        let open = |path: &std::path::Path| {
            SledQueueStore::open(path, None, None).expect("sled store should open")
        };

        exercise_store(open(&path), |store| {
            drop(store);
            open(&path)
        });

        let _ = std::fs::remove_dir_all(path);
    }

    #[test]
    fn facade_selects_engine_from_config() {
        let mut app_config = AppConfig::default();
        app_config.storage.engine = "memory".to_owned();
        let facade = StorageFacade::initialize(&app_config, &Logger::silent())
            .expect("memory facade should initialize");
        assert_eq!(facade.engine(), StorageEngine::Memory);
        assert!(facade.data_path().is_none());

        let path = unique_temp_path("facade");
        app_config.storage.engine = "sled".to_owned();
        app_config.storage.path = path.to_string_lossy().to_string();
        let facade = StorageFacade::initialize(&app_config, &Logger::silent())
            .expect("sled facade should initialize");
        assert_eq!(facade.engine(), StorageEngine::Sled);
        assert_eq!(facade.data_path(), Some(&path));
        drop(facade);
        let _ = std::fs::remove_dir_all(path);

        app_config.storage.engine = "postgres".to_owned();
        let err = StorageFacade::initialize(&app_config, &Logger::silent())
            .err()
            .expect("unknown engine should fail");
        assert!(matches!(err, StorageError::UnsupportedEngine { .. }));
    }

    #[test]
    fn facade_rejects_unknown_sled_mode() {
        let mut app_config = AppConfig::default();
        app_config.storage.path = unique_temp_path("bad-mode").to_string_lossy().to_string();
        app_config.storage.sled.mode = Some("turbo".to_owned());

        let err = StorageFacade::initialize(&app_config, &Logger::silent())
            .err()
            .expect("unknown mode should fail");
        assert!(matches!(err, StorageError::InvalidSledMode { .. }));
    }

    #[test]
    fn expands_home_prefixes() {
        let home = std::env::var("HOME").expect("HOME should be available in tests");
        let expected = std::path::Path::new(&home).join(".gearhop/data");

        assert_eq!(expand_home_path("~/.gearhop/data").expect("tilde"), expected);
        assert_eq!(expand_home_path("$HOME/.gearhop/data").expect("env"), expected);
        assert_eq!(
            expand_home_path("/var/lib/gearhop").expect("absolute"),
            std::path::PathBuf::from("/var/lib/gearhop")
        );
    }
}
