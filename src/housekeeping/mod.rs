use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{json, Value};

use crate::config::HousekeepingConfig;
use crate::logging::{LogLevel, Logger};
use crate::server::Broker;

pub const MIN_INTERVAL_MS: u64 = 10;
pub const MAX_INTERVAL_MS: u64 = 60_000;
const STOP_CHECK_MS: u64 = 25;
const LOG_CONTEXT: &str = "housekeeping";

#[derive(Debug)]
pub enum HousekeeperError {
    InvalidInterval { provided_ms: u64 },
    AlreadyRunning,
    JoinFailed,
}

impl fmt::Display for HousekeeperError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidInterval { provided_ms } => write!(
                f,
                "housekeeping interval must be between {MIN_INTERVAL_MS}ms and {MAX_INTERVAL_MS}ms, got {provided_ms}ms"
            ),
            Self::AlreadyRunning => write!(f, "housekeeper is already running"),
            Self::JoinFailed => write!(f, "housekeeper thread join failed"),
        }
    }
}

impl std::error::Error for HousekeeperError {}

/// Periodically evicts finished jobs past their retention window.
pub struct Housekeeper {
    pub initiated_at: DateTime<Utc>,
    interval_ms: u64,
    broker: Arc<Broker>,
    logger: Arc<Logger>,
    stop_signal: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl Housekeeper {
    pub fn new(
        broker: Arc<Broker>,
        logger: Arc<Logger>,
        config: &HousekeepingConfig,
    ) -> Result<Self, HousekeeperError> {
        if !(MIN_INTERVAL_MS..=MAX_INTERVAL_MS).contains(&config.interval_ms) {
            return Err(HousekeeperError::InvalidInterval {
                provided_ms: config.interval_ms,
            });
        }

        Ok(Self {
            initiated_at: Utc::now(),
            interval_ms: config.interval_ms,
            broker,
            logger,
            stop_signal: Arc::new(AtomicBool::new(false)),
            worker: None,
        })
    }

    pub fn start(&mut self) -> Result<(), HousekeeperError> {
        if self.worker.is_some() {
            return Err(HousekeeperError::AlreadyRunning);
        }

        self.stop_signal.store(false, Ordering::SeqCst);
        let stop_signal = Arc::clone(&self.stop_signal);
        let broker = Arc::clone(&self.broker);
        let logger = Arc::clone(&self.logger);
        let interval = Duration::from_millis(self.interval_ms);

        self.worker = Some(thread::spawn(move || {
            let mut next_run = Instant::now() + interval;
            while !stop_signal.load(Ordering::SeqCst) {
                if Instant::now() >= next_run {
                    sweep_once(&broker, &logger, Utc::now());
                    next_run = Instant::now() + interval;
                }
                thread::sleep(Duration::from_millis(STOP_CHECK_MS).min(interval));
            }
        }));

        Ok(())
    }

    pub fn stop(&mut self) -> Result<(), HousekeeperError> {
        self.stop_signal.store(true, Ordering::SeqCst);

        if let Some(handle) = self.worker.take() {
            return handle.join().map_err(|_| HousekeeperError::JoinFailed);
        }

        Ok(())
    }

    pub fn initial_metadata_payload(&self) -> Value {
        json!({
            "initiated_at": self.initiated_at.to_rfc3339_opts(SecondsFormat::Millis, true),
            "interval_ms": self.interval_ms
        })
    }
}

impl Drop for Housekeeper {
    fn drop(&mut self) {
        self.stop_signal.store(true, Ordering::SeqCst);
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
    }
}

/// One sweep pass; returns how many retained jobs were evicted.
pub fn sweep_once(broker: &Broker, logger: &Logger, now: DateTime<Utc>) -> usize {
    let (evicted, snapshot) = broker.with_dispatcher(|dispatcher| {
        let evicted = dispatcher.sweep_retained(now);
        (evicted, dispatcher.snapshot())
    });

    if evicted > 0 {
        logger.log(
            LogLevel::Info,
            Some(LOG_CONTEXT),
            "Evicted retained jobs",
            Some(json!({"evicted": evicted})),
        );
    }
    if logger.enabled(LogLevel::Debug) {
        logger.log(
            LogLevel::Debug,
            Some(LOG_CONTEXT),
            "Dispatcher snapshot",
            serde_json::to_value(&snapshot).ok(),
        );
    }
    evicted
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use chrono::Utc;

    use crate::config::HousekeepingConfig;
    use crate::logging::tests::memory_logger;
    use crate::logging::{LogLevel, Logger};
    use crate::orchestrator::dispatcher::{Dispatcher, DispatcherConfig};
    use crate::orchestrator::jobs::Priority;
    use crate::server::Broker;
    use crate::storage::MemoryQueueStore;
    use crate::wire::session::{Request, Submission};

    use super::{sweep_once, Housekeeper, HousekeeperError};

    fn broker(retention_ms: u64) -> Arc<Broker> {
        let logger = Arc::new(Logger::silent());
        let dispatcher = Dispatcher::new(
            DispatcherConfig {
                handle_prefix: "hk".to_owned(),
                worker_wakeup: 0,
                retention_ms,
            },
            Arc::new(MemoryQueueStore::new()),
            Arc::clone(&logger),
        );
        Arc::new(Broker::new(dispatcher, logger))
    }

    fn finish_one_job(broker: &Broker) -> String {
        broker.with_dispatcher(|dispatcher| {
            let created = dispatcher.dispatch(
                1,
                Request::Submit(Submission {
                    function_name: "reverse".to_owned(),
                    unique_key: None,
                    payload: b"abc".to_vec(),
                    priority: Priority::Normal,
                    background: false,
                }),
            );
            let handle = String::from_utf8(created[0].packet.args[0].clone()).expect("utf-8");
            dispatcher.dispatch(
                2,
                Request::CanDo {
                    function_name: "reverse".to_owned(),
                },
            );
            dispatcher.dispatch(2, Request::GrabJob { include_unique: false });
            dispatcher.dispatch(
                2,
                Request::WorkComplete {
                    handle: handle.clone(),
                    result: b"cba".to_vec(),
                },
            );
            handle
        })
    }

    #[test]
    fn rejects_intervals_outside_allowed_range() {
        let low = Housekeeper::new(
            broker(0),
            Arc::new(Logger::silent()),
            &HousekeepingConfig { interval_ms: 1 },
        );
        assert!(matches!(
            low,
            Err(HousekeeperError::InvalidInterval { provided_ms: 1 })
        ));
    }

    #[test]
    fn sweep_evicts_expired_jobs_and_logs_snapshot() {
        let broker = broker(50);
        let handle = finish_one_job(&broker);
        let (logger, sink) = memory_logger(LogLevel::Debug);

        assert_eq!(sweep_once(&broker, &logger, Utc::now()), 0);
        let later = Utc::now() + chrono::Duration::milliseconds(100);
        assert_eq!(sweep_once(&broker, &logger, later), 1);
        assert!(broker.with_dispatcher(|dispatcher| dispatcher.job(&handle).is_none()));

        let lines = sink.snapshot();
        assert!(lines.iter().any(|line| line.contains("Evicted retained jobs")));
        assert!(lines.iter().any(|line| line.contains("\"jobs_by_state\"")));
    }

    #[test]
    fn background_thread_sweeps_until_stopped() {
        let broker = broker(1);
        let handle = finish_one_job(&broker);
        let mut housekeeper = Housekeeper::new(
            Arc::clone(&broker),
            Arc::new(Logger::silent()),
            &HousekeepingConfig { interval_ms: 10 },
        )
        .expect("housekeeper should be created");

        housekeeper.start().expect("housekeeper should start");
        assert!(matches!(
            housekeeper.start(),
            Err(HousekeeperError::AlreadyRunning)
        ));

        let mut evicted = false;
        for _ in 0..200 {
            if broker.with_dispatcher(|dispatcher| dispatcher.job(&handle).is_none()) {
                evicted = true;
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        housekeeper.stop().expect("housekeeper should stop");
        assert!(evicted, "retained job should be swept");
    }
}
