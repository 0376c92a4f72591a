//! Common test utilities for transfer-engine integration tests

use std::path::PathBuf;
use std::time::Duration;
use tempfile::TempDir;
use transfer_engine::{Config, HistoryEntry, RetryConfig, TaskId, TransferEngine};

/// Started engine over a temporary directory
pub struct TestEngine {
    pub engine: TransferEngine,
    pub dir: TempDir,
}

impl TestEngine {
    /// Engine built from [`test_config`] with the admission loop running
    pub async fn start() -> Self {
        let dir = tempfile::tempdir().expect("temp dir");
        let engine = TransferEngine::new(test_config(&dir))
            .await
            .expect("engine should start");
        engine.start();
        Self { engine, dir }
    }

    pub fn upload_root(&self) -> PathBuf {
        self.dir.path().join("uploads")
    }
}

/// Config with fast polling and short retry delays
pub fn test_config(dir: &TempDir) -> Config {
    let mut config = Config::default();
    config.engine.work_dir = dir.path().join("work");
    config.engine.poll_interval = Duration::from_millis(20);
    config.engine.admission_tick = Duration::from_millis(50);
    config.engine.shutdown_timeout = Duration::from_secs(5);
    config.backends.http.min_free_space = 0;
    config.retry = RetryConfig {
        initial_delay: Duration::from_millis(10),
        max_delay: Duration::from_millis(50),
        backoff_multiplier: 2.0,
        jitter: false,
    };
    config.upload.root = dir.path().join("uploads");
    config.persistence.database_path = dir.path().join("engine.db");
    config
}

/// Wait for a task's history entry, panicking after 30s
pub async fn wait_for_history(engine: &TransferEngine, id: TaskId) -> HistoryEntry {
    tokio::time::timeout(Duration::from_secs(30), async {
        loop {
            if let Some(entry) = engine.get_history(id).await {
                return entry;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("task {} did not finish", id))
}
