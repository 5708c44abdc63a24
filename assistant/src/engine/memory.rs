// Host-side memory watcher
// Samples system memory and tells the session to release its model when memory runs low.
// The session never registers for system notifications itself; this watcher (or any
// other host component) calls InferenceSession::handle_memory_pressure directly.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use sysinfo::System;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::session::{InferenceSession, SessionState};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryWatchConfig {
    /// Sampling interval
    pub poll_interval_ms: u64,

    /// Release the model when available memory drops below this
    pub min_available_mb: u64,

    /// Release a model nobody used for this long (None = keep loaded)
    pub idle_unload_secs: Option<u64>,
}

impl Default for MemoryWatchConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 5_000,
            min_available_mb: 512,
            idle_unload_secs: Some(super::models::DEFAULT_IDLE_TIMEOUT_SECS),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemorySnapshot {
    pub available_mb: u64,
    pub total_mb: u64,
}

impl MemorySnapshot {
    pub fn is_critical(&self, min_available_mb: u64) -> bool {
        self.available_mb < min_available_mb
    }
}

pub struct MemoryWatcher {
    system: System,
    config: MemoryWatchConfig,
}

impl MemoryWatcher {
    pub fn new(config: MemoryWatchConfig) -> Self {
        info!(
            "Initializing memory watcher (threshold: {} MB, interval: {} ms)",
            config.min_available_mb, config.poll_interval_ms
        );
        Self {
            system: System::new(),
            config,
        }
    }

    pub fn sample(&mut self) -> MemorySnapshot {
        self.system.refresh_memory();
        MemorySnapshot {
            available_mb: self.system.available_memory() / 1024 / 1024,
            total_mb: self.system.total_memory() / 1024 / 1024,
        }
    }

    /// One watcher tick: pressure check, then idle check. Returns whether the model was released.
    pub fn check(&mut self, session: &InferenceSession) -> bool {
        if session.state() == SessionState::Unloaded {
            return false;
        }

        let snapshot = self.sample();
        debug!(
            "Memory: {} MB available of {} MB",
            snapshot.available_mb, snapshot.total_mb
        );

        if snapshot.is_critical(self.config.min_available_mb) {
            warn!(
                "Available memory {} MB below {} MB, releasing model",
                snapshot.available_mb, self.config.min_available_mb
            );
            session.handle_memory_pressure();
            return true;
        }

        match self.config.idle_unload_secs {
            Some(secs) => session.unload_if_idle(Duration::from_secs(secs)),
            None => false,
        }
    }

    /// Run `check` on an interval until `cancel` fires
    pub fn spawn(mut self, session: Arc<InferenceSession>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let period = Duration::from_millis(self.config.poll_interval_ms.max(1));
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        self.check(&session);
                    }
                }
            }

            debug!("Memory watcher exited");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::session::LoadOutcome;
    use crate::engine::testing::{model_locator, CountingLoader, ScriptedRuntime};
    use tempfile::TempDir;

    fn loaded_session(dir: &TempDir) -> Arc<InferenceSession> {
        std::fs::write(dir.path().join("medgemma-4b-instruct.gguf"), b"gguf").unwrap();
        let loader = Arc::new(CountingLoader::new(ScriptedRuntime::new()));
        Arc::new(InferenceSession::new(model_locator(dir), loader))
    }

    #[test]
    fn test_snapshot_threshold() {
        let snapshot = MemorySnapshot {
            available_mb: 400,
            total_mb: 6000,
        };
        assert!(snapshot.is_critical(512));
        assert!(!snapshot.is_critical(400));
    }

    #[test]
    fn test_sample_reports_memory() {
        let mut watcher = MemoryWatcher::new(MemoryWatchConfig::default());
        let snapshot = watcher.sample();
        assert!(snapshot.total_mb > 0);
    }

    #[tokio::test]
    async fn test_check_releases_model_under_pressure() {
        let dir = TempDir::new().unwrap();
        let session = loaded_session(&dir);
        assert_eq!(session.ensure_loaded().await, LoadOutcome::Ready);

        let mut relaxed = MemoryWatcher::new(MemoryWatchConfig {
            min_available_mb: 0,
            idle_unload_secs: None,
            ..MemoryWatchConfig::default()
        });
        assert!(!relaxed.check(&session));
        assert_eq!(session.state(), SessionState::Loaded);

        let mut strict = MemoryWatcher::new(MemoryWatchConfig {
            min_available_mb: u64::MAX,
            idle_unload_secs: None,
            ..MemoryWatchConfig::default()
        });
        assert!(strict.check(&session));
        assert_eq!(session.state(), SessionState::Unloaded);
    }

    #[tokio::test]
    async fn test_check_unloads_idle_model() {
        let dir = TempDir::new().unwrap();
        let session = loaded_session(&dir);
        assert_eq!(session.ensure_loaded().await, LoadOutcome::Ready);

        let mut watcher = MemoryWatcher::new(MemoryWatchConfig {
            min_available_mb: 0,
            idle_unload_secs: Some(0),
            ..MemoryWatchConfig::default()
        });
        assert!(watcher.check(&session));
        assert_eq!(session.state(), SessionState::Unloaded);
    }

    #[tokio::test]
    async fn test_spawned_watcher_stops_on_cancel() {
        let dir = TempDir::new().unwrap();
        let session = loaded_session(&dir);
        assert_eq!(session.ensure_loaded().await, LoadOutcome::Ready);

        let cancel = CancellationToken::new();
        let watcher = MemoryWatcher::new(MemoryWatchConfig {
            poll_interval_ms: 10,
            min_available_mb: u64::MAX,
            idle_unload_secs: None,
        });
        let handle = watcher.spawn(session.clone(), cancel.clone());

        while session.state() != SessionState::Unloaded {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        cancel.cancel();
        handle.await.unwrap();
    }
}
