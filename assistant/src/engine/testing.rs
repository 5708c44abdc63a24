// Scripted runtime and loader for session and orchestrator tests

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use tempfile::TempDir;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::Notify;

use super::locator::{LocationKind, ModelLocator, ResolvedModelPath, SearchLocation};
use super::models::default_candidates;
use super::runtime::{InferenceRuntime, RuntimeLoader};

/// Route `log` output through the test harness; safe to call from every test
pub(crate) fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Locator searching only `dir`
pub(crate) fn model_locator(dir: &TempDir) -> ModelLocator {
    ModelLocator::new(
        vec![SearchLocation {
            kind: LocationKind::Documents,
            dir: dir.path().to_path_buf(),
        }],
        default_candidates(),
    )
}

/// Replays queued replies piece by piece. `None` entries fail the request.
pub(crate) struct ScriptedRuntime {
    replies: Mutex<VecDeque<Option<Vec<String>>>>,
    prompts: Mutex<Vec<String>>,
    hold: Mutex<Option<Arc<Notify>>>,
    active: AtomicUsize,
    pub max_concurrent: AtomicUsize,
    pub alive: AtomicBool,
}

impl ScriptedRuntime {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(VecDeque::new()),
            prompts: Mutex::new(Vec::new()),
            hold: Mutex::new(None),
            active: AtomicUsize::new(0),
            max_concurrent: AtomicUsize::new(0),
            alive: AtomicBool::new(true),
        })
    }

    pub fn push_reply(&self, pieces: &[&str]) {
        let pieces = pieces.iter().map(|p| p.to_string()).collect();
        self.replies.lock().unwrap().push_back(Some(pieces));
    }

    pub fn push_failure(&self) {
        self.replies.lock().unwrap().push_back(None);
    }

    /// The next generation blocks until the returned notify fires
    pub fn hold(&self) -> Arc<Notify> {
        let notify = Arc::new(Notify::new());
        *self.hold.lock().unwrap() = Some(notify.clone());
        notify
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }

    async fn next_reply(&self, prompt: String) -> Option<Vec<String>> {
        self.prompts.lock().unwrap().push(prompt);
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_concurrent.fetch_max(active, Ordering::SeqCst);

        let hold = self.hold.lock().unwrap().take();
        if let Some(notify) = hold {
            notify.notified().await;
        }

        let reply = self
            .replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Some(Vec::new()));
        self.active.fetch_sub(1, Ordering::SeqCst);
        reply
    }
}

#[async_trait]
impl InferenceRuntime for ScriptedRuntime {
    async fn generate(&self, prompt: String) -> Result<String> {
        self.next_reply(prompt)
            .await
            .map(|pieces| pieces.concat())
            .ok_or_else(|| anyhow!("scripted failure"))
    }

    async fn generate_streaming(&self, prompt: String, tokens: UnboundedSender<String>) -> Result<()> {
        let pieces = self
            .next_reply(prompt)
            .await
            .ok_or_else(|| anyhow!("scripted failure"))?;
        for piece in pieces {
            tokens.send(piece)?;
        }
        Ok(())
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }
}

/// Hands out the same scripted runtime and counts successful loads
pub(crate) struct CountingLoader {
    runtime: Arc<ScriptedRuntime>,
    pub loads: AtomicUsize,
    pub fail_next: AtomicBool,
}

impl CountingLoader {
    pub fn new(runtime: Arc<ScriptedRuntime>) -> Self {
        Self {
            runtime,
            loads: AtomicUsize::new(0),
            fail_next: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl RuntimeLoader for CountingLoader {
    async fn load(&self, model: &ResolvedModelPath) -> Result<Arc<dyn InferenceRuntime>> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(anyhow!("refusing to load {}", model));
        }
        self.loads.fetch_add(1, Ordering::SeqCst);
        // A fresh load behaves like a newly spawned process
        self.runtime.alive.store(true, Ordering::SeqCst);
        Ok(self.runtime.clone())
    }
}
