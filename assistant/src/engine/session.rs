// Inference session: owns at most one loaded runtime and serializes generation against it
// Unloaded -> Loaded -> Generating -> Loaded ..., any state drops to Unloaded on memory pressure.
// Concurrent asks queue on a FIFO async mutex; callers always get displayable text, never an error.

use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tokio::sync::mpsc::{self, UnboundedSender};
use tokio::sync::{Mutex, OwnedMutexGuard};

use super::locator::{ModelLocator, ResolvedModelPath};
use super::prompt;
use super::runtime::{InferenceRuntime, RuntimeLoader};
use super::sanitize;

/// Shown in place of a reply when no model file is installed or loading failed
pub const MODEL_UNAVAILABLE_MESSAGE: &str = "Modell nicht verfügbar. Erfordert ein Gerät mit 6 GB+ RAM. \
Bitte medgemma-4b-instruct.Q4_K_M.gguf im Modellordner ablegen.";

/// Shown in place of a reply when the runtime produced no usable output
pub const GENERATION_FAILED_MESSAGE: &str = "Fehler bei der Generierung.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Unloaded,
    Loaded,
    Generating,
}

/// Result of [`InferenceSession::ensure_loaded`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    Ready,
    /// No model file, or the runtime refused to load it. Retrying later is fine.
    Unavailable,
}

struct Slot {
    runtime: Option<Arc<dyn InferenceRuntime>>,
    model: Option<ResolvedModelPath>,
    generating: bool,
    last_activity: Instant,
}

impl Slot {
    fn unload(&mut self) -> Option<Arc<dyn InferenceRuntime>> {
        self.model = None;
        self.generating = false;
        self.runtime.take()
    }
}

fn lock_slot(slot: &StdMutex<Slot>) -> MutexGuard<'_, Slot> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One claimed generation: the flight gate plus the generating flag.
///
/// Moved into the task that drives the runtime, so both stay held until the
/// runtime call returns, even if the caller stops waiting for the reply.
struct FlightClaim {
    slot: Arc<StdMutex<Slot>>,
    _flight: OwnedMutexGuard<()>,
}

impl Drop for FlightClaim {
    fn drop(&mut self) {
        let mut slot = lock_slot(&self.slot);
        slot.generating = false;
        slot.last_activity = Instant::now();
    }
}

pub struct InferenceSession {
    locator: ModelLocator,
    loader: Arc<dyn RuntimeLoader>,

    /// Runtime slot; only held for short, non-async sections
    slot: Arc<StdMutex<Slot>>,

    /// Serializes loads so concurrent callers never spawn two runtimes
    load_lock: Mutex<()>,

    /// Single-flight gate for generation; tokio's mutex hands out the lock FIFO
    flight: Arc<Mutex<()>>,
}

impl InferenceSession {
    pub fn new(locator: ModelLocator, loader: Arc<dyn RuntimeLoader>) -> Self {
        Self {
            locator,
            loader,
            slot: Arc::new(StdMutex::new(Slot {
                runtime: None,
                model: None,
                generating: false,
                last_activity: Instant::now(),
            })),
            load_lock: Mutex::new(()),
            flight: Arc::new(Mutex::new(())),
        }
    }

    fn slot(&self) -> MutexGuard<'_, Slot> {
        lock_slot(&self.slot)
    }

    /// Whether a model file can currently be found. Probes the filesystem
    /// each time, so installing a model flips it without a restart.
    pub fn is_available(&self) -> bool {
        self.locator.resolve().is_ok()
    }

    pub fn state(&self) -> SessionState {
        let slot = self.slot();
        match (&slot.runtime, slot.generating) {
            (None, _) => SessionState::Unloaded,
            (Some(_), true) => SessionState::Generating,
            (Some(_), false) => SessionState::Loaded,
        }
    }

    /// Path of the loaded model, cached until the next unload
    pub fn model_path(&self) -> Option<ResolvedModelPath> {
        self.slot().model.clone()
    }

    /// Loaded runtime, discarding one whose backend has died
    fn current_runtime(&self) -> Option<Arc<dyn InferenceRuntime>> {
        let mut slot = self.slot();
        let alive = slot.runtime.as_ref().map(|runtime| runtime.is_alive());
        match alive {
            Some(true) => slot.runtime.clone(),
            Some(false) => {
                log::warn!("Loaded runtime is no longer alive, discarding it");
                slot.unload();
                None
            }
            None => None,
        }
    }

    /// Load the model if nothing is loaded yet.
    pub async fn ensure_loaded(&self) -> LoadOutcome {
        if self.current_runtime().is_some() {
            return LoadOutcome::Ready;
        }

        let _loading = self.load_lock.lock().await;
        // Another caller may have finished loading while we waited
        if self.current_runtime().is_some() {
            return LoadOutcome::Ready;
        }

        let model = match self.locator.resolve() {
            Ok(model) => model,
            Err(e) => {
                log::warn!("{}", e);
                return LoadOutcome::Unavailable;
            }
        };

        log::info!("Loading model: {}", model);
        let started = Instant::now();
        match self.loader.load(&model).await {
            Ok(runtime) => {
                let mut slot = self.slot();
                slot.runtime = Some(runtime);
                slot.model = Some(model);
                slot.last_activity = Instant::now();
                log::info!("Model loaded in {:.2}s", started.elapsed().as_secs_f64());
                LoadOutcome::Ready
            }
            Err(e) => {
                log::error!("Failed to load model {}: {:#}", model, e);
                LoadOutcome::Unavailable
            }
        }
    }

    /// Wait for the flight gate, ensure a runtime and mark the session as generating.
    async fn begin_generation(&self) -> Option<(Arc<dyn InferenceRuntime>, FlightClaim)> {
        let flight = self.flight.clone().lock_owned().await;
        // A memory-pressure unload can land between loading and claiming; retry once
        for _ in 0..2 {
            if self.ensure_loaded().await == LoadOutcome::Unavailable {
                return None;
            }
            let claimed = {
                let mut slot = self.slot();
                slot.runtime.clone().map(|runtime| {
                    slot.generating = true;
                    slot.last_activity = Instant::now();
                    runtime
                })
            };
            if let Some(runtime) = claimed {
                let claim = FlightClaim {
                    slot: self.slot.clone(),
                    _flight: flight,
                };
                return Some((runtime, claim));
            }
        }
        None
    }

    /// Generate a complete reply for `user_message`.
    pub async fn ask(&self, user_message: &str) -> String {
        let Some((runtime, claim)) = self.begin_generation().await else {
            return MODEL_UNAVAILABLE_MESSAGE.to_string();
        };

        let prompt = prompt::format_prompt(user_message);
        // Off the control task; the runtime reference keeps the model alive until done
        let outcome = tokio::spawn(async move {
            let _claim = claim;
            runtime.generate(prompt).await
        })
        .await;

        let raw = match outcome {
            Ok(Ok(raw)) => raw,
            Ok(Err(e)) => {
                log::error!("Generation failed: {:#}", e);
                return GENERATION_FAILED_MESSAGE.to_string();
            }
            Err(e) => {
                log::error!("Generation task aborted: {}", e);
                return GENERATION_FAILED_MESSAGE.to_string();
            }
        };

        finish_reply(&raw)
    }

    /// Generate a reply, forwarding each raw non-empty piece to `on_token` as
    /// it arrives. Returns the sanitized full reply; `on_token` is dropped
    /// before this returns.
    pub async fn ask_streaming(&self, user_message: &str, on_token: UnboundedSender<String>) -> String {
        let Some((runtime, claim)) = self.begin_generation().await else {
            return MODEL_UNAVAILABLE_MESSAGE.to_string();
        };

        let prompt = prompt::format_prompt(user_message);
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        let worker = tokio::spawn(async move {
            let _claim = claim;
            runtime.generate_streaming(prompt, tx).await
        });

        let mut raw = String::new();
        while let Some(piece) = rx.recv().await {
            if piece.is_empty() {
                continue;
            }
            raw.push_str(&piece);
            // The display side may have gone away; the reply is still accumulated
            let _ = on_token.send(piece);
        }
        drop(on_token);

        match worker.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => log::error!("Streaming generation failed after {} chars: {:#}", raw.len(), e),
            Err(e) => log::error!("Generation task aborted: {}", e),
        }

        finish_reply(&raw)
    }

    /// Release the runtime immediately.
    ///
    /// Safe to call in any state. An in-flight generation keeps its own
    /// runtime reference and finishes; the session itself is `Unloaded` when
    /// this returns, so the next request reloads the model.
    pub fn handle_memory_pressure(&self) {
        let (released, was_generating) = {
            let mut slot = self.slot();
            let was_generating = slot.generating;
            (slot.unload(), was_generating)
        };
        match released {
            Some(_) => log::warn!(
                "Memory pressure: released model (generation in flight: {})",
                was_generating
            ),
            None => log::debug!("Memory pressure: no model loaded"),
        }
    }

    /// Release a loaded, non-generating runtime that has been idle for `idle`.
    pub fn unload_if_idle(&self, idle: Duration) -> bool {
        let mut slot = self.slot();
        if slot.runtime.is_none() || slot.generating || slot.last_activity.elapsed() < idle {
            return false;
        }
        log::info!(
            "Model idle for {}s (timeout: {}s), unloading",
            slot.last_activity.elapsed().as_secs(),
            idle.as_secs()
        );
        slot.unload();
        true
    }
}

fn finish_reply(raw: &str) -> String {
    let cleaned = sanitize::clean_output(raw);
    if cleaned.is_empty() {
        log::warn!("Runtime produced no usable output ({} raw chars)", raw.len());
        GENERATION_FAILED_MESSAGE.to_string()
    } else {
        cleaned
    }
}
