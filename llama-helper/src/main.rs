// llama-helper: out-of-process llama.cpp runtime for the assistant
// Reads one JSON request per line on stdin and answers with JSON lines on stdout.
// Diagnostics go to stderr through env_logger (RUST_LOG, default "info").

use std::io::{self, BufRead, Write};
use std::num::NonZeroU32;
use std::path::{Path, PathBuf};
use std::pin::pin;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use anyhow::{bail, Context, Result};
use encoding_rs::{CoderResult, Decoder};
use llama_cpp_2::context::params::LlamaContextParams;
use llama_cpp_2::llama_backend::LlamaBackend;
use llama_cpp_2::llama_batch::LlamaBatch;
use llama_cpp_2::model::params::LlamaModelParams;
use llama_cpp_2::model::{AddBos, LlamaModel, Special};
use llama_cpp_2::sampling::LlamaSampler;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};

// ============================================================================
// Protocol Messages (JSON over stdin/stdout)
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Request {
    Load {
        model_path: String,
        context_size: Option<u32>,
    },
    Generate {
        prompt: String,
        max_tokens: Option<i32>,
        temperature: Option<f32>,
        top_k: Option<i32>,
        top_p: Option<f32>,
        #[serde(default)]
        stop_tokens: Vec<String>,
        #[serde(default)]
        stream: bool,
    },
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Response {
    Loaded,
    Token { text: String },
    Response { text: String, error: Option<String> },
    Error { message: String },
}

const DEFAULT_CONTEXT_SIZE: u32 = 4096;
const DEFAULT_MAX_TOKENS: i32 = 1024;

struct Sampling {
    temperature: f32,
    top_k: i32,
    top_p: f32,
}

// ============================================================================
// VRAM Detection and GPU Layer Calculation
// ============================================================================

fn detect_vram_gb() -> f32 {
    #[cfg(feature = "metal")]
    {
        if let Some(vram) = detect_metal_vram() {
            info!("Metal VRAM detected: {:.2} GB", vram);
            return vram;
        }
    }

    #[cfg(feature = "cuda")]
    {
        if let Some(vram) = detect_cuda_vram() {
            info!("CUDA VRAM detected: {:.2} GB", vram);
            return vram;
        }
    }

    warn!("VRAM detection not available, assuming CPU only");
    0.0
}

#[cfg(feature = "metal")]
fn detect_metal_vram() -> Option<f32> {
    let output = std::process::Command::new("sysctl")
        .arg("hw.memsize")
        .output()
        .ok()?;
    let stdout = String::from_utf8(output.stdout).ok()?;
    let bytes = stdout.split(':').nth(1)?.trim().parse::<u64>().ok()?;
    // Unified memory: the GPU gets roughly 60% of system RAM
    Some(bytes as f32 / (1024.0 * 1024.0 * 1024.0) * 0.6)
}

#[cfg(feature = "cuda")]
fn detect_cuda_vram() -> Option<f32> {
    let output = std::process::Command::new("nvidia-smi")
        .args(["--query-gpu=memory.free", "--format=csv,noheader,nounits"])
        .output()
        .ok()?;
    let stdout = String::from_utf8(output.stdout).ok()?;
    let mb = stdout.lines().next()?.trim().parse::<f32>().ok()?;
    Some(mb / 1024.0)
}

fn file_size_gb(path: &Path) -> f32 {
    std::fs::metadata(path)
        .map(|m| m.len() as f32 / 1024.0 / 1024.0 / 1024.0)
        .unwrap_or(0.0)
}

/// Layers that fit into `vram_gb` once weights and KV cache are accounted for
fn gpu_layers_for(model_gb: f32, model_layers: u32, vram_gb: f32, context_size: u32) -> u32 {
    if model_gb <= 0.0 || model_layers == 0 {
        return 0;
    }

    // 4B Gemma-class models: ~0.25 GB of KV cache per 1k context, smaller ones about half
    let kv_per_1k_gb = if model_gb > 2.0 { 0.25 } else { 0.12 };
    let kv_gb = (context_size as f32 / 1000.0) * kv_per_1k_gb;

    // Keep 500 MB for the OS and display
    let usable_gb = vram_gb - 0.5;
    if usable_gb <= 0.0 {
        return 0;
    }

    let per_layer_gb = (model_gb + kv_gb) / model_layers as f32;
    let layers = ((usable_gb / per_layer_gb).floor() as u32).min(model_layers);

    debug!(
        "GPU budget: {:.2} GB usable, weights {:.2} GB, KV {:.2} GB, {:.1} MB per layer",
        usable_gb,
        model_gb,
        kv_gb,
        per_layer_gb * 1024.0
    );
    layers
}

fn default_gpu_layers(model_path: &Path, context_size: u32) -> u32 {
    let model_gb = file_size_gb(model_path);
    // No GGUF metadata read here; Gemma 3 4B has 34 blocks
    let estimated_layers = if model_gb > 2.0 { 34 } else { 26 };
    let layers = gpu_layers_for(model_gb, estimated_layers, detect_vram_gb(), context_size);

    if layers < estimated_layers {
        info!("Memory constrained: offloading {}/{} layers", layers, estimated_layers);
    } else {
        info!("Full GPU offload ({} layers)", layers);
    }
    layers
}

// ============================================================================
// Stop token handling for streamed output
// ============================================================================

/// Byte offset of the earliest stop token in `text`
fn find_stop(text: &str, stop_tokens: &[String]) -> Option<usize> {
    stop_tokens
        .iter()
        .filter(|stop| !stop.is_empty())
        .filter_map(|stop| text.find(stop.as_str()))
        .min()
}

/// Length of the longest tail of `text` that could still grow into a stop token.
/// That tail must not be streamed yet.
fn pending_stop_prefix(text: &str, stop_tokens: &[String]) -> usize {
    stop_tokens
        .iter()
        .flat_map(|stop| stop.char_indices().skip(1).map(move |(end, _)| &stop[..end]))
        .filter(|prefix| text.ends_with(prefix))
        .map(|prefix| prefix.len())
        .max()
        .unwrap_or(0)
}

/// Decode one token's bytes. Incomplete UTF-8 sequences stay buffered in
/// `decoder` until the next token completes them.
fn decode_piece(decoder: &mut Decoder, bytes: &[u8]) -> Result<String> {
    let capacity = decoder
        .max_utf8_buffer_length(bytes.len())
        .context("token too large to decode")?;
    let mut piece = String::with_capacity(capacity);
    let (result, read, _) = decoder.decode_to_string(bytes, &mut piece, false);
    if result == CoderResult::OutputFull || read != bytes.len() {
        bail!("decoded {} of {} token bytes", read, bytes.len());
    }
    Ok(piece)
}

// ============================================================================
// Model State Management
// ============================================================================

struct ModelState {
    backend: LlamaBackend,
    model: Option<LlamaModel>,
    model_path: Option<PathBuf>,
    context_size: u32,
}

impl ModelState {
    fn new() -> Result<Self> {
        let backend = LlamaBackend::init().context("Failed to init LlamaBackend")?;
        Ok(Self {
            backend,
            model: None,
            model_path: None,
            context_size: DEFAULT_CONTEXT_SIZE,
        })
    }

    fn load_model(&mut self, model_path: PathBuf, context_size: u32) -> Result<()> {
        if self.model.is_some()
            && self.model_path.as_ref() == Some(&model_path)
            && self.context_size == context_size
        {
            debug!("Model already loaded");
            return Ok(());
        }
        if !model_path.is_file() {
            bail!("model file not found: {}", model_path.display());
        }

        info!("Loading model: {}", model_path.display());
        let started = Instant::now();

        // Drop any previous model before allocating the next one
        self.model = None;

        let gpu_layers = default_gpu_layers(&model_path, context_size);
        let model_params = pin!(LlamaModelParams::default().with_n_gpu_layers(gpu_layers));
        let model = LlamaModel::load_from_file(&self.backend, &model_path, &model_params)
            .with_context(|| format!("unable to load model at {}", model_path.display()))?;

        self.model = Some(model);
        self.model_path = Some(model_path);
        self.context_size = context_size;

        info!("Model loaded in {:.2}s", started.elapsed().as_secs_f64());
        Ok(())
    }

    /// Generate a reply. `on_piece` receives decoded text as it becomes safe to show;
    /// stop tokens and anything after them are never passed on.
    fn generate(
        &self,
        prompt: &str,
        max_tokens: i32,
        sampling: &Sampling,
        stop_tokens: &[String],
        mut on_piece: impl FnMut(&str) -> Result<()>,
    ) -> Result<String> {
        let started = Instant::now();
        let model = self.model.as_ref().context("Model not loaded")?;

        // Leave cores for the UI: max(1, cores / 2 + 2)
        let threads: i32 = std::thread::available_parallelism()
            .map(|n| ((n.get() as i32 / 2) + 2).max(1))
            .unwrap_or(2);

        let ctx_params = LlamaContextParams::default()
            .with_n_ctx(Some(
                NonZeroU32::new(self.context_size).context("Invalid context size")?,
            ))
            .with_n_batch(self.context_size)
            .with_n_threads(threads)
            .with_n_threads_batch(threads);

        let mut ctx = model
            .new_context(&self.backend, ctx_params)
            .context("unable to create the llama_context")?;

        let prompt_tokens = model
            .str_to_token(prompt, AddBos::Always)
            .context("failed to tokenize prompt")?;
        if prompt_tokens.is_empty() {
            bail!("prompt produced no tokens");
        }
        if prompt_tokens.len() >= self.context_size as usize {
            bail!(
                "prompt of {} tokens does not fit the {} token context",
                prompt_tokens.len(),
                self.context_size
            );
        }
        debug!("Prompt: {} tokens", prompt_tokens.len());

        let mut batch = LlamaBatch::new(self.context_size as usize, 1);
        let last_index = prompt_tokens.len() as i32 - 1;
        for (i, token) in (0_i32..).zip(prompt_tokens.into_iter()) {
            batch
                .add(token, i, &[0], i == last_index)
                .context("Failed to add prompt token to batch")?;
        }
        ctx.decode(&mut batch).context("llama_decode() failed for prompt")?;
        let prompt_time = started.elapsed();

        let mut sampler = if sampling.temperature <= 0.0 {
            LlamaSampler::greedy()
        } else {
            let seed = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis() as u32)
                .unwrap_or_default();
            LlamaSampler::chain_simple([
                LlamaSampler::top_k(sampling.top_k),
                LlamaSampler::top_p(sampling.top_p, 1),
                LlamaSampler::temp(sampling.temperature),
                LlamaSampler::dist(seed),
            ])
        };

        let n_prompt = batch.n_tokens();
        let max_position = self.context_size as i32;
        let mut n_cur = n_prompt;
        let mut decoder = encoding_rs::UTF_8.new_decoder();
        let mut output = String::new();
        let mut emitted = 0;

        loop {
            if n_cur - n_prompt >= max_tokens {
                debug!("Reached max_tokens ({})", max_tokens);
                break;
            }
            if n_cur >= max_position {
                warn!("Context window full after {} tokens", n_cur - n_prompt);
                break;
            }

            let token = sampler.sample(&ctx, batch.n_tokens() - 1);
            sampler.accept(token);

            if model.is_eog_token(token) {
                debug!("End of generation token");
                break;
            }

            let bytes = model
                .token_to_bytes(token, Special::Tokenize)
                .context("Failed to convert token to bytes")?;
            output.push_str(&decode_piece(&mut decoder, &bytes)?);

            if let Some(stop_at) = find_stop(&output, stop_tokens) {
                output.truncate(stop_at);
                debug!("Stop token reached");
                break;
            }

            let mut safe = output.len() - pending_stop_prefix(&output, stop_tokens);
            while !output.is_char_boundary(safe) {
                safe -= 1;
            }
            if safe > emitted {
                on_piece(&output[emitted..safe])?;
                emitted = safe;
            }

            batch.clear();
            batch
                .add(token, n_cur, &[0], true)
                .context("Failed to add generated token to batch")?;
            n_cur += 1;
            ctx.decode(&mut batch).context("llama_decode() failed")?;
        }

        if output.len() > emitted {
            on_piece(&output[emitted..])?;
        }

        let total = started.elapsed();
        let generated = (n_cur - n_prompt).max(0) as f64;
        let gen_secs = total.saturating_sub(prompt_time).as_secs_f64();
        info!(
            "Generated {} tokens in {:.2}s (prompt {:.2}s, {:.2} tok/s)",
            generated,
            total.as_secs_f64(),
            prompt_time.as_secs_f64(),
            if gen_secs > 0.0 { generated / gen_secs } else { 0.0 }
        );

        Ok(output.trim_end().to_string())
    }
}

// ============================================================================
// Main Loop
// ============================================================================

fn send_response(out: &mut impl Write, response: &Response) -> Result<()> {
    serde_json::to_writer(&mut *out, response)?;
    out.write_all(b"\n")?;
    out.flush()?;
    Ok(())
}

fn handle_request(state: &mut ModelState, request: Request, out: &mut impl Write) -> Result<()> {
    match request {
        Request::Load {
            model_path,
            context_size,
        } => {
            let context_size = context_size.unwrap_or(DEFAULT_CONTEXT_SIZE);
            match state.load_model(PathBuf::from(model_path), context_size) {
                Ok(()) => send_response(out, &Response::Loaded),
                Err(e) => {
                    error!("Model load failed: {:#}", e);
                    send_response(
                        out,
                        &Response::Error {
                            message: format!("Failed to load model: {:#}", e),
                        },
                    )
                }
            }
        }
        Request::Generate {
            prompt,
            max_tokens,
            temperature,
            top_k,
            top_p,
            stop_tokens,
            stream,
        } => {
            let sampling = Sampling {
                temperature: temperature.unwrap_or(1.0),
                top_k: top_k.unwrap_or(64),
                top_p: top_p.unwrap_or(0.95),
            };
            let max_tokens = max_tokens.unwrap_or(DEFAULT_MAX_TOKENS);

            let result = state.generate(&prompt, max_tokens, &sampling, &stop_tokens, |piece| {
                if stream {
                    send_response(
                        &mut *out,
                        &Response::Token {
                            text: piece.to_string(),
                        },
                    )?;
                }
                Ok(())
            });

            let response = match result {
                Ok(text) => Response::Response { text, error: None },
                Err(e) => {
                    error!("Generation failed: {:#}", e);
                    Response::Response {
                        text: String::new(),
                        error: Some(format!("Generation failed: {:#}", e)),
                    }
                }
            };
            send_response(out, &response)
        }
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    info!("llama-helper starting");

    let mut state = ModelState::new()?;
    let stdin = io::stdin();
    let stdout = io::stdout();
    let mut out = stdout.lock();

    for line in stdin.lock().lines() {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                error!("Error reading stdin: {}", e);
                break;
            }
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        match serde_json::from_str::<Request>(line) {
            Ok(request) => handle_request(&mut state, request, &mut out)?,
            Err(e) => {
                warn!("Failed to parse request: {}", e);
                send_response(
                    &mut out,
                    &Response::Error {
                        message: format!("Invalid request: {}", e),
                    },
                )?;
            }
        }
    }

    info!("stdin closed, llama-helper exiting");
    Ok(())
}
