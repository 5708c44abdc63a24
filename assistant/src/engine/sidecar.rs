// Sidecar runtime backed by the llama-helper process
// Handles helper discovery, spawning, the JSON-lines protocol and request timeouts

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout};
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::Mutex;

#[cfg(target_os = "windows")]
use std::os::windows::process::CommandExt;

use super::locator::ResolvedModelPath;
use super::models::GenerationParams;
use super::runtime::{InferenceRuntime, RuntimeLoader};
use crate::config::{AssistantConfig, HELPER_ENV_VAR};
use crate::error::EngineError;

/// Loading a 4B model from flash can take a while on small devices
const LOAD_TIMEOUT_SECS: u64 = 120;

// ============================================================================
// Protocol Messages (JSON over stdin/stdout)
// ============================================================================

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Request {
    Load {
        model_path: String,
        context_size: u32,
    },
    Generate {
        prompt: String,
        max_tokens: i32,
        // Sampling parameters
        temperature: f32,
        top_k: i32,
        top_p: f32,
        stop_tokens: Vec<String>,
        stream: bool,
    },
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Response {
    Loaded,
    Token { text: String },
    Response { text: String, error: Option<String> },
    Error { message: String },
}

// ============================================================================
// Helper Discovery
// ============================================================================

fn target_triple() -> String {
    std::env::var("TARGET").unwrap_or_else(|_| {
        #[cfg(all(target_os = "linux", target_arch = "x86_64"))]
        { "x86_64-unknown-linux-gnu".to_string() }
        #[cfg(all(target_os = "linux", target_arch = "aarch64"))]
        { "aarch64-unknown-linux-gnu".to_string() }
        #[cfg(all(target_os = "macos", target_arch = "x86_64"))]
        { "x86_64-apple-darwin".to_string() }
        #[cfg(all(target_os = "macos", target_arch = "aarch64"))]
        { "aarch64-apple-darwin".to_string() }
        #[cfg(all(target_os = "ios", target_arch = "aarch64"))]
        { "aarch64-apple-ios".to_string() }
        #[cfg(all(target_os = "windows", target_arch = "x86_64"))]
        { "x86_64-pc-windows-msvc".to_string() }
        #[cfg(all(target_os = "windows", target_arch = "aarch64"))]
        { "aarch64-pc-windows-msvc".to_string() }
        #[cfg(not(any(
            all(target_os = "linux", any(target_arch = "x86_64", target_arch = "aarch64")),
            all(target_os = "macos", any(target_arch = "x86_64", target_arch = "aarch64")),
            all(target_os = "ios", target_arch = "aarch64"),
            all(target_os = "windows", any(target_arch = "x86_64", target_arch = "aarch64"))
        )))]
        { "unknown".to_string() }
    })
}

/// Bundled binaries carry the target triple as suffix
fn bundled_binary_name() -> String {
    if cfg!(windows) {
        format!("llama-helper-{}.exe", target_triple())
    } else {
        format!("llama-helper-{}", target_triple())
    }
}

/// Exact bundled name first, then any `llama-helper*` file (skipping cargo `.d` files)
fn find_in_dir(dir: &Path) -> Option<PathBuf> {
    let exact = dir.join(bundled_binary_name());
    if exact.is_file() {
        return Some(exact);
    }

    let entries = std::fs::read_dir(dir).ok()?;
    let mut matches: Vec<PathBuf> = entries
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| {
            path.is_file()
                && path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .map_or(false, |name| name.starts_with("llama-helper") && !name.ends_with(".d"))
        })
        .collect();
    // read_dir order is platform dependent
    matches.sort();
    matches.into_iter().next()
}

/// Resolve the path to the llama-helper binary
pub fn resolve_helper_binary(configured: Option<&Path>) -> Result<PathBuf, EngineError> {
    // 1. Explicit configuration (MYMED_LLAMA_HELPER or config file)
    if let Some(path) = configured {
        if path.is_file() {
            log::info!("Using configured llama-helper: {}", path.display());
            return Ok(path.to_path_buf());
        }
        log::warn!("Configured llama-helper does not exist: {}", path.display());
    }

    // 2. Next to the current executable (bundled apps)
    if let Some(exe_dir) = std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf))
    {
        if let Some(found) = find_in_dir(&exe_dir) {
            log::info!("Found llama-helper next to executable: {}", found.display());
            return Ok(found);
        }
    }

    // 3. Bundled resources
    if let Ok(resource_dir) = std::env::var("RESOURCE_DIR") {
        if let Some(found) = find_in_dir(Path::new(&resource_dir)) {
            log::info!("Found llama-helper in RESOURCE_DIR: {}", found.display());
            return Ok(found);
        }
    }

    // 4. Dev builds in the workspace target directory
    if let Ok(manifest_dir) = std::env::var("CARGO_MANIFEST_DIR") {
        if let Some(workspace_root) = Path::new(&manifest_dir).parent() {
            for profile in ["release", "debug"] {
                for name in ["llama-helper", "llama-helper.exe"] {
                    let candidate = workspace_root.join("target").join(profile).join(name);
                    if candidate.is_file() {
                        log::info!("Using dev llama-helper: {}", candidate.display());
                        return Ok(candidate);
                    }
                }
            }
        }
    }

    Err(EngineError::HelperNotFound(format!(
        "build it with 'cargo build --release -p llama-helper' or set {}",
        HELPER_ENV_VAR
    )))
}

// ============================================================================
// Loader
// ============================================================================

/// Spawns one llama-helper process per loaded model.
///
/// The helper binary is located on every load, so a missing helper only
/// makes loads fail (the session reports the model as unavailable) and a
/// helper installed later is picked up without restarting.
pub struct SidecarLoader {
    configured: Option<PathBuf>,
    params: GenerationParams,
}

impl SidecarLoader {
    pub fn new(configured: Option<PathBuf>, params: GenerationParams) -> Self {
        Self { configured, params }
    }

    pub fn from_config(config: &AssistantConfig) -> Self {
        let loader = Self::new(config.helper_binary.clone(), config.generation.clone());
        match loader.helper_binary() {
            Ok(path) => log::info!("Helper binary path: {}", path.display()),
            Err(e) => log::warn!("{}", e),
        }
        loader
    }

    pub fn helper_binary(&self) -> Result<PathBuf, EngineError> {
        resolve_helper_binary(self.configured.as_deref())
    }
}

#[async_trait]
impl RuntimeLoader for SidecarLoader {
    async fn load(&self, model: &ResolvedModelPath) -> Result<Arc<dyn InferenceRuntime>> {
        let helper_binary = self.helper_binary()?;
        let runtime = SidecarRuntime::spawn(&helper_binary, self.params.clone())?;
        runtime.load_model(model.path()).await?;
        Ok(Arc::new(runtime))
    }
}

// ============================================================================
// Runtime
// ============================================================================

struct Pipes {
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

/// A running llama-helper with one model loaded.
///
/// The process is killed when the runtime is dropped, which is what frees
/// the model memory on unload.
pub struct SidecarRuntime {
    /// Child process handle (kill-on-drop)
    child: StdMutex<Child>,

    /// One request/response exchange at a time
    pipes: Mutex<Pipes>,

    /// Health status
    is_healthy: AtomicBool,

    params: GenerationParams,
}

impl SidecarRuntime {
    /// Spawn the helper process. The model is not loaded yet.
    pub fn spawn(helper_binary: &Path, params: GenerationParams) -> Result<Self> {
        log::info!("Spawning llama-helper sidecar");

        // Run below normal priority so the UI thread is never starved
        #[cfg(unix)]
        let mut command = {
            let mut command = tokio::process::Command::new("nice");
            command.arg("-n").arg("10").arg(helper_binary);
            command
        };

        #[cfg(not(unix))]
        let mut command = tokio::process::Command::new(helper_binary);

        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit()) // Log stderr to main process
            .kill_on_drop(true);

        #[cfg(target_os = "windows")]
        {
            const CREATE_NO_WINDOW: u32 = 0x08000000;
            const BELOW_NORMAL_PRIORITY_CLASS: u32 = 0x00004000;

            command.creation_flags(CREATE_NO_WINDOW | BELOW_NORMAL_PRIORITY_CLASS);
        }

        let mut child = command
            .spawn()
            .with_context(|| format!("Failed to spawn llama-helper at {:?}", helper_binary))?;

        let stdin = child.stdin.take().ok_or_else(|| anyhow!("Failed to get stdin"))?;
        let stdout = child.stdout.take().ok_or_else(|| anyhow!("Failed to get stdout"))?;

        Ok(Self {
            child: StdMutex::new(child),
            pipes: Mutex::new(Pipes {
                stdin,
                stdout: BufReader::new(stdout),
            }),
            is_healthy: AtomicBool::new(true),
            params,
        })
    }

    /// Ask the helper to load the model into memory
    pub async fn load_model(&self, model_path: &Path) -> Result<()> {
        log::info!("Loading model in sidecar: {}", model_path.display());

        let request = Request::Load {
            model_path: model_path.to_string_lossy().to_string(),
            context_size: self.params.context_size,
        };

        match self
            .exchange(&request, Duration::from_secs(LOAD_TIMEOUT_SECS), |_| {})
            .await?
        {
            Response::Loaded => {
                log::info!("Sidecar model loaded");
                Ok(())
            }
            Response::Error { message } | Response::Response { error: Some(message), .. } => {
                Err(EngineError::RuntimeLoad {
                    path: model_path.to_path_buf(),
                    message,
                }
                .into())
            }
            other => bail!("Unexpected load response: {:?}", other),
        }
    }

    fn generate_request(&self, prompt: String, stream: bool) -> Request {
        let sampling = &self.params.sampling;
        Request::Generate {
            prompt,
            max_tokens: self.params.max_tokens,
            temperature: sampling.temperature,
            top_k: sampling.top_k,
            top_p: sampling.top_p,
            stop_tokens: sampling.stop_tokens.clone(),
            stream,
        }
    }

    /// Write one request and read lines until a non-token response arrives.
    /// Token lines are handed to `on_token` in arrival order.
    async fn exchange(
        &self,
        request: &Request,
        timeout: Duration,
        mut on_token: impl FnMut(String) + Send,
    ) -> Result<Response> {
        let mut pipes = self.pipes.lock().await;
        if !self.is_alive() {
            return Err(EngineError::RuntimeClosed.into());
        }
        let Pipes { stdin, stdout } = &mut *pipes;

        let request_json = serde_json::to_string(request)?;
        let result = tokio::time::timeout(timeout, async {
            stdin
                .write_all(request_json.as_bytes())
                .await
                .context("Failed to write request to stdin")?;
            stdin
                .write_all(b"\n")
                .await
                .context("Failed to write newline")?;
            stdin.flush().await.context("Failed to flush stdin")?;

            loop {
                match read_response(stdout).await? {
                    Response::Token { text } => on_token(text),
                    other => return Ok::<Response, anyhow::Error>(other),
                }
            }
        })
        .await;

        match result {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(e)) => {
                self.mark_dead();
                Err(e)
            }
            Err(_) => {
                // Timeout reached - kill the helper to stop generation
                log::error!("Request timeout after {:?}, killing sidecar", timeout);
                self.mark_dead();
                Err(EngineError::Timeout {
                    secs: timeout.as_secs(),
                }
                .into())
            }
        }
    }

    /// The pipe is out of sync or gone; no further request can succeed
    fn mark_dead(&self) {
        self.is_healthy.store(false, Ordering::SeqCst);
        let mut child = self.child.lock().unwrap_or_else(PoisonError::into_inner);
        if let Err(e) = child.start_kill() {
            log::debug!("Sidecar already gone: {}", e);
        }
    }
}

/// Read a single line response from stdout
async fn read_response(stdout: &mut BufReader<ChildStdout>) -> Result<Response> {
    let mut line = String::new();
    stdout
        .read_line(&mut line)
        .await
        .context("Failed to read response from stdout")?;

    if line.is_empty() {
        return Err(EngineError::RuntimeClosed.into());
    }

    serde_json::from_str(line.trim())
        .with_context(|| format!("Failed to parse response: {}", line.trim()))
}

fn into_text(response: Response) -> Result<String> {
    match response {
        Response::Response { text, error: None } => Ok(text),
        Response::Response { error: Some(err), .. } => Err(EngineError::Generation(err).into()),
        Response::Error { message } => Err(anyhow!("Sidecar error: {}", message)),
        other => Err(anyhow!("Unexpected generation response: {:?}", other)),
    }
}

#[async_trait]
impl InferenceRuntime for SidecarRuntime {
    async fn generate(&self, prompt: String) -> Result<String> {
        let request = self.generate_request(prompt, false);
        let timeout = Duration::from_secs(self.params.timeout_secs);

        let mut text = String::new();
        let response = self
            .exchange(&request, timeout, |piece| text.push_str(&piece))
            .await?;
        let final_text = into_text(response)?;

        log::info!("Generation completed: {} chars", final_text.len());
        // A non-streaming helper never sends tokens; prefer the final text
        Ok(if final_text.is_empty() { text } else { final_text })
    }

    async fn generate_streaming(
        &self,
        prompt: String,
        tokens: UnboundedSender<String>,
    ) -> Result<()> {
        let request = self.generate_request(prompt, true);
        let timeout = Duration::from_secs(self.params.timeout_secs);

        let mut streamed = 0usize;
        let response = self
            .exchange(&request, timeout, |piece| {
                streamed += 1;
                // Receiver gone means nobody displays the reply; keep draining the pipe
                let _ = tokens.send(piece);
            })
            .await?;
        into_text(response)?;

        log::info!("Streaming generation completed: {} pieces", streamed);
        Ok(())
    }

    fn is_alive(&self) -> bool {
        self.is_healthy.load(Ordering::SeqCst)
    }
}

impl Drop for SidecarRuntime {
    fn drop(&mut self) {
        // kill_on_drop on the child terminates the helper and frees the model
        log::debug!("SidecarRuntime dropped, releasing llama-helper");
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_generate_request_serialization() {
        let request = Request::Generate {
            prompt: "test prompt".to_string(),
            max_tokens: 512,
            temperature: 1.0,
            top_k: 64,
            top_p: 0.95,
            stop_tokens: vec!["<end_of_turn>".to_string()],
            stream: true,
        };

        let json = serde_json::to_string(&request).unwrap();
        assert!(json.contains("\"type\":\"generate\""));
        assert!(json.contains("\"prompt\":\"test prompt\""));
        assert!(json.contains("\"max_tokens\":512"));
        assert!(json.contains("\"stream\":true"));
    }

    #[test]
    fn test_load_request_serialization() {
        let request = Request::Load {
            model_path: "/models/medgemma.gguf".to_string(),
            context_size: 4096,
        };
        let json = serde_json::to_string(&request).unwrap();
        assert_eq!(
            json,
            r#"{"type":"load","model_path":"/models/medgemma.gguf","context_size":4096}"#
        );
    }

    #[test]
    fn test_token_response_deserialization() {
        let response: Response = serde_json::from_str(r#"{"type":"token","text":"Hal"}"#).unwrap();
        match response {
            Response::Token { text } => assert_eq!(text, "Hal"),
            _ => panic!("Wrong response type"),
        }

        let response: Response = serde_json::from_str(r#"{"type":"loaded"}"#).unwrap();
        assert!(matches!(response, Response::Loaded));
    }

    #[test]
    fn test_error_response_maps_to_generation_error() {
        let json = r#"{"type":"response","text":"","error":"decode failed"}"#;
        let response: Response = serde_json::from_str(json).unwrap();
        let err = into_text(response).unwrap_err();
        assert!(err.to_string().contains("decode failed"));
    }

    #[test]
    fn test_find_in_dir_prefers_exact_name_and_skips_dep_files() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("llama-helper.d"), b"deps").unwrap();
        assert!(find_in_dir(dir.path()).is_none());

        std::fs::write(dir.path().join("llama-helper"), b"bin").unwrap();
        std::fs::write(dir.path().join(bundled_binary_name()), b"bin").unwrap();
        assert_eq!(
            find_in_dir(dir.path()).unwrap(),
            dir.path().join(bundled_binary_name())
        );
    }

    #[test]
    fn test_configured_helper_wins() {
        let dir = TempDir::new().unwrap();
        let helper = dir.path().join("my-helper");
        std::fs::write(&helper, b"bin").unwrap();

        assert_eq!(resolve_helper_binary(Some(&helper)).unwrap(), helper);
    }

    #[cfg(unix)]
    mod process {
        use super::*;
        use crate::engine::models::default_candidates;
        use crate::engine::locator::{LocationKind, ModelLocator, SearchLocation};
        use std::os::unix::fs::PermissionsExt;

        /// Stand-in helper speaking the protocol from a shell loop
        const FAKE_HELPER: &str = r#"#!/bin/sh
while read -r line; do
  case "$line" in
    *'"type":"load"'*) echo '{"type":"loaded"}' ;;
    *'"stream":true'*)
      echo '{"type":"token","text":"Hi"}'
      echo '{"type":"token","text":" there"}'
      echo '{"type":"response","text":"Hi there","error":null}' ;;
    *) printf '%s\n' '{"type":"response","text":"<start_of_turn>model\nHallo","error":null}' ;;
  esac
done
"#;

        fn write_fake_helper(dir: &TempDir) -> PathBuf {
            let path = dir.path().join("fake-helper.sh");
            std::fs::write(&path, FAKE_HELPER).unwrap();
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
            path
        }

        fn model_in(dir: &TempDir) -> ResolvedModelPath {
            std::fs::write(dir.path().join("medgemma-4b-instruct.gguf"), b"gguf").unwrap();
            ModelLocator::new(
                vec![SearchLocation {
                    kind: LocationKind::Documents,
                    dir: dir.path().to_path_buf(),
                }],
                default_candidates(),
            )
            .resolve()
            .unwrap()
        }

        #[tokio::test]
        async fn test_sidecar_round_trip() {
            let dir = TempDir::new().unwrap();
            let loader = SidecarLoader::new(Some(write_fake_helper(&dir)), GenerationParams::default());
            let runtime = loader.load(&model_in(&dir)).await.unwrap();

            let text = runtime.generate("prompt".to_string()).await.unwrap();
            assert_eq!(text, "<start_of_turn>model\nHallo");

            let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
            runtime
                .generate_streaming("prompt".to_string(), tx)
                .await
                .unwrap();
            let mut pieces = Vec::new();
            while let Some(piece) = rx.recv().await {
                pieces.push(piece);
            }
            assert_eq!(pieces, vec!["Hi".to_string(), " there".to_string()]);
            assert!(runtime.is_alive());
        }

        #[tokio::test]
        async fn test_dead_helper_is_reported() {
            let dir = TempDir::new().unwrap();
            let path = dir.path().join("exit-helper.sh");
            std::fs::write(&path, "#!/bin/sh\nexit 0\n").unwrap();
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();

            let loader = SidecarLoader::new(Some(path), GenerationParams::default());
            assert!(loader.load(&model_in(&dir)).await.is_err());
        }
    }
}
