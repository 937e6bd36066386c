//! OCR Engine Process Manager
//!
//! Keeps one long-lived engine process and exchanges newline-delimited JSON
//! with it. The engine answers strictly in order with no multiplexing, so
//! every request/response pair runs under one lock: recognition is serialized
//! no matter how many callers there are.
//!
//! Lifecycle: `Idle -> Live(n) -> Dead -> Live(n + 1) -> ...`. A crash, a
//! timeout or an unreadable reply marks the process dead and fails the request
//! that saw it; the next caller launches a fresh generation. If that relaunch fails the manager is
//! `Failed` and all later requests fail fatally until `start` is called again.

pub mod process;
pub mod protocol;

pub use process::EngineProcess;
pub use protocol::{EngineRequest, EngineResponse};

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::config::EngineConfig;
use crate::error::{OcrRenameError, Result};

/// Engine folder shipped next to the application
const BUNDLED_ENGINE_DIR: &str = "PaddleOCR-json_v1.4.1";

/// Engine executable base name
const ENGINE_BINARY: &str = "PaddleOCR-json";

/// A response tagged with the engine generation that produced it
#[derive(Debug, Clone)]
pub struct EngineReply {
    pub generation: u64,
    pub response: EngineResponse,
}

/// Anything that can turn an image file into an engine response
#[async_trait]
pub trait TextRecognizer: Send + Sync {
    async fn recognize(&self, image_path: &Path) -> Result<EngineReply>;
}

enum EngineState {
    /// Never started
    Idle,
    Live(EngineProcess),
    /// Crashed, timed out or out of step; next request relaunches
    Dead { reason: String },
    /// Relaunch failed; requests fail until `start` is called
    Failed { reason: String },
    /// Shut down on purpose
    Closed,
}

impl EngineState {
    fn label(&self) -> &'static str {
        match self {
            EngineState::Idle => "idle",
            EngineState::Live(_) => "live",
            EngineState::Dead { .. } => "dead",
            EngineState::Failed { .. } => "failed",
            EngineState::Closed => "closed",
        }
    }
}

/// Owner of the engine process handle
pub struct EngineManager {
    config: EngineConfig,
    executable: PathBuf,
    state: Mutex<EngineState>,
    generation: AtomicU64,
}

impl EngineManager {
    /// Create a manager; nothing is launched until `start` or the first request
    pub fn new(config: EngineConfig, executable: PathBuf) -> Self {
        Self {
            config,
            executable,
            state: Mutex::new(EngineState::Idle),
            generation: AtomicU64::new(0),
        }
    }

    /// Create a manager for the configured executable, falling back to discovery
    pub fn from_config(config: EngineConfig) -> Result<Self> {
        let executable = match &config.executable {
            Some(path) => path.clone(),
            None => discover_engine()?,
        };
        Ok(Self::new(config, executable))
    }

    pub fn executable(&self) -> &Path {
        &self.executable
    }

    /// Generation of the most recently launched process (0 before the first launch)
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Launch the engine and wait for readiness, replacing any live process
    pub async fn start(&self) -> Result<u64> {
        let mut state = self.state.lock().await;

        if let EngineState::Live(old) = std::mem::replace(&mut *state, EngineState::Idle) {
            info!("Replacing live OCR engine generation {}", old.generation());
            old.terminate(self.config.shutdown_grace()).await;
        }

        match self.launch().await {
            Ok(process) => {
                let generation = process.generation();
                *state = EngineState::Live(process);
                Ok(generation)
            }
            Err(e) => {
                *state = EngineState::Failed {
                    reason: e.to_string(),
                };
                Err(e)
            }
        }
    }

    /// Make sure a live process exists without replacing one that is already running
    ///
    /// Fails fatally if the manager gave up after a failed restart or was shut down.
    pub async fn ensure_started(&self) -> Result<u64> {
        {
            let mut state = self.state.lock().await;
            if !matches!(*state, EngineState::Idle) {
                let process = self.ensure_live(&mut state).await?;
                return Ok(process.generation());
            }
        }
        // First launch; called before any request is dispatched
        self.start().await
    }

    /// Send one request and read its response, serialized against all other callers
    pub async fn send_request(&self, request: &EngineRequest) -> Result<EngineReply> {
        let line = request.to_line()?;
        let mut state = self.state.lock().await;

        let request_timeout = self.config.request_timeout();
        let (generation, outcome) = {
            let process = self.ensure_live(&mut state).await?;
            let generation = process.generation();
            (generation, timeout(request_timeout, process.exchange(&line)).await)
        };

        match outcome {
            Ok(Ok(reply)) => match EngineResponse::parse_line(&reply) {
                Ok(response) => {
                    debug!(
                        "Engine generation {} answered {} for {}",
                        generation, response.status_code, request.image_path
                    );
                    Ok(EngineReply {
                        generation,
                        response,
                    })
                }
                Err(e) => {
                    // Whatever answer belongs to this request may still be in the pipe
                    warn!("Engine generation {} sent an unreadable reply: {}", generation, e);
                    self.mark_dead(&mut state, e.to_string()).await;
                    Err(e)
                }
            },
            Ok(Err(e)) => {
                error!("Engine generation {} crashed: {}", generation, e);
                self.mark_dead(&mut state, e.to_string()).await;
                Err(e)
            }
            Err(_) => {
                let millis = request_timeout.as_millis() as u64;
                warn!(
                    "Engine generation {} gave no answer within {} ms, tearing it down",
                    generation, millis
                );
                self.mark_dead(&mut state, format!("no response within {millis} ms"))
                    .await;
                Err(OcrRenameError::EngineTimeout(millis))
            }
        }
    }

    /// Close the engine; safe to call more than once
    pub async fn shutdown(&self) {
        let mut state = self.state.lock().await;
        match std::mem::replace(&mut *state, EngineState::Closed) {
            EngineState::Live(process) => {
                let generation = process.generation();
                process.terminate(self.config.shutdown_grace()).await;
                info!("OCR engine generation {} shut down", generation);
            }
            previous => debug!("Engine shutdown requested while {}", previous.label()),
        }
    }

    /// Whether a live process is currently held
    #[cfg(test)]
    pub async fn is_running(&self) -> bool {
        matches!(&*self.state.lock().await, EngineState::Live(_))
    }

    /// Bring the state to `Live`, relaunching after a crash
    async fn ensure_live<'a>(&self, state: &'a mut EngineState) -> Result<&'a mut EngineProcess> {
        let relaunch = match &*state {
            EngineState::Live(_) => None,
            EngineState::Idle => Some(false),
            EngineState::Dead { reason } => {
                warn!("Restarting OCR engine after failure: {}", reason);
                Some(true)
            }
            EngineState::Failed { reason } => {
                return Err(OcrRenameError::EngineLaunch(format!(
                    "engine unavailable after failed restart: {reason}"
                )))
            }
            EngineState::Closed => {
                return Err(OcrRenameError::EngineLaunch(
                    "engine has been shut down".to_string(),
                ))
            }
        };

        if let Some(is_restart) = relaunch {
            match self.launch().await {
                Ok(process) => {
                    if is_restart {
                        info!("OCR engine restarted as generation {}", process.generation());
                    }
                    *state = EngineState::Live(process);
                }
                Err(e) => {
                    error!("OCR engine launch failed: {}", e);
                    *state = EngineState::Failed {
                        reason: e.to_string(),
                    };
                    return Err(e);
                }
            }
        }

        match state {
            EngineState::Live(process) => Ok(process),
            other => Err(OcrRenameError::EngineCrashed(format!(
                "engine is {}",
                other.label()
            ))),
        }
    }

    /// Spawn a new generation and wait for its readiness marker
    async fn launch(&self) -> Result<EngineProcess> {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let mut process = EngineProcess::spawn(&self.config, &self.executable, generation)?;

        info!("Waiting for OCR engine generation {} to load models...", generation);
        match process
            .await_ready(&self.config.ready_markers, self.config.ready_timeout())
            .await
        {
            Ok(()) => {
                info!("OCR engine generation {} ready", generation);
                Ok(process)
            }
            Err(e) => {
                process.kill().await;
                Err(e)
            }
        }
    }

    async fn mark_dead(&self, state: &mut EngineState, reason: String) {
        if let EngineState::Live(process) =
            std::mem::replace(state, EngineState::Dead { reason })
        {
            // The pipe can no longer be trusted to be request-aligned
            process.kill().await;
        }
    }
}

#[async_trait]
impl TextRecognizer for EngineManager {
    async fn recognize(&self, image_path: &Path) -> Result<EngineReply> {
        let absolute = std::path::absolute(image_path)?;
        self.send_request(&EngineRequest::for_path(&absolute)).await
    }
}

/// Look for a bundled engine next to the running executable
pub fn discover_engine() -> Result<PathBuf> {
    let exe = std::env::current_exe()?;
    let base_dir = exe.parent().map(Path::to_path_buf).unwrap_or_default();
    find_engine_in(&base_dir).ok_or_else(|| {
        OcrRenameError::EngineLaunch(format!(
            "{} not found under {}; set engine.executable in the config",
            ENGINE_BINARY,
            base_dir.display()
        ))
    })
}

/// Candidates under `base_dir`; one only counts if a `models` folder sits beside it
pub fn find_engine_in(base_dir: &Path) -> Option<PathBuf> {
    let binary = format!("{}{}", ENGINE_BINARY, std::env::consts::EXE_SUFFIX);
    let candidates = [
        base_dir.join(BUNDLED_ENGINE_DIR).join(&binary),
        base_dir.join(&binary),
    ];

    candidates.into_iter().find(|candidate| {
        candidate.is_file()
            && candidate
                .parent()
                .map(|dir| dir.join("models").is_dir())
                .unwrap_or(false)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_engine_prefers_bundled_dir() {
        let dir = tempfile::tempdir().unwrap();
        let binary = format!("{}{}", ENGINE_BINARY, std::env::consts::EXE_SUFFIX);

        let bundled = dir.path().join(BUNDLED_ENGINE_DIR);
        std::fs::create_dir_all(bundled.join("models")).unwrap();
        std::fs::write(bundled.join(&binary), b"").unwrap();

        std::fs::create_dir_all(dir.path().join("models")).unwrap();
        std::fs::write(dir.path().join(&binary), b"").unwrap();

        assert_eq!(find_engine_in(dir.path()), Some(bundled.join(&binary)));
    }

    #[test]
    fn test_find_engine_requires_models_dir() {
        let dir = tempfile::tempdir().unwrap();
        let binary = format!("{}{}", ENGINE_BINARY, std::env::consts::EXE_SUFFIX);
        std::fs::write(dir.path().join(&binary), b"").unwrap();

        assert_eq!(find_engine_in(dir.path()), None);

        std::fs::create_dir_all(dir.path().join("models")).unwrap();
        assert_eq!(find_engine_in(dir.path()), Some(dir.path().join(&binary)));
    }

    #[cfg(unix)]
    mod process_tests {
        use super::super::*;
        use tempfile::TempDir;

        /// Engine that answers every request with two fragments
        const ECHO_ENGINE: &str = r#"
echo "PaddleOCR-json v1.4.1"
echo "OCR init completed."
while IFS= read -r line; do
  echo '{"code":100,"data":[{"box":[[0,0],[1,0],[1,1],[0,1]],"score":0.9,"text":"Hello "},{"box":[],"score":0.8,"text":"World"}]}'
done
"#;

        /// Engine that answers once, then exits; a marker file makes relaunches fail
        const CRASH_ONCE_ENGINE: &str = r#"
if [ -f launched ]; then
  exit 3
fi
touch launched
echo "OCR init completed."
read -r line
echo '{"code":100,"data":[{"text":"first"}]}'
exit 0
"#;

        /// Engine that answers once and exits every time
        const ONE_SHOT_ENGINE: &str = r#"
echo "OCR init completed."
read -r line
echo '{"code":100,"data":[{"text":"once"}]}'
exit 0
"#;

        /// Answers with the image stem; the first launch prints a stray line before its first answer
        const NOISY_FIRST_ENGINE: &str = r#"
noisy=
if [ ! -f warned ]; then
  touch warned
  noisy=1
fi
echo "OCR init completed."
while IFS= read -r line; do
  if [ -n "$noisy" ]; then
    echo '[warn] slow image'
    noisy=
  fi
  text=$(printf '%s' "$line" | sed 's/.*\///; s/\.[^.]*$//')
  printf '{"code":100,"data":[{"text":"%s"}]}\n' "$text"
done
"#;

        fn engine_config(dir: &TempDir, script: &str) -> EngineConfig {
            let script_path = dir.path().join("engine.sh");
            std::fs::write(&script_path, script).unwrap();
            EngineConfig {
                executable: Some(PathBuf::from("/bin/sh")),
                args: vec![script_path.to_string_lossy().into_owned()],
                working_dir: Some(dir.path().to_path_buf()),
                models_subdir: None,
                ready_timeout_secs: 5,
                request_timeout_secs: 5,
                shutdown_grace_ms: 200,
                ..Default::default()
            }
        }

        fn manager(config: EngineConfig) -> EngineManager {
            EngineManager::from_config(config).unwrap()
        }

        #[tokio::test]
        async fn test_request_roundtrip() {
            let dir = tempfile::tempdir().unwrap();
            let engine = manager(engine_config(&dir, ECHO_ENGINE));

            assert_eq!(engine.start().await.unwrap(), 1);
            let reply = engine
                .send_request(&EngineRequest {
                    image_path: "/tmp/a.png".to_string(),
                })
                .await
                .unwrap();

            assert_eq!(reply.generation, 1);
            assert_eq!(reply.response.status_code, protocol::CODE_SUCCESS);
            assert_eq!(reply.response.into_text("").unwrap(), "Hello World");

            engine.shutdown().await;
            assert!(!engine.is_running().await);
        }

        #[tokio::test]
        async fn test_first_request_starts_engine() {
            let dir = tempfile::tempdir().unwrap();
            let engine = manager(engine_config(&dir, ECHO_ENGINE));

            assert_eq!(engine.generation(), 0);
            let reply = engine.recognize(Path::new("/tmp/b.png")).await.unwrap();
            assert_eq!(reply.generation, 1);
            assert!(engine.is_running().await);
            engine.shutdown().await;
        }

        #[tokio::test]
        async fn test_concurrent_requests_are_serialized() {
            let dir = tempfile::tempdir().unwrap();
            let engine = std::sync::Arc::new(manager(engine_config(&dir, ECHO_ENGINE)));
            engine.start().await.unwrap();

            let mut handles = Vec::new();
            for i in 0..8 {
                let engine = engine.clone();
                handles.push(tokio::spawn(async move {
                    engine
                        .recognize(Path::new(&format!("/tmp/img_{i}.png")))
                        .await
                }));
            }
            for handle in handles {
                let reply = handle.await.unwrap().unwrap();
                assert_eq!(reply.response.into_text("").unwrap(), "Hello World");
            }
            assert_eq!(engine.generation(), 1);
            engine.shutdown().await;
        }

        #[tokio::test]
        async fn test_ensure_started_keeps_live_process() {
            let dir = tempfile::tempdir().unwrap();
            let engine = manager(engine_config(&dir, ECHO_ENGINE));

            assert_eq!(engine.ensure_started().await.unwrap(), 1);
            assert_eq!(engine.ensure_started().await.unwrap(), 1);
            assert_eq!(engine.generation(), 1);

            engine.shutdown().await;
            assert!(engine.ensure_started().await.unwrap_err().is_fatal());
        }

        #[tokio::test]
        async fn test_readiness_timeout() {
            let dir = tempfile::tempdir().unwrap();
            let mut config = engine_config(&dir, "exec sleep 30\n");
            config.ready_timeout_secs = 1;
            let engine = manager(config);

            let result = engine.start().await;
            assert!(matches!(result, Err(OcrRenameError::EngineNotReady(_))));
            assert!(!engine.is_running().await);

            // A failed start is not retried implicitly by requests
            let next = engine.recognize(Path::new("/tmp/a.png")).await;
            assert!(matches!(next, Err(OcrRenameError::EngineLaunch(_))));
        }

        #[tokio::test]
        async fn test_engine_exit_before_ready() {
            let dir = tempfile::tempdir().unwrap();
            let engine = manager(engine_config(&dir, "echo loading\nexit 1\n"));

            match engine.start().await {
                Err(OcrRenameError::EngineNotReady(msg)) => assert!(msg.contains("startup")),
                other => panic!("unexpected start result: {:?}", other.map(|_| ())),
            }
        }

        #[tokio::test]
        async fn test_custom_ready_marker() {
            let dir = tempfile::tempdir().unwrap();
            let mut config = engine_config(
                &dir,
                "echo '[init] models loaded: READY'\nwhile IFS= read -r line; do echo '{\"code\":101,\"data\":\"no text\"}'; done\n",
            );
            config.ready_markers = vec!["READY".to_string()];
            let engine = manager(config);

            engine.start().await.unwrap();
            let reply = engine.recognize(Path::new("/tmp/blank.png")).await.unwrap();
            assert_eq!(reply.response.into_text("").unwrap(), "");
            engine.shutdown().await;
        }

        #[tokio::test]
        async fn test_crash_triggers_single_restart() {
            let dir = tempfile::tempdir().unwrap();
            let engine = manager(engine_config(&dir, ONE_SHOT_ENGINE));
            engine.start().await.unwrap();

            let first = engine.recognize(Path::new("/tmp/1.png")).await.unwrap();
            assert_eq!(first.generation, 1);

            // The process exited after one answer: this request sees the crash
            let second = engine.recognize(Path::new("/tmp/2.png")).await;
            assert!(matches!(second, Err(OcrRenameError::EngineCrashed(_))));
            assert_eq!(engine.generation(), 1);

            // The next caller relaunches a new generation
            let third = engine.recognize(Path::new("/tmp/3.png")).await.unwrap();
            assert_eq!(third.generation, 2);
            assert_eq!(third.response.into_text("").unwrap(), "once");
            engine.shutdown().await;
        }

        #[tokio::test]
        async fn test_failed_restart_is_fatal() {
            let dir = tempfile::tempdir().unwrap();
            let engine = manager(engine_config(&dir, CRASH_ONCE_ENGINE));
            engine.start().await.unwrap();

            engine.recognize(Path::new("/tmp/1.png")).await.unwrap();
            let crashed = engine.recognize(Path::new("/tmp/2.png")).await;
            assert!(matches!(crashed, Err(OcrRenameError::EngineCrashed(_))));

            let restart = engine.recognize(Path::new("/tmp/3.png")).await;
            let err = restart.unwrap_err();
            assert!(err.is_fatal());
            assert_eq!(engine.generation(), 2);

            // No further restart attempts
            let after = engine.recognize(Path::new("/tmp/4.png")).await;
            assert!(after.unwrap_err().is_fatal());
            assert_eq!(engine.generation(), 2);
        }

        #[tokio::test]
        async fn test_response_timeout_tears_down_engine() {
            let dir = tempfile::tempdir().unwrap();
            let mut config = engine_config(
                &dir,
                "echo 'OCR init completed.'\nread -r line\nexec sleep 30\n",
            );
            config.request_timeout_secs = 1;
            let engine = manager(config);
            engine.start().await.unwrap();

            let result = engine.recognize(Path::new("/tmp/slow.png")).await;
            assert!(matches!(result, Err(OcrRenameError::EngineTimeout(1000))));
            assert!(!engine.is_running().await);
        }

        #[tokio::test]
        async fn test_unreadable_reply_restarts_engine() {
            let dir = tempfile::tempdir().unwrap();
            let engine = manager(engine_config(&dir, NOISY_FIRST_ENGINE));
            engine.start().await.unwrap();

            let first = engine.recognize(Path::new("/tmp/first.png")).await;
            assert!(matches!(first, Err(OcrRenameError::EngineProtocol(_))));
            assert!(!engine.is_running().await);

            // The answer left behind for "first" must not reach later requests
            let second = engine.recognize(Path::new("/tmp/second.png")).await.unwrap();
            assert_eq!(second.generation, 2);
            assert_eq!(second.response.into_text("").unwrap(), "second");

            let third = engine.recognize(Path::new("/tmp/third.png")).await.unwrap();
            assert_eq!(third.generation, 2);
            assert_eq!(third.response.into_text("").unwrap(), "third");
            engine.shutdown().await;
        }

        #[tokio::test]
        async fn test_shutdown_is_idempotent() {
            let dir = tempfile::tempdir().unwrap();
            let engine = manager(engine_config(&dir, ECHO_ENGINE));
            engine.start().await.unwrap();

            engine.shutdown().await;
            engine.shutdown().await;

            let result = engine.recognize(Path::new("/tmp/a.png")).await;
            assert!(matches!(result, Err(OcrRenameError::EngineLaunch(_))));
        }
    }
}
