//! Engine child process
//!
//! Owns the spawned engine together with its pipes. Everything here assumes a
//! single caller; the manager in the parent module provides the locking.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::error::{OcrRenameError, Result};

/// Windows `CREATE_NO_WINDOW` process creation flag
#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

/// A running engine and its stdin/stdout pipes
pub struct EngineProcess {
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: BufReader<ChildStdout>,
    generation: u64,
}

impl EngineProcess {
    /// Spawn the engine with piped stdin/stdout in its installation directory
    pub fn spawn(config: &EngineConfig, executable: &Path, generation: u64) -> Result<Self> {
        if !executable.exists() {
            return Err(OcrRenameError::EngineLaunch(format!(
                "engine executable not found: {}",
                executable.display()
            )));
        }

        let working_dir = resolve_working_dir(config, executable);
        if let Some(models) = &config.models_subdir {
            let models_dir = working_dir.join(models);
            if !models_dir.is_dir() {
                return Err(OcrRenameError::EngineLaunch(format!(
                    "models directory not found: {}",
                    models_dir.display()
                )));
            }
        }

        let mut command = Command::new(executable);
        command
            .args(&config.args)
            .current_dir(&working_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        #[cfg(windows)]
        command.creation_flags(CREATE_NO_WINDOW);

        let mut child = command.spawn().map_err(|e| {
            OcrRenameError::EngineLaunch(format!("failed to spawn {}: {}", executable.display(), e))
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| OcrRenameError::EngineLaunch("failed to capture engine stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| OcrRenameError::EngineLaunch("failed to capture engine stdout".to_string()))?;

        info!(
            "Spawned OCR engine {:?} (generation {}, pid {:?}) in {:?}",
            executable,
            generation,
            child.id(),
            working_dir
        );

        Ok(Self {
            child,
            stdin: Some(stdin),
            stdout: BufReader::new(stdout),
            generation,
        })
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Read stdout until a line contains one of the markers
    pub async fn await_ready(&mut self, markers: &[String], wait: Duration) -> Result<()> {
        let scan = async {
            loop {
                match self.read_line().await {
                    Ok(Some(line)) => {
                        if markers.iter().any(|m| !m.is_empty() && line.contains(m.as_str())) {
                            return Ok(());
                        }
                        debug!("Engine startup output: {}", line.trim_end());
                    }
                    Ok(None) => {
                        let status = self.child.try_wait().ok().flatten();
                        return Err(OcrRenameError::EngineNotReady(match status {
                            Some(status) => format!("engine exited during startup ({status})"),
                            None => "engine closed its output during startup".to_string(),
                        }));
                    }
                    Err(e) => {
                        return Err(OcrRenameError::EngineNotReady(format!(
                            "failed reading engine output: {e}"
                        )))
                    }
                }
            }
        };

        match timeout(wait, scan).await {
            Ok(result) => result,
            Err(_) => Err(OcrRenameError::EngineNotReady(format!(
                "no readiness marker within {} ms",
                wait.as_millis()
            ))),
        }
    }

    /// Write one request line and read back one non-empty response line
    pub async fn exchange(&mut self, line: &str) -> Result<String> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| OcrRenameError::EngineCrashed("engine stdin already closed".to_string()))?;

        stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|e| OcrRenameError::EngineCrashed(format!("write to engine failed: {e}")))?;
        stdin
            .flush()
            .await
            .map_err(|e| OcrRenameError::EngineCrashed(format!("flush to engine failed: {e}")))?;

        loop {
            match self.read_line().await {
                Ok(Some(reply)) if reply.trim().is_empty() => continue,
                Ok(Some(reply)) => return Ok(reply),
                Ok(None) => {
                    return Err(OcrRenameError::EngineCrashed(
                        "engine closed its output".to_string(),
                    ))
                }
                Err(e) => {
                    return Err(OcrRenameError::EngineCrashed(format!(
                        "read from engine failed: {e}"
                    )))
                }
            }
        }
    }

    /// Close stdin, give the engine a moment to exit, then kill it
    pub async fn terminate(mut self, grace: Duration) {
        drop(self.stdin.take());

        match timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => {
                debug!("Engine generation {} exited with {}", self.generation, status);
            }
            Ok(Err(e)) => {
                warn!("Waiting for engine generation {} failed: {}", self.generation, e);
            }
            Err(_) => {
                debug!(
                    "Engine generation {} still alive after {:?}, killing",
                    self.generation, grace
                );
                if let Err(e) = self.child.kill().await {
                    warn!("Failed to kill engine generation {}: {}", self.generation, e);
                }
            }
        }
    }

    /// Kill without the polite stdin close; used once the pipe is out of step
    pub async fn kill(mut self) {
        if let Err(e) = self.child.kill().await {
            warn!("Failed to kill engine generation {}: {}", self.generation, e);
        }
    }

    /// One line of stdout, decoded lossily; `None` on EOF
    async fn read_line(&mut self) -> std::io::Result<Option<String>> {
        let mut buf = Vec::new();
        let n = self.stdout.read_until(b'\n', &mut buf).await?;
        if n == 0 {
            return Ok(None);
        }
        Ok(Some(String::from_utf8_lossy(&buf).into_owned()))
    }
}

fn resolve_working_dir(config: &EngineConfig, executable: &Path) -> PathBuf {
    config
        .working_dir
        .clone()
        .or_else(|| executable.parent().map(Path::to_path_buf))
        .unwrap_or_else(|| PathBuf::from("."))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_working_dir_defaults_to_executable_dir() {
        let config = EngineConfig::default();
        let dir = resolve_working_dir(&config, Path::new("/opt/ocr/PaddleOCR-json"));
        assert_eq!(dir, PathBuf::from("/opt/ocr"));
    }

    #[test]
    fn test_working_dir_override() {
        let config = EngineConfig {
            working_dir: Some(PathBuf::from("/srv/engine")),
            ..Default::default()
        };
        let dir = resolve_working_dir(&config, Path::new("/opt/ocr/PaddleOCR-json"));
        assert_eq!(dir, PathBuf::from("/srv/engine"));
    }

    #[test]
    fn test_spawn_missing_executable() {
        let config = EngineConfig::default();
        let result = EngineProcess::spawn(&config, Path::new("/nonexistent/PaddleOCR-json"), 1);
        assert!(matches!(result, Err(OcrRenameError::EngineLaunch(_))));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_spawn_requires_models_dir() {
        let dir = tempfile::tempdir().unwrap();
        let config = EngineConfig {
            working_dir: Some(dir.path().to_path_buf()),
            ..Default::default()
        };
        let result = EngineProcess::spawn(&config, Path::new("/bin/sh"), 1);
        match result {
            Err(OcrRenameError::EngineLaunch(msg)) => assert!(msg.contains("models")),
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("spawn should fail without a models directory"),
        }
    }
}
