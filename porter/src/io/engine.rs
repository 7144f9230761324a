//! Engine invocation boundary.
//!
//! The [`EngineRunner`] trait decouples the executor and arbitration from
//! the actual engine backends (external AI CLIs). Tests use scripted
//! runners that return predetermined responses without spawning processes.
//! Engines receive the structured prompt on stdin and are expected to emit
//! the files protocol on stdout.

use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

use anyhow::{Result, anyhow};
use tracing::{debug, info, instrument, warn};

use crate::core::plan::EngineKind;
use crate::io::process::{InterruptHandle, run_command_with_timeout};

/// Parameters for one engine invocation.
#[derive(Debug, Clone)]
pub struct EngineRequest {
    pub engine: EngineKind,
    /// Prompt text delivered on the engine's stdin.
    pub prompt: String,
    /// Working directory for the engine process.
    pub workdir: PathBuf,
    pub timeout: Duration,
    /// Truncate captured stdout/stderr beyond this many bytes.
    pub output_limit_bytes: usize,
    /// Extra command-line arguments appended to the engine template.
    pub extra_args: Vec<String>,
    /// Cooperative stop flag; a stop request kills the process.
    pub interrupt: InterruptHandle,
}

/// Raw result of one engine invocation.
#[derive(Debug, Clone)]
pub struct EngineResponse {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
    pub interrupted: bool,
}

impl EngineResponse {
    /// A response is usable only when the process exited zero in time.
    pub fn succeeded(&self) -> bool {
        !self.timed_out && !self.interrupted && self.exit_code == Some(0)
    }
}

/// Abstraction over engine backends.
pub trait EngineRunner {
    fn invoke(&self, request: &EngineRequest) -> Result<EngineResponse>;
}

/// Runner that spawns the engine's external CLI.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessEngineRunner;

impl ProcessEngineRunner {
    /// Fixed command template per engine. Mechanical engines have none.
    fn command_template(engine: EngineKind) -> Option<(&'static str, &'static [&'static str])> {
        match engine {
            EngineKind::Qwen => Some(("qwen", &["--yolo"])),
            EngineKind::Gemini => Some(("gemini", &["--approval-mode", "yolo"])),
            EngineKind::Claude => Some((
                "claude",
                &[
                    "--print",
                    "--output-format",
                    "text",
                    "--permission-mode",
                    "bypassPermissions",
                ],
            )),
            EngineKind::Codex => {
                Some(("codex", &["exec", "--dangerously-bypass-approvals-and-sandbox"]))
            }
            EngineKind::FileCopy | EngineKind::DirectoryCreate => None,
        }
    }
}

impl EngineRunner for ProcessEngineRunner {
    #[instrument(skip_all, fields(engine = %request.engine, timeout_secs = request.timeout.as_secs()))]
    fn invoke(&self, request: &EngineRequest) -> Result<EngineResponse> {
        let (program, args) = Self::command_template(request.engine)
            .ok_or_else(|| anyhow!("engine '{}' has no external command", request.engine))?;

        info!(workdir = %request.workdir.display(), "invoking engine");
        let mut cmd = Command::new(program);
        cmd.args(args)
            .args(&request.extra_args)
            .current_dir(&request.workdir);

        let output = run_command_with_timeout(
            cmd,
            Some(request.prompt.as_bytes()),
            request.timeout,
            request.output_limit_bytes,
            &request.interrupt,
        )?;

        if output.timed_out {
            warn!(timeout_secs = request.timeout.as_secs(), "engine timed out");
        } else if output.interrupted {
            warn!("engine interrupted");
        } else if !output.status.success() {
            warn!(exit_code = ?output.status.code(), "engine exited nonzero");
        } else {
            debug!("engine completed");
        }

        Ok(EngineResponse {
            exit_code: output.status.code(),
            stdout: output.stdout_utf8(),
            stderr: output.stderr_utf8(),
            timed_out: output.timed_out,
            interrupted: output.interrupted,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn request(engine: EngineKind) -> EngineRequest {
        EngineRequest {
            engine,
            prompt: "prompt".to_string(),
            workdir: Path::new("/tmp").to_path_buf(),
            timeout: Duration::from_secs(1),
            output_limit_bytes: 1000,
            extra_args: vec![],
            interrupt: InterruptHandle::new(),
        }
    }

    #[test]
    fn mechanical_engines_have_no_command() {
        let runner = ProcessEngineRunner;
        let err = runner
            .invoke(&request(EngineKind::FileCopy))
            .expect_err("should fail");
        assert!(err.to_string().contains("no external command"));
    }

    #[test]
    fn success_requires_zero_exit_without_timeout() {
        let ok = EngineResponse {
            exit_code: Some(0),
            stdout: String::new(),
            stderr: String::new(),
            timed_out: false,
            interrupted: false,
        };
        assert!(ok.succeeded());

        let timed_out = EngineResponse {
            timed_out: true,
            ..ok.clone()
        };
        assert!(!timed_out.succeeded());

        let nonzero = EngineResponse {
            exit_code: Some(2),
            ..ok
        };
        assert!(!nonzero.succeeded());
    }
}
