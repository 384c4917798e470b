//! Runs untrusted snippets as child processes.
//!
//! Every execution gets its own scratch directory holding a uniquely named
//! source file. The child runs with a cleared environment, the scratch directory
//! as working directory and `HOME`, no stdin, its own process group, and (on
//! Linux) resource limits set between fork and exec. The directory is removed
//! before `execute` returns, whatever the outcome.

use crate::error::ExecutionError;
use crate::registry::{LanguageRegistry, LanguageRuntime};
use crate::types::{ExecutionResult, ExitIndicator};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

const FALLBACK_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

/// How long to wait for output pipes to close after the child exits.
const DRAIN_GRACE: Duration = Duration::from_secs(1);

/// Appended to a stream that was cut at `max_output_bytes`.
pub const TRUNCATED_MARKER: &str = "\n[output truncated]";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceLimits {
    /// Maximum number of open files.
    pub nofile: u64,
    /// Maximum size of any file written, in KB.
    pub fsize_kb: Option<u64>,
    /// Address space limit in KB. Off by default; JIT runtimes reserve large
    /// virtual ranges up front.
    pub mem_kb: Option<u64>,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            nofile: 256,
            fsize_kb: None,
            mem_kb: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Wall-clock bound for compile and run together.
    pub timeout: Duration,
    pub scratch_dir: PathBuf,
    /// Captured stdout and stderr are each cut to this many bytes.
    pub max_output_bytes: usize,
    pub limits: ResourceLimits,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            scratch_dir: std::env::temp_dir(),
            max_output_bytes: 64 * 1024,
            limits: ResourceLimits::default(),
        }
    }
}

pub struct Sandbox {
    registry: LanguageRegistry,
    config: SandboxConfig,
    search_path: OsString,
}

/// Bytes kept from one output pipe.
#[derive(Debug, Default)]
struct Captured {
    bytes: Vec<u8>,
    truncated: bool,
}

impl Captured {
    fn into_text(self) -> String {
        let mut text = String::from_utf8_lossy(&self.bytes).into_owned();
        if self.truncated {
            text.push_str(TRUNCATED_MARKER);
        }
        text
    }
}

/// Raw output of one child process.
#[derive(Debug)]
struct StepOutput {
    stdout: Captured,
    stderr: Captured,
    exit: ExitIndicator,
}

impl StepOutput {
    fn into_result(self) -> ExecutionResult {
        let stdout = self.stdout.into_text();
        let stderr = self.stderr.into_text();
        let failure_reason = if self.exit.success() {
            if !stderr.is_empty() {
                debug!(bytes = stderr.len(), "Discarding stderr of successful run");
            }
            None
        } else if stderr.trim().is_empty() {
            Some(format!("exited with {}", self.exit))
        } else {
            Some(stderr)
        };
        ExecutionResult {
            stdout,
            exit: self.exit,
            failure_reason,
        }
    }
}

impl Sandbox {
    pub fn new(registry: LanguageRegistry, config: SandboxConfig) -> Self {
        let search_path = std::env::var_os("PATH").unwrap_or_else(|| FALLBACK_PATH.into());
        Self {
            registry,
            config,
            search_path,
        }
    }

    /// Runs `code` with the runtime registered under `language_key`.
    ///
    /// A guest that exits non-zero still produces `Ok`; only failing to get the
    /// guest running (or to stop it in time) is an error.
    pub async fn execute(
        &self,
        language_key: &str,
        code: &str,
    ) -> Result<ExecutionResult, ExecutionError> {
        let runtime = self
            .registry
            .get(language_key)
            .ok_or_else(|| ExecutionError::UnknownRuntime(language_key.to_string()))?;
        if code.trim().is_empty() {
            return Err(ExecutionError::EmptyCode);
        }

        let workspace = tempfile::Builder::new()
            .prefix("resl-")
            .tempdir_in(&self.config.scratch_dir)
            .map_err(storage_failure)?;

        let started = Instant::now();
        let outcome = self.run_in(workspace.path(), runtime, code).await;
        let removed = workspace.close();

        let result = match outcome {
            Ok(result) => result,
            Err(e) => {
                warn!(language = language_key, error = %e, "Execution failed");
                return Err(e);
            }
        };
        removed.map_err(storage_failure)?;

        info!(
            language = language_key,
            exit = %result.exit,
            stdout_len = result.stdout.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Execution finished"
        );
        Ok(result)
    }

    async fn run_in(
        &self,
        workspace: &Path,
        runtime: &LanguageRuntime,
        code: &str,
    ) -> Result<ExecutionResult, ExecutionError> {
        let dir = workspace.canonicalize().map_err(storage_failure)?;
        let stem = uuid::Uuid::new_v4().simple().to_string();
        let file = dir.join(format!("{}.{}", stem, runtime.extension()));
        let artifact = dir.join(&stem);
        tokio::fs::write(&file, code)
            .await
            .map_err(storage_failure)?;

        let deadline = Instant::now() + self.config.timeout;

        if let Some(compile) = &runtime.compile_command_template {
            let (program, args) = compile.render(&file, &artifact);
            let step = self.run_step(&program, &args, &dir, deadline).await?;
            if !step.exit.success() {
                debug!(language = %runtime.key, exit = %step.exit, "Compile step failed");
                return Ok(step.into_result());
            }
        }

        let (program, args) = runtime.run_command_template.render(&file, &artifact);
        let step = self.run_step(&program, &args, &dir, deadline).await?;
        Ok(step.into_result())
    }

    /// Finds `program` on the server's PATH. Absolute paths are taken as-is.
    fn resolve(&self, program: &str, cwd: &Path) -> Result<PathBuf, ExecutionError> {
        let path = Path::new(program);
        if path.is_absolute() {
            return Ok(path.to_path_buf());
        }
        which::which_in(program, Some(&self.search_path), cwd)
            .map_err(|e| ExecutionError::StartFailure(format!("{}: {}", program, e)))
    }

    async fn run_step(
        &self,
        program: &str,
        args: &[String],
        dir: &Path,
        deadline: Instant,
    ) -> Result<StepOutput, ExecutionError> {
        let binary = self.resolve(program, dir)?;
        debug!(binary = %binary.display(), ?args, "Spawning");

        let mut command = Command::new(&binary);
        command
            .args(args)
            .current_dir(dir)
            .env_clear()
            .env("PATH", &self.search_path)
            .env("HOME", dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);
        #[cfg(target_os = "linux")]
        apply_limits(&mut command, self.config.limits, cpu_seconds(self.config.timeout));

        let mut child = command
            .spawn()
            .map_err(|e| ExecutionError::StartFailure(format!("{}: {}", program, e)))?;
        // The child leads its own group; its pid is unavailable once it is reaped.
        let group = child.id();

        let limit = self.config.max_output_bytes;
        let stdout = child.stdout.take().map(|out| Capture::start(out, limit));
        let stderr = child.stderr.take().map(|err| Capture::start(err, limit));

        match tokio::time::timeout_at(deadline, child.wait()).await {
            Ok(Ok(status)) => {
                // Background processes left in the group would keep the pipes open.
                kill_group(group);
                let (stdout, stderr) = tokio::join!(collect(stdout), collect(stderr));
                Ok(StepOutput {
                    stdout,
                    stderr,
                    exit: status.into(),
                })
            }
            Ok(Err(e)) => {
                abort(stdout);
                abort(stderr);
                Err(ExecutionError::StartFailure(format!("{}: {}", program, e)))
            }
            Err(_) => {
                warn!(program, timeout_ms = self.timeout_ms(), "Execution timed out, killing");
                kill_group(group);
                let _ = child.start_kill();
                let _ = child.wait().await;
                abort(stdout);
                abort(stderr);
                Err(ExecutionError::ExecutionTimeout {
                    timeout_ms: self.timeout_ms(),
                })
            }
        }
    }

    fn timeout_ms(&self) -> u64 {
        self.config.timeout.as_millis() as u64
    }
}

fn storage_failure(e: std::io::Error) -> ExecutionError {
    ExecutionError::StorageFailure(e.to_string())
}

/// A task reading one output pipe. It stops on end of file or when told to.
struct Capture {
    task: JoinHandle<Captured>,
    stop: oneshot::Sender<()>,
}

impl Capture {
    fn start<R>(reader: R, limit: usize) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let (stop, stopped) = oneshot::channel();
        Self {
            task: tokio::spawn(drain(reader, limit, stopped)),
            stop,
        }
    }

    /// Waits up to `DRAIN_GRACE` for the pipe to close. A descendant that left
    /// the process group can hold it open; what was read so far is kept.
    async fn finish(mut self) -> Captured {
        if let Ok(joined) = tokio::time::timeout(DRAIN_GRACE, &mut self.task).await {
            return joined.unwrap_or_else(|e| {
                warn!(error = %e, "Output reader failed");
                Captured::default()
            });
        }
        debug!("Output pipe still open after exit");
        let _ = self.stop.send(());
        self.task.await.unwrap_or_else(|e| {
            warn!(error = %e, "Output reader failed");
            Captured::default()
        })
    }
}

/// Reads until end of file or `stop`, keeping at most `limit` bytes. The pipe
/// is drained past the limit so a chatty child never blocks on a full pipe.
async fn drain<R: AsyncRead + Unpin>(
    mut reader: R,
    limit: usize,
    mut stop: oneshot::Receiver<()>,
) -> Captured {
    let mut captured = Captured::default();
    let mut buf = [0u8; 8192];
    loop {
        let read = tokio::select! {
            read = reader.read(&mut buf) => read,
            _ = &mut stop => break,
        };
        match read {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let room = limit.saturating_sub(captured.bytes.len());
                if n > room {
                    captured.truncated = true;
                }
                captured.bytes.extend_from_slice(&buf[..n.min(room)]);
            }
        }
    }
    if captured.truncated {
        drop_partial_char(&mut captured.bytes);
    }
    captured
}

/// Removes a multi-byte character cut off at the end of `bytes`.
fn drop_partial_char(bytes: &mut Vec<u8>) {
    if let Err(e) = std::str::from_utf8(bytes) {
        if e.error_len().is_none() {
            bytes.truncate(e.valid_up_to());
        }
    }
}

async fn collect(capture: Option<Capture>) -> Captured {
    match capture {
        Some(capture) => capture.finish().await,
        None => Captured::default(),
    }
}

fn abort(capture: Option<Capture>) {
    if let Some(capture) = capture {
        capture.task.abort();
    }
}

#[cfg(target_os = "linux")]
fn kill_group(group: Option<u32>) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    if let Some(pid) = group {
        // ESRCH just means the group is already gone.
        let _ = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL);
    }
}

#[cfg(not(target_os = "linux"))]
fn kill_group(_group: Option<u32>) {}

#[cfg(target_os = "linux")]
fn cpu_seconds(timeout: Duration) -> u64 {
    timeout.as_secs() + 1
}

#[cfg(target_os = "linux")]
fn apply_limits(command: &mut Command, limits: ResourceLimits, cpu_secs: u64) {
    use nix::sys::resource::{setrlimit, Resource};

    // SAFETY: the closure only calls setrlimit, which is async-signal-safe.
    unsafe {
        command.pre_exec(move || {
            setrlimit(Resource::RLIMIT_CPU, cpu_secs, cpu_secs)?;
            setrlimit(Resource::RLIMIT_CORE, 0, 0)?;
            setrlimit(Resource::RLIMIT_NOFILE, limits.nofile, limits.nofile)?;
            if let Some(kb) = limits.fsize_kb {
                setrlimit(Resource::RLIMIT_FSIZE, kb * 1024, kb * 1024)?;
            }
            if let Some(kb) = limits.mem_kb {
                setrlimit(Resource::RLIMIT_AS, kb * 1024, kb * 1024)?;
            }
            Ok(())
        });
    }
}
