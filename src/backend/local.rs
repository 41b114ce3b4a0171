//! Local execution backend - runs code in a short-lived child process.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::cancel::Cancellation;
use super::result::ExecutionResult;
use super::ExecutionBackend;
use crate::registry::CodeRef;

/// Configuration for the local backend
#[derive(Debug, Clone)]
pub struct LocalConfig {
    /// Interpreter binary (e.g. `sh`, `python3`)
    pub interpreter: String,
    /// Flag that makes the interpreter run inline source (e.g. `-c`)
    pub inline_flag: String,
    /// Extra arguments placed before the code
    pub args: Vec<String>,
    /// Working directory for the child
    pub work_dir: Option<PathBuf>,
    /// Environment variables to set
    pub env: Vec<(String, String)>,
    /// Bytes kept per stream; the rest is drained and dropped
    pub max_output_bytes: usize,
    /// How long to wait for the killed child and its pipes
    pub kill_grace_ms: u64,
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            interpreter: "sh".to_string(),
            inline_flag: "-c".to_string(),
            args: Vec::new(),
            work_dir: None,
            env: Vec::new(),
            max_output_bytes: 100_000,
            kill_grace_ms: 200,
        }
    }
}

impl LocalConfig {
    pub fn new(interpreter: impl Into<String>) -> Self {
        Self {
            interpreter: interpreter.into(),
            ..Default::default()
        }
    }

    /// Add an environment variable
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn work_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.work_dir = Some(dir.into());
        self
    }

    pub fn max_output_bytes(mut self, bytes: usize) -> Self {
        self.max_output_bytes = bytes;
        self
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }
}

#[derive(Debug, Default)]
struct Captured {
    bytes: Vec<u8>,
    dropped: usize,
}

type SharedCapture = Arc<Mutex<Captured>>;

/// Drain `reader` into `capture`, keeping at most `limit` bytes.
async fn drain_limited<R: AsyncRead + Unpin>(mut reader: R, capture: SharedCapture, limit: usize) {
    let mut chunk = [0u8; 8192];
    loop {
        let n = match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => return,
            Ok(n) => n,
        };
        let Ok(mut cap) = capture.lock() else {
            return;
        };
        let room = limit.saturating_sub(cap.bytes.len());
        let keep = room.min(n);
        cap.bytes.extend_from_slice(&chunk[..keep]);
        cap.dropped += n - keep;
    }
}

/// Wait briefly for a reader, then take whatever it captured.
async fn collect(handle: Option<JoinHandle<()>>, capture: &SharedCapture, grace: Duration) -> (String, bool) {
    if let Some(mut handle) = handle
        && tokio::time::timeout(grace, &mut handle).await.is_err()
    {
        // A grandchild may still hold the pipe open.
        handle.abort();
    }
    match capture.lock() {
        Ok(cap) => (String::from_utf8_lossy(&cap.bytes).into_owned(), cap.dropped > 0),
        Err(_) => (String::new(), false),
    }
}

enum Ending {
    Exited(std::io::Result<std::process::ExitStatus>),
    TimedOut,
    Cancelled,
}

/// Backend that runs code with a local interpreter.
///
/// The deadline is enforced: a child still running at `timeout` is killed and
/// the call returns a `timeout` result.
#[derive(Debug, Clone)]
pub struct LocalBackend {
    config: LocalConfig,
}

impl LocalBackend {
    pub fn new(config: LocalConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &LocalConfig {
        &self.config
    }

    fn command(&self, code: &CodeRef) -> Command {
        let mut cmd = Command::new(&self.config.interpreter);
        cmd.args(&self.config.args);
        match code {
            CodeRef::Inline { source } => {
                cmd.arg(&self.config.inline_flag).arg(source);
            }
            CodeRef::Path { path } => {
                cmd.arg(path);
            }
        }
        if let Some(dir) = &self.config.work_dir {
            cmd.current_dir(dir);
        }
        for (key, value) in &self.config.env {
            cmd.env(key, value);
        }
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // Own process group, so a kill reaches subshells and grandchildren
        #[cfg(unix)]
        {
            cmd.process_group(0);
        }
        cmd
    }
}

/// Kill the child and everything it spawned.
fn kill_tree(child: &mut Child) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{Signal, killpg};
        use nix::unistd::Pid;

        if let Some(pid) = child.id() {
            match killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
                Ok(()) => return,
                Err(e) => warn!(pid, error = %e, "failed to kill process group"),
            }
        }
    }
    if let Err(e) = child.start_kill() {
        warn!(error = %e, "failed to kill local execution");
    }
}

#[async_trait]
impl ExecutionBackend for LocalBackend {
    fn name(&self) -> &str {
        "local"
    }

    async fn submit_and_wait(&self, code: &CodeRef, timeout: Duration, cancel: &Cancellation) -> ExecutionResult {
        let started = Instant::now();
        let grace = Duration::from_millis(self.config.kill_grace_ms);
        let limit = self.config.max_output_bytes;

        if cancel.is_cancelled() {
            debug!(code = %code, "cancelled before spawn");
            return ExecutionResult::timed_out(String::new(), String::new(), started.elapsed());
        }

        let mut child = match self.command(code).spawn() {
            Ok(child) => child,
            Err(e) => {
                warn!(interpreter = %self.config.interpreter, error = %e, "failed to spawn interpreter");
                return ExecutionResult::infra_error(
                    format!("failed to spawn {}: {}", self.config.interpreter, e),
                    started.elapsed(),
                );
            }
        };
        debug!(pid = ?child.id(), code = %code, timeout_ms = timeout.as_millis() as u64, "spawned local execution");

        let stdout_cap = SharedCapture::default();
        let stderr_cap = SharedCapture::default();
        let stdout_task = child
            .stdout
            .take()
            .map(|out| tokio::spawn(drain_limited(out, stdout_cap.clone(), limit)));
        let stderr_task = child
            .stderr
            .take()
            .map(|err| tokio::spawn(drain_limited(err, stderr_cap.clone(), limit)));

        let ending = tokio::select! {
            status = child.wait() => Ending::Exited(status),
            _ = tokio::time::sleep(timeout) => Ending::TimedOut,
            _ = cancel.cancelled() => Ending::Cancelled,
        };

        if !matches!(ending, Ending::Exited(_)) {
            kill_tree(&mut child);
            let _ = tokio::time::timeout(grace, child.wait()).await;
        }

        let (stdout, stdout_truncated) = collect(stdout_task, &stdout_cap, grace).await;
        let (stderr, stderr_truncated) = collect(stderr_task, &stderr_cap, grace).await;
        let truncated = stdout_truncated || stderr_truncated;
        if truncated {
            warn!(limit, "local execution output truncated");
        }

        let elapsed = started.elapsed();
        let result = match ending {
            Ending::Exited(Ok(status)) => ExecutionResult::completed(stdout, stderr, status.code(), elapsed),
            Ending::Exited(Err(e)) => ExecutionResult::infra_error(format!("wait failed: {}", e), elapsed),
            Ending::TimedOut => {
                warn!(timeout_ms = timeout.as_millis() as u64, "local execution timed out, killed");
                ExecutionResult::timed_out(stdout, stderr, elapsed)
            }
            Ending::Cancelled => {
                warn!("local execution cancelled, killed");
                ExecutionResult::timed_out(stdout, stderr, elapsed)
            }
        };
        debug!(failure_kind = %result.failure_kind, duration_ms = result.duration_ms, "local execution finished");
        result.with_truncated(truncated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{FailureKind, cancellation};

    fn sh() -> LocalBackend {
        LocalBackend::new(LocalConfig::default())
    }

    async fn run(backend: &LocalBackend, source: &str, timeout: Duration) -> ExecutionResult {
        backend
            .submit_and_wait(&CodeRef::inline(source), timeout, &Cancellation::never())
            .await
    }

    #[test]
    fn test_local_config_default() {
        let config = LocalConfig::default();
        assert_eq!(config.interpreter, "sh");
        assert_eq!(config.inline_flag, "-c");
        assert_eq!(config.max_output_bytes, 100_000);
    }

    #[test]
    fn test_local_config_builder() {
        let config = LocalConfig::new("python3")
            .env("FOO", "bar")
            .arg("-u")
            .work_dir("/tmp")
            .max_output_bytes(10);
        assert_eq!(config.interpreter, "python3");
        assert_eq!(config.env, vec![("FOO".to_string(), "bar".to_string())]);
        assert_eq!(config.args, vec!["-u".to_string()]);
        assert_eq!(config.work_dir, Some(PathBuf::from("/tmp")));
        assert_eq!(config.max_output_bytes, 10);
    }

    #[tokio::test]
    async fn test_success_captures_stdout() {
        let result = run(&sh(), "echo hello", Duration::from_secs(5)).await;
        assert!(result.success);
        assert_eq!(result.exit_status, Some(0));
        assert_eq!(result.failure_kind, FailureKind::None);
        assert!(result.stdout.contains("hello"));
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_runtime_error() {
        let result = run(&sh(), "echo oops >&2; exit 3", Duration::from_secs(5)).await;
        assert!(!result.success);
        assert_eq!(result.exit_status, Some(3));
        assert_eq!(result.failure_kind, FailureKind::RuntimeError);
        assert!(result.stderr.contains("oops"));
    }

    #[tokio::test]
    async fn test_timeout_is_enforced() {
        let started = Instant::now();
        let result = run(&sh(), "sleep 10", Duration::from_secs(1)).await;
        let elapsed = started.elapsed();

        assert_eq!(result.failure_kind, FailureKind::Timeout);
        assert!(!result.success);
        assert!(elapsed >= Duration::from_secs(1));
        assert!(elapsed < Duration::from_secs(3), "took {:?}", elapsed);
    }

    #[tokio::test]
    async fn test_cancellation_kills_child() {
        let backend = sh();
        let (handle, cancel) = cancellation();
        let task = tokio::spawn(async move {
            backend
                .submit_and_wait(&CodeRef::inline("sleep 10"), Duration::from_secs(30), &cancel)
                .await
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.cancel();

        let result = tokio::time::timeout(Duration::from_secs(3), task)
            .await
            .expect("cancelled run should return promptly")
            .unwrap();
        assert_eq!(result.failure_kind, FailureKind::Timeout);
    }

    #[tokio::test]
    async fn test_timeout_kills_grandchildren() {
        let dir = tempfile::TempDir::new().unwrap();
        let marker = dir.path().join("leaked");
        let source = format!("( sleep 2; echo leaked > '{}' ); true", marker.display());

        let result = run(&sh(), &source, Duration::from_secs(1)).await;
        assert_eq!(result.failure_kind, FailureKind::Timeout);

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(!marker.exists(), "subshell outlived the timeout");
    }

    #[tokio::test]
    async fn test_already_cancelled_does_not_spawn() {
        let dir = tempfile::TempDir::new().unwrap();
        let marker = dir.path().join("ran");
        let (handle, cancel) = cancellation();
        handle.cancel();

        let source = format!("touch '{}'", marker.display());
        let result = sh()
            .submit_and_wait(&CodeRef::inline(source), Duration::from_secs(5), &cancel)
            .await;
        assert_eq!(result.failure_kind, FailureKind::Timeout);
        assert!(!marker.exists());
    }

    #[tokio::test]
    async fn test_output_truncated() {
        let backend = LocalBackend::new(LocalConfig::default().max_output_bytes(16));
        let result = run(&backend, "printf '%0100d' 0", Duration::from_secs(5)).await;
        assert!(result.success);
        assert!(result.truncated);
        assert_eq!(result.stdout.len(), 16);
    }

    #[tokio::test]
    async fn test_env_is_passed() {
        let backend = LocalBackend::new(LocalConfig::default().env("MY_VAR", "hello"));
        let result = run(&backend, "test \"$MY_VAR\" = \"hello\"", Duration::from_secs(5)).await;
        assert!(result.success);
    }

    #[tokio::test]
    async fn test_script_path() {
        let dir = tempfile::TempDir::new().unwrap();
        let script = dir.path().join("job.sh");
        std::fs::write(&script, "echo from-file\n").unwrap();

        let result = sh()
            .submit_and_wait(&CodeRef::path(&script), Duration::from_secs(5), &Cancellation::never())
            .await;
        assert!(result.success);
        assert!(result.stdout.contains("from-file"));
    }

    #[tokio::test]
    async fn test_missing_interpreter_is_infra_error() {
        let backend = LocalBackend::new(LocalConfig::new("nonexistent_interpreter_xyz123"));
        let result = run(&backend, "true", Duration::from_secs(5)).await;
        assert_eq!(result.failure_kind, FailureKind::InfraError);
        assert!(result.stderr.contains("nonexistent_interpreter_xyz123"));
    }
}
