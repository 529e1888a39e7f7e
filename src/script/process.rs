//! Process spawning and result capture for service scripts.
//!
//! A run ends in exactly one [`Completion`]: the first JSON value parsed from
//! stdout, a clean exit, a failed exit, or an OS-level process error. Once a
//! value is captured the child is left to finish on its own; its remaining
//! output is only echoed to the debug log.

use std::ffi::OsString;
use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;

use futures::future::BoxFuture;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::process::{Child, ChildStdout, Command};
use tracing::{debug, warn};

use super::{ExecOutcome, Executor, ScriptOptions};

const UTF8_BOM: &[u8] = &[0xEF, 0xBB, 0xBF];

/// Spawns the configured interpreter for each script.
#[derive(Debug, Clone)]
pub struct ScriptExecutor {
    program: PathBuf,
    policy_args: Vec<String>,
    scripts_dir: PathBuf,
    extension: String,
}

impl ScriptExecutor {
    pub fn new(
        program: PathBuf,
        policy_args: Vec<String>,
        scripts_dir: PathBuf,
        extension: impl Into<String>,
    ) -> Self {
        Self {
            program,
            policy_args,
            scripts_dir,
            extension: extension.into(),
        }
    }

    /// `<scripts_dir>/<name>.<ext>` (no extension when `ext` is empty).
    pub fn script_path(&self, script: &str) -> PathBuf {
        let path = self.scripts_dir.join(script);
        if self.extension.is_empty() {
            path
        } else {
            path.with_extension(&self.extension)
        }
    }

    /// Full argument vector: policy args, script path, then `-key value` pairs.
    pub fn command_args(&self, script: &str, options: &ScriptOptions) -> Vec<OsString> {
        let mut args: Vec<OsString> = self.policy_args.iter().map(OsString::from).collect();
        args.push(self.script_path(script).into_os_string());
        for (key, value) in options {
            args.push(format!("-{key}").into());
            args.push(value.into());
        }
        args
    }

    /// Spawn the script and wait for its single outcome.
    pub async fn execute(&self, script: &str, options: &ScriptOptions) -> ExecOutcome {
        let args = self.command_args(script, options);
        debug!(program = %self.program.display(), ?args, "Executor: spawning {script}");

        let mut child = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| ExecError::SpawnFailed(e.to_string()))?;

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(echo_lines(script.to_string(), stderr));
        }
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ExecError::ProcessFailed("Failed to take stdout pipe".to_string()))?;

        let completion = await_completion(script, stdout, child).await;
        debug!(script, ?completion, "Executor: completed");
        completion.into_outcome()
    }
}

impl Executor for ScriptExecutor {
    fn run<'a>(
        &'a self,
        script: &'a str,
        options: &'a ScriptOptions,
    ) -> BoxFuture<'a, ExecOutcome> {
        Box::pin(self.execute(script, options))
    }
}

/// The single terminal transition of a script run.
#[derive(Debug, Clone, PartialEq)]
pub enum Completion {
    /// A JSON value was parsed from stdout before anything else happened.
    Data(Value),
    /// The process exited successfully without printing a JSON value.
    CleanExit,
    /// The process exited unsuccessfully without printing a JSON value.
    /// `None` when it was terminated by a signal.
    ErrorExit(Option<i32>),
    /// Waiting on the process failed at the OS level.
    Failed(String),
}

impl Completion {
    pub fn into_outcome(self) -> ExecOutcome {
        match self {
            Completion::Data(value) => Ok(Some(value)),
            Completion::CleanExit => Ok(None),
            Completion::ErrorExit(code) => Err(ExecError::ClosedWithoutData(code)),
            Completion::Failed(e) => Err(ExecError::ProcessFailed(e)),
        }
    }
}

/// Read stdout until the first JSON value or EOF, then classify the exit.
///
/// Stdout is drained to EOF before the exit status is looked at, so a value
/// printed by a script that later fails still wins.
async fn await_completion(script: &str, mut stdout: ChildStdout, mut child: Child) -> Completion {
    let mut scanner = JsonScanner::default();
    let mut chunk = [0u8; 8192];

    loop {
        match stdout.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => {
                debug!(script, "Executor stdout: {}", String::from_utf8_lossy(&chunk[..n]));
                if let Some(value) = scanner.push(&chunk[..n]) {
                    tokio::spawn(drain(script.to_string(), Some(stdout), child));
                    return Completion::Data(value);
                }
            }
            Err(e) => {
                warn!(script, "Executor: stdout read failed: {e}");
                break;
            }
        }
    }

    if let Some(value) = scanner.finish() {
        tokio::spawn(drain(script.to_string(), None, child));
        return Completion::Data(value);
    }

    match child.wait().await {
        Ok(status) if status.success() => Completion::CleanExit,
        Ok(status) => Completion::ErrorExit(status.code()),
        Err(e) => Completion::Failed(e.to_string()),
    }
}

/// Echo whatever the child still prints, then reap it.
async fn drain(script: String, stdout: Option<ChildStdout>, mut child: Child) {
    if let Some(stdout) = stdout {
        echo_lines(script.clone(), stdout).await;
    }
    match child.wait().await {
        Ok(status) => debug!(script, "Executor: exited after result ({status})"),
        Err(e) => warn!(script, "Executor: wait failed after result: {e}"),
    }
}

/// Log each output line until EOF. Lines are raw bytes: scripts write in the
/// console code page, and closing the pipe early would kill them on EPIPE.
async fn echo_lines(script: String, reader: impl AsyncRead + Unpin) {
    let mut reader = BufReader::new(reader);
    let mut line = Vec::new();
    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) => break,
            Ok(_) => debug!(
                script,
                "Executor output: {}",
                String::from_utf8_lossy(&line).trim_end()
            ),
            Err(e) => {
                debug!(script, "Executor: output read failed: {e}");
                break;
            }
        }
    }
}

/// Incremental parser for a stream of whitespace-separated JSON values.
///
/// Lines that are not JSON (banners, warnings) are skipped.
#[derive(Debug, Default)]
pub struct JsonScanner {
    buf: Vec<u8>,
}

impl JsonScanner {
    /// Feed a chunk; returns the first complete value once one is available.
    pub fn push(&mut self, chunk: &[u8]) -> Option<Value> {
        self.buf.extend_from_slice(chunk);
        self.scan(false)
    }

    /// Input is over; accept a value that ends exactly at the end of input.
    pub fn finish(&mut self) -> Option<Value> {
        self.scan(true)
    }

    fn scan(&mut self, eof: bool) -> Option<Value> {
        if self.buf.starts_with(UTF8_BOM) {
            self.buf.drain(..UTF8_BOM.len());
        }
        loop {
            {
                let mut stream =
                    serde_json::Deserializer::from_slice(&self.buf).into_iter::<Value>();
                match stream.next() {
                    None => {
                        self.buf.clear();
                        return None;
                    }
                    Some(Ok(value)) => {
                        if value.is_object() || value.is_array() {
                            return Some(value);
                        }
                        // A scalar counts only when nothing else follows it on its
                        // line; `2024 started` is a log line, not a result.
                        let tail = &self.buf[stream.byte_offset()..];
                        match tail.iter().position(|b| !matches!(b, b' ' | b'\t' | b'\r')) {
                            Some(i) if tail[i] == b'\n' => return Some(value),
                            Some(_) => {}
                            None if eof => return Some(value),
                            None => return None,
                        }
                    }
                    Some(Err(e)) if e.is_eof() => return None,
                    Some(Err(_)) => {}
                }
            }
            if !self.skip_line(eof) {
                return None;
            }
        }
    }

    /// Drop the current line; `false` when it is not complete yet.
    fn skip_line(&mut self, eof: bool) -> bool {
        match self.buf.iter().position(|b| *b == b'\n') {
            Some(i) => {
                self.buf.drain(..=i);
                true
            }
            None => {
                if eof {
                    self.buf.clear();
                }
                false
            }
        }
    }
}

/// Errors surfaced to the controller as a command failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecError {
    /// The executor binary could not be started.
    SpawnFailed(String),
    /// The process started but an OS-level error followed.
    ProcessFailed(String),
    /// The process exited unsuccessfully before printing a JSON value.
    ClosedWithoutData(Option<i32>),
}

impl fmt::Display for ExecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecError::SpawnFailed(e) => write!(f, "Failed to spawn executor: {e}"),
            ExecError::ProcessFailed(e) => write!(f, "Executor error: {e}"),
            ExecError::ClosedWithoutData(_) => write!(f, "stream closed without data"),
        }
    }
}

impl std::error::Error for ExecError {}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn executor() -> ScriptExecutor {
        ScriptExecutor::new(
            PathBuf::from("powershell.exe"),
            vec!["-ExecutionPolicy".into(), "remotesigned".into(), "-File".into()],
            PathBuf::from("/opt/dockd/scripts"),
            "ps1",
        )
    }

    #[test]
    fn test_command_args_order() {
        let mut opts = ScriptOptions::new();
        opts.insert("serviceName".into(), "web".into());
        opts.insert("tarball".into(), "http://localhost:7001/web".into());
        let args = executor().command_args("sync", &opts);
        let args: Vec<String> = args.iter().map(|a| a.to_string_lossy().into_owned()).collect();
        assert_eq!(
            args,
            vec![
                "-ExecutionPolicy",
                "remotesigned",
                "-File",
                "/opt/dockd/scripts/sync.ps1",
                "-serviceName",
                "web",
                "-tarball",
                "http://localhost:7001/web",
            ]
        );
    }

    #[test]
    fn test_script_path_without_extension() {
        let exec = ScriptExecutor::new("sh".into(), vec![], "/s".into(), "");
        assert_eq!(exec.script_path("list"), PathBuf::from("/s/list"));
    }

    #[test]
    fn test_scanner_single_line() {
        let mut s = JsonScanner::default();
        assert_eq!(s.push(b"{\"ok\":true}\n"), Some(json!({"ok": true})));
    }

    #[test]
    fn test_scanner_split_across_chunks() {
        let mut s = JsonScanner::default();
        assert_eq!(s.push(b"[{\"name\":"), None);
        assert_eq!(s.push(b"\"web\"}]\r\n"), Some(json!([{"name": "web"}])));
    }

    #[test]
    fn test_scanner_multiline_value() {
        let mut s = JsonScanner::default();
        assert_eq!(s.push(b"{\r\n    \"status\":  \"Running\"\r\n"), None);
        assert_eq!(s.push(b"}\r\n"), Some(json!({"status": "Running"})));
    }

    #[test]
    fn test_scanner_skips_noise_lines() {
        let mut s = JsonScanner::default();
        assert_eq!(
            s.push(b"WARNING: something odd\n{\"ok\":1}\n"),
            Some(json!({"ok": 1}))
        );
    }

    #[test]
    fn test_scanner_bom() {
        let mut s = JsonScanner::default();
        assert_eq!(s.push(b"\xEF\xBB\xBF[1,2]"), Some(json!([1, 2])));
    }

    #[test]
    fn test_scanner_number_waits_for_boundary() {
        let mut s = JsonScanner::default();
        assert_eq!(s.push(b"12"), None);
        assert_eq!(s.push(b"3"), None);
        assert_eq!(s.finish(), Some(json!(123)));
    }

    #[test]
    fn test_scanner_scalar_must_end_its_line() {
        let mut s = JsonScanner::default();
        assert_eq!(s.push(b"2024 started\n"), None);
        assert_eq!(s.push(b"true story\n\"done\"\r\n"), Some(json!("done")));
    }

    #[test]
    fn test_scanner_scalar_waits_for_line_end() {
        let mut s = JsonScanner::default();
        assert_eq!(s.push(b"42 "), None);
        assert_eq!(s.push(b"apples\n{\"n\":42}\n"), Some(json!({"n": 42})));
    }

    #[test]
    fn test_scanner_whitespace_only() {
        let mut s = JsonScanner::default();
        assert_eq!(s.push(b"\r\n  \n"), None);
        assert_eq!(s.finish(), None);
    }

    #[test]
    fn test_completion_outcomes() {
        assert_eq!(
            Completion::Data(json!({"ok": true})).into_outcome(),
            Ok(Some(json!({"ok": true})))
        );
        assert_eq!(Completion::CleanExit.into_outcome(), Ok(None));
        let err = Completion::ErrorExit(Some(1)).into_outcome().unwrap_err();
        assert_eq!(err.to_string(), "stream closed without data");
    }
}
