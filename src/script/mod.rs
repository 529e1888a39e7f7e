//! Local script executor.
//!
//! Every service action ends up here: [`process::ScriptExecutor`] spawns the
//! configured interpreter on `<scripts_dir>/<name>.<ext>`, passes the options
//! as `-key value` pairs, and turns the first JSON value on stdout into the
//! command's result. The dispatcher only sees the [`Executor`] trait so tests
//! can swap in a scripted fake.

use std::path::{Path, PathBuf};

use futures::future::BoxFuture;
use indexmap::IndexMap;
use serde_json::Value;

use crate::config::ConfigError;

pub mod process;

pub use process::{ExecError, ScriptExecutor};

/// Named script options, rendered in insertion order.
pub type ScriptOptions = IndexMap<String, String>;

/// What an executor run produces: the first JSON value, `None` for a clean
/// exit with no output, or the reason it failed.
pub type ExecOutcome = Result<Option<Value>, ExecError>;

/// Runs one named script per call and yields exactly one outcome.
pub trait Executor: Send + Sync {
    fn run<'a>(&'a self, script: &'a str, options: &'a ScriptOptions)
        -> BoxFuture<'a, ExecOutcome>;
}

/// Pick the first executor binary that exists on this host.
///
/// Called once at startup; a miss is fatal.
pub fn resolve_program(candidates: &[String]) -> Result<PathBuf, ConfigError> {
    candidates
        .iter()
        .map(PathBuf::from)
        .find(|p| Path::new(p).exists())
        .ok_or_else(|| ConfigError::ExecutorNotFound(candidates.to_vec()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_program_first_existing() {
        let dir = tempfile::tempdir().unwrap();
        let present = dir.path().join("pwsh");
        std::fs::write(&present, b"").unwrap();
        let candidates = vec![
            dir.path().join("missing").display().to_string(),
            present.display().to_string(),
        ];
        assert_eq!(resolve_program(&candidates).unwrap(), present);
    }

    #[test]
    fn test_resolve_program_none() {
        let err = resolve_program(&["/nonexistent/powershell.exe".to_string()]).unwrap_err();
        assert!(matches!(err, ConfigError::ExecutorNotFound(_)));
        assert!(err.to_string().contains("/nonexistent/powershell.exe"));
    }
}
