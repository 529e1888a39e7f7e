//! Command dispatcher — maps controller commands onto service scripts.
//!
//! | command   | script    | options                                        | result               |
//! |-----------|-----------|------------------------------------------------|----------------------|
//! | `add`     | `add`     | `serviceName`                                  | as returned          |
//! | `remove`  | `remove`  | `serviceName`                                  | as returned          |
//! | `sync`    | `sync`    | `serviceName`, `fetchTar`, `tarball`           | as returned          |
//! | `update`  | —         | —                                              | `null`, no work done |
//! | `restart` | `restart` | `serviceName`                                  | as returned          |
//! | `start`   | `restart` | `serviceName`                                  | as returned          |
//! | `stop`    | `stop`    | `serviceName`                                  | as returned          |
//! | `list`    | `list`    | —                                              | always an array      |
//! | `ps`      | `ps`      | —                                              | `[{id, list}]`       |
//!
//! `start` runs the restart script; there is no dedicated start action.

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use serde_json::{json, Map, Value};
use tracing::{info, warn};

use crate::script::{ExecError, Executor, ScriptOptions};

/// One inbound command, as decoded from a tunnel frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    pub name: String,
    /// Service the command acts on; absent for `list` and `ps`.
    pub target_id: Option<String>,
    /// Options object sent by the controller. Decoded and logged, but no
    /// action reads it: scripts only get the options the dispatcher builds.
    pub options: Map<String, Value>,
}

impl Command {
    /// Decode positional frame arguments: `[id?, options?]`.
    pub fn from_args(name: impl Into<String>, args: &[Value]) -> Self {
        let target_id = args
            .first()
            .and_then(Value::as_str)
            .map(ToString::to_string);
        let options = args
            .iter()
            .find_map(Value::as_object)
            .cloned()
            .unwrap_or_default();
        Self {
            name: name.into(),
            target_id,
            options,
        }
    }
}

/// Success payload or the reason the command failed.
pub type CommandResult = Result<Value, CommandError>;

/// How a command name is served.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Action {
    /// Run a per-service script with `serviceName`.
    Service(&'static str),
    Sync,
    Update,
    List,
    Ps,
}

fn action_for(name: &str) -> Option<Action> {
    match name {
        "add" => Some(Action::Service("add")),
        "remove" => Some(Action::Service("remove")),
        "restart" | "start" => Some(Action::Service("restart")),
        "stop" => Some(Action::Service("stop")),
        "sync" => Some(Action::Sync),
        "update" => Some(Action::Update),
        "list" => Some(Action::List),
        "ps" => Some(Action::Ps),
        _ => None,
    }
}

/// Routes commands to the executor and shapes their results.
#[derive(Clone)]
pub struct Dispatcher {
    executor: Arc<dyn Executor>,
    identity: String,
    fetch_helper: String,
    relay_base: String,
}

impl Dispatcher {
    pub fn new(
        executor: Arc<dyn Executor>,
        identity: impl Into<String>,
        fetch_helper: &Path,
        relay_port: u16,
    ) -> Self {
        Self {
            executor,
            identity: identity.into(),
            fetch_helper: fetch_helper.display().to_string(),
            relay_base: format!("http://localhost:{relay_port}"),
        }
    }

    /// Local relay URL the `sync` script fetches the service tarball from.
    pub fn tarball_url(&self, service_id: &str) -> String {
        format!("{}/{service_id}", self.relay_base)
    }

    /// Run one command to completion.
    pub async fn dispatch(&self, command: &Command) -> CommandResult {
        let action =
            action_for(&command.name).ok_or_else(|| CommandError::UnknownCommand(command.name.clone()))?;
        info!(
            command = %command.name,
            target = ?command.target_id,
            options = ?command.options,
            "Dispatching command"
        );

        let result = match action {
            Action::Update => Ok(Value::Null),
            Action::Service(script) => {
                let id = self.require_target(command)?;
                let mut opts = ScriptOptions::new();
                opts.insert("serviceName".to_string(), id.to_string());
                self.run(script, &opts).await
            }
            Action::Sync => {
                let id = self.require_target(command)?;
                let mut opts = ScriptOptions::new();
                opts.insert("serviceName".to_string(), id.to_string());
                opts.insert("fetchTar".to_string(), self.fetch_helper.clone());
                opts.insert("tarball".to_string(), self.tarball_url(id));
                self.run("sync", &opts).await
            }
            Action::List => self
                .run("list", &ScriptOptions::new())
                .await
                .map(into_sequence),
            Action::Ps => self.run("ps", &ScriptOptions::new()).await.map(|data| {
                json!([{
                    "id": self.identity,
                    "list": into_sequence(data),
                }])
            }),
        };

        if let Err(ref e) = result {
            warn!(command = %command.name, "Command failed: {e}");
        }
        result
    }

    async fn run(&self, script: &str, opts: &ScriptOptions) -> CommandResult {
        match self.executor.run(script, opts).await {
            Ok(value) => Ok(value.unwrap_or(Value::Null)),
            Err(e) => Err(CommandError::Executor(e)),
        }
    }

    fn require_target<'c>(&self, command: &'c Command) -> Result<&'c str, CommandError> {
        command
            .target_id
            .as_deref()
            .ok_or_else(|| CommandError::BadArguments(format!("{} requires a service id", command.name)))
    }
}

/// Coerce an executor result into an array: absent becomes `[]`, a lone
/// object (a one-element list serialized without brackets) becomes `[obj]`.
fn into_sequence(value: Value) -> Value {
    match value {
        Value::Array(_) => value,
        Value::Null => Value::Array(Vec::new()),
        other => Value::Array(vec![other]),
    }
}

/// Why a command failed. The `Display` text is what the controller sees.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandError {
    Executor(ExecError),
    UnknownCommand(String),
    BadArguments(String),
}

impl fmt::Display for CommandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandError::Executor(e) => write!(f, "{e}"),
            CommandError::UnknownCommand(name) => write!(f, "Unknown command: {name}"),
            CommandError::BadArguments(msg) => write!(f, "{msg}"),
        }
    }
}

impl std::error::Error for CommandError {}
