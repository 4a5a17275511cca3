/// The input of one watchdog invocation, and its five-argument wire form.
use crate::pidfile::RecordKey;
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Placeholder used on the command line for an absent optional argument.
pub const ABSENT: &str = "None";

/// Session component of the record key when no session id is given.
pub const DEFAULT_SESSION: &str = "default";

/// Immutable input to one watchdog run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupervisionRequest {
    /// Shell command line to launch.
    pub command: String,
    /// Extra environment layered over the inherited one.
    pub env: BTreeMap<String, String>,
    /// Process name to locate and kill on shutdown.
    pub kill_target: Option<String>,
    pub session_id: Option<String>,
    /// Token the supervisor keeps refreshing while it is alive.
    pub heartbeat: Option<PathBuf>,
}

/// Errors from decoding watchdog arguments.
#[derive(Debug)]
pub enum RequestError {
    EmptyCommand,
    InvalidEnv { source: serde_json::Error },
}

impl std::fmt::Display for RequestError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RequestError::EmptyCommand => write!(f, "command is empty"),
            RequestError::InvalidEnv { source } => {
                write!(f, "environment is not a JSON object of strings: {}", source)
            }
        }
    }
}

impl std::error::Error for RequestError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RequestError::EmptyCommand => None,
            RequestError::InvalidEnv { source } => Some(source),
        }
    }
}

fn optional(arg: &str) -> Option<String> {
    let arg = arg.trim();
    if arg.is_empty() || arg == ABSENT {
        None
    } else {
        Some(arg.to_string())
    }
}

impl SupervisionRequest {
    /// Decode the positional arguments `command env kill-target session heartbeat`.
    pub fn from_args(
        command: &str,
        env_json: &str,
        kill_target: &str,
        session_id: &str,
        heartbeat: &str,
    ) -> Result<Self, RequestError> {
        let command = command.trim();
        if command.is_empty() {
            return Err(RequestError::EmptyCommand);
        }

        let env_json = env_json.trim();
        let env = if env_json.is_empty() {
            BTreeMap::new()
        } else {
            serde_json::from_str(env_json).map_err(|e| RequestError::InvalidEnv { source: e })?
        };

        Ok(Self {
            command: command.to_string(),
            env,
            kill_target: optional(kill_target),
            session_id: optional(session_id),
            heartbeat: optional(heartbeat).map(PathBuf::from),
        })
    }

    /// Encode as the five positional arguments `from_args` accepts.
    pub fn to_args(&self) -> Vec<String> {
        let env = serde_json::to_string(&self.env).unwrap_or_else(|_| "{}".to_string());
        vec![
            self.command.clone(),
            env,
            self.kill_target.clone().unwrap_or_else(|| ABSENT.to_string()),
            self.session_id.clone().unwrap_or_else(|| ABSENT.to_string()),
            self.heartbeat
                .as_ref()
                .map(|p| p.to_string_lossy().into_owned())
                .unwrap_or_else(|| ABSENT.to_string()),
        ]
    }

    /// Name of the process to locate: the kill target, else the command's first word.
    pub fn target_name(&self) -> &str {
        match &self.kill_target {
            Some(target) => target,
            None => self.command.split_whitespace().next().unwrap_or_default(),
        }
    }

    pub fn record_key(&self) -> RecordKey {
        RecordKey::new(
            self.target_name(),
            self.session_id.as_deref().unwrap_or(DEFAULT_SESSION),
        )
    }
}
