use thiserror::Error;

#[derive(Error, Debug)]
pub enum HeronError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Command '{program}' failed with exit code {code}: {output}")]
    Command {
        program: String,
        code: i32,
        output: String,
    },

    #[error("Command '{program}' timed out after {secs}s")]
    Timeout { program: String, secs: u64 },

    #[error("Failed to spawn '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Host key error: {0}")]
    HostKey(String),

    #[error("Daemon error: {0}")]
    Daemon(String),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl HeronError {
    /// True when an external command ran (or was attempted) and did not succeed.
    pub fn is_command_failure(&self) -> bool {
        matches!(
            self,
            HeronError::Command { .. } | HeronError::Timeout { .. } | HeronError::Spawn { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, HeronError>;
