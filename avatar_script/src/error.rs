use std::io;

use thiserror::Error;

use crate::pings::PingError;
use crate::trust::Phase;

/// Message shown to the participant when a script runs out of instructions.
pub const OVERRUN_MESSAGE: &str = "Script overran resource limits";

/// Message raised when the global binding hook sees a foreign table.
pub const INTEGRITY_MESSAGE: &str = "Can't use global table metatable on other tables!";

/// Every way a script instance can fail. All of them are caught at the task
/// boundary; none of them reaches the worker loop.
#[derive(Debug, Error)]
pub enum ScriptError {
    #[error("failed to compile '{chunk}': {source}")]
    Compile {
        chunk: String,
        #[source]
        source: mlua::Error,
    },
    #[error("failed to prepare the script environment: {0}")]
    Setup(#[source] mlua::Error),
    #[error("{source}")]
    Runtime {
        phase: Phase,
        #[source]
        source: mlua::Error,
    },
    #[error("{OVERRUN_MESSAGE} ({limit} instructions during {phase})")]
    BudgetExceeded { phase: Phase, limit: u64 },
    #[error(transparent)]
    PingResolution(#[from] PingError),
    #[error("{INTEGRITY_MESSAGE}")]
    HostIntegrity,
    #[error("failed to start script worker: {0}")]
    Worker(#[from] io::Error),
}

impl ScriptError {
    /// Whether this failure came from the sandbox guards rather than the script itself.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ScriptError::BudgetExceeded { .. } | ScriptError::HostIntegrity
        )
    }

    /// Text shown in chat. Script failures carry Lua's own message, without
    /// the error-kind prefix mlua puts in front of it.
    pub fn chat_message(&self) -> String {
        match self {
            ScriptError::Compile { source, .. } | ScriptError::Runtime { source, .. } => {
                lua_message(source)
            }
            other => other.to_string(),
        }
    }
}

fn lua_message(error: &mlua::Error) -> String {
    match error {
        mlua::Error::RuntimeError(message) | mlua::Error::MemoryError(message) => message.clone(),
        mlua::Error::SyntaxError { message, .. } => message.clone(),
        mlua::Error::CallbackError { cause, .. } => lua_message(cause),
        other => other.to_string(),
    }
}
