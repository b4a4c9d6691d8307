use serde::{Deserialize, Serialize};

/// Chunk name used for every script that does not belong to the local participant.
pub const GENERIC_CHUNK_NAME: &str = "main";

/// The owner of a script instance, as far as the engine needs to know it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub id: String,
    pub display_name: String,
    /// Name the local participant chose when loading the avatar, if any.
    #[serde(default)]
    pub loaded_name: Option<String>,
    #[serde(default)]
    pub is_local: bool,
}

impl Participant {
    pub fn local(id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
            loaded_name: None,
            is_local: true,
        }
    }

    pub fn remote(id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
            loaded_name: None,
            is_local: false,
        }
    }

    pub fn with_loaded_name(mut self, name: impl Into<String>) -> Self {
        self.loaded_name = Some(name.into());
        self
    }

    /// Name the compiled chunk carries in error messages and tracebacks.
    pub fn chunk_name(&self) -> &str {
        match (&self.loaded_name, self.is_local) {
            (Some(name), true) => name.as_str(),
            _ => GENERIC_CHUNK_NAME,
        }
    }
}
