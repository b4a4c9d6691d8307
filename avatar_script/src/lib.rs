//! Sandboxed execution of untrusted avatar scripts.
//!
//! Each participant's script runs in its own Lua state on its own worker
//! thread, under instruction budgets resolved from a trust policy. Hosts drive
//! instances through [`ScriptInstance`] and wire peers together with a
//! [`PingTransport`].

use std::sync::{Mutex, MutexGuard, PoisonError};

pub mod config;
pub mod customization;
pub mod diagnostics;
pub mod error;
pub mod events;
pub mod instance;
pub mod participant;
pub mod pings;
pub mod sandbox;
pub mod source;
pub mod task_queue;
pub mod transport;
pub mod trust;

pub use config::{HostConfig, LogMode, LoggingConfig};
pub use customization::{CustomizationKind, CustomizationRecord};
pub use diagnostics::{FeedbackSink, StyledText};
pub use error::ScriptError;
pub use instance::{HostServices, PingInbox, SavedScript, ScriptInstance};
pub use participant::Participant;
pub use pings::{Ping, PingId, PingTransport};
pub use transport::LoopbackTransport;
pub use trust::{Permission, TrustProvider};

/// Locks `mutex`, recovering the data if a panicking holder poisoned it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
