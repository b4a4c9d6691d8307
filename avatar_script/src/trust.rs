use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::participant::Participant;

/// Permission identifiers the engine asks the trust store about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    InitBudget,
    TickBudget,
    RenderBudget,
    MaxParticleRate,
    MaxSoundRate,
    MaxMemory,
}

impl Permission {
    pub fn as_str(&self) -> &'static str {
        match self {
            Permission::InitBudget => "max_init_instructions",
            Permission::TickBudget => "max_tick_instructions",
            Permission::RenderBudget => "max_render_instructions",
            Permission::MaxParticleRate => "max_particles",
            Permission::MaxSoundRate => "max_sounds",
            Permission::MaxMemory => "max_memory_bytes",
        }
    }
}

/// Lifecycle entry point a task body runs under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Init,
    Tick,
    Render,
    /// Host-fired catalog event other than tick and render.
    Event,
}

impl Phase {
    /// Budget the phase is measured against.
    pub fn budget(&self) -> Permission {
        match self {
            Phase::Init => Permission::InitBudget,
            Phase::Tick | Phase::Event => Permission::TickBudget,
            Phase::Render => Permission::RenderBudget,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Phase::Init => "init",
            Phase::Tick => "tick",
            Phase::Render => "render",
            Phase::Event => "event",
        };
        f.write_str(label)
    }
}

/// External policy store resolving permissions to integer limits.
pub trait TrustProvider: Send + Sync {
    fn integer_setting(&self, permission: Permission, participant: &Participant) -> i64;
}

impl fmt::Debug for dyn TrustProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("TrustProvider")
    }
}

/// Limits granted to one participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrustLevel {
    pub init_instructions: i64,
    pub tick_instructions: i64,
    pub render_instructions: i64,
    pub particles_per_second: i64,
    pub sounds_per_second: i64,
    /// Bytes the Lua state may hold; zero or less means unlimited.
    pub memory_bytes: i64,
}

impl Default for TrustLevel {
    fn default() -> Self {
        Self {
            init_instructions: 262_144,
            tick_instructions: 32_768,
            render_instructions: 16_384,
            particles_per_second: 32,
            sounds_per_second: 16,
            memory_bytes: 16 * 1024 * 1024,
        }
    }
}

impl TrustLevel {
    pub fn setting(&self, permission: Permission) -> i64 {
        match permission {
            Permission::InitBudget => self.init_instructions,
            Permission::TickBudget => self.tick_instructions,
            Permission::RenderBudget => self.render_instructions,
            Permission::MaxParticleRate => self.particles_per_second,
            Permission::MaxSoundRate => self.sounds_per_second,
            Permission::MaxMemory => self.memory_bytes,
        }
    }
}

/// Static trust table: a default level plus per-participant overrides keyed by id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrustConfig {
    pub defaults: TrustLevel,
    pub participants: BTreeMap<String, TrustLevel>,
}

impl TrustConfig {
    pub fn level_for(&self, participant: &Participant) -> &TrustLevel {
        self.participants
            .get(&participant.id)
            .unwrap_or(&self.defaults)
    }
}

impl TrustProvider for TrustConfig {
    fn integer_setting(&self, permission: Permission, participant: &Participant) -> i64 {
        self.level_for(participant).setting(permission)
    }
}
