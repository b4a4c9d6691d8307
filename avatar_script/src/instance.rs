use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::config::{HostConfig, LoggingConfig};
use crate::customization::{CustomizationKind, Customizations, SharedRecord};
use crate::diagnostics::{Diagnostics, FeedbackSink};
use crate::error::ScriptError;
use crate::events::{EventCatalog, RENDER, TICK};
use crate::lock;
use crate::participant::Participant;
use crate::pings::{PingChannel, PingId, PingPayload, PingTransport};
use crate::sandbox::{PhaseLimits, PhaseRun, Sandbox, SandboxBuilder};
use crate::source::strip_comments;
use crate::task_queue::{TaskHandle, TaskQueue};
use crate::trust::{Permission, TrustProvider};

/// Spawn counters never exceed this, however often a script asks.
const METER_CEILING: f32 = 999.0;
/// Ticks per second; a meter drains its per-second rate over this many ticks.
const TICKS_PER_SECOND: f32 = 20.0;

/// Collaborators shared by every instance a host runs.
#[derive(Debug, Clone)]
pub struct HostServices {
    pub trust: Arc<dyn TrustProvider>,
    pub transport: Arc<dyn PingTransport>,
    pub sink: Arc<dyn FeedbackSink>,
    pub logging: LoggingConfig,
    pub catalog: EventCatalog,
}

impl HostServices {
    pub fn from_config(
        config: &HostConfig,
        transport: Arc<dyn PingTransport>,
        sink: Arc<dyn FeedbackSink>,
    ) -> Self {
        Self {
            trust: Arc::new(config.trust.clone()),
            transport,
            sink,
            logging: config.logging(),
            catalog: EventCatalog::standard(),
        }
    }
}

/// What persistence stores for a script.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SavedScript {
    pub source: String,
}

#[derive(Debug, Default)]
struct SpawnMeters {
    particles: f32,
    sounds: f32,
}

/// State both the host thread and the worker touch.
#[derive(Debug)]
struct InstanceShared {
    participant: Participant,
    diagnostics: Arc<Diagnostics>,
    load_error: Arc<AtomicBool>,
    pings: Arc<PingChannel>,
    customizations: Arc<Customizations>,
    init_instructions: AtomicU64,
    tick_instructions: AtomicU64,
    render_instructions: AtomicU64,
}

impl InstanceShared {
    fn fail(&self, error: &ScriptError) {
        self.load_error.store(true, Ordering::SeqCst);
        self.diagnostics.log_error(error);
    }
}

/// Worker-side context. `None` once environment setup or compilation failed.
struct ScriptRuntime {
    sandbox: Option<Sandbox>,
}

impl ScriptRuntime {
    fn build(
        shared: &InstanceShared,
        catalog: &EventCatalog,
        limits: PhaseLimits,
        source: &str,
    ) -> Self {
        let sandbox = SandboxBuilder::new(
            catalog,
            limits,
            Arc::clone(&shared.diagnostics),
            Arc::clone(&shared.load_error),
        )
        .and_then(SandboxBuilder::install_logging)
        .and_then(|builder| builder.install_pings(Arc::clone(&shared.pings)))
        .and_then(|builder| builder.install_customize(Arc::clone(&shared.customizations)))
        .and_then(SandboxBuilder::install_event_listener)
        .and_then(|builder| builder.compile(shared.participant.chunk_name(), source));

        match sandbox {
            Ok(sandbox) => Self {
                sandbox: Some(sandbox),
            },
            Err(error) => {
                shared.fail(&error);
                Self { sandbox: None }
            }
        }
    }

    fn init(&mut self, shared: &InstanceShared) {
        let Some(sandbox) = self.sandbox.as_mut() else {
            return;
        };
        let run = sandbox.run_init();
        shared.init_instructions.store(run.executed, Ordering::SeqCst);
        if run.is_ok() {
            log::info!(
                "[avatar_script] script for {} loaded ({} instructions)",
                shared.participant.id,
                run.executed
            );
        }
    }

    fn tick(&mut self, shared: &InstanceShared, transport: &dyn PingTransport) {
        let incoming = shared.pings.take_incoming();
        let run = self
            .sandbox
            .as_mut()
            .and_then(|sandbox| sandbox.run_tick(incoming));
        // Pings sent from render or host events wait here for the next tick.
        let outgoing = shared.pings.take_outgoing();
        let Some(run) = run else {
            if !outgoing.is_empty() {
                log::debug!(
                    "[avatar_script] dropping {} outgoing pings from {}: tick is not running",
                    outgoing.len(),
                    shared.participant.id
                );
            }
            return;
        };
        shared.tick_instructions.store(run.executed, Ordering::SeqCst);

        if outgoing.is_empty() {
            return;
        }
        // Only the owner's copy broadcasts; peer copies run the same script.
        if run.is_ok() && shared.participant.is_local {
            transport.send_batch(&shared.participant, outgoing);
        } else {
            log::debug!(
                "[avatar_script] dropping {} outgoing pings from {} (failed tick or peer copy)",
                outgoing.len(),
                shared.participant.id
            );
        }
    }

    fn render(&mut self, shared: &InstanceShared, delta: f32) {
        if let Some(run) = self
            .sandbox
            .as_mut()
            .and_then(|sandbox| sandbox.run_render(delta))
        {
            shared
                .render_instructions
                .store(run.executed, Ordering::SeqCst);
        }
    }

    fn event(&mut self, name: &str, args: &[JsonValue]) -> Option<PhaseRun> {
        self.sandbox
            .as_mut()
            .and_then(|sandbox| sandbox.run_event(name, args))
    }
}

/// Transport-facing entry point for pings addressed to one instance.
#[derive(Debug, Clone)]
pub struct PingInbox {
    shared: Arc<InstanceShared>,
}

impl PingInbox {
    pub fn participant_id(&self) -> &str {
        &self.shared.participant.id
    }

    /// Queues a remote call for the next tick. Ids the script never
    /// registered are logged and flag the instance; they never reach the
    /// transport again.
    pub fn submit(&self, id: PingId, payload: PingPayload) {
        if let Err(error) = self.shared.pings.submit_incoming(id, payload) {
            self.shared.fail(&ScriptError::PingResolution(error));
        }
    }
}

/// One participant's loaded script.
pub struct ScriptInstance {
    source: String,
    services: HostServices,
    shared: Arc<InstanceShared>,
    queue: TaskQueue<ScriptRuntime>,
    last_tick: Mutex<Option<TaskHandle>>,
    meters: Mutex<SpawnMeters>,
}

impl ScriptInstance {
    /// Builds the environment on a fresh worker and queues the top-level
    /// chunk under the init budget. Script failures are reported through the
    /// diagnostics pipeline; only failing to start the worker is an error.
    pub fn load(
        participant: Participant,
        source: &str,
        services: HostServices,
    ) -> Result<Self, ScriptError> {
        let diagnostics = Arc::new(Diagnostics::new(
            participant.clone(),
            services.logging,
            Arc::clone(&services.sink),
        ));
        let shared = Arc::new(InstanceShared {
            participant: participant.clone(),
            diagnostics,
            load_error: Arc::new(AtomicBool::new(false)),
            pings: Arc::new(PingChannel::default()),
            customizations: Arc::new(Customizations::default()),
            init_instructions: AtomicU64::new(0),
            tick_instructions: AtomicU64::new(0),
            render_instructions: AtomicU64::new(0),
        });

        let build_shared = Arc::clone(&shared);
        let catalog = services.catalog.clone();
        let limits = PhaseLimits::new(Arc::clone(&services.trust), participant.clone());
        let build_source = source.to_string();
        let queue = TaskQueue::spawn(&participant.id, move || {
            ScriptRuntime::build(&build_shared, &catalog, limits, &build_source)
        })?;

        let init_shared = Arc::clone(&shared);
        queue.enqueue(move |runtime: &mut ScriptRuntime| runtime.init(&init_shared));

        Ok(Self {
            source: source.to_string(),
            services,
            shared,
            queue,
            last_tick: Mutex::new(None),
            meters: Mutex::new(SpawnMeters::default()),
        })
    }

    /// Reloads a persisted script as a new instance.
    pub fn deserialize(
        saved: &SavedScript,
        participant: Participant,
        services: HostServices,
    ) -> Result<Self, ScriptError> {
        Self::load(participant, &saved.source, services)
    }

    pub fn serialize(&self) -> SavedScript {
        SavedScript {
            source: strip_comments(&self.source),
        }
    }

    /// Queues one tick. Returns false, queuing nothing, while the previous
    /// tick is still pending or running.
    pub fn tick(&self) -> bool {
        self.decay_meters();

        let mut last = lock(&self.last_tick);
        if last.as_ref().is_some_and(|handle| !handle.is_done()) {
            return false;
        }
        let shared = Arc::clone(&self.shared);
        let transport = Arc::clone(&self.services.transport);
        *last = Some(self.queue.enqueue(move |runtime: &mut ScriptRuntime| {
            runtime.tick(&shared, transport.as_ref())
        }));
        true
    }

    /// Runs `render` only when nothing else is pending or running.
    pub fn render(&self, delta: f32) -> bool {
        let shared = Arc::clone(&self.shared);
        self.queue
            .enqueue_if_idle(move |runtime: &mut ScriptRuntime| runtime.render(&shared, delta))
            .is_some()
    }

    /// Fires a catalog event other than tick and render. Returns `None` when
    /// the catalog does not know `name`.
    pub fn call_event(&self, name: &str, args: Vec<JsonValue>) -> Option<TaskHandle> {
        if name == TICK || name == RENDER || !self.services.catalog.contains(name) {
            log::debug!("[avatar_script] ignoring host call to event '{name}'");
            return None;
        }
        let event = name.to_string();
        Some(self.queue.enqueue(move |runtime: &mut ScriptRuntime| {
            runtime.event(&event, &args);
        }))
    }

    pub fn inbox(&self) -> PingInbox {
        PingInbox {
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn get_or_create(&self, kind: CustomizationKind, accessor: &str) -> SharedRecord {
        self.shared.customizations.get_or_create(kind, accessor)
    }

    pub fn customization(&self, kind: CustomizationKind, accessor: &str) -> Option<SharedRecord> {
        self.shared.customizations.get(kind, accessor)
    }

    pub fn customizations(&self) -> &Customizations {
        &self.shared.customizations
    }

    /// Admits one particle spawn if the per-second allowance is not used up.
    pub fn try_spawn_particle(&self) -> bool {
        self.try_spawn(Permission::MaxParticleRate, |meters| &mut meters.particles)
    }

    pub fn try_spawn_sound(&self) -> bool {
        self.try_spawn(Permission::MaxSoundRate, |meters| &mut meters.sounds)
    }

    fn rate(&self, permission: Permission) -> f32 {
        self.services
            .trust
            .integer_setting(permission, &self.shared.participant) as f32
    }

    fn try_spawn(&self, permission: Permission, meter: fn(&mut SpawnMeters) -> &mut f32) -> bool {
        let rate = self.rate(permission);
        let mut meters = lock(&self.meters);
        let count = meter(&mut meters);
        if *count >= rate {
            return false;
        }
        *count = (*count + 1.0).min(METER_CEILING);
        true
    }

    fn decay_meters(&self) {
        let particle_rate = self.rate(Permission::MaxParticleRate);
        let sound_rate = self.rate(Permission::MaxSoundRate);
        let mut guard = lock(&self.meters);
        let meters = &mut *guard;
        for (count, rate) in [
            (&mut meters.particles, particle_rate),
            (&mut meters.sounds, sound_rate),
        ] {
            if *count > 0.0 {
                *count = (*count - rate / TICKS_PER_SECOND).clamp(0.0, METER_CEILING);
            }
        }
    }

    pub fn participant(&self) -> &Participant {
        &self.shared.participant
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn load_error(&self) -> bool {
        self.shared.load_error.load(Ordering::SeqCst)
    }

    pub fn init_instructions(&self) -> u64 {
        self.shared.init_instructions.load(Ordering::SeqCst)
    }

    pub fn tick_instructions(&self) -> u64 {
        self.shared.tick_instructions.load(Ordering::SeqCst)
    }

    pub fn render_instructions(&self) -> u64 {
        self.shared.render_instructions.load(Ordering::SeqCst)
    }

    pub fn ping_id(&self, name: &str) -> Option<PingId> {
        self.shared.pings.id_of(name)
    }

    pub fn registered_pings(&self) -> usize {
        self.shared.pings.registered()
    }

    pub fn is_idle(&self) -> bool {
        self.queue.is_idle()
    }

    /// Blocks until every queued body has finished.
    pub fn wait_idle(&self) {
        if let Some(handle) = self.queue.current() {
            handle.wait();
        }
    }

    /// Like [`ScriptInstance::wait_idle`]; returns false if `timeout` ran out first.
    pub fn wait_idle_timeout(&self, timeout: Duration) -> bool {
        match self.queue.current() {
            Some(handle) => handle.wait_timeout(timeout).is_some(),
            None => true,
        }
    }
}
