//! Per-instance Lua environment: restricted stdlib, logging surface, event
//! binding intercept and the instruction budget every phase runs under.

mod api;
mod budget;
mod logging;

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use mlua::{
    ChunkMode, Error as LuaError, Function, Lua, LuaOptions, LuaSerdeExt, MultiValue,
    RegistryKey, Result as LuaResult, SerializeOptions, StdLib, Table, Value,
};
use serde_json::Value as JsonValue;

pub use budget::{Abort, InstructionBudget};
pub use logging::{display_value, table_lines};

use crate::customization::Customizations;
use crate::diagnostics::Diagnostics;
use crate::error::{ScriptError, INTEGRITY_MESSAGE};
use crate::events::{call_in_order, EventCatalog, EventRegistry, RENDER, TICK};
use crate::participant::Participant;
use crate::pings::{IncomingPing, PingChannel, PingError};
use crate::trust::{Permission, Phase, TrustProvider};

/// Base library entries that reach the loader, the environment or the collector.
const STRIPPED_GLOBALS: &[&str] = &[
    "dofile",
    "loadfile",
    "load",
    "loadstring",
    "getfenv",
    "setfenv",
    "collectgarbage",
    "gcinfo",
    "newproxy",
    "coroutine",
    "module",
    "require",
];

fn payload_options() -> SerializeOptions {
    SerializeOptions::new()
        .serialize_none_to_null(false)
        .serialize_unit_to_null(false)
        .set_array_metatable(false)
}

/// Resolves phase budgets for one participant.
#[derive(Debug, Clone)]
pub struct PhaseLimits {
    trust: Arc<dyn TrustProvider>,
    participant: Participant,
}

impl PhaseLimits {
    pub fn new(trust: Arc<dyn TrustProvider>, participant: Participant) -> Self {
        Self { trust, participant }
    }

    pub fn limit(&self, phase: Phase) -> u64 {
        let setting = self.trust.integer_setting(phase.budget(), &self.participant);
        u64::try_from(setting).unwrap_or(0)
    }

    /// Allocation ceiling for the Lua state; zero leaves it unlimited.
    pub fn memory(&self) -> usize {
        let setting = self
            .trust
            .integer_setting(Permission::MaxMemory, &self.participant);
        usize::try_from(setting).unwrap_or(0)
    }
}

/// Assembles a [`Sandbox`] one capability at a time.
pub struct SandboxBuilder {
    lua: Lua,
    events: Rc<RefCell<EventRegistry>>,
    budget: InstructionBudget,
    limits: PhaseLimits,
    diagnostics: Arc<Diagnostics>,
    load_error: Arc<AtomicBool>,
}

impl SandboxBuilder {
    /// Opens the restricted standard library and creates the instance's events.
    pub fn new(
        catalog: &EventCatalog,
        limits: PhaseLimits,
        diagnostics: Arc<Diagnostics>,
        load_error: Arc<AtomicBool>,
    ) -> Result<Self, ScriptError> {
        let lua = Lua::new_with(
            StdLib::TABLE | StdLib::STRING | StdLib::MATH,
            LuaOptions::new(),
        )
        .map_err(ScriptError::Setup)?;
        lua.set_memory_limit(limits.memory())
            .map_err(ScriptError::Setup)?;
        strip_globals(&lua).map_err(ScriptError::Setup)?;

        let overrun_diagnostics = Arc::clone(&diagnostics);
        let overrun_flag = Arc::clone(&load_error);
        let budget = InstructionBudget::new(move |limit| {
            overrun_flag.store(true, Ordering::SeqCst);
            overrun_diagnostics.budget_overrun(limit);
        });

        Ok(Self {
            lua,
            events: Rc::new(RefCell::new(catalog.instantiate())),
            budget,
            limits,
            diagnostics,
            load_error,
        })
    }

    pub fn install_logging(self) -> Result<Self, ScriptError> {
        logging::install_logging(&self.lua, Arc::clone(&self.diagnostics))
            .map_err(ScriptError::Setup)?;
        Ok(self)
    }

    pub fn install_pings(self, channel: Arc<PingChannel>) -> Result<Self, ScriptError> {
        api::install_pings(&self.lua, channel).map_err(ScriptError::Setup)?;
        Ok(self)
    }

    pub fn install_customize(self, customizations: Arc<Customizations>) -> Result<Self, ScriptError> {
        api::install_customize(&self.lua, customizations).map_err(ScriptError::Setup)?;
        Ok(self)
    }

    /// Routes `name = function` assignments under an event name to that
    /// event's subscribers. Every other new global is stored as usual.
    ///
    /// The globals metatable is locked so scripts cannot read or replace it.
    pub fn install_event_listener(self) -> Result<Self, ScriptError> {
        self.listen().map_err(ScriptError::Setup)?;
        Ok(self)
    }

    fn listen(&self) -> LuaResult<()> {
        let globals = self.lua.globals();
        let scope = globals.to_pointer();
        let events = Rc::clone(&self.events);
        let budget = self.budget.clone();
        let load_error = Arc::clone(&self.load_error);

        let newindex = self.lua.create_function(
            move |lua, (table, key, value): (Table, Value, Value)| {
                if table.to_pointer() != scope {
                    load_error.store(true, Ordering::SeqCst);
                    budget.abort(Abort::Integrity);
                    return Err(LuaError::RuntimeError(INTEGRITY_MESSAGE.to_string()));
                }
                if let (Value::String(name), Value::Function(handler)) = (&key, &value) {
                    if let Ok(name) = name.to_str() {
                        if events.borrow_mut().subscribe(lua, name, handler.clone())? {
                            return Ok(());
                        }
                    }
                }
                table.raw_set(key, value)
            },
        )?;

        let metatable = self.lua.create_table()?;
        metatable.raw_set("__newindex", newindex)?;
        metatable.raw_set("__metatable", false)?;
        globals.set_metatable(Some(metatable));
        Ok(())
    }

    /// Compiles `source` as a text chunk named `chunk_name`.
    pub fn compile(self, chunk_name: &str, source: &str) -> Result<Sandbox, ScriptError> {
        let main = {
            let chunk = self
                .lua
                .load(source)
                .set_name(format!("={chunk_name}"))
                .set_mode(ChunkMode::Text)
                .into_function()
                .map_err(|source| ScriptError::Compile {
                    chunk: chunk_name.to_string(),
                    source,
                })?;
            self.lua
                .create_registry_value(chunk)
                .map_err(ScriptError::Setup)?
        };
        Ok(Sandbox {
            lua: self.lua,
            main,
            events: self.events,
            budget: self.budget,
            limits: self.limits,
            diagnostics: self.diagnostics,
            load_error: self.load_error,
            initialized: false,
        })
    }
}

fn strip_globals(lua: &Lua) -> LuaResult<()> {
    let globals = lua.globals();
    for name in STRIPPED_GLOBALS {
        globals.raw_set(*name, Value::Nil)?;
    }
    let string: Table = globals.raw_get("string")?;
    string.raw_set("dump", Value::Nil)?;
    Ok(())
}

/// Result of one budgeted phase body.
#[derive(Debug)]
pub struct PhaseRun {
    pub phase: Phase,
    pub executed: u64,
    pub result: Result<(), ScriptError>,
}

impl PhaseRun {
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }
}

/// A compiled script with its environment. Lives on the instance's worker thread.
pub struct Sandbox {
    lua: Lua,
    main: RegistryKey,
    events: Rc<RefCell<EventRegistry>>,
    budget: InstructionBudget,
    limits: PhaseLimits,
    diagnostics: Arc<Diagnostics>,
    load_error: Arc<AtomicBool>,
    initialized: bool,
}

impl Sandbox {
    /// Runs the top-level chunk under the init budget. A failure leaves the
    /// sandbox inert: no event fires afterwards.
    pub fn run_init(&mut self) -> PhaseRun {
        let main = &self.main;
        let run = self.run_guarded(Phase::Init, |lua| {
            let chunk: Function = lua.registry_value(main)?;
            chunk.call::<_, ()>(())
        });
        self.initialized = run.is_ok();
        if let Err(error) = &run.result {
            self.fail(error);
        }
        run
    }

    /// Delivers `incoming` pings in order, then dispatches `tick`.
    /// Returns `None` when the tick event is not live.
    pub fn run_tick(&mut self, incoming: VecDeque<IncomingPing>) -> Option<PhaseRun> {
        if !self.is_live(TICK) {
            if !incoming.is_empty() {
                log::debug!(
                    "[avatar_script] dropping {} pings for {}: tick is not running",
                    incoming.len(),
                    self.diagnostics.participant().id
                );
            }
            return None;
        }
        let run = self.run_guarded(Phase::Tick, |lua| {
            for ping in incoming {
                self.deliver(lua, ping)?;
            }
            let handlers = self.events.borrow().handlers(lua, TICK)?;
            call_in_order(lua, &handlers, ())
        });
        self.settle(&run, TICK);
        Some(run)
    }

    pub fn run_render(&mut self, delta: f32) -> Option<PhaseRun> {
        if !self.is_live(RENDER) {
            return None;
        }
        let run = self.run_guarded(Phase::Render, |lua| {
            let handlers = self.events.borrow().handlers(lua, RENDER)?;
            call_in_order(lua, &handlers, delta)
        });
        self.settle(&run, RENDER);
        Some(run)
    }

    /// Fires a catalog event with JSON arguments under the tick budget.
    pub fn run_event(&mut self, name: &str, args: &[JsonValue]) -> Option<PhaseRun> {
        if !self.is_live(name) {
            return None;
        }
        let run = self.run_guarded(Phase::Event, |lua| {
            let values = args
                .iter()
                .map(|arg| lua.to_value_with(arg, payload_options()))
                .collect::<LuaResult<Vec<_>>>()?;
            let handlers = self.events.borrow().handlers(lua, name)?;
            call_in_order(lua, &handlers, MultiValue::from_vec(values))
        });
        self.settle(&run, name);
        Some(run)
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn is_enabled(&self, event: &str) -> bool {
        self.events.borrow().is_enabled(event)
    }

    fn is_live(&self, event: &str) -> bool {
        self.initialized && self.is_enabled(event)
    }

    fn run_guarded<F>(&self, phase: Phase, body: F) -> PhaseRun
    where
        F: FnOnce(&Lua) -> LuaResult<()>,
    {
        let limit = self.limits.limit(phase);
        self.budget.arm(&self.lua, limit);
        let outcome = body(&self.lua);
        let executed = self.budget.disarm(&self.lua);

        let result = match (self.budget.aborted(), outcome) {
            (Some(Abort::Overrun), _) => Err(ScriptError::BudgetExceeded { phase, limit }),
            (Some(Abort::Integrity), _) => Err(ScriptError::HostIntegrity),
            (None, Ok(())) => Ok(()),
            (None, Err(source)) => Err(ScriptError::Runtime { phase, source }),
        };
        PhaseRun {
            phase,
            executed,
            result,
        }
    }

    fn deliver(&self, lua: &Lua, ping: IncomingPing) -> LuaResult<()> {
        match lua.globals().raw_get::<_, Value>(ping.name.as_str())? {
            Value::Function(target) => {
                let args = lua.to_value_with(&ping.payload, payload_options())?;
                target.call::<_, ()>(args)
            }
            _ => {
                self.load_error.store(true, Ordering::SeqCst);
                self.diagnostics
                    .log_error(&ScriptError::PingResolution(PingError::NotAFunction {
                        id: ping.id,
                        name: ping.name,
                    }));
                Ok(())
            }
        }
    }

    fn settle(&self, run: &PhaseRun, event: &str) {
        if let Err(error) = &run.result {
            self.events.borrow_mut().disable(event);
            self.fail(error);
        }
    }

    fn fail(&self, error: &ScriptError) {
        self.load_error.store(true, Ordering::SeqCst);
        self.diagnostics.log_error(error);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LoggingConfig;
    use crate::diagnostics::RecordingSink;
    use crate::trust::{TrustConfig, TrustLevel};
    use serde_json::json;

    struct Fixture {
        sink: RecordingSink,
        load_error: Arc<AtomicBool>,
        pings: Arc<PingChannel>,
        customizations: Arc<Customizations>,
    }

    fn trust(level: TrustLevel) -> Arc<dyn TrustProvider> {
        Arc::new(TrustConfig {
            defaults: level,
            ..TrustConfig::default()
        })
    }

    fn build(source: &str, tick_budget: i64) -> (Result<Sandbox, ScriptError>, Fixture) {
        let level = TrustLevel {
            tick_instructions: tick_budget,
            ..TrustLevel::default()
        };
        build_with(source, level)
    }

    fn build_with(source: &str, level: TrustLevel) -> (Result<Sandbox, ScriptError>, Fixture) {
        let participant = Participant::local("p1", "Alex");
        let sink = RecordingSink::new();
        let diagnostics = Arc::new(Diagnostics::new(
            participant.clone(),
            LoggingConfig::default(),
            Arc::new(sink.clone()),
        ));
        let fixture = Fixture {
            sink,
            load_error: Arc::new(AtomicBool::new(false)),
            pings: Arc::new(PingChannel::default()),
            customizations: Arc::new(Customizations::default()),
        };
        let sandbox = SandboxBuilder::new(
            &EventCatalog::standard(),
            PhaseLimits::new(trust(level), participant),
            diagnostics,
            Arc::clone(&fixture.load_error),
        )
        .and_then(SandboxBuilder::install_logging)
        .and_then(|builder| builder.install_pings(Arc::clone(&fixture.pings)))
        .and_then(|builder| builder.install_customize(Arc::clone(&fixture.customizations)))
        .and_then(SandboxBuilder::install_event_listener)
        .and_then(|builder| builder.compile("main", source));
        (sandbox, fixture)
    }

    fn loaded(source: &str) -> (Sandbox, Fixture) {
        let (sandbox, fixture) = build(source, 32_768);
        let mut sandbox = sandbox.expect("sandbox builds");
        let run = sandbox.run_init();
        assert!(run.is_ok(), "init failed: {:?}", run.result);
        (sandbox, fixture)
    }

    fn global<'lua, T: mlua::FromLua<'lua>>(sandbox: &'lua Sandbox, name: &str) -> T {
        sandbox.lua.globals().raw_get(name).expect("global readable")
    }

    #[test]
    fn unsafe_libraries_are_unreachable() {
        let (sandbox, _) = loaded(
            r#"
            checks = {
                debug = debug == nil,
                io = io == nil,
                os = os == nil,
                package = package == nil,
                loadstring = loadstring == nil,
                setfenv = setfenv == nil,
                dump = string.dump == nil,
                meta = getmetatable(_G) == false,
            }
            "#,
        );
        let checks: Table = global(&sandbox, "checks");
        for pair in checks.pairs::<String, bool>() {
            let (name, hidden) = pair.expect("check entry");
            assert!(hidden, "{name} should be hidden");
        }
        let math: Table = global(&sandbox, "math");
        assert!(math.contains_key("floor").expect("lookup"));
    }

    #[test]
    fn function_assignment_under_event_name_subscribes() {
        let (mut sandbox, _) = loaded(
            r#"
            count = 0
            function tick() count = count + 1 end
            function helper() return 1 end
            "#,
        );
        {
            let tick: Value = global(&sandbox, "tick");
            assert!(matches!(tick, Value::Nil));
            let helper: Value = global(&sandbox, "helper");
            assert!(matches!(helper, Value::Function(_)));
        }

        for _ in 0..3 {
            let run = sandbox.run_tick(VecDeque::new()).expect("tick live");
            assert!(run.is_ok());
            assert!(run.executed > 0);
        }
        let count: i64 = global(&sandbox, "count");
        assert_eq!(count, 3);
    }

    #[test]
    fn foreign_table_with_global_metatable_is_fatal() {
        let (mut sandbox, fixture) = loaded("function render() end");
        let metatable = sandbox
            .lua
            .globals()
            .get_metatable()
            .expect("globals metatable installed");
        let victim = sandbox.lua.create_table().expect("table");
        victim.set_metatable(Some(metatable));
        sandbox
            .lua
            .globals()
            .raw_set("victim", victim)
            .expect("expose victim");
        sandbox
            .lua
            .load("function render() pcall(function() victim.x = 1 end) reached = true end")
            .exec()
            .expect("redefine render");

        let run = sandbox.run_render(0.5).expect("render live");
        assert!(matches!(run.result, Err(ScriptError::HostIntegrity)));
        assert!(fixture.load_error.load(Ordering::SeqCst));
        let reached: Option<bool> = global(&sandbox, "reached");
        assert_eq!(reached, None);
        assert!(!sandbox.is_enabled(RENDER));
    }

    #[test]
    fn tick_overrun_disables_tick() {
        let (sandbox, fixture) = build(
            r#"
            function tick()
                local total = 0
                for i = 1, 100 do total = total + i end
            end
            "#,
            100,
        );
        let mut sandbox = sandbox.expect("sandbox builds");
        assert!(sandbox.run_init().is_ok());

        let run = sandbox.run_tick(VecDeque::new()).expect("tick live");
        assert!(matches!(
            run.result,
            Err(ScriptError::BudgetExceeded {
                phase: Phase::Tick,
                limit: 100
            })
        ));
        assert_eq!(run.executed, 101);
        assert!(fixture.load_error.load(Ordering::SeqCst));
        assert!(!sandbox.is_enabled(TICK));
        assert!(sandbox.run_tick(VecDeque::new()).is_none());
        assert!(fixture
            .sink
            .plain_lines()
            .iter()
            .any(|line| line.contains("Script overran resource limits")));
    }

    #[test]
    fn incoming_pings_run_before_tick_handlers() {
        let (mut sandbox, fixture) = loaded(
            r#"
            calls = {}
            function a(n) table.insert(calls, "a" .. n) end
            function b(n) table.insert(calls, "b" .. n) end
            function c(n) table.insert(calls, "c" .. n) end
            for _, name in ipairs({"a", "b", "c"}) do pings.register(name) end
            function tick() table.insert(calls, "tick") end
            "#,
        );
        for (name, n) in [("a", 1), ("b", 2), ("c", 3)] {
            let id = fixture.pings.id_of(name).expect("registered by script");
            fixture
                .pings
                .submit_incoming(id, json!(n))
                .expect("known id");
        }
        let run = sandbox
            .run_tick(fixture.pings.take_incoming())
            .expect("tick live");
        assert!(run.is_ok());

        let calls: Table = global(&sandbox, "calls");
        let calls: Vec<String> = calls
            .sequence_values()
            .collect::<LuaResult<_>>()
            .expect("strings");
        assert_eq!(calls, vec!["a1", "b2", "c3", "tick"]);
    }

    #[test]
    fn non_function_ping_target_is_logged_not_fatal() {
        let (mut sandbox, fixture) = loaded(
            r#"
            ticks = 0
            pings.register("missing")
            function tick() ticks = ticks + 1 end
            "#,
        );
        let id = fixture.pings.id_of("missing").expect("registered");
        fixture
            .pings
            .submit_incoming(id, JsonValue::Null)
            .expect("known id");
        let run = sandbox
            .run_tick(fixture.pings.take_incoming())
            .expect("tick live");
        assert!(run.is_ok());
        assert!(fixture.load_error.load(Ordering::SeqCst));
        assert!(sandbox.is_enabled(TICK));
        let ticks: i64 = global(&sandbox, "ticks");
        assert_eq!(ticks, 1);
    }

    #[test]
    fn script_api_queues_pings_and_customizations() {
        let (_sandbox, fixture) = loaded(
            r#"
            pings.register("wave")
            pings.send("wave", { speed = 2 })
            customize("nameplate", "above", "text", "hello")
            "#,
        );
        let batch = fixture.pings.take_outgoing();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].payload["speed"].as_f64(), Some(2.0));

        let record = fixture
            .customizations
            .get(crate::customization::CustomizationKind::Nameplate, "above")
            .expect("record created by script");
        assert_eq!(
            crate::lock(&record).get("text"),
            Some(&json!("hello"))
        );
    }

    #[test]
    fn compile_errors_name_the_chunk() {
        let (sandbox, _) = build("function (", 32_768);
        match sandbox {
            Err(ScriptError::Compile { chunk, source }) => {
                assert_eq!(chunk, "main");
                assert!(source.to_string().contains("main:1:"));
            }
            Err(other) => panic!("unexpected error {other:?}"),
            Ok(_) => panic!("broken source compiled"),
        }
    }

    #[test]
    fn memory_limit_stops_oversized_allocations() {
        let level = TrustLevel {
            memory_bytes: 1024 * 1024,
            ..TrustLevel::default()
        };
        let (sandbox, fixture) =
            build_with(r#"big = string.rep("x", 64 * 1024 * 1024)"#, level);
        let mut sandbox = sandbox.expect("compiles");
        let run = sandbox.run_init();
        assert!(matches!(
            run.result,
            Err(ScriptError::Runtime {
                phase: Phase::Init,
                source: LuaError::MemoryError(_),
            })
        ));
        assert!(run.executed < 100);
        assert!(fixture.load_error.load(Ordering::SeqCst));
        assert!(!sandbox.is_initialized());
    }

    #[test]
    fn runtime_errors_in_init_leave_sandbox_inert() {
        let (sandbox, fixture) = build("function tick() end error('bad start')", 32_768);
        let mut sandbox = sandbox.expect("compiles");
        let run = sandbox.run_init();
        assert!(matches!(
            run.result,
            Err(ScriptError::Runtime {
                phase: Phase::Init,
                ..
            })
        ));
        assert!(fixture.load_error.load(Ordering::SeqCst));
        assert!(!sandbox.is_initialized());
        assert!(sandbox.run_tick(VecDeque::new()).is_none());
        assert!(fixture
            .sink
            .plain_lines()
            .iter()
            .any(|line| line.contains("bad start")));
    }
}
