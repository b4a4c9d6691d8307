use std::collections::BTreeMap;

use mlua::{Function, IntoLuaMulti, Lua, RegistryKey, Result as LuaResult};

pub const TICK: &str = "tick";
pub const RENDER: &str = "render";

/// Builds a fresh event for one instance.
pub type EventFactory = fn(&str) -> Event;

/// Process-wide list of event kinds every instance gets a copy of.
#[derive(Debug, Clone)]
pub struct EventCatalog {
    factories: BTreeMap<String, EventFactory>,
}

impl EventCatalog {
    pub fn empty() -> Self {
        Self {
            factories: BTreeMap::new(),
        }
    }

    /// Lifecycle events a host drives for avatars.
    pub fn standard() -> Self {
        let mut catalog = Self::empty();
        for name in [TICK, RENDER, "world_render", "player_init", "onCommand", "onDamage"] {
            catalog.register(name, Event::new);
        }
        catalog
    }

    pub fn register(&mut self, name: &str, factory: EventFactory) {
        self.factories.insert(name.to_string(), factory);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }

    pub fn instantiate(&self) -> EventRegistry {
        let events = self
            .factories
            .iter()
            .map(|(name, factory)| (name.clone(), factory(name)))
            .collect();
        EventRegistry { events }
    }
}

impl Default for EventCatalog {
    fn default() -> Self {
        Self::standard()
    }
}

/// Named dispatch point. Handlers run in subscription order.
#[derive(Debug)]
pub struct Event {
    name: String,
    handlers: Vec<RegistryKey>,
    enabled: bool,
}

impl Event {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            handlers: Vec::new(),
            enabled: true,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn subscribe(&mut self, handler: RegistryKey) {
        self.handlers.push(handler);
    }

    fn handlers<'lua>(&self, lua: &'lua Lua) -> LuaResult<Vec<Function<'lua>>> {
        if !self.enabled {
            return Ok(Vec::new());
        }
        self.handlers
            .iter()
            .map(|key| lua.registry_value(key))
            .collect()
    }
}

/// Calls every handler with `args`, stopping at the first error.
pub fn call_in_order<'lua, A>(lua: &'lua Lua, handlers: &[Function<'lua>], args: A) -> LuaResult<()>
where
    A: IntoLuaMulti<'lua>,
{
    if handlers.is_empty() {
        return Ok(());
    }
    let args = args.into_lua_multi(lua)?;
    for handler in handlers {
        handler.call::<_, ()>(args.clone())?;
    }
    Ok(())
}

/// The events of one instance.
#[derive(Debug, Default)]
pub struct EventRegistry {
    events: BTreeMap<String, Event>,
}

impl EventRegistry {
    pub fn contains(&self, name: &str) -> bool {
        self.events.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&Event> {
        self.events.get(name)
    }

    /// Appends `handler` to `name`. Returns false when no such event exists.
    pub fn subscribe(&mut self, lua: &Lua, name: &str, handler: Function) -> LuaResult<bool> {
        let Some(event) = self.events.get_mut(name) else {
            return Ok(false);
        };
        event.subscribe(lua.create_registry_value(handler)?);
        Ok(true)
    }

    /// Snapshot of the handlers of `name`. Unknown and disabled events have none.
    ///
    /// Callers invoke the snapshot after releasing the registry, since a
    /// running handler may subscribe new ones.
    pub fn handlers<'lua>(&self, lua: &'lua Lua, name: &str) -> LuaResult<Vec<Function<'lua>>> {
        match self.events.get(name) {
            Some(event) => event.handlers(lua),
            None => Ok(Vec::new()),
        }
    }

    /// Runs the handlers of `name`. Unknown and disabled events are no-ops.
    pub fn dispatch<'lua, A>(&self, lua: &'lua Lua, name: &str, args: A) -> LuaResult<()>
    where
        A: IntoLuaMulti<'lua>,
    {
        let handlers = self.handlers(lua, name)?;
        call_in_order(lua, &handlers, args)
    }

    /// Turns `name` off until the instance is reloaded.
    pub fn disable(&mut self, name: &str) {
        if let Some(event) = self.events.get_mut(name) {
            if event.enabled {
                log::debug!("[avatar_script] disabling event {name}");
            }
            event.enabled = false;
        }
    }

    pub fn is_enabled(&self, name: &str) -> bool {
        self.events.get(name).is_some_and(Event::is_enabled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mlua::Table;

    fn handler<'lua>(lua: &'lua Lua, source: &str) -> Function<'lua> {
        lua.load(source).eval().expect("handler compiles")
    }

    #[test]
    fn catalog_creates_fresh_events_per_instance() {
        let catalog = EventCatalog::standard();
        let first = catalog.instantiate();
        let second = catalog.instantiate();
        assert!(first.contains(TICK));
        assert!(first.contains(RENDER));
        assert!(second.contains("onCommand"));
        assert!(!first.contains("debug"));
    }

    #[test]
    fn handlers_run_in_subscription_order() {
        let lua = Lua::new();
        lua.load("calls = {}").exec().expect("setup");
        let mut registry = EventCatalog::standard().instantiate();
        for label in ["a", "b", "c"] {
            let source = format!("function(dt) table.insert(calls, '{label}' .. dt) end");
            let subscribed = registry
                .subscribe(&lua, TICK, handler(&lua, &source))
                .expect("subscribe");
            assert!(subscribed);
        }
        registry.dispatch(&lua, TICK, 1).expect("dispatch");

        let calls: Table = lua.globals().get("calls").expect("calls table");
        let calls: Vec<String> = calls.sequence_values().collect::<LuaResult<_>>().expect("strings");
        assert_eq!(calls, vec!["a1", "b1", "c1"]);
        assert_eq!(registry.get(TICK).map(Event::handler_count), Some(3));
    }

    #[test]
    fn dispatch_stops_at_first_error() {
        let lua = Lua::new();
        lua.load("count = 0").exec().expect("setup");
        let mut registry = EventCatalog::standard().instantiate();
        registry
            .subscribe(&lua, RENDER, handler(&lua, "function() error('first') end"))
            .expect("subscribe");
        registry
            .subscribe(&lua, RENDER, handler(&lua, "function() count = count + 1 end"))
            .expect("subscribe");

        assert!(registry.dispatch(&lua, RENDER, ()).is_err());
        let count: i64 = lua.globals().get("count").expect("count");
        assert_eq!(count, 0);

        registry.disable(RENDER);
        assert!(!registry.is_enabled(RENDER));
        assert!(registry.dispatch(&lua, RENDER, ()).is_ok());
    }

    #[test]
    fn unknown_events_reject_subscription() {
        let lua = Lua::new();
        let mut registry = EventCatalog::standard().instantiate();
        let subscribed = registry
            .subscribe(&lua, "update", handler(&lua, "function() end"))
            .expect("subscribe");
        assert!(!subscribed);
        assert!(registry.dispatch(&lua, "update", ()).is_ok());
    }
}
