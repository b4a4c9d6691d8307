use std::cell::Cell;
use std::rc::Rc;

use mlua::{Error as LuaError, HookTriggers, Lua};

use crate::error::{INTEGRITY_MESSAGE, OVERRUN_MESSAGE};

/// Why the enforcer stopped the current task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Abort {
    Overrun,
    Integrity,
}

impl Abort {
    fn message(&self) -> &'static str {
        match self {
            Abort::Overrun => OVERRUN_MESSAGE,
            Abort::Integrity => INTEGRITY_MESSAGE,
        }
    }
}

#[derive(Debug, Default)]
struct Counter {
    executed: Cell<u64>,
    limit: Cell<u64>,
    abort: Cell<Option<Abort>>,
}

/// Counts executed Lua instructions and traps once a limit is passed.
///
/// The trap is sticky: after it fires, every further instruction raises
/// again, so a `pcall` in user code cannot swallow it.
#[derive(Clone)]
pub struct InstructionBudget {
    counter: Rc<Counter>,
    on_overrun: Rc<dyn Fn(u64)>,
}

impl InstructionBudget {
    /// `on_overrun` runs once per armed phase, with the limit, when the trap fires.
    pub fn new(on_overrun: impl Fn(u64) + 'static) -> Self {
        Self {
            counter: Rc::new(Counter::default()),
            on_overrun: Rc::new(on_overrun),
        }
    }

    /// Resets the counter and installs the hook for a fresh phase.
    pub fn arm(&self, lua: &Lua, limit: u64) {
        self.counter.executed.set(0);
        self.counter.limit.set(limit);
        self.counter.abort.set(None);

        let counter = Rc::clone(&self.counter);
        let on_overrun = Rc::clone(&self.on_overrun);
        lua.set_hook(
            HookTriggers::new().every_nth_instruction(1),
            move |_lua, _debug| {
                if let Some(abort) = counter.abort.get() {
                    return Err(LuaError::RuntimeError(abort.message().to_string()));
                }
                let executed = counter.executed.get() + 1;
                counter.executed.set(executed);
                if executed > counter.limit.get() {
                    counter.abort.set(Some(Abort::Overrun));
                    on_overrun(counter.limit.get());
                    return Err(LuaError::RuntimeError(OVERRUN_MESSAGE.to_string()));
                }
                Ok(())
            },
        );
    }

    /// Removes the hook and returns how many instructions the phase executed.
    pub fn disarm(&self, lua: &Lua) -> u64 {
        lua.remove_hook();
        self.counter.executed.get()
    }

    /// Makes every following instruction of the armed phase fail.
    pub fn abort(&self, reason: Abort) {
        self.counter.abort.set(Some(reason));
    }

    pub fn aborted(&self) -> Option<Abort> {
        self.counter.abort.get()
    }

    pub fn executed(&self) -> u64 {
        self.counter.executed.get()
    }

    pub fn limit(&self) -> u64 {
        self.counter.limit.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    use mlua::Function;

    fn run_with_limit(lua: &Lua, budget: &InstructionBudget, body: &Function, limit: u64) -> (bool, u64) {
        budget.arm(lua, limit);
        let result = body.call::<_, ()>(());
        let executed = budget.disarm(lua);
        (result.is_ok() && budget.aborted().is_none(), executed)
    }

    #[test]
    fn trap_fires_exactly_after_limit() {
        let lua = Lua::new();
        let budget = InstructionBudget::new(|_| {});
        let body: Function = lua
            .load("local total = 0 for i = 1, 25 do total = total + i end return total")
            .into_function()
            .expect("body compiles");

        let (ok, needed) = run_with_limit(&lua, &budget, &body, u64::MAX);
        assert!(ok);
        assert!(needed > 25);

        let (ok, executed) = run_with_limit(&lua, &budget, &body, needed);
        assert!(ok, "a limit equal to the cost must be enough");
        assert_eq!(executed, needed);

        let (ok, executed) = run_with_limit(&lua, &budget, &body, needed - 1);
        assert!(!ok, "one instruction short must trap");
        assert_eq!(executed, needed);
        assert_eq!(budget.aborted(), Some(Abort::Overrun));
    }

    #[test]
    fn pcall_cannot_swallow_the_trap() {
        let lua = Lua::new();
        let overruns = Rc::new(RefCell::new(Vec::new()));
        let seen = Rc::clone(&overruns);
        let budget = InstructionBudget::new(move |limit| seen.borrow_mut().push(limit));
        let body: Function = lua
            .load(
                r#"
                escaped = false
                while true do
                    pcall(function() while true do end end)
                    escaped = true
                end
                "#,
            )
            .into_function()
            .expect("body compiles");

        budget.arm(&lua, 500);
        let result = body.call::<_, ()>(());
        budget.disarm(&lua);

        assert!(result.is_err());
        assert_eq!(budget.aborted(), Some(Abort::Overrun));
        assert_eq!(*overruns.borrow(), vec![500]);
        let escaped: bool = lua.globals().get("escaped").expect("flag");
        assert!(!escaped);
    }

    #[test]
    fn rearming_resets_the_counter() {
        let lua = Lua::new();
        let budget = InstructionBudget::new(|_| {});
        let spin: Function = lua
            .load("while true do end")
            .into_function()
            .expect("body compiles");
        budget.arm(&lua, 100);
        assert!(spin.call::<_, ()>(()).is_err());
        assert_eq!(budget.disarm(&lua), 101);

        let quick: Function = lua.load("return 1").into_function().expect("compiles");
        budget.arm(&lua, 100);
        assert!(quick.call::<_, i64>(()).is_ok());
        assert!(budget.aborted().is_none());
        assert!(budget.disarm(&lua) <= 100);
    }

    #[test]
    fn explicit_abort_stops_the_next_instruction() {
        let lua = Lua::new();
        let budget = InstructionBudget::new(|_| {});
        let trip = budget.clone();
        let guard = lua
            .create_function(move |_, ()| {
                trip.abort(Abort::Integrity);
                Ok(())
            })
            .expect("guard");
        lua.globals().set("guard", guard).expect("install guard");
        let body: Function = lua
            .load("pcall(guard) reached = true")
            .into_function()
            .expect("compiles");

        budget.arm(&lua, 10_000);
        let result = body.call::<_, ()>(());
        budget.disarm(&lua);
        assert!(result.is_err());
        assert_eq!(budget.aborted(), Some(Abort::Integrity));
        let reached: Option<bool> = lua.globals().get("reached").expect("lookup");
        assert_eq!(reached, None);
    }
}
