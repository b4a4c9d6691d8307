use std::str::FromStr;
use std::sync::Arc;

use mlua::{Error as LuaError, Lua, LuaSerdeExt, Result as LuaResult, Value};
use serde_json::Value as JsonValue;

use crate::customization::{CustomizationKind, Customizations};
use crate::lock;
use crate::pings::PingChannel;

fn to_json(lua: &Lua, value: Value) -> LuaResult<JsonValue> {
    match value {
        Value::Nil => Ok(JsonValue::Null),
        other => lua.from_value(other),
    }
}

/// Installs the `pings` table: `pings.register(name)` and `pings.send(name, args)`.
pub(super) fn install_pings(lua: &Lua, channel: Arc<PingChannel>) -> LuaResult<()> {
    let pings = lua.create_table()?;

    let register_channel = Arc::clone(&channel);
    pings.set(
        "register",
        lua.create_function(move |_, name: String| {
            register_channel
                .register_name(&name)
                .map_err(LuaError::external)
        })?,
    )?;

    let send_channel = channel;
    pings.set(
        "send",
        lua.create_function(move |lua, (name, args): (String, Value)| {
            let payload = to_json(lua, args)?;
            send_channel
                .queue_outgoing(&name, payload)
                .map(|_| ())
                .map_err(LuaError::external)
        })?,
    )?;

    lua.globals().raw_set("pings", pings)
}

/// Installs `customize(kind, accessor, field, value)`.
pub(super) fn install_customize(lua: &Lua, customizations: Arc<Customizations>) -> LuaResult<()> {
    let customize = lua.create_function(
        move |lua, (kind, accessor, field, value): (String, String, String, Value)| {
            let kind = CustomizationKind::from_str(&kind).map_err(LuaError::RuntimeError)?;
            let value = to_json(lua, value)?;
            let record = customizations.get_or_create(kind, &accessor);
            lock(&record).set(field, value);
            Ok(())
        },
    )?;
    lua.globals().raw_set("customize", customize)
}
