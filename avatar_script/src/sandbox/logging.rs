use std::collections::HashSet;
use std::ffi::c_void;
use std::sync::Arc;

use mlua::{Lua, Result as LuaResult, Table, Value};

use crate::diagnostics::Diagnostics;

const INDENT: &str = "  ";

/// Installs `log`, `print` and `logTableContent`.
pub(super) fn install_logging(lua: &Lua, diagnostics: Arc<Diagnostics>) -> LuaResult<()> {
    let globals = lua.globals();

    let log_diagnostics = Arc::clone(&diagnostics);
    let log = lua.create_function(move |_, value: Value| {
        log_diagnostics.script_message(&display_value(&value));
        Ok(())
    })?;
    globals.raw_set("log", log.clone())?;
    globals.raw_set("print", log)?;

    let table_diagnostics = diagnostics;
    let log_table = lua.create_function(move |_, table: Table| {
        if !table_diagnostics.should_log() {
            return Ok(());
        }
        let lines = table_lines(&table)?;
        table_diagnostics.script_table(&lines);
        Ok(())
    })?;
    globals.raw_set("logTableContent", log_table)?;
    Ok(())
}

/// Renders a value the way Lua's `tostring` does.
pub fn display_value(value: &Value) -> String {
    match value {
        Value::Nil => "nil".to_string(),
        Value::Boolean(flag) => flag.to_string(),
        Value::Integer(number) => format_number(*number as f64),
        Value::Number(number) => format_number(*number),
        Value::String(text) => text.to_string_lossy().into_owned(),
        other => format!("{}: {:?}", other.type_name(), other.to_pointer()),
    }
}

/// Significant digits Lua 5.1 uses for `tostring` on numbers (`%.14g`).
const NUMBER_DIGITS: i32 = 14;

fn format_number(number: f64) -> String {
    if number.is_nan() {
        return "nan".to_string();
    }
    if number.is_infinite() {
        return if number > 0.0 { "inf" } else { "-inf" }.to_string();
    }
    let scientific = format!("{:.*e}", (NUMBER_DIGITS - 1) as usize, number);
    let Some((mantissa, exponent)) = scientific.split_once('e') else {
        return number.to_string();
    };
    let Ok(exponent) = exponent.parse::<i32>() else {
        return number.to_string();
    };
    if exponent < -4 || exponent >= NUMBER_DIGITS {
        let sign = if exponent < 0 { '-' } else { '+' };
        return format!(
            "{}e{sign}{:02}",
            trim_fraction(mantissa),
            exponent.unsigned_abs()
        );
    }
    let decimals = (NUMBER_DIGITS - 1 - exponent) as usize;
    trim_fraction(&format!("{number:.decimals$}")).to_string()
}

fn trim_fraction(digits: &str) -> &str {
    if digits.contains('.') {
        digits.trim_end_matches('0').trim_end_matches('.')
    } else {
        digits
    }
}

/// Most lines one `logTableContent` call renders.
const MAX_TABLE_LINES: usize = 1000;

/// Pretty-prints `table` one line per entry, nesting by two spaces.
///
/// A table reached again through another key is printed once; later
/// references render as `<repeated>`, or `<cycle>` while it is still open.
/// Output stops after [`MAX_TABLE_LINES`] lines.
pub fn table_lines(table: &Table) -> LuaResult<Vec<String>> {
    let mut writer = TableWriter::default();
    writer.write(table, "")?;
    if writer.truncated {
        writer
            .lines
            .push(format!("... (output cut at {MAX_TABLE_LINES} lines)"));
    }
    Ok(writer.lines)
}

#[derive(Default)]
struct TableWriter {
    open: Vec<*const c_void>,
    seen: HashSet<*const c_void>,
    lines: Vec<String>,
    truncated: bool,
}

impl TableWriter {
    fn push(&mut self, line: String) -> bool {
        if self.lines.len() >= MAX_TABLE_LINES {
            self.truncated = true;
            return false;
        }
        self.lines.push(line);
        true
    }

    fn write(&mut self, table: &Table, depth: &str) -> LuaResult<()> {
        let pointer = table.to_pointer();
        self.open.push(pointer);
        self.seen.insert(pointer);
        let written = self.write_entries(table, depth);
        self.open.pop();
        written
    }

    fn write_entries(&mut self, table: &Table, depth: &str) -> LuaResult<()> {
        if !self.push(format!("{depth}{{")) {
            return Ok(());
        }
        for pair in table.clone().pairs::<Value, Value>() {
            if self.truncated {
                return Ok(());
            }
            let (key, value) = pair?;
            let key = display_value(&key);
            match &value {
                Value::Table(nested) if self.open.contains(&nested.to_pointer()) => {
                    self.push(format!("{INDENT}{depth}\"{key}\" : <cycle>,"));
                }
                Value::Table(nested) if self.seen.contains(&nested.to_pointer()) => {
                    self.push(format!("{INDENT}{depth}\"{key}\" : <repeated>,"));
                }
                Value::Table(nested) => {
                    let header = format!("{INDENT}{depth}\"{key}\" : {}", display_value(&value));
                    if self.push(header) {
                        let nested_depth = format!("{INDENT}{depth}");
                        self.write(nested, &nested_depth)?;
                    }
                }
                _ => {
                    self.push(format!(
                        "{INDENT}{depth}\"{key}\" : {},",
                        display_value(&value)
                    ));
                }
            }
        }
        self.push(format!("{depth}}},"));
        Ok(())
    }
}
