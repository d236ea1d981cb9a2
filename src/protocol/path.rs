//! Dotted paths into the global namespace.
//!
//! On the wire a path is a `u32` length followed by its segments joined with
//! `.`, e.g. `string.format`. The server walks it left to right: the first
//! segment is looked up in the globals, each following one is a field of
//! the previous result.
use mlua::{Lua, Value};

use crate::error::{ErrorNum, Result};

use super::{NUM_FUNCNAME_CHARS, link::Link};

/// Reject segments that cannot be sent unambiguously.
pub fn validate_segment(name: &str) -> Result<()> {
    if name.len() > NUM_FUNCNAME_CHARS - 1 {
        return Err(ErrorNum::LongFname.into());
    }
    if name.is_empty() || name.contains(['.', '\0']) {
        return Err(ErrorNum::InvalidName(name.to_string()).into());
    }
    Ok(())
}

pub fn write_path(link: &mut Link, segments: &[&str]) -> Result<()> {
    link.write_string(segments.join(".").as_bytes())
}

pub fn read_path(link: &mut Link) -> Result<String> {
    let bytes = link.read_string()?;
    String::from_utf8(bytes).map_err(|e| ErrorNum::Protocol(format!("path is not utf-8: {e}")).into())
}

/// Segments of a non-empty path; `None` if any segment is empty.
pub fn split(path: &str) -> Option<Vec<&str>> {
    let segments: Vec<&str> = path.split('.').collect();
    if segments.iter().any(|s| s.is_empty()) {
        return None;
    }
    Some(segments)
}

/// Look `path` up starting from the globals.
pub fn resolve(lua: &Lua, path: &str) -> mlua::Result<Value> {
    let segments =
        split(path).ok_or_else(|| mlua::Error::runtime(format!("invalid path '{path}'")))?;

    let mut value = Value::Table(lua.globals());
    for segment in segments {
        value = index(value, segment)?;
    }
    Ok(value)
}

/// `value[key]`, honouring `__index` on tables.
pub fn index(value: Value, key: &str) -> mlua::Result<Value> {
    match value {
        Value::Table(t) => t.get(key),
        other => Err(mlua::Error::runtime(format!(
            "attempt to index a {} value (field '{key}')",
            other.type_name()
        ))),
    }
}
