//! Tagged encoding of Lua values.
//!
//! Every value starts with a one byte tag from [`tag`](super::tag):
//!
//! | Tag            | Payload                                         |
//! |----------------|-------------------------------------------------|
//! | `NIL`          | none                                            |
//! | `BOOLEAN`      | `u8` 0 or 1                                     |
//! | `NUMBER`       | number in the negotiated format                 |
//! | `STRING`       | `u32` length, raw bytes                         |
//! | `TABLE`        | key/value pairs as values, then `TABLE_END`     |
//! | `FUNCTION`     | bytecode as a `STRING` value, then `FUNCTION_END`|
//! | `REMOTE`       | a dotted path, resolved by the receiver         |
//!
//! Tables are walked with a visited set so a cycle is reported instead of
//! recursing forever; the same table may still appear twice in a tree.
//! Incoming values may nest at most [`MAX_NESTING`] tables or functions
//! deep, and bytecode is only loaded when the link allows it.
use std::collections::HashSet;

use log::{debug, trace};
use mlua::{ChunkMode, Function, Lua, Table, Value};

use crate::{
    client::Helper,
    error::{ErrorNum, Result, RpcError},
};

use super::{
    link::{Link, WireNumber},
    path, status, tag,
};

/// Deepest table or function nesting accepted from a peer.
pub const MAX_NESTING: usize = 64;

/// Result of reading one tag.
#[derive(Debug)]
pub enum Decoded {
    Value(Value),
    /// `TABLE_END` or `FUNCTION_END`.
    End,
}

pub fn write_variable(link: &mut Link, value: &Value) -> Result<()> {
    let mut visiting = HashSet::new();
    write_value(link, value, &mut visiting)
}

fn write_value(link: &mut Link, value: &Value, visiting: &mut HashSet<usize>) -> Result<()> {
    match value {
        Value::Nil => link.write_u8(tag::NIL),
        Value::Boolean(b) => {
            link.write_u8(tag::BOOLEAN)?;
            link.write_u8(*b as u8)
        }
        Value::Integer(i) => {
            link.write_u8(tag::NUMBER)?;
            link.write_number(WireNumber::Integer(*i))
        }
        Value::Number(n) => {
            link.write_u8(tag::NUMBER)?;
            link.write_number(WireNumber::Float(*n))
        }
        Value::String(s) => {
            link.write_u8(tag::STRING)?;
            link.write_string(&s.as_bytes())
        }
        Value::Table(t) => write_table(link, t, visiting),
        Value::Function(f) => write_function(link, f),
        Value::UserData(ud) => match ud.borrow::<Helper>() {
            Ok(helper) => {
                link.write_u8(tag::REMOTE)?;
                helper.write_path(link)
            }
            Err(_) => Err(ErrorNum::UnsupportedType("userdata").into()),
        },
        Value::LightUserData(_) => Err(ErrorNum::UnsupportedType("light userdata").into()),
        other => Err(ErrorNum::UnsupportedType(other.type_name()).into()),
    }
}

fn write_table(link: &mut Link, table: &Table, visiting: &mut HashSet<usize>) -> Result<()> {
    let id = table.to_pointer() as usize;
    if !visiting.insert(id) {
        return Err(ErrorNum::UnsupportedType("circular table").into());
    }

    link.write_u8(tag::TABLE)?;
    for pair in table.clone().pairs::<Value, Value>() {
        let (key, value) = pair?;
        write_value(link, &key, visiting)?;
        write_value(link, &value, visiting)?;
    }
    link.write_u8(tag::TABLE_END)?;

    visiting.remove(&id);
    Ok(())
}

fn write_function(link: &mut Link, function: &Function) -> Result<()> {
    let code = function.dump(false);
    if code.is_empty() {
        return Err(ErrorNum::UnsupportedType("C function").into());
    }
    trace!("sending function of {} bytes", code.len());

    link.write_u8(tag::FUNCTION)?;
    link.write_u8(tag::STRING)?;
    link.write_string(&code)?;
    link.write_u8(tag::FUNCTION_END)
}

pub fn read_variable(link: &mut Link, lua: &Lua) -> Result<Decoded> {
    read_nested(link, lua, 0)
}

fn read_nested(link: &mut Link, lua: &Lua, depth: usize) -> Result<Decoded> {
    let value = match link.read_u8()? {
        tag::NIL => Value::Nil,
        tag::BOOLEAN => Value::Boolean(link.read_u8()? != 0),
        tag::NUMBER => {
            let number = link.read_number()?;
            if link.local().intnum {
                Value::Integer(number.as_integer())
            } else {
                Value::Number(number.as_float())
            }
        }
        tag::STRING => Value::String(lua.create_string(link.read_string()?)?),
        tag::TABLE => Value::Table(read_table(link, lua, nest(depth)?)?),
        tag::FUNCTION => Value::Function(read_function(link, lua, nest(depth)?)?),
        tag::REMOTE => {
            let name = path::read_path(link)?;
            path::resolve(lua, &name).unwrap_or_else(|e| {
                debug!("remote reference '{name}' unresolved: {e}");
                Value::Nil
            })
        }
        tag::TABLE_END | tag::FUNCTION_END => return Ok(Decoded::End),
        other => return Err(ErrorNum::UnknownTag(other).into()),
    };
    Ok(Decoded::Value(value))
}

fn nest(depth: usize) -> Result<usize> {
    if depth >= MAX_NESTING {
        return Err(ErrorNum::Protocol(format!(
            "value nested deeper than {MAX_NESTING} levels"
        ))
        .into());
    }
    Ok(depth + 1)
}

/// Read a value where an end marker would be out of place.
pub fn read_value(link: &mut Link, lua: &Lua) -> Result<Value> {
    read_value_at(link, lua, 0)
}

fn read_value_at(link: &mut Link, lua: &Lua, depth: usize) -> Result<Value> {
    match read_nested(link, lua, depth)? {
        Decoded::Value(value) => Ok(value),
        Decoded::End => Err(ErrorNum::Protocol("unexpected end marker".to_string()).into()),
    }
}

/// Read `count` consecutive values.
///
/// A value the interpreter refuses (bytecode the link does not accept or
/// that will not load, a nil or NaN table key) does not stop the read: the rest of the frame is consumed
/// first and the first such error is returned afterwards, so the stream
/// stays in sync. Transport and framing errors return immediately.
pub fn read_values(link: &mut Link, lua: &Lua, count: usize) -> Result<Vec<Value>> {
    let mut failed = None;
    let mut values = Vec::new();
    for _ in 0..count {
        let value = defer(read_value(link, lua), &mut failed)?;
        values.push(value);
    }
    match failed {
        Some(e) => Err(e),
        None => Ok(values),
    }
}

fn defer(res: Result<Value>, failed: &mut Option<RpcError>) -> Result<Value> {
    match res {
        Err(e) if matches!(e.errnum, ErrorNum::Lua(_)) => {
            failed.get_or_insert(e);
            Ok(Value::Nil)
        }
        res => res,
    }
}

fn read_table(link: &mut Link, lua: &Lua, depth: usize) -> Result<Table> {
    let table = lua.create_table()?;
    let mut failed = None;
    loop {
        let key = match read_nested(link, lua, depth) {
            Ok(Decoded::Value(key)) => key,
            Ok(Decoded::End) => break,
            Err(e) => defer(Err(e), &mut failed)?,
        };
        let value = defer(read_value_at(link, lua, depth), &mut failed)?;

        // Raw sets with these keys raise outside a protected call.
        let refused = match &key {
            Value::Nil => Some("table index is nil"),
            Value::Number(n) if n.is_nan() => Some("table index is NaN"),
            _ => None,
        };
        if let Some(message) = refused {
            failed.get_or_insert(mlua::Error::runtime(message).into());
            continue;
        }
        if let Err(e) = table.raw_set(key, value) {
            failed.get_or_insert(e.into());
        }
    }
    match failed {
        Some(e) => Err(e),
        None => Ok(table),
    }
}

fn read_function(link: &mut Link, lua: &Lua, depth: usize) -> Result<Function> {
    let code = match read_value_at(link, lua, depth)? {
        Value::String(code) => code.as_bytes().to_vec(),
        other => {
            return Err(ErrorNum::Protocol(format!(
                "expected function bytecode, got {}",
                other.type_name()
            ))
            .into());
        }
    };
    if let Decoded::Value(_) = read_nested(link, lua, depth)? {
        return Err(ErrorNum::Protocol("unterminated function".to_string()).into());
    }

    // The frame is fully consumed before loading, so a refused chunk leaves
    // the stream in sync.
    if !link.allows_bytecode() {
        debug!("refusing {} bytes of function bytecode", code.len());
        return Err(mlua::Error::runtime("function bytecode is not accepted").into());
    }
    let function = lua
        .load(code)
        .set_name("=remote")
        .set_mode(ChunkMode::Binary)
        .into_function()?;
    Ok(function)
}

/// Error status payload: `u32 code, u32 len, message`.
pub fn write_error(link: &mut Link, code: u32, message: &[u8]) -> Result<()> {
    link.write_u8(status::ERR)?;
    link.write_u32(code)?;
    link.write_string(message)
}

/// Read the payload following an error status.
pub fn read_error(link: &mut Link) -> Result<RpcError> {
    let code = link.read_u32()?;
    let message = String::from_utf8_lossy(&link.read_string()?).into_owned();
    Ok(ErrorNum::Remote { code, message }.into())
}
