//! The `rpc` library exposed to Lua.
//!
//! | Function                          | Effect                                      |
//! |-----------------------------------|---------------------------------------------|
//! | `rpc.connect(addr [, port])`      | handle, or `nil` after reporting the error  |
//! | `rpc.close(handle)`               | close a client handle or a server handle    |
//! | `rpc.listen(addr [, port])`       | server handle                               |
//! | `rpc.server(addr [, port])`       | listen and dispatch until the listener closes |
//! | `rpc.peek(server)`                | `true` if a dispatch step has work to do    |
//! | `rpc.dispatch(server)`            | one dispatch step                           |
//! | `rpc.on_error([handle,] fn)`      | install or clear (`nil`) an error hook      |
//! | `rpc.mode`                        | `"socket"`                                  |
//!
//! Addresses are `"tcp://host:port"`, `"udp://host:port"` or a bare
//! `"host:port"`; the two argument form takes a host and a TCP port.
use std::{fs, path::Path};

use log::{debug, info};
use mlua::{AnyUserData, Function, Lua, MultiValue, Table, UserDataRefMut, Value};

use crate::{
    client::{self, ERROR_HOOK, Handle},
    config::RpcConfig,
    error::Result,
    server::ServerHandle,
    transport::TransportAddr,
};

pub const MODE: &str = "socket";

/// Install `rpc` with the default configuration.
pub fn register(lua: &Lua) -> mlua::Result<Table> {
    register_with(lua, RpcConfig::default())
}

pub fn register_with(lua: &Lua, config: RpcConfig) -> mlua::Result<Table> {
    lua.set_app_data(config);

    let rpc = lua.create_table()?;
    rpc.set("connect", lua.create_function(connect)?)?;
    rpc.set("close", lua.create_function(close)?)?;
    rpc.set("listen", lua.create_function(listen)?)?;
    rpc.set("server", lua.create_function(server)?)?;
    rpc.set("peek", lua.create_function(peek)?)?;
    rpc.set("dispatch", lua.create_function(dispatch)?)?;
    rpc.set("on_error", lua.create_function(on_error)?)?;
    rpc.set("mode", MODE)?;

    lua.globals().set("rpc", &rpc)?;
    Ok(rpc)
}

/// Execute a Lua source file.
pub fn run_script(lua: &Lua, path: &Path) -> Result<()> {
    let source = fs::read_to_string(path)?;
    lua.load(source)
        .set_name(format!("@{}", path.display()))
        .exec()?;
    Ok(())
}

fn config(lua: &Lua) -> RpcConfig {
    lua.app_data_ref::<RpcConfig>()
        .map(|config| (*config).clone())
        .unwrap_or_default()
}

fn transport_addr(addr: &str, port: Option<u16>) -> Result<TransportAddr> {
    match port {
        Some(port) => Ok(TransportAddr::from_parts(addr, port)),
        None => addr.parse(),
    }
}

fn connect(lua: &Lua, (addr, port): (String, Option<u16>)) -> mlua::Result<Option<Handle>> {
    let config = config(lua);
    match transport_addr(&addr, port).and_then(|target| Handle::connect(&target, &config)) {
        Ok(handle) => {
            info!("connected to {addr}");
            Ok(Some(handle))
        }
        Err(e) => {
            client::report(lua, e)?;
            Ok(None)
        }
    }
}

fn close(_: &Lua, ud: AnyUserData) -> mlua::Result<()> {
    if let Ok(handle) = ud.borrow::<Handle>() {
        handle.close();
        return Ok(());
    }
    if let Ok(mut server) = ud.borrow_mut::<ServerHandle>() {
        server.shutdown();
        return Ok(());
    }
    Err(mlua::Error::runtime("arg must be handle"))
}

fn listen(lua: &Lua, (addr, port): (String, Option<u16>)) -> mlua::Result<ServerHandle> {
    let config = config(lua);
    match transport_addr(&addr, port).and_then(|target| ServerHandle::listen(&target, config)) {
        Ok(server) => Ok(server),
        Err(e) => {
            client::report(lua, e)?;
            Err(mlua::Error::runtime("bad handle"))
        }
    }
}

fn server(lua: &Lua, args: (String, Option<u16>)) -> mlua::Result<()> {
    let mut server = listen(lua, args)?;
    if let Err(e) = server.serve(lua) {
        client::report(lua, e)?;
    }
    Ok(())
}

fn peek(_: &Lua, mut server: UserDataRefMut<ServerHandle>) -> mlua::Result<Option<bool>> {
    match server.peek() {
        Ok(ready) => Ok(Some(ready)),
        Err(e) => {
            debug!("peek failed: {e}");
            Ok(None)
        }
    }
}

fn dispatch(lua: &Lua, mut server: UserDataRefMut<ServerHandle>) -> mlua::Result<()> {
    match server.dispatch(lua) {
        Err(e) if e.is_fatal() => client::report(lua, e),
        Err(e) => {
            debug!("dispatch failed: {e}");
            Ok(())
        }
        Ok(()) => Ok(()),
    }
}

fn on_error(lua: &Lua, args: MultiValue) -> mlua::Result<()> {
    let mut args = args.into_iter();
    match args.next().unwrap_or(Value::Nil) {
        Value::UserData(ud) if ud.is::<Handle>() => {
            let hook = hook_arg(args.next().unwrap_or(Value::Nil))?;
            ud.borrow::<Handle>()?.set_error_handler(lua, hook)
        }
        arg => match hook_arg(arg)? {
            Some(hook) => lua.set_named_registry_value(ERROR_HOOK, hook),
            None => lua.unset_named_registry_value(ERROR_HOOK),
        },
    }
}

fn hook_arg(value: Value) -> mlua::Result<Option<Function>> {
    match value {
        Value::Nil => Ok(None),
        Value::Function(f) => Ok(Some(f)),
        _ => Err(mlua::Error::runtime("bad args")),
    }
}
