//! Command dispatcher.
//!
//! A [`ServerHandle`] pairs a listening transport with at most one accepted
//! connection. Each call to [`ServerHandle::dispatch`] performs one step:
//! with no connection it accepts one, which must open with CON; otherwise it
//! reads one command and executes it against the Lua state.
//!
//! Errors are classified after every step. A fatal error shuts the whole
//! handle down. A nonfatal one counts towards the connection's link error
//! budget; once more than [`MAX_LINK_ERRS`] happen in a row the connection
//! is dropped and the listener accepts the next one.
use log::{debug, error, info, warn};
use mlua::{Lua, MultiValue, UserData, UserDataMethods, Value};

use crate::{
    config::RpcConfig,
    error::{ErrorNum, Result, RpcError},
    protocol::{Command, MAX_LINK_ERRS, codec, link::Link, lua_status, negotiate, path, status},
    transport::{Listener, TransportAddr},
};

pub struct ServerHandle {
    ltpt: Option<Box<dyn Listener>>,
    atpt: Option<Link>,
    link_errs: u32,
    config: RpcConfig,
}

impl ServerHandle {
    pub fn new(listener: Box<dyn Listener>, config: RpcConfig) -> Self {
        Self {
            ltpt: Some(listener),
            atpt: None,
            link_errs: 0,
            config,
        }
    }

    pub fn listen(addr: &TransportAddr, config: RpcConfig) -> Result<Self> {
        let listener = addr.listen(&config)?;
        Ok(Self::new(listener, config))
    }

    pub fn is_listening(&self) -> bool {
        self.ltpt.as_ref().is_some_and(|l| l.is_open())
    }

    pub fn is_connected(&self) -> bool {
        self.atpt.as_ref().is_some_and(|l| l.is_open())
    }

    pub fn link_errs(&self) -> u32 {
        self.link_errs
    }

    /// Whether [`dispatch`](Self::dispatch) would make progress: data on
    /// the connection, or a pending connection when there is none.
    pub fn peek(&mut self) -> Result<bool> {
        if let Some(link) = self.atpt.as_mut().filter(|l| l.is_open()) {
            return link.readable();
        }
        match self.ltpt.as_mut().filter(|l| l.is_open()) {
            Some(listener) => listener.readable(),
            None => Ok(false),
        }
    }

    /// Run one dispatch step.
    pub fn dispatch(&mut self, lua: &Lua) -> Result<()> {
        if !self.is_connected() {
            return self.accept().map_err(|e| {
                if e.is_fatal() {
                    error!("fatal server error: {e}");
                    self.shutdown();
                } else {
                    warn!("connection refused: {e}");
                    self.close_connection();
                }
                e
            });
        }

        match self.read_command(lua) {
            Ok(()) => {
                self.link_errs = 0;
                Ok(())
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    /// Dispatch until the listener closes or a fatal error shuts us down.
    pub fn serve(&mut self, lua: &Lua) -> Result<()> {
        while self.is_listening() {
            match self.dispatch(lua) {
                Err(e) if e.is_fatal() && !self.is_listening() => return Err(e),
                Err(e) => debug!("dispatch failed: {e}"),
                Ok(()) => {}
            }
        }
        Ok(())
    }

    /// Close both transports.
    pub fn shutdown(&mut self) {
        info!("shutting down server");
        self.close_connection();
        if let Some(mut listener) = self.ltpt.take() {
            listener.close();
        }
    }

    pub fn close_connection(&mut self) {
        if let Some(mut link) = self.atpt.take() {
            info!("closing connection");
            link.close();
        }
        self.link_errs = 0;
    }

    fn fail(&mut self, err: RpcError) -> RpcError {
        if err.is_fatal() {
            error!("fatal server error: {err}");
            self.shutdown();
            return err;
        }

        if !self.is_connected() {
            info!("connection lost: {err}");
            self.close_connection();
            return err;
        }

        self.link_errs += 1;
        warn!("link error {}/{MAX_LINK_ERRS}: {err}", self.link_errs);
        if self.link_errs > MAX_LINK_ERRS {
            warn!("too many link errors, dropping connection");
            self.close_connection();
            return err.escalate();
        }
        err
    }

    fn accept(&mut self) -> Result<()> {
        let listener = self
            .ltpt
            .as_mut()
            .filter(|l| l.is_open())
            .ok_or_else(|| RpcError::from(ErrorNum::Closed))?;
        let tpt = listener.accept()?;
        self.link_errs = 0;

        let link = self.atpt.insert(Link::new(tpt, self.config.local));
        link.set_allow_bytecode(self.config.allow_bytecode);
        link.exchange(|link| match link.read_u8()? {
            byte if byte == Command::Con as u8 => negotiate::server_negotiate(link),
            byte => Err(ErrorNum::Command(byte).into()),
        })
    }

    fn read_command(&mut self, lua: &Lua) -> Result<()> {
        let helper_wait = self.config.helper_wait;
        let link = self
            .atpt
            .as_mut()
            .ok_or_else(|| RpcError::from(ErrorNum::Closed))?;

        link.exchange(|link| {
            let cmd = match Command::try_from(link.read_u8()?) {
                Ok(cmd) => cmd,
                Err(byte) => {
                    if helper_wait {
                        link.write_u8(status::UNSUPPORTED_CMD)?;
                    }
                    return Err(ErrorNum::Command(byte).into());
                }
            };

            debug!("dispatching {cmd:?}");
            if helper_wait && cmd != Command::Con {
                link.write_u8(status::READY)?;
            }

            match cmd {
                Command::Call => read_cmd_call(link, lua),
                Command::Get => read_cmd_get(link, lua),
                Command::NewIndex => read_cmd_newindex(link, lua),
                Command::Con => negotiate::server_negotiate(link),
            }
        })
    }
}

fn read_cmd_call(link: &mut Link, lua: &Lua) -> Result<()> {
    let name = path::read_path(link)?;
    let target = path::resolve(lua, &name);
    let nargs = link.read_u32()?;

    let args = match codec::read_values(link, lua, nargs as usize) {
        Ok(args) => args,
        Err(RpcError {
            errnum: ErrorNum::Lua(e),
            ..
        }) => return write_lua_error(link, &e),
        Err(e) => return Err(e),
    };

    let function = match target {
        Ok(Value::Function(f)) => f,
        _ => {
            debug!("undefined function '{name}'");
            let message = format!("undefined function: {name}");
            return link
                .staged(|link| codec::write_error(link, lua_status::ERRRUN, message.as_bytes()));
        }
    };

    let values = match function.call::<MultiValue>(MultiValue::from_vec(args)) {
        Ok(values) => values,
        Err(e) => return write_lua_error(link, &e),
    };

    let sent = link.staged(|link| {
        link.write_u8(status::OK)?;
        link.write_u32(values.len() as u32)?;
        for value in values.iter() {
            codec::write_variable(link, value)?;
        }
        Ok(())
    });
    match sent {
        Err(RpcError {
            errnum: ErrorNum::UnsupportedType(what),
            ..
        }) => {
            warn!("'{name}' returned a value that cannot be sent: {what}");
            let message = format!("{what} transmission unsupported");
            link.staged(|link| codec::write_error(link, lua_status::ERRRUN, message.as_bytes()))
        }
        sent => sent,
    }
}

fn read_cmd_get(link: &mut Link, lua: &Lua) -> Result<()> {
    let name = path::read_path(link)?;
    let value = path::resolve(lua, &name).unwrap_or_else(|e| {
        debug!("cannot resolve '{name}': {e}");
        Value::Nil
    });

    match link.staged(|link| codec::write_variable(link, &value)) {
        Err(RpcError {
            errnum: ErrorNum::UnsupportedType(what),
            ..
        }) => {
            warn!("'{name}' cannot be sent: {what}");
            link.staged(|link| codec::write_variable(link, &Value::Nil))
        }
        sent => sent,
    }
}

fn read_cmd_newindex(link: &mut Link, lua: &Lua) -> Result<()> {
    let name = path::read_path(link)?;

    let assigned = match codec::read_values(link, lua, 2) {
        Ok(entry) => assign(lua, &name, entry),
        Err(RpcError {
            errnum: ErrorNum::Lua(e),
            ..
        }) => Err(e),
        Err(e) => return Err(e),
    };

    match assigned {
        Ok(()) => link.staged(|link| link.write_u8(status::OK)),
        Err(e) => write_lua_error(link, &e),
    }
}

/// Perform a NEWINDEX. An empty path assigns a global. A path ending in the
/// key names the assigned field itself (`t.k` with key `k`), so the
/// assignment goes into the path's parent; any other path names the table
/// to assign into.
fn assign(lua: &Lua, name: &str, entry: Vec<Value>) -> mlua::Result<()> {
    let mut entry = entry.into_iter();
    let key = entry.next().unwrap_or(Value::Nil);
    let value = entry.next().unwrap_or(Value::Nil);

    let target = match &key {
        Value::String(k) => parent_of(name, &k.to_string_lossy()),
        _ => Some(name),
    };
    let table = match target {
        None | Some("") => lua.globals(),
        Some(target) => match path::resolve(lua, target)? {
            Value::Table(t) => t,
            other => {
                return Err(mlua::Error::runtime(format!(
                    "attempt to index a {} value ({target})",
                    other.type_name()
                )));
            }
        },
    };
    table.set(key, value)
}

/// Table path holding `key` when `name` ends in it; `None` for a global.
fn parent_of<'a>(name: &'a str, key: &str) -> Option<&'a str> {
    if name == key {
        return None;
    }
    match name.strip_suffix(key) {
        Some(parent) if parent.ends_with('.') => Some(&parent[..parent.len() - 1]),
        _ => Some(name),
    }
}

fn write_lua_error(link: &mut Link, err: &mlua::Error) -> Result<()> {
    let code = lua_error_code(err);
    let message = lua_error_message(err);
    debug!("lua error {code}: {message}");
    link.staged(|link| codec::write_error(link, code, message.as_bytes()))
}

fn lua_error_code(err: &mlua::Error) -> u32 {
    match err {
        mlua::Error::SyntaxError { .. } => lua_status::ERRSYNTAX,
        mlua::Error::MemoryError(_) => lua_status::ERRMEM,
        mlua::Error::CallbackError { cause, .. } => lua_error_code(cause),
        _ => lua_status::ERRRUN,
    }
}

fn lua_error_message(err: &mlua::Error) -> String {
    match err {
        mlua::Error::RuntimeError(message) => message
            .split_once("\nstack traceback:")
            .map_or(message.as_str(), |(message, _)| message)
            .to_string(),
        mlua::Error::CallbackError { cause, .. } => lua_error_message(cause),
        other => other.to_string(),
    }
}

impl UserData for ServerHandle {
    fn add_methods<M: UserDataMethods<Self>>(methods: &mut M) {
        methods.add_meta_method(mlua::MetaMethod::ToString, |_, this, ()| {
            let state = match (this.is_listening(), this.is_connected()) {
                (_, true) => "connected",
                (true, false) => "listening",
                (false, false) => "closed",
            };
            Ok(format!("rpc.server_handle ({state})"))
        });
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        config::NumberFormat,
        protocol::tag,
        transport::memory::{MemoryListener, MemoryTransport},
    };

    use super::*;

    const HANDSHAKE: [u8; 8] = [0x4c, 0x52, 0x50, 0x43, 0x03, 0x01, 0x08, 0x00];

    fn config() -> RpcConfig {
        RpcConfig {
            local: NumberFormat {
                little: true,
                lnum_bytes: 8,
                intnum: false,
            },
            ..RpcConfig::default()
        }
    }

    fn con() -> Vec<u8> {
        let mut frame = vec![Command::Con as u8];
        frame.extend_from_slice(&HANDSHAKE);
        frame
    }

    fn number(n: f64) -> Vec<u8> {
        let mut bytes = vec![tag::NUMBER];
        bytes.extend_from_slice(&n.to_le_bytes());
        bytes
    }

    fn frame(cmd: Command, path: &str) -> Vec<u8> {
        let mut bytes = vec![cmd as u8];
        bytes.extend_from_slice(&(path.len() as u32).to_le_bytes());
        bytes.extend_from_slice(path.as_bytes());
        bytes
    }

    /// A server with one accepted and negotiated connection.
    fn connected(config: RpcConfig) -> (Lua, MemoryTransport, ServerHandle) {
        let tpt = MemoryTransport::with_input(&con());
        let mut server = ServerHandle::new(Box::new(MemoryListener::new([tpt.clone()])), config);
        let lua = Lua::new();

        server.dispatch(&lua).unwrap();
        assert_eq!(tpt.take_output(), HANDSHAKE.to_vec());
        assert!(server.is_connected());

        (lua, tpt, server)
    }

    #[test]
    fn handshake() {
        let (_lua, _tpt, server) = connected(config());
        let link = server.atpt.as_ref().unwrap();
        assert_eq!(
            link.net(),
            NumberFormat {
                little: true,
                lnum_bytes: 8,
                intnum: false,
            }
        );
    }

    #[test]
    fn first_command_must_be_con() {
        let tpt = MemoryTransport::with_input(&frame(Command::Get, "x"));
        let mut server = ServerHandle::new(
            Box::new(MemoryListener::new([tpt.clone(), MemoryTransport::new()])),
            config(),
        );

        let err = server.dispatch(&Lua::new()).unwrap_err();
        assert!(matches!(err.errnum, ErrorNum::Command(2)));
        assert!(!server.is_connected());
        assert!(server.is_listening());
    }

    #[test]
    fn call_echo() {
        let (lua, tpt, mut server) = connected(config());
        lua.load("function echo(...) return ... end").exec().unwrap();

        let mut request = frame(Command::Call, "echo");
        request.extend_from_slice(&[2, 0, 0, 0]);
        request.extend(number(42.0));
        request.extend_from_slice(&[tag::STRING, 2, 0, 0, 0, b'h', b'i']);
        tpt.feed(&request);

        server.dispatch(&lua).unwrap();

        let mut expected = vec![status::OK, 2, 0, 0, 0];
        expected.extend(number(42.0));
        expected.extend_from_slice(&[tag::STRING, 2, 0, 0, 0, b'h', b'i']);
        assert_eq!(tpt.take_output(), expected);
        assert_eq!(tpt.modes().last(), Some(&crate::transport::Mode::Stop));
    }

    #[test]
    fn call_reports_errors() {
        let (lua, tpt, mut server) = connected(config());
        lua.load("function boom() error('boom', 0) end").exec().unwrap();

        let mut request = frame(Command::Call, "nope");
        request.extend_from_slice(&[0, 0, 0, 0]);
        tpt.feed(&request);
        server.dispatch(&lua).unwrap();

        let message = b"undefined function: nope";
        let mut expected = vec![status::ERR, 2, 0, 0, 0, message.len() as u8, 0, 0, 0];
        expected.extend_from_slice(message);
        assert_eq!(tpt.take_output(), expected);

        let mut request = frame(Command::Call, "boom");
        request.extend_from_slice(&[0, 0, 0, 0]);
        tpt.feed(&request);
        server.dispatch(&lua).unwrap();

        let mut expected = vec![status::ERR, 2, 0, 0, 0, 4, 0, 0, 0];
        expected.extend_from_slice(b"boom");
        assert_eq!(tpt.take_output(), expected);
        assert_eq!(server.link_errs(), 0);
    }

    #[test]
    fn nil_table_key_becomes_error_status() {
        let (lua, tpt, mut server) = connected(config());
        lua.load("function f() called = true end").exec().unwrap();

        let mut request = frame(Command::Call, "f");
        request.extend_from_slice(&[1, 0, 0, 0, tag::TABLE, tag::NIL]);
        request.extend_from_slice(&[tag::BOOLEAN, 1, tag::TABLE_END]);
        tpt.feed(&request);
        server.dispatch(&lua).unwrap();

        let output = tpt.take_output();
        assert_eq!(output[0], status::ERR);
        assert!(String::from_utf8_lossy(&output).contains("table index is nil"));
        assert!(lua.globals().get::<Value>("called").unwrap().is_nil());
        assert!(server.is_connected());
        assert_eq!(tpt.remaining(), 0);
    }

    #[test]
    fn bytecode_needs_allow_bytecode() {
        let bytecode = Lua::new()
            .load("return function() pwned = true end")
            .eval::<mlua::Function>()
            .unwrap()
            .dump(false);
        let mut request = frame(Command::Call, "run");
        request.extend_from_slice(&[1, 0, 0, 0, tag::FUNCTION, tag::STRING]);
        request.extend_from_slice(&(bytecode.len() as u32).to_le_bytes());
        request.extend_from_slice(&bytecode);
        request.push(tag::FUNCTION_END);

        let (lua, tpt, mut server) = connected(config());
        lua.load("function run(g) g() end").exec().unwrap();
        tpt.feed(&request);
        server.dispatch(&lua).unwrap();
        let output = tpt.take_output();
        assert_eq!(output[0], status::ERR);
        assert!(String::from_utf8_lossy(&output).contains("bytecode is not accepted"));
        assert!(lua.globals().get::<Value>("pwned").unwrap().is_nil());

        let config = RpcConfig {
            allow_bytecode: true,
            ..config()
        };
        let (lua, tpt, mut server) = connected(config);
        lua.load("function run(g) g() end").exec().unwrap();
        tpt.feed(&request);
        server.dispatch(&lua).unwrap();
        assert_eq!(tpt.take_output(), vec![status::OK, 0, 0, 0, 0]);
        assert!(lua.globals().get::<bool>("pwned").unwrap());
    }

    #[test]
    fn unsendable_result_becomes_error_status() {
        let (lua, tpt, mut server) = connected(config());
        lua.load("function co() return coroutine.create(print) end")
            .exec()
            .unwrap();

        let mut request = frame(Command::Call, "co");
        request.extend_from_slice(&[0, 0, 0, 0]);
        tpt.feed(&request);
        server.dispatch(&lua).unwrap();

        let output = tpt.take_output();
        assert_eq!(output[0], status::ERR);
        assert!(output.ends_with(b"thread transmission unsupported"));
    }

    #[test]
    fn get_nested() {
        let (lua, tpt, mut server) = connected(config());
        lua.load("t = { k = 7 }").exec().unwrap();

        tpt.feed(&frame(Command::Get, "t.k"));
        server.dispatch(&lua).unwrap();
        assert_eq!(tpt.take_output(), number(7.0));

        tpt.feed(&frame(Command::Get, "t.k.deeper"));
        server.dispatch(&lua).unwrap();
        assert_eq!(tpt.take_output(), vec![tag::NIL]);
    }

    #[test]
    fn newindex_assigns() {
        let (lua, tpt, mut server) = connected(config());
        lua.load("t = {}").exec().unwrap();

        let mut request = frame(Command::NewIndex, "t");
        request.extend_from_slice(&[tag::STRING, 1, 0, 0, 0, b'k', tag::BOOLEAN, 1]);
        tpt.feed(&request);
        server.dispatch(&lua).unwrap();
        assert_eq!(tpt.take_output(), vec![status::OK]);
        assert!(lua.load("return t.k").eval::<bool>().unwrap());

        let mut request = frame(Command::NewIndex, "");
        request.extend_from_slice(&[tag::STRING, 1, 0, 0, 0, b'x']);
        request.extend(number(5.0));
        tpt.feed(&request);
        server.dispatch(&lua).unwrap();
        assert_eq!(tpt.take_output(), vec![status::OK]);
        assert_eq!(lua.globals().get::<f64>("x").unwrap(), 5.0);
    }

    #[test]
    fn newindex_accepts_path_ending_in_key() {
        let (lua, tpt, mut server) = connected(config());
        lua.load("t = { k = {} }").exec().unwrap();

        // handle.x = 5 sent with the key as its path.
        let mut request = frame(Command::NewIndex, "x");
        request.extend_from_slice(&[tag::STRING, 1, 0, 0, 0, b'x']);
        request.extend(number(5.0));
        tpt.feed(&request);
        server.dispatch(&lua).unwrap();
        assert_eq!(tpt.take_output(), vec![status::OK]);
        assert_eq!(lua.globals().get::<f64>("x").unwrap(), 5.0);

        // handle.t.k = true
        tpt.feed(&[
            0x04, 0x03, 0x00, 0x00, 0x00, 0x74, 0x2e, 0x6b, 0x03, 0x01, 0x00, 0x00, 0x00, 0x6b,
            0x02, 0x01,
        ]);
        server.dispatch(&lua).unwrap();
        assert_eq!(tpt.take_output(), vec![status::OK]);
        assert!(lua.load("return t.k").eval::<bool>().unwrap());
        assert_eq!(tpt.remaining(), 0);
    }

    #[test]
    fn parent_of_path() {
        assert_eq!(parent_of("x", "x"), None);
        assert_eq!(parent_of("t.k", "k"), Some("t"));
        assert_eq!(parent_of("a.b.k", "k"), Some("a.b"));
        assert_eq!(parent_of("t", "k"), Some("t"));
        assert_eq!(parent_of("tk", "k"), Some("tk"));
        assert_eq!(parent_of("", "k"), Some(""));
    }

    #[test]
    fn newindex_on_non_table_reports_error() {
        let (lua, tpt, mut server) = connected(config());
        lua.load("n = 1").exec().unwrap();

        let mut request = frame(Command::NewIndex, "n");
        request.extend_from_slice(&[tag::STRING, 1, 0, 0, 0, b'k', tag::NIL]);
        tpt.feed(&request);
        server.dispatch(&lua).unwrap();

        let output = tpt.take_output();
        assert_eq!(output[0], status::ERR);
        assert_eq!(tpt.remaining(), 0);
    }

    #[test]
    fn unknown_command_with_helper_wait() {
        let config = RpcConfig {
            helper_wait: true,
            ..config()
        };
        let (lua, tpt, mut server) = connected(config);

        tpt.feed(&[5]);
        let err = server.dispatch(&lua).unwrap_err();
        assert!(matches!(err.errnum, ErrorNum::Command(5)));
        assert_eq!(tpt.take_output(), vec![status::UNSUPPORTED_CMD]);
        assert_eq!(server.link_errs(), 1);

        lua.load("v = 1").exec().unwrap();
        tpt.feed(&frame(Command::Get, "v"));
        server.dispatch(&lua).unwrap();
        let mut expected = vec![status::READY];
        expected.extend(number(1.0));
        assert_eq!(tpt.take_output(), expected);
        assert_eq!(server.link_errs(), 0);
    }

    #[test]
    fn header_mismatch_drops_connection() {
        let mut request = vec![Command::Con as u8];
        request.extend_from_slice(&[0x4c, 0x52, 0x50, 0x43, 0x02, 0x01, 0x08, 0x00]);
        let tpt = MemoryTransport::with_input(&request);
        let mut server = ServerHandle::new(
            Box::new(MemoryListener::new([tpt.clone(), MemoryTransport::new()])),
            config(),
        );

        let err = server.dispatch(&Lua::new()).unwrap_err();
        assert!(matches!(err.errnum, ErrorNum::Header));
        assert!(!err.is_fatal());
        assert!(!server.is_connected());
        assert!(server.is_listening());
        assert!(tpt.take_output().is_empty());
    }

    #[test]
    fn repeated_errors_escalate() {
        let (lua, tpt, mut server) = connected(config());
        tpt.feed(&[9, 9, 9]);

        for expected in 1..=MAX_LINK_ERRS {
            server.dispatch(&lua).unwrap_err();
            assert_eq!(server.link_errs(), expected);
            assert!(server.is_connected());
        }

        let err = server.dispatch(&lua).unwrap_err();
        assert!(err.is_fatal());
        assert!(!server.is_connected());
        assert!(server.is_listening());
        assert_eq!(server.link_errs(), 0);
    }

    #[test]
    fn unknown_tag_shuts_down() {
        let (lua, tpt, mut server) = connected(config());
        lua.load("function f() end").exec().unwrap();

        let mut request = frame(Command::Call, "f");
        request.extend_from_slice(&[1, 0, 0, 0, 0x2a]);
        tpt.feed(&request);

        let err = server.dispatch(&lua).unwrap_err();
        assert!(err.is_fatal());
        assert!(!server.is_connected());
        assert!(!server.is_listening());
    }

    #[test]
    fn hang_up_closes_immediately() {
        let (lua, _tpt, mut server) = connected(config());

        let err = server.dispatch(&lua).unwrap_err();
        assert!(matches!(err.errnum, ErrorNum::Eof));
        assert!(!server.is_connected());
        assert_eq!(server.link_errs(), 0);
    }

    #[test]
    fn peek_reports_pending_work() {
        let tpt = MemoryTransport::with_input(&con());
        let mut server =
            ServerHandle::new(Box::new(MemoryListener::new([tpt.clone()])), config());
        let lua = Lua::new();

        assert!(server.peek().unwrap());
        server.dispatch(&lua).unwrap();
        assert!(!server.peek().unwrap());

        tpt.feed(&frame(Command::Get, "x"));
        assert!(server.peek().unwrap());

        server.shutdown();
        assert!(!server.peek().unwrap());
    }

    #[test]
    fn serve_until_listener_closes() {
        let lua = Lua::new();
        lua.load("function inc(n) return n + 1 end").exec().unwrap();

        let mut requests = con();
        requests.extend(frame(Command::Call, "inc"));
        requests.extend_from_slice(&[1, 0, 0, 0]);
        requests.extend(number(1.0));
        let first = MemoryTransport::with_input(&requests);
        let second = MemoryTransport::with_input(&con());

        let mut server = ServerHandle::new(
            Box::new(MemoryListener::new([first.clone(), second.clone()])),
            config(),
        );
        server.serve(&lua).unwrap();

        let mut expected = HANDSHAKE.to_vec();
        expected.extend_from_slice(&[status::OK, 1, 0, 0, 0]);
        expected.extend(number(2.0));
        assert_eq!(first.take_output(), expected);
        assert_eq!(second.take_output(), HANDSHAKE.to_vec());
        assert!(!server.is_listening());
    }
}
