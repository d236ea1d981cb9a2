//! Client side proxies.
//!
//! A [`Handle`] owns the link to one server. Indexing it yields a
//! [`Helper`], a proxy for a path in the remote global namespace; indexing
//! a helper extends the path without touching the network. Calling a helper
//! performs a remote CALL, assigning through it a NEWINDEX, and calling a
//! leaf named `get` fetches the value of its parent with a GET:
//!
//! ```lua
//! local remote = rpc.connect("127.0.0.1:9000")
//! remote.print("hello")          -- CALL print
//! remote.config.depth = 3        -- NEWINDEX config, depth
//! local d = remote.config.depth.get()  -- GET config.depth
//! ```
//!
//! Failures are routed to the handle's error hook, then to the global one
//! installed with `rpc.on_error`; with no hook they are raised as Lua
//! errors. A fatal error closes the handle's link before it is reported.
use std::{cell::RefCell, fmt, rc::Rc};

use log::{debug, warn};
use mlua::{
    Function, Lua, MetaMethod, MultiValue, RegistryKey, UserData, UserDataMethods, Value,
};

use crate::{
    config::RpcConfig,
    error::{ErrorNum, Result, RpcError},
    protocol::{Command, codec, link::Link, negotiate, path, status},
    transport::{Transport, TransportAddr},
};

/// Registry slot of the global error hook.
pub const ERROR_HOOK: &str = "lrpc.on_error";

struct ClientLink {
    link: RefCell<Link>,
    error_handler: RefCell<Option<RegistryKey>>,
    helper_wait: bool,
}

/// Connection to one server.
#[derive(Clone)]
pub struct Handle {
    inner: Rc<ClientLink>,
}

impl Handle {
    pub fn connect(addr: &TransportAddr, config: &RpcConfig) -> Result<Self> {
        let tpt = addr.connect(config)?;
        Self::from_transport(tpt, config)
    }

    /// Send CON over an open transport and negotiate the session.
    pub fn from_transport(tpt: Box<dyn Transport>, config: &RpcConfig) -> Result<Self> {
        let mut link = Link::new(tpt, config.local);
        link.set_allow_bytecode(config.allow_bytecode);
        let handle = Self {
            inner: Rc::new(ClientLink {
                link: RefCell::new(link),
                error_handler: RefCell::new(None),
                helper_wait: config.helper_wait,
            }),
        };
        handle.renegotiate()?;
        Ok(handle)
    }

    pub fn renegotiate(&self) -> Result<()> {
        let mut link = self.link()?;
        link.exchange(|link| {
            link.write_u8(Command::Con as u8)?;
            negotiate::client_negotiate(link)
        })
    }

    pub fn is_open(&self) -> bool {
        self.inner
            .link
            .try_borrow()
            .map(|link| link.is_open())
            .unwrap_or(true)
    }

    pub fn close(&self) {
        if let Ok(mut link) = self.inner.link.try_borrow_mut() {
            debug!("closing client link");
            link.close();
        }
    }

    /// Proxy for the global `name`.
    pub fn index(&self, name: &str) -> Result<Helper> {
        path::validate_segment(name)?;
        Ok(Helper {
            node: Rc::new(Node {
                handle: self.clone(),
                parent: None,
                nparents: 0,
                name: name.to_string(),
            }),
        })
    }

    /// `handle.key = value`: NEWINDEX with an empty path.
    pub fn set(&self, lua: &Lua, key: &str, value: &Value) -> Result<()> {
        path::validate_segment(key)?;
        self.new_index(lua, &[], key, value)
    }

    pub fn set_error_handler(&self, lua: &Lua, handler: Option<Function>) -> mlua::Result<()> {
        let key = handler.map(|f| lua.create_registry_value(f)).transpose()?;
        if let Some(old) = self.inner.error_handler.replace(key) {
            lua.remove_registry_value(old)?;
        }
        Ok(())
    }

    /// Hand `err` to the installed hook, or raise it.
    pub fn report(&self, lua: &Lua, err: RpcError) -> mlua::Result<()> {
        if err.is_fatal() {
            warn!("fatal error on client link: {err}");
            self.close();
        }

        let hook = match &*self.inner.error_handler.borrow() {
            Some(key) => Some(lua.registry_value::<Function>(key)?),
            None => None,
        };
        match hook {
            Some(hook) => hook.call::<()>(err.to_string()),
            None => report(lua, err),
        }
    }

    fn link(&self) -> Result<std::cell::RefMut<'_, Link>> {
        self.inner
            .link
            .try_borrow_mut()
            .map_err(|_| ErrorNum::Protocol("link is already in use".to_string()).into())
    }

    /// One request/response exchange. `body` writes everything after the
    /// command byte and is sent as a single frame; `reply` reads the answer.
    /// A body that fails to build sends nothing, not even the command.
    fn request<T>(
        &self,
        cmd: Command,
        body: impl FnOnce(&mut Link) -> Result<()>,
        reply: impl FnOnce(&mut Link) -> Result<T>,
    ) -> Result<T> {
        let helper_wait = self.inner.helper_wait;
        let mut link = self.link()?;
        link.exchange(|link| {
            if helper_wait {
                let frame = link.buffered(body)?;
                link.write_u8(cmd as u8)?;
                match link.read_u8()? {
                    status::READY => {}
                    other => {
                        return Err(
                            ErrorNum::Protocol(format!("expected READY, got {other}")).into()
                        );
                    }
                }
                link.write_frame(&frame)?;
            } else {
                link.staged(|link| {
                    link.write_u8(cmd as u8)?;
                    body(link)
                })?;
            }
            reply(link)
        })
    }

    fn new_index(&self, lua: &Lua, segments: &[&str], key: &str, value: &Value) -> Result<()> {
        let key = Value::String(lua.create_string(key)?);
        self.request(
            Command::NewIndex,
            |link| {
                path::write_path(link, segments)?;
                codec::write_variable(link, &key)?;
                codec::write_variable(link, value)
            },
            |link| match link.read_u8()? {
                status::OK => Ok(()),
                status::ERR => Err(codec::read_error(link)?),
                other => Err(ErrorNum::Protocol(format!("unexpected status {other}")).into()),
            },
        )
    }
}

/// Raise `err`, or pass it to the global hook if one is installed.
pub fn report(lua: &Lua, err: RpcError) -> mlua::Result<()> {
    match lua.named_registry_value::<Option<Function>>(ERROR_HOOK)? {
        Some(hook) => hook.call::<()>(err.to_string()),
        None => Err(err.into()),
    }
}

impl UserData for Handle {
    fn add_methods<M: UserDataMethods<Self>>(methods: &mut M) {
        methods.add_meta_method(MetaMethod::Index, |_, this, name: String| {
            Ok(this.index(&name)?)
        });

        methods.add_meta_method(
            MetaMethod::NewIndex,
            |lua, this, (key, value): (String, Value)| {
                path::validate_segment(&key)?;
                if let Err(e) = this.set(lua, &key, &value) {
                    this.report(lua, e)?;
                }
                Ok(())
            },
        );

        methods.add_meta_method(MetaMethod::ToString, |_, this, ()| {
            let state = if this.is_open() { "open" } else { "closed" };
            Ok(format!("rpc.handle ({state})"))
        });
    }
}

struct Node {
    handle: Handle,
    parent: Option<Helper>,
    nparents: usize,
    name: String,
}

/// Proxy for a path on the server. Children keep their parents alive.
#[derive(Clone)]
pub struct Helper {
    node: Rc<Node>,
}

impl Helper {
    pub fn index(&self, name: &str) -> Result<Helper> {
        path::validate_segment(name)?;
        Ok(Helper {
            node: Rc::new(Node {
                handle: self.node.handle.clone(),
                parent: Some(self.clone()),
                nparents: self.node.nparents + 1,
                name: name.to_string(),
            }),
        })
    }

    pub fn handle(&self) -> &Handle {
        &self.node.handle
    }

    pub fn name(&self) -> &str {
        &self.node.name
    }

    pub fn parent(&self) -> Option<&Helper> {
        self.node.parent.as_ref()
    }

    /// Segments from the root down to this helper.
    pub fn segments(&self) -> Vec<&str> {
        let mut segments = Vec::with_capacity(self.node.nparents + 1);
        let mut current = Some(self);
        while let Some(helper) = current {
            segments.push(helper.node.name.as_str());
            current = helper.node.parent.as_ref();
        }
        segments.reverse();
        segments
    }

    pub fn path(&self) -> String {
        self.segments().join(".")
    }

    pub fn write_path(&self, link: &mut Link) -> Result<()> {
        path::write_path(link, &self.segments())
    }

    /// Remote CALL of this path.
    pub fn call(&self, lua: &Lua, args: MultiValue) -> Result<MultiValue> {
        let nargs = u32::try_from(args.len())
            .map_err(|_| ErrorNum::Protocol(format!("{} arguments", args.len())))?;

        self.node.handle.request(
            Command::Call,
            |link| {
                self.write_path(link)?;
                link.write_u32(nargs)?;
                for arg in args.iter() {
                    codec::write_variable(link, arg)?;
                }
                Ok(())
            },
            |link| match link.read_u8()? {
                status::OK => {
                    let nret = link.read_u32()?;
                    let values = codec::read_values(link, lua, nret as usize)?;
                    Ok(MultiValue::from_vec(values))
                }
                status::ERR => Err(codec::read_error(link)?),
                other => Err(ErrorNum::Protocol(format!("unexpected status {other}")).into()),
            },
        )
    }

    /// Remote GET of this path.
    pub fn get(&self, lua: &Lua) -> Result<Value> {
        self.node.handle.request(
            Command::Get,
            |link| self.write_path(link),
            |link| codec::read_value(link, lua),
        )
    }

    /// `helper.key = value`: NEWINDEX of the path ending in `key`.
    pub fn set(&self, lua: &Lua, key: &str, value: &Value) -> Result<()> {
        path::validate_segment(key)?;
        let mut segments = self.segments();
        segments.push(key);
        self.node.handle.new_index(lua, &segments, key, value)
    }

    fn invoke(&self, lua: &Lua, args: MultiValue) -> Result<MultiValue> {
        match (self.name(), self.parent()) {
            ("get", Some(parent)) => Ok(MultiValue::from_vec(vec![parent.get(lua)?])),
            _ => self.call(lua, args),
        }
    }
}

impl fmt::Debug for Helper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Helper").field(&self.path()).finish()
    }
}

impl UserData for Helper {
    fn add_methods<M: UserDataMethods<Self>>(methods: &mut M) {
        methods.add_meta_method(MetaMethod::Index, |_, this, name: String| {
            Ok(this.index(&name)?)
        });

        methods.add_meta_method(
            MetaMethod::NewIndex,
            |lua, this, (key, value): (String, Value)| {
                path::validate_segment(&key)?;
                if let Err(e) = this.set(lua, &key, &value) {
                    this.handle().report(lua, e)?;
                }
                Ok(())
            },
        );

        methods.add_meta_method(MetaMethod::Call, |lua, this, args: MultiValue| {
            match this.invoke(lua, args) {
                Ok(values) => Ok(values),
                Err(e) => {
                    this.handle().report(lua, e)?;
                    Ok(MultiValue::new())
                }
            }
        });

        methods.add_meta_method(MetaMethod::ToString, |_, this, ()| {
            Ok(format!("rpc.helper ({})", this.path()))
        });
    }
}

#[cfg(test)]
mod tests {
    use crate::{config::NumberFormat, protocol::tag, transport::memory::MemoryTransport};

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

    fn connected(config: &RpcConfig) -> (Lua, MemoryTransport, Handle) {
        let tpt = MemoryTransport::with_input(&HANDSHAKE);
        let handle = Handle::from_transport(Box::new(tpt.clone()), config).unwrap();

        let mut expected = vec![Command::Con as u8];
        expected.extend_from_slice(&HANDSHAKE);
        assert_eq!(tpt.take_output(), expected);

        (Lua::new(), tpt, handle)
    }

    fn number(n: f64) -> Vec<u8> {
        let mut bytes = vec![tag::NUMBER];
        bytes.extend_from_slice(&n.to_le_bytes());
        bytes
    }

    #[test]
    fn call_echo() {
        let (lua, tpt, handle) = connected(&config());

        let mut response = vec![status::OK, 2, 0, 0, 0];
        response.extend(number(42.0));
        response.extend_from_slice(&[tag::STRING, 2, 0, 0, 0, b'h', b'i']);
        tpt.feed(&response);

        let args = MultiValue::from_vec(vec![
            Value::Integer(42),
            Value::String(lua.create_string("hi").unwrap()),
        ]);
        let out = handle.index("echo").unwrap().call(&lua, args).unwrap();

        let mut expected = vec![Command::Call as u8, 4, 0, 0, 0];
        expected.extend_from_slice(b"echo");
        expected.extend_from_slice(&[2, 0, 0, 0]);
        expected.extend(number(42.0));
        expected.extend_from_slice(&[tag::STRING, 2, 0, 0, 0, b'h', b'i']);
        assert_eq!(tpt.take_output(), expected);

        let out: Vec<Value> = out.iter().cloned().collect();
        assert_eq!(out[0], Value::Number(42.0));
        assert_eq!(out[1].as_string().unwrap().to_string_lossy(), "hi");
    }

    #[test]
    fn get_intercepts_leaf() {
        let (lua, tpt, handle) = connected(&config());
        lua.globals().set("remote", handle).unwrap();

        tpt.feed(&number(7.0));
        let k: f64 = lua.load("return remote.t.k.get()").eval().unwrap();
        assert_eq!(k, 7.0);

        let mut expected = vec![Command::Get as u8, 3, 0, 0, 0];
        expected.extend_from_slice(b"t.k");
        assert_eq!(tpt.take_output(), expected);
    }

    #[test]
    fn get_without_parent_is_a_call() {
        let (lua, tpt, handle) = connected(&config());
        lua.globals().set("remote", handle).unwrap();

        tpt.feed(&[status::OK, 0, 0, 0, 0]);
        lua.load("remote.get()").exec().unwrap();

        let mut expected = vec![Command::Call as u8, 3, 0, 0, 0];
        expected.extend_from_slice(b"get");
        expected.extend_from_slice(&[0, 0, 0, 0]);
        assert_eq!(tpt.take_output(), expected);
    }

    #[test]
    fn newindex_sends_full_path_and_key() {
        let (lua, tpt, handle) = connected(&config());
        lua.globals().set("remote", handle).unwrap();

        tpt.feed(&[status::OK]);
        lua.load("remote.t.k = true").exec().unwrap();
        assert_eq!(
            tpt.take_output(),
            vec![
                0x04, 0x03, 0x00, 0x00, 0x00, 0x74, 0x2e, 0x6b, 0x03, 0x01, 0x00, 0x00, 0x00, 0x6b,
                0x02, 0x01,
            ]
        );

        tpt.feed(&[status::OK]);
        lua.load("remote.x = 5").exec().unwrap();

        let mut expected = vec![Command::NewIndex as u8, 0, 0, 0, 0];
        expected.extend_from_slice(&[tag::STRING, 1, 0, 0, 0, b'x']);
        expected.extend(number(5.0));
        assert_eq!(tpt.take_output(), expected);
    }

    #[test]
    fn path_composition() {
        let (lua, tpt, handle) = connected(&config());

        let c = handle
            .index("a")
            .and_then(|a| a.index("b"))
            .and_then(|b| b.index("c"))
            .unwrap();
        assert_eq!(c.path(), "a.b.c");
        assert_eq!(c.segments(), vec!["a", "b", "c"]);

        tpt.feed(&[tag::NIL]);
        assert!(c.get(&lua).unwrap().is_nil());
        assert_eq!(tpt.take_output(), b"\x02\x05\0\0\0a.b.c".to_vec());
    }

    #[test]
    fn helper_argument_is_sent_as_remote() {
        let (lua, tpt, handle) = connected(&config());
        lua.globals().set("remote", handle).unwrap();

        tpt.feed(&[status::OK, 0, 0, 0, 0]);
        lua.load("remote.f(remote.x.y)").exec().unwrap();

        let mut expected = vec![Command::Call as u8, 1, 0, 0, 0, b'f', 1, 0, 0, 0];
        expected.extend_from_slice(&[tag::REMOTE, 3, 0, 0, 0]);
        expected.extend_from_slice(b"x.y");
        assert_eq!(tpt.take_output(), expected);
    }

    #[test]
    fn long_segment_is_rejected_locally() {
        let (_lua, tpt, handle) = connected(&config());

        let err = handle.index(&"n".repeat(40)).unwrap_err();
        assert!(matches!(err.errnum, ErrorNum::LongFname));
        assert!(tpt.take_output().is_empty());
    }

    #[test]
    fn remote_error_goes_to_hook() {
        let (lua, tpt, handle) = connected(&config());
        lua.globals().set("remote", handle).unwrap();

        let hook = lua
            .load("return function(msg) last_error = msg end")
            .eval::<Function>()
            .unwrap();
        lua.set_named_registry_value(ERROR_HOOK, hook).unwrap();

        let mut response = vec![status::ERR, 2, 0, 0, 0, 4, 0, 0, 0];
        response.extend_from_slice(b"boom");
        tpt.feed(&response);

        let n: i64 = lua.load("return select('#', remote.fail())").eval().unwrap();
        assert_eq!(n, 0);
        let msg: String = lua.globals().get("last_error").unwrap();
        assert_eq!(msg, "boom");
    }

    #[test]
    fn handle_hook_wins_and_fatal_closes() {
        let (lua, tpt, handle) = connected(&config());
        lua.globals().set("remote", handle.clone()).unwrap();

        let global = lua
            .load("return function(msg) global_error = msg end")
            .eval::<Function>()
            .unwrap();
        lua.set_named_registry_value(ERROR_HOOK, global).unwrap();
        let local = lua
            .load("return function(msg) handle_error = msg end")
            .eval::<Function>()
            .unwrap();
        handle.set_error_handler(&lua, Some(local)).unwrap();

        tpt.feed(&[0x2a]);
        lua.load("remote.x.get()").exec().unwrap();

        let msg: String = lua.globals().get("handle_error").unwrap();
        assert_eq!(msg, "unknown value tag 42");
        assert!(lua.globals().get::<Value>("global_error").unwrap().is_nil());
        assert!(!handle.is_open());
    }

    #[test]
    fn unhandled_error_is_raised() {
        let (lua, tpt, handle) = connected(&config());
        lua.globals().set("remote", handle.clone()).unwrap();

        let mut response = vec![status::ERR, 2, 0, 0, 0, 3, 0, 0, 0];
        response.extend_from_slice(b"bad");
        tpt.feed(&response);

        let err = lua.load("remote.fail()").exec().unwrap_err();
        assert!(err.to_string().contains("bad"));
        assert!(handle.is_open());
    }

    #[test]
    fn closed_handle_refuses_requests() {
        let (lua, _tpt, handle) = connected(&config());
        handle.close();

        let err = handle.index("x").unwrap().get(&lua).unwrap_err();
        assert!(matches!(err.errnum, ErrorNum::Closed));
    }

    #[test]
    fn helper_wait_expects_ready() {
        let config = RpcConfig {
            helper_wait: true,
            ..config()
        };
        let (lua, tpt, handle) = connected(&config);
        let x = handle.index("x").unwrap();

        let mut response = vec![status::READY];
        response.extend(number(1.0));
        tpt.feed(&response);
        assert_eq!(x.get(&lua).unwrap(), Value::Number(1.0));
        assert_eq!(tpt.take_output(), b"\x02\x01\0\0\0x".to_vec());

        tpt.feed(&[status::UNSUPPORTED_CMD]);
        let err = x.get(&lua).unwrap_err();
        assert!(matches!(err.errnum, ErrorNum::Protocol(_)));
        assert_eq!(tpt.take_output(), vec![Command::Get as u8]);
    }

    #[test]
    fn helper_wait_sends_nothing_for_unsendable_arguments() {
        let config = RpcConfig {
            helper_wait: true,
            ..config()
        };
        let (lua, tpt, handle) = connected(&config);
        let f = handle.index("f").unwrap();

        let co = lua
            .create_thread(lua.load("return function() end").eval::<Function>().unwrap())
            .unwrap();
        let err = f
            .call(&lua, MultiValue::from_vec(vec![Value::Thread(co)]))
            .unwrap_err();
        assert!(matches!(err.errnum, ErrorNum::UnsupportedType("thread")));
        assert!(!err.is_fatal());
        assert!(tpt.take_output().is_empty());
        assert!(handle.is_open());

        tpt.feed(&[status::READY, status::OK, 0, 0, 0, 0]);
        f.call(&lua, MultiValue::new()).unwrap();
        assert_eq!(tpt.take_output(), b"\x01\x01\0\0\0f\0\0\0\0".to_vec());
    }
}
