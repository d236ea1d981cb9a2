use std::{error::Error, io, path::PathBuf};

use clap::Parser;
use lrpc::{
    Handle, Input, NumberFormat, RpcConfig, RpcError, TransportAddr, prompt, register_with,
    run_script,
};
use mlua::{Function, Lua, MultiValue};

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Server address (`host:port`, `tcp://…` or `udp://…`)
    #[arg(value_parser = parse_addr)]
    address: TransportAddr,
    /// Run a script with `remote` bound instead of prompting
    #[arg(long)]
    script: Option<PathBuf>,
    /// Wait for a READY status before sending each command
    #[arg(long)]
    helper_wait: bool,
    /// Propose integer numbers during negotiation
    #[arg(long)]
    int_numbers: bool,
    /// Propose this number width in bytes (1, 2, 4 or 8)
    #[arg(long, default_value_t = 8)]
    number_bytes: u8,
}

fn parse_addr(s: &str) -> Result<TransportAddr, String> {
    s.parse().map_err(|e: RpcError| e.to_string())
}

/// Evaluate `chunk` as an expression if it is one, as a statement otherwise.
fn eval(lua: &Lua, chunk: &str) -> mlua::Result<MultiValue> {
    match lua.load(format!("return {chunk}")).set_name("=stdin").into_function() {
        Ok(f) => f.call(()),
        Err(_) => lua.load(chunk).set_name("=stdin").call(()),
    }
}

fn main() -> Result<(), Box<dyn Error>> {
    // Initialize env_logger; For logging to STDOUT/STDERR
    env_logger::init();

    let cli = Cli::parse();
    let local = NumberFormat {
        lnum_bytes: cli.number_bytes,
        intnum: cli.int_numbers,
        ..NumberFormat::native()
    };
    if !local.is_valid() {
        return Err(format!("unsupported number format: {} bytes", cli.number_bytes).into());
    }
    let config = RpcConfig {
        local,
        helper_wait: cli.helper_wait,
        ..RpcConfig::default()
    };

    let lua = Lua::new();
    register_with(&lua, config.clone())?;
    let handle = Handle::connect(&cli.address, &config)?;
    lua.globals().set("remote", handle.clone())?;

    if let Some(script) = &cli.script {
        run_script(&lua, script)?;
        handle.close();
        return Ok(());
    }

    let print: Function = lua.globals().get("print")?;
    let stdin = io::stdin();
    let stdout = io::stdout();

    loop {
        let input = match prompt(stdin.lock(), stdout.lock()) {
            Ok(input) => input,
            Err(e) => {
                eprintln!("{e}");
                continue;
            }
        };

        let chunk = match input {
            Input::Exit => break,
            Input::Chunk(chunk) => chunk,
        };
        if chunk.trim().is_empty() {
            continue;
        }

        match eval(&lua, &chunk) {
            Ok(values) if values.is_empty() => {}
            Ok(values) => print.call::<()>(values)?,
            Err(e) => eprintln!("error: {e}"),
        }
        if !handle.is_open() {
            eprintln!("connection closed");
            break;
        }
    }

    handle.close();
    Ok(())
}
