use std::{
    error::Error,
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::Duration,
};

use clap::Parser;
use log::{info, warn};
use lrpc::{NumberFormat, RpcConfig, RpcError, ServerHandle, TransportAddr, register_with, run_script};
use mlua::Lua;

const POLL_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Listen for new connections at address (`host:port`, `tcp://…` or `udp://…`)
    #[arg(value_parser = parse_addr)]
    address: TransportAddr,
    /// Lua script to run before serving
    #[arg(long)]
    script: Option<PathBuf>,
    /// Send a READY status before executing each command
    #[arg(long)]
    helper_wait: bool,
    /// Propose integer numbers during negotiation
    #[arg(long)]
    int_numbers: bool,
    /// Propose this number width in bytes (1, 2, 4 or 8)
    #[arg(long, default_value_t = 8)]
    number_bytes: u8,
    /// Load function bytecode sent by clients
    #[arg(long)]
    allow_bytecode: bool,
}

fn parse_addr(s: &str) -> Result<TransportAddr, String> {
    s.parse().map_err(|e: RpcError| e.to_string())
}

fn main() -> Result<(), Box<dyn Error>> {
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
        allow_bytecode: cli.allow_bytecode,
        ..RpcConfig::default()
    };
    if config.allow_bytecode {
        warn!("loading function bytecode sent by clients");
    }

    let lua = Lua::new();
    register_with(&lua, config.clone())?;
    if let Some(script) = &cli.script {
        run_script(&lua, script)?;
    }

    let running = Arc::new(AtomicBool::new(true));
    let r = Arc::clone(&running);
    ctrlc::set_handler(move || r.store(false, Ordering::SeqCst))?;

    let mut server = ServerHandle::listen(&cli.address, config)?;
    info!("serving on {:?}", cli.address);

    while running.load(Ordering::SeqCst) && server.is_listening() {
        match server.peek() {
            Ok(true) => {
                if let Err(e) = server.dispatch(&lua) {
                    if e.is_fatal() && !server.is_listening() {
                        return Err(e.into());
                    }
                    warn!("dispatch failed: {e}");
                }
            }
            Ok(false) => thread::sleep(POLL_INTERVAL),
            Err(e) => {
                warn!("peek failed: {e}");
                thread::sleep(POLL_INTERVAL);
            }
        }
    }

    info!("shutting down");
    server.shutdown();
    Ok(())
}
