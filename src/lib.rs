pub mod api;
pub mod cli;
pub mod client;
pub mod config;
pub mod error;
pub mod protocol;
pub mod server;
pub mod transport;

pub use api::{register, register_with, run_script};
pub use cli::{Input, prompt};
pub use client::{Handle, Helper};
pub use config::{NumberFormat, RpcConfig};
pub use error::{ErrorKind, ErrorNum, Result, RpcError};
pub use server::ServerHandle;
pub use transport::TransportAddr;
