//! CLI utilities for the Lua-RPC client.
//!
//! The utilities present in this module read the client's interactive
//! input one line at a time.
use std::io::{BufRead, Write};

/// Possible inputs from a user.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Input {
    /// Exit command `.exit`, or end of input
    Exit,
    /// A Lua chunk to evaluate
    Chunk(String),
}

/// Prompt user for the next line of input.
pub fn prompt<R, W>(mut reader: R, mut writer: W) -> Result<Input, String>
where
    R: BufRead,
    W: Write,
{
    let mut s = String::default();
    write!(&mut writer, "> ").map_err(|e| format!("failed to write prompt: {e}"))?;
    writer
        .flush()
        .map_err(|e| format!("failed to write prompt: {e}"))?;

    let read = reader
        .read_line(&mut s)
        .map_err(|e| format!("failed to read input: {e}"))?;
    if read == 0 {
        return Ok(Input::Exit);
    }

    match s.trim_end() {
        ".exit" => Ok(Input::Exit),
        s if !s.starts_with('.') => Ok(Input::Chunk(s.to_string())),
        s => Err(format!("unrecognized command '{}'", s)),
    }
}
