//! Lua read-eval-print loop.
//!
//! Each input line is first tried as an expression (`return <line>`), then
//! as a statement. A chunk that fails to compile only because input ended
//! early keeps accumulating lines until it is complete. Results print as
//! `=> value`; errors print and the session continues. `os.exit` ends the
//! session and becomes the request's exit code.

use std::fs::File;
use std::io::{self, BufRead, BufReader, IsTerminal, Write};

use anyhow::{Context, Result};
use mlua::{Function, MultiValue};

use super::Repl;
use crate::lua::{lua_error, lua_exit_request, ExitRequest, LuaRuntime};

const PROMPT: &str = "lua> ";
const CONTINUATION_PROMPT: &str = "...> ";

/// The built-in [`Repl`].
#[derive(Debug, Default, Clone, Copy)]
pub struct LuaRepl;

impl LuaRepl {
    /// Create the REPL.
    pub fn new() -> Self {
        Self
    }

    /// Run a session over arbitrary streams.
    ///
    /// Prompts are only written when `interactive` is set.
    pub fn session<R: BufRead, W: Write>(
        &self,
        runtime: &LuaRuntime,
        mut input: R,
        out: &mut W,
        interactive: bool,
    ) -> Result<()> {
        let mut buffer = String::new();
        loop {
            if interactive {
                let prompt = if buffer.is_empty() { PROMPT } else { CONTINUATION_PROMPT };
                write!(out, "{prompt}")?;
                out.flush()?;
            }

            let mut line = String::new();
            if input.read_line(&mut line).context("Failed to read REPL input")? == 0 {
                break;
            }
            if buffer.is_empty() && matches!(line.trim(), "exit" | "quit") {
                break;
            }
            buffer.push_str(&line);

            match compile(runtime, &buffer, out)? {
                Compiled::Incomplete => continue,
                Compiled::Rejected => buffer.clear(),
                Compiled::Ready(chunk) => {
                    buffer.clear();
                    evaluate(runtime, &chunk, out)?;
                }
            }
        }
        if interactive {
            writeln!(out)?;
        }
        out.flush()?;
        Ok(())
    }
}

impl Repl for LuaRepl {
    fn run(&self, runtime: &LuaRuntime, args: &[String]) -> Result<()> {
        let stdout = io::stdout();
        let mut out = stdout.lock();
        match args.first() {
            Some(path) => {
                let file = File::open(path).with_context(|| format!("{path}: cannot open"))?;
                self.session(runtime, BufReader::new(file), &mut out, false)
            }
            None => {
                let stdin = io::stdin();
                let interactive = stdin.is_terminal();
                self.session(runtime, stdin.lock(), &mut out, interactive)
            }
        }
    }
}

/// Result of compiling the buffered input.
enum Compiled {
    Ready(Function),
    /// Input ended in the middle of a construct; read another line.
    Incomplete,
    /// Syntax error, already printed.
    Rejected,
}

fn compile<W: Write>(runtime: &LuaRuntime, buffer: &str, out: &mut W) -> Result<Compiled> {
    let lua = runtime.lua();
    if let Ok(function) = lua
        .load(format!("return {buffer}"))
        .set_name("=repl")
        .into_function()
    {
        return Ok(Compiled::Ready(function));
    }
    match lua.load(buffer).set_name("=repl").into_function() {
        Ok(function) => Ok(Compiled::Ready(function)),
        Err(mlua::Error::SyntaxError {
            incomplete_input: true,
            ..
        }) => Ok(Compiled::Incomplete),
        Err(err) => {
            writeln!(out, "{err}")?;
            Ok(Compiled::Rejected)
        }
    }
}

/// Call a compiled chunk and print what it returns.
fn evaluate<W: Write>(runtime: &LuaRuntime, chunk: &Function, out: &mut W) -> Result<()> {
    match chunk.call::<MultiValue>(()) {
        Ok(values) => {
            crate::process::flush_stdio();
            if values.is_empty() {
                return Ok(());
            }
            let tostring: Function = runtime
                .lua()
                .globals()
                .get("tostring")
                .map_err(|e| lua_error(e, "Failed to get tostring"))?;
            let rendered = values
                .iter()
                .map(|value| tostring.call::<String>(value.clone()))
                .collect::<mlua::Result<Vec<_>>>()
                .map_err(|e| lua_error(e, "Failed to render result"))?;
            writeln!(out, "=> {}", rendered.join(", "))?;
        }
        Err(err) => {
            if let Some(code) = lua_exit_request(&err) {
                return Err(ExitRequest(code).into());
            }
            crate::process::flush_stdio();
            writeln!(out, "{err}")?;
        }
    }
    Ok(())
}
