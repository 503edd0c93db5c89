//! prefork-server - preloads Lua modules and forks a worker per client.
//!
//! `prefork-server mod_a lib/b.lua` stops any server already on the socket,
//! preloads the listed modules, and serves. `prefork-server stop` only stops
//! the running server.

use clap::Parser;
use mimalloc::MiMalloc;
use prefork::config::{vars, DebugMode};
use prefork::{logging, Server, ServerConfig};

/// Global allocator configured per M-MIMALLOC-APPS guideline.
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[derive(Parser, Debug)]
#[command(name = "prefork-server")]
#[command(version)]
#[command(about = "Preloading fork server for Lua programs")]
struct Cli {
    /// Modules or files to preload, or `stop` to stop a running server
    #[arg(trailing_var_arg = true, allow_hyphen_values = true, value_name = "MODULE")]
    modules: Vec<String>,
}

fn main() {
    let cli = Cli::parse();
    let config = ServerConfig::load(cli.modules);
    // Workers get the client's environment; only the server reads DEBUG.
    std::env::remove_var(vars::DEBUG);
    logging::init(if config.debug == DebugMode::Off {
        "warn"
    } else {
        "debug"
    });

    if let Err(e) = Server::new(config).run() {
        eprintln!("{e:#}");
        std::process::exit(1);
    }
}
