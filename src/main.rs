//! Prefork client - runs a command inside a preloaded prefork-server worker.
//!
//! Every argument is forwarded untouched, so `prefork -e 'print(1)'` and
//! `prefork test test/math_test.lua:12` mean exactly what they would mean to
//! the worker. See the `prefork` library for the protocol.

use mimalloc::MiMalloc;
use prefork::{logging, Client, ClientConfig};

/// Global allocator configured per M-MIMALLOC-APPS guideline.
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

fn main() {
    logging::init("warn");

    let args: Vec<String> = std::env::args().skip(1).collect();
    let client = Client::new(ClientConfig::load());
    let code = match client.run(&args) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{e:#}");
            1
        }
    };
    std::process::exit(code);
}
