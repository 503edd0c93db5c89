//! Prefork - a preloading fork server for Lua programs.
//!
//! A long-lived server loads a set of Lua modules once, then forks a fresh
//! worker for every client connection. The worker takes over the client's
//! terminal streams, working directory, and environment, runs the requested
//! command against the already-warm runtime, and reports a one-byte status.
//!
//! # Architecture
//!
//! - **Server** - Preloads, binds the socket, forks workers, handles signals
//! - **Worker** - Forked per connection, runs the handshake and dispatch
//! - **Client** - Forwards stdio, cwd, env, and arguments to the server
//! - **Protocol** - NUL-terminated lines plus descriptor passing
//!
//! # Modules
//!
//! - [`server`] - Accept loop, takeover, and signal handling
//! - [`worker`] - Request handling inside a forked worker
//! - [`client`] - Client side of a request
//! - [`lua`] - Preloaded Lua runtime
//! - [`runners`] - Built-in test runner and REPL
//! - [`config`] - Environment-driven configuration

// Library modules
pub mod client;
pub mod config;
pub mod logging;
pub mod lua;
pub mod process;
pub mod protocol;
pub mod runners;
pub mod server;
pub mod worker;

// Re-export commonly used types
pub use client::Client;
pub use config::{ClientConfig, ServerConfig};
pub use lua::LuaRuntime;
pub use server::Server;
pub use worker::{Completion, Dispatch, RequestContext};
