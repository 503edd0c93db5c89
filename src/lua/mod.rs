//! Embedded Lua: the state the server preloads and every worker inherits.
//!
//! # Architecture
//!
//! ```text
//! prefork-server
//!  └── LuaRuntime (preloaded once, then fork()ed per request)
//!       ├── Lua state (mlua)
//!       ├── require wrapper (records loaded modules)
//!       └── Primitives
//!            ├── log (error, warn, info, debug, trace)
//!            └── os.exit (unwinds to the worker instead of exiting)
//! ```
//!
//! # Configuration
//!
//! - `PREFORK_LUA_PATH` - Colon-separated directories prepended to `package.path`

pub mod primitives;
pub mod runtime;

pub use primitives::{exit_request, lua_error, lua_exit_request, pending_exit, ExitRequest};
pub use runtime::{looks_like_path, LuaRuntime};
