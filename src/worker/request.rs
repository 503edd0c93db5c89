//! What a client asked for.
//!
//! [`RequestContext`] carries everything read off the connection after the
//! stream takeover; [`RequestKind`] classifies its argument vector.

use std::ffi::OsString;
use std::path::PathBuf;

/// Arguments naming the test runner.
pub const TEST_KEYWORD: &str = "test";

/// Argument naming the REPL.
pub const SHELL_KEYWORD: &str = "repl";

/// Argument introducing inline code.
pub const INLINE_FLAG: &str = "-e";

/// Everything a worker learned from the client.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestContext {
    /// Directory the worker changed into.
    pub cwd: PathBuf,
    /// The client's environment, which replaced the worker's.
    pub env: Vec<(OsString, OsString)>,
    /// Argument vector.
    pub args: Vec<String>,
}

impl RequestContext {
    /// Look up a variable in the client's environment. Values that are not
    /// valid UTF-8 read as absent.
    pub fn env_var(&self, key: &str) -> Option<&str> {
        self.env
            .iter()
            .find(|(k, _)| k == key)
            .and_then(|(_, v)| v.to_str())
    }
}

/// The shape of a request, in dispatch priority order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestKind {
    /// `test ...` or `file.lua:<line> ...`: run tests.
    TestAtLine {
        /// Runner arguments (the `test` keyword removed).
        args: Vec<String>,
    },
    /// `repl ...`: interactive session.
    Shell {
        /// Remaining arguments.
        args: Vec<String>,
    },
    /// `-e <code> ...`: run inline code. `code` is `None` when it is missing.
    InlineEval {
        /// Source text.
        code: Option<String>,
        /// Arguments after the code.
        args: Vec<String>,
    },
    /// `<path> ...`: load and run a script.
    Script {
        /// Script path as given.
        path: String,
        /// Arguments after the path.
        args: Vec<String>,
    },
    /// No arguments: run stdin as source.
    Stdin,
}

impl RequestKind {
    /// Classify an argument vector. The first matching shape wins.
    pub fn classify(args: &[String]) -> Self {
        let Some((first, rest)) = args.split_first() else {
            return Self::Stdin;
        };
        if first == TEST_KEYWORD {
            return Self::TestAtLine {
                args: rest.to_vec(),
            };
        }
        if is_file_line(first) {
            return Self::TestAtLine {
                args: args.to_vec(),
            };
        }
        if first == SHELL_KEYWORD {
            return Self::Shell {
                args: rest.to_vec(),
            };
        }
        if first == INLINE_FLAG {
            let (code, args) = match rest.split_first() {
                Some((code, args)) => (Some(code.clone()), args.to_vec()),
                None => (None, Vec::new()),
            };
            return Self::InlineEval { code, args };
        }
        Self::Script {
            path: first.clone(),
            args: rest.to_vec(),
        }
    }
}

/// Whether `arg` looks like `something.lua:<digits>`.
pub fn is_file_line(arg: &str) -> bool {
    match arg.rsplit_once(':') {
        Some((file, line)) => {
            file.ends_with(".lua") && !line.is_empty() && line.bytes().all(|b| b.is_ascii_digit())
        }
        None => false,
    }
}
