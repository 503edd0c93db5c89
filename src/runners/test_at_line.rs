//! Line-addressed test runner.
//!
//! Lua files register tests with the global `test(name, body)` helper. The
//! runner selects them by file, by `file.lua:<line>` (the test whose body
//! encloses that line), or by name, runs each inside `pcall`, and prints a
//! minitest-style report:
//!
//! ```text
//! # Running:
//!
//! ..F
//!
//!   1) Failure:
//! subtracts [/src/math_test.lua:9]:
//! Expected: 1
//!   Actual: 2
//!
//! 3 runs, 3 assertions, 1 failures, 0 errors
//! ```

use std::io::{self, Write};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use mlua::{Function, Table, Value};

use super::TestRunner;
use crate::lua::{lua_error, lua_exit_request, ExitRequest, LuaRuntime};

/// Registry key of the table returned by the test prelude.
const REGISTRY_KEY: &str = "prefork.tests";

/// Lua source of the test helpers.
const PRELUDE: &str = include_str!("test_prelude.lua");

/// One argument's worth of selection.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Target {
    file: PathBuf,
    line: Option<usize>,
}

/// Parsed runner arguments.
#[derive(Debug, Default, PartialEq, Eq)]
struct RunOptions {
    targets: Vec<Target>,
    name: Option<String>,
    verbose: bool,
}

impl RunOptions {
    fn parse(args: &[String]) -> Result<Self> {
        let mut options = Self::default();
        let mut iter = args.iter();
        while let Some(arg) = iter.next() {
            match arg.as_str() {
                "-v" | "--verbose" => options.verbose = true,
                "-n" | "--name" => {
                    let name = iter.next().context("-n requires a test name")?;
                    options.name = Some(name.clone());
                }
                _ => options.targets.push(parse_target(arg)),
            }
        }
        Ok(options)
    }
}

/// Split `path:<digits>` into a file and a line.
fn parse_target(arg: &str) -> Target {
    if let Some((file, line)) = arg.rsplit_once(':') {
        if !line.is_empty() && line.bytes().all(|b| b.is_ascii_digit()) {
            if let Ok(line) = line.parse() {
                return Target {
                    file: PathBuf::from(file),
                    line: Some(line),
                };
            }
        }
    }
    Target {
        file: PathBuf::from(arg),
        line: None,
    }
}

/// A registered test as seen from Rust.
#[derive(Debug, Clone)]
struct TestCase {
    /// 1-based index into the Lua registry.
    index: usize,
    name: String,
    /// Absolute path of the defining file, when it came from a file.
    file: Option<String>,
    first_line: usize,
    last_line: usize,
}

impl TestCase {
    fn encloses(&self, line: usize) -> bool {
        self.first_line <= line && line <= self.last_line
    }

    fn location(&self) -> String {
        match &self.file {
            Some(file) => format!("{}:{}", file, self.first_line),
            None => format!("?:{}", self.first_line),
        }
    }
}

/// How one test ended.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Outcome {
    Pass,
    Fail(String),
    Error(String),
}

/// Tally for the summary line.
#[derive(Debug, Default, PartialEq, Eq)]
struct Tally {
    runs: usize,
    assertions: usize,
    failures: usize,
    errors: usize,
}

impl Tally {
    fn passed(&self) -> bool {
        self.failures == 0 && self.errors == 0
    }
}

/// The built-in [`TestRunner`].
#[derive(Debug, Default, Clone, Copy)]
pub struct LineTestRunner;

impl LineTestRunner {
    /// Create the runner.
    pub fn new() -> Self {
        Self
    }

    fn module(runtime: &LuaRuntime) -> Result<Table> {
        runtime
            .lua()
            .named_registry_value::<Table>(REGISTRY_KEY)
            .map_err(|e| anyhow!("Test helpers are not installed: {e}"))
    }

    fn registry(runtime: &LuaRuntime) -> Result<Table> {
        Self::module(runtime)?
            .get::<Table>("tests")
            .map_err(|e| anyhow!("Failed to get test registry: {e}"))
    }

    /// Every registered test, in registration order.
    fn cases(runtime: &LuaRuntime) -> Result<Vec<TestCase>> {
        let registry = Self::registry(runtime)?;
        let mut cases = Vec::new();
        for index in 1..=registry.raw_len() {
            let entry: Table = registry
                .get(index)
                .map_err(|e| anyhow!("Malformed test entry {index}: {e}"))?;
            let name: String = entry
                .get("name")
                .map_err(|e| anyhow!("Malformed test name {index}: {e}"))?;
            let body: Function = entry
                .get("body")
                .map_err(|e| anyhow!("Malformed test body {index}: {e}"))?;
            let info = body.info();
            cases.push(TestCase {
                index,
                name,
                file: info
                    .source
                    .as_deref()
                    .and_then(|source| source.strip_prefix('@'))
                    .map(String::from),
                first_line: info.line_defined.unwrap_or(0),
                last_line: info.last_line_defined.unwrap_or(0),
            });
        }
        Ok(cases)
    }

    /// Run one test through the prelude's `pcall` wrapper.
    ///
    /// An `os.exit` inside a test is not a test error: it propagates.
    fn run_case(runtime: &LuaRuntime, case: &TestCase) -> Result<Outcome> {
        let run: Function = Self::module(runtime)?
            .get("run")
            .map_err(|e| anyhow!("Failed to get test run function: {e}"))?;
        let (status, detail): (String, Value) = run
            .call(case.index)
            .map_err(|e| lua_error(e, format!("Failed to run test {}", case.name)))?;
        match status.as_str() {
            "pass" => Ok(Outcome::Pass),
            "fail" => Ok(Outcome::Fail(describe(runtime, detail)?)),
            _ => {
                if let Value::Error(err) = &detail {
                    if let Some(code) = lua_exit_request(err) {
                        return Err(ExitRequest(code).into());
                    }
                }
                Ok(Outcome::Error(describe(runtime, detail)?))
            }
        }
    }

    fn assertion_count(runtime: &LuaRuntime) -> Result<usize> {
        let count: Function = Self::module(runtime)?
            .get("assertion_count")
            .map_err(|e| anyhow!("Failed to get assertion counter: {e}"))?;
        count
            .call::<usize>(())
            .map_err(|e| anyhow!("Failed to count assertions: {e}"))
    }

    /// Run `cases` and write the report to `out`.
    fn run_cases<W: Write>(
        runtime: &LuaRuntime,
        cases: &[TestCase],
        verbose: bool,
        out: &mut W,
    ) -> Result<bool> {
        let assertions_before = Self::assertion_count(runtime)?;
        let mut tally = Tally::default();
        let mut problems = Vec::new();

        writeln!(out, "# Running:\n")?;
        for case in cases {
            out.flush()?;
            let outcome = Self::run_case(runtime, case)?;
            crate::process::flush_stdio();
            tally.runs += 1;
            let mark = match &outcome {
                Outcome::Pass => ".",
                Outcome::Fail(_) => {
                    tally.failures += 1;
                    "F"
                }
                Outcome::Error(_) => {
                    tally.errors += 1;
                    "E"
                }
            };
            if verbose {
                let label = match mark {
                    "." => "PASS",
                    "F" => "FAIL",
                    _ => "ERROR",
                };
                writeln!(out, "{} = {}", case.name, label)?;
            } else {
                write!(out, "{mark}")?;
            }
            if outcome != Outcome::Pass {
                problems.push((case, outcome));
            }
        }
        if !verbose {
            writeln!(out)?;
        }

        for (number, (case, outcome)) in problems.iter().enumerate() {
            let (kind, detail) = match outcome {
                Outcome::Fail(detail) => ("Failure", detail),
                Outcome::Error(detail) => ("Error", detail),
                Outcome::Pass => continue,
            };
            writeln!(out, "\n  {}) {}:", number + 1, kind)?;
            writeln!(out, "{} [{}]:\n{}", case.name, case.location(), detail)?;
        }

        tally.assertions = Self::assertion_count(runtime)?.saturating_sub(assertions_before);
        writeln!(
            out,
            "\n{} runs, {} assertions, {} failures, {} errors",
            tally.runs, tally.assertions, tally.failures, tally.errors
        )?;
        out.flush()?;
        Ok(tally.passed())
    }

    /// Select tests and run them, writing the report to `out`.
    fn run_with_output<W: Write>(
        &self,
        runtime: &LuaRuntime,
        args: &[String],
        out: &mut W,
        err: &mut dyn Write,
    ) -> Result<bool> {
        let options = RunOptions::parse(args)?;

        let mut targets = Vec::with_capacity(options.targets.len());
        for target in &options.targets {
            runtime.require_file(&target.file)?;
            let absolute = std::fs::canonicalize(&target.file)
                .with_context(|| format!("cannot load such file -- {}", target.file.display()))?;
            targets.push((absolute.to_string_lossy().into_owned(), target.line));
        }

        let all = Self::cases(runtime)?;
        let selected: Vec<TestCase> = all
            .iter()
            .filter(|case| {
                targets.is_empty()
                    || targets.iter().any(|(file, line)| {
                        case.file.as_deref() == Some(file.as_str())
                            && line.map_or(true, |line| case.encloses(line))
                    })
            })
            .filter(|case| options.name.as_ref().map_or(true, |name| &case.name == name))
            .cloned()
            .collect();

        if selected.is_empty() {
            if let Some((file, Some(line))) = targets.iter().find(|(_, line)| line.is_some()) {
                writeln!(err, "No tests found on line {line}. Valid tests to run:\n")?;
                for case in all.iter().filter(|c| c.file.as_deref() == Some(file.as_str())) {
                    writeln!(err, "{}:{}  {}", display_path(file), case.first_line, case.name)?;
                }
            } else {
                writeln!(err, "No tests found.")?;
            }
            err.flush()?;
            return Ok(false);
        }

        log::debug!("Running {} of {} registered tests", selected.len(), all.len());
        Self::run_cases(runtime, &selected, options.verbose, out)
    }
}

impl TestRunner for LineTestRunner {
    fn install(&self, runtime: &LuaRuntime) -> Result<()> {
        let lua = runtime.lua();
        let module: Table = lua
            .load(PRELUDE)
            .set_name("=test_prelude")
            .eval()
            .map_err(|e| anyhow!("Failed to load test helpers: {e}"))?;
        lua.set_named_registry_value(REGISTRY_KEY, module)
            .map_err(|e| anyhow!("Failed to store test helpers: {e}"))?;
        Ok(())
    }

    fn run(&self, runtime: &LuaRuntime, args: &[String]) -> Result<bool> {
        let stdout = io::stdout();
        let stderr = io::stderr();
        self.run_with_output(runtime, args, &mut stdout.lock(), &mut stderr.lock())
    }

    fn registered(&self, runtime: &LuaRuntime) -> Result<usize> {
        Ok(Self::registry(runtime)?.raw_len())
    }

    fn run_registered_since(
        &self,
        runtime: &LuaRuntime,
        since: usize,
        args: &[String],
    ) -> Result<Option<bool>> {
        let cases: Vec<TestCase> = Self::cases(runtime)?
            .into_iter()
            .filter(|case| case.index > since)
            .collect();
        if cases.is_empty() {
            return Ok(None);
        }
        let verbose = args.iter().any(|a| a == "-v" || a == "--verbose");
        Self::run_cases(runtime, &cases, verbose, &mut io::stdout().lock()).map(Some)
    }
}

/// Render a Lua value for a report.
fn describe(runtime: &LuaRuntime, value: Value) -> Result<String> {
    if let Value::String(s) = &value {
        return Ok(s.to_string_lossy().to_string());
    }
    let tostring: Function = runtime
        .lua()
        .globals()
        .get("tostring")
        .map_err(|e| anyhow!("Failed to get tostring: {e}"))?;
    tostring
        .call::<String>(value)
        .map_err(|e| anyhow!("Failed to describe test result: {e}"))
}

/// Show a path relative to the working directory when it is below it.
fn display_path(file: &str) -> String {
    std::env::current_dir()
        .ok()
        .and_then(|cwd| Path::new(file).strip_prefix(cwd).ok().map(Path::to_path_buf))
        .map_or_else(|| file.to_string(), |rel| rel.display().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lua::exit_request;

    const MATH_TESTS: &str = r#"
test("adds", function()
  assert_equal(4, 2 + 2)
end)

test("subtracts", function()
  assert_equal(1, 3 - 1)
end)

test("explodes", function()
  error("kaboom")
end)
"#;

    fn setup() -> (LuaRuntime, LineTestRunner, tempfile::TempDir, PathBuf) {
        let runtime = LuaRuntime::new().expect("Should create runtime");
        let runner = LineTestRunner::new();
        runner.install(&runtime).expect("Should install helpers");
        let dir = tempfile::tempdir().expect("tempdir");
        let file = dir.path().join("math_test.lua");
        std::fs::write(&file, MATH_TESTS).expect("write tests");
        (runtime, runner, dir, file)
    }

    fn run(
        runner: &LineTestRunner,
        runtime: &LuaRuntime,
        args: &[String],
    ) -> (bool, String, String) {
        let mut out = Vec::new();
        let mut err = Vec::new();
        let passed = runner
            .run_with_output(runtime, args, &mut out, &mut err)
            .expect("runner should not fail");
        (
            passed,
            String::from_utf8(out).expect("utf8"),
            String::from_utf8(err).expect("utf8"),
        )
    }

    #[test]
    fn test_parse_target() {
        assert_eq!(
            parse_target("test/a_test.lua:12"),
            Target {
                file: PathBuf::from("test/a_test.lua"),
                line: Some(12)
            }
        );
        assert_eq!(
            parse_target("test/a_test.lua"),
            Target {
                file: PathBuf::from("test/a_test.lua"),
                line: None
            }
        );
        assert_eq!(parse_target("odd:name:x").line, None);
    }

    #[test]
    fn test_parse_options() {
        let args: Vec<String> = ["-v", "a.lua", "-n", "adds"]
            .iter()
            .map(|s| (*s).to_string())
            .collect();
        let options = RunOptions::parse(&args).expect("parse");
        assert!(options.verbose);
        assert_eq!(options.name.as_deref(), Some("adds"));
        assert_eq!(options.targets.len(), 1);
        assert!(RunOptions::parse(&["-n".to_string()]).is_err());
    }

    #[test]
    fn test_line_selects_enclosing_test() {
        let (runtime, runner, _dir, file) = setup();
        let (passed, out, _) = run(&runner, &runtime, &[format!("{}:3", file.display())]);
        assert!(passed, "{out}");
        assert!(out.contains("1 runs, 1 assertions, 0 failures, 0 errors"), "{out}");
    }

    #[test]
    fn test_line_on_failing_test() {
        let (runtime, runner, _dir, file) = setup();
        let (passed, out, _) = run(&runner, &runtime, &[format!("{}:7", file.display())]);
        assert!(!passed);
        assert!(out.contains("1) Failure:"), "{out}");
        assert!(out.contains("subtracts ["), "{out}");
        assert!(out.contains("Expected: 1\n  Actual: 2"), "{out}");
    }

    #[test]
    fn test_whole_file_counts_errors() {
        let (runtime, runner, _dir, file) = setup();
        let (passed, out, _) = run(
            &runner,
            &runtime,
            &[file.display().to_string(), "-v".to_string()],
        );
        assert!(!passed);
        assert!(out.contains("adds = PASS"), "{out}");
        assert!(out.contains("explodes = ERROR"), "{out}");
        assert!(out.contains("kaboom"), "{out}");
        assert!(out.contains("3 runs, 2 assertions, 1 failures, 1 errors"), "{out}");
    }

    #[test]
    fn test_no_test_on_line() {
        let (runtime, runner, _dir, file) = setup();
        let (passed, out, err) = run(&runner, &runtime, &[format!("{}:5", file.display())]);
        assert!(!passed);
        assert!(out.is_empty());
        assert!(err.contains("No tests found on line 5"), "{err}");
        assert!(err.contains("adds"), "{err}");
    }

    #[test]
    fn test_autorun_only_runs_new_tests() {
        let (runtime, runner, _dir, file) = setup();
        runtime
            .exec_source("helpers", r#"test("preloaded", function() error("never") end)"#, &[])
            .expect("register preloaded test");
        let since = runner.registered(&runtime).expect("count");
        assert_eq!(since, 1);
        assert_eq!(
            runner.run_registered_since(&runtime, since, &[]).expect("none"),
            None
        );

        runtime.require_file(&file).expect("load tests");
        let result = runner
            .run_registered_since(&runtime, since, &[])
            .expect("autorun");
        assert_eq!(result, Some(false));
    }

    #[test]
    fn test_exit_inside_test_propagates() {
        let (runtime, runner, _dir, _file) = setup();
        runtime
            .exec_source("exiting", r#"test("exits", function() os.exit(3) end)"#, &[])
            .expect("register");
        let err = runner
            .run_registered_since(&runtime, 0, &[])
            .unwrap_err();
        assert_eq!(exit_request(&err), Some(3));
    }
}
