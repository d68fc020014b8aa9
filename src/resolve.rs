//! Executable lookup and command-line assembly

use std::ffi::OsStr;
use std::path::{Path, PathBuf};

use crate::error::{PtyError, PtyResult};

/// Resolve `file` to the path that will be executed
///
/// Absolute paths are taken as given. Names containing a separator are
/// resolved against `cwd`. Bare names are searched on `path_var` (with
/// `PATHEXT` suffixes on Windows, where `cwd` is tried last as cmd.exe does).
pub fn resolve_executable(file: &str, cwd: &Path, path_var: Option<&OsStr>) -> PtyResult<PathBuf> {
    if file.is_empty() {
        return Err(PtyError::not_found(file));
    }

    match which::which_in(file, path_var, cwd) {
        Ok(found) => return Ok(found),
        Err(e) => tracing::debug!("{} not found on the search path: {}", file, e),
    }

    if cfg!(windows) {
        if let Ok(found) = which::which_in(file, Some(cwd.as_os_str()), cwd) {
            return Ok(found);
        }
    }

    Err(PtyError::not_found(file))
}

/// Join a program and its arguments into one command line
///
/// Follows the rules the Microsoft C runtime uses to split a command line:
/// arguments that are empty or contain whitespace or quotes are quoted,
/// embedded quotes are escaped and backslashes are doubled only where they
/// precede a quote.
pub fn args_to_command_line(file: &str, args: &[String]) -> String {
    let mut line = String::new();
    for (i, arg) in std::iter::once(file).chain(args.iter().map(String::as_str)).enumerate() {
        if i > 0 {
            line.push(' ');
        }
        quote_arg(arg, &mut line);
    }
    line
}

fn quote_arg(arg: &str, out: &mut String) {
    let needs_quotes =
        arg.is_empty() || arg.contains(|c: char| c == ' ' || c == '\t' || c == '"');
    if !needs_quotes {
        out.push_str(arg);
        return;
    }

    out.push('"');
    let mut backslashes = 0;
    for c in arg.chars() {
        match c {
            '\\' => backslashes += 1,
            '"' => {
                push_backslashes(out, backslashes * 2 + 1);
                out.push('"');
                backslashes = 0;
            },
            _ => {
                push_backslashes(out, backslashes);
                out.push(c);
                backslashes = 0;
            },
        }
    }
    // Trailing backslashes would escape the closing quote
    push_backslashes(out, backslashes * 2);
    out.push('"');
}

fn push_backslashes(out: &mut String, n: usize) {
    out.extend(std::iter::repeat('\\').take(n));
}
