//! Spawn configuration
//!
//! Accepts the same option bag as JSON (camelCase keys) so hosts can pass
//! configuration straight through from their own config files.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::encoding::Encoding;
use crate::error::{PtyError, PtyResult};
use crate::flow::{DEFAULT_PAUSE, DEFAULT_RESUME};
use crate::size::{WindowSize, DEFAULT_COLS, DEFAULT_ROWS};

/// Default value of `$TERM` in the child
pub const DEFAULT_TERM_NAME: &str = "xterm-256color";

/// Variables describing the parent's own terminal, dropped from an inherited environment
const PARENT_TERMINAL_VARS: &[&str] = &[
    "TMUX",
    "TMUX_PANE",
    "STY",
    "WINDOW",
    "WINDOWID",
    "TERMCAP",
    "COLUMNS",
    "LINES",
];

/// Options for spawning a program on a PTY
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SpawnOptions {
    /// Terminal type, exported as `$TERM`
    pub name: String,
    pub cols: u16,
    pub rows: u16,
    /// Working directory (defaults to the current directory)
    pub cwd: Option<PathBuf>,
    /// Complete child environment (defaults to the inherited one)
    pub env: Option<BTreeMap<String, String>>,
    /// Text encoding; `None` delivers and accepts raw bytes
    pub encoding: Option<Encoding>,
    pub handle_flow_control: bool,
    pub flow_control_pause: String,
    pub flow_control_resume: String,
    /// User id for the child (fork platform only).
    ///
    /// Descriptors opened with higher privileges may leak into the child.
    pub uid: Option<u32>,
    /// Group id for the child (fork platform only)
    pub gid: Option<u32>,
    /// Keep the cursor position when attaching the pseudo-console (console platform only)
    pub conpty_inherit_cursor: bool,
}

impl Default for SpawnOptions {
    fn default() -> Self {
        Self {
            name: DEFAULT_TERM_NAME.to_string(),
            cols: DEFAULT_COLS,
            rows: DEFAULT_ROWS,
            cwd: None,
            env: None,
            encoding: Some(Encoding::Utf8),
            handle_flow_control: false,
            flow_control_pause: DEFAULT_PAUSE.to_string(),
            flow_control_resume: DEFAULT_RESUME.to_string(),
            uid: None,
            gid: None,
            conpty_inherit_cursor: false,
        }
    }
}

impl SpawnOptions {
    /// Parse options from a JSON object
    ///
    /// `cols` and `rows` are checked before the rest of the object, so a
    /// zero, negative or oversized geometry fails with
    /// [`PtyError::InvalidDimensions`].
    pub fn from_json(json: &str) -> PtyResult<Self> {
        let mut value: serde_json::Value = serde_json::from_str(json).map_err(invalid_options)?;
        let (cols, rows) = match value.as_object_mut() {
            Some(map) => (
                take_dimension(map, "cols", DEFAULT_COLS)?,
                take_dimension(map, "rows", DEFAULT_ROWS)?,
            ),
            None => (i64::from(DEFAULT_COLS), i64::from(DEFAULT_ROWS)),
        };
        let size = WindowSize::from_signed(cols, rows)?;

        let options: Self = serde_json::from_value(value).map_err(invalid_options)?;
        Ok(options.with_size(size.cols, size.rows))
    }

    pub fn with_size(mut self, cols: u16, rows: u16) -> Self {
        self.cols = cols;
        self.rows = rows;
        self
    }

    pub fn with_cwd(mut self, cwd: impl AsRef<Path>) -> Self {
        self.cwd = Some(cwd.as_ref().to_path_buf());
        self
    }

    pub fn with_env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env = Some(env);
        self
    }

    pub fn with_encoding(mut self, encoding: Option<Encoding>) -> Self {
        self.encoding = encoding;
        self
    }

    pub fn with_flow_control(mut self, enabled: bool) -> Self {
        self.handle_flow_control = enabled;
        self
    }

    pub fn size(&self) -> WindowSize {
        WindowSize::new(self.cols, self.rows)
    }

    pub(crate) fn resolve_cwd(&self) -> PtyResult<PathBuf> {
        match &self.cwd {
            Some(dir) => Ok(dir.clone()),
            None => Ok(std::env::current_dir()?),
        }
    }

    /// Environment handed to the child, as `KEY=VALUE` pairs
    pub fn child_env(&self) -> Vec<(String, String)> {
        let mut env = match &self.env {
            Some(env) => env.clone(),
            None => inherited_env(),
        };
        env.insert("TERM".to_string(), self.name.clone());
        env.into_iter().collect()
    }
}

fn invalid_options(e: serde_json::Error) -> PtyError {
    PtyError::InvalidArgument(format!("invalid spawn options: {}", e))
}

/// Remove one geometry field, keeping its full signed value
fn take_dimension(
    map: &mut serde_json::Map<String, serde_json::Value>,
    key: &str,
    default: u16,
) -> PtyResult<i64> {
    match map.remove(key) {
        None | Some(serde_json::Value::Null) => Ok(i64::from(default)),
        Some(value) => match value.as_i64() {
            Some(n) => Ok(n),
            // Beyond the i64 range; clamp so the error still reports the sign
            None if value.as_u64().is_some() => Ok(i64::MAX),
            None => Err(PtyError::InvalidArgument(format!(
                "invalid spawn options: {} must be an integer, got {}",
                key, value
            ))),
        },
    }
}

/// The current environment without variables describing our own terminal
pub(crate) fn inherited_env() -> BTreeMap<String, String> {
    std::env::vars_os()
        .filter_map(|(k, v)| Some((k.into_string().ok()?, v.into_string().ok()?)))
        .filter(|(k, _)| !PARENT_TERMINAL_VARS.contains(&k.as_str()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let opts = SpawnOptions::default();
        assert_eq!(opts.name, "xterm-256color");
        assert_eq!(opts.size(), WindowSize::new(80, 24));
        assert_eq!(opts.encoding, Some(Encoding::Utf8));
        assert!(!opts.handle_flow_control);
        assert_eq!(opts.flow_control_pause, "\x13");
        assert_eq!(opts.flow_control_resume, "\x11");
    }

    #[test]
    fn test_from_json_camel_case() {
        let opts = SpawnOptions::from_json(
            r#"{"name":"xterm-color","cols":120,"rows":40,"cwd":"/tmp",
                "env":{"FOO":"bar"},"handleFlowControl":true,
                "flowControlPause":"P","conptyInheritCursor":true,"uid":1000}"#,
        )
        .unwrap();
        assert_eq!(opts.name, "xterm-color");
        assert_eq!(opts.size(), WindowSize::new(120, 40));
        assert_eq!(opts.cwd.as_deref(), Some(Path::new("/tmp")));
        assert!(opts.handle_flow_control);
        assert_eq!(opts.flow_control_pause, "P");
        assert_eq!(opts.flow_control_resume, "\x11");
        assert!(opts.conpty_inherit_cursor);
        assert_eq!(opts.uid, Some(1000));
        assert_eq!(opts.gid, None);
        // Missing encoding keeps the default
        assert_eq!(opts.encoding, Some(Encoding::Utf8));
    }

    #[test]
    fn test_null_encoding_selects_raw_mode() {
        let opts = SpawnOptions::from_json(r#"{"encoding":null}"#).unwrap();
        assert_eq!(opts.encoding, None);
        let opts = SpawnOptions::from_json(r#"{"encoding":"binary"}"#).unwrap();
        assert_eq!(opts.encoding, Some(Encoding::Latin1));
    }

    #[test]
    fn test_invalid_json_is_reported() {
        let err = SpawnOptions::from_json(r#"{"cols":"wide"}"#).unwrap_err();
        assert!(matches!(err, PtyError::InvalidArgument(_)));
        let err = SpawnOptions::from_json(r#"{"uid":-5}"#).unwrap_err();
        assert!(matches!(err, PtyError::InvalidArgument(_)));
        assert!(matches!(
            SpawnOptions::from_json("[1, 2]"),
            Err(PtyError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_bad_geometry_in_json_is_invalid_dimensions() {
        assert!(matches!(
            SpawnOptions::from_json(r#"{"cols":-1,"rows":24}"#),
            Err(PtyError::InvalidDimensions { cols: -1, rows: 24 })
        ));
        assert!(matches!(
            SpawnOptions::from_json(r#"{"rows":0}"#),
            Err(PtyError::InvalidDimensions { cols: 80, rows: 0 })
        ));
        assert!(matches!(
            SpawnOptions::from_json(r#"{"cols":70000}"#),
            Err(PtyError::InvalidDimensions { cols: 70000, rows: 24 })
        ));

        let opts = SpawnOptions::from_json(r#"{"cols":132,"rows":43}"#).unwrap();
        assert_eq!((opts.cols, opts.rows), (132, 43));
    }

    #[test]
    fn test_explicit_env_gets_term() {
        let mut env = BTreeMap::new();
        env.insert("FOO".to_string(), "bar".to_string());
        env.insert("TMUX".to_string(), "kept".to_string());
        let opts = SpawnOptions::default().with_env(env);
        let child = opts.child_env();
        assert!(child.contains(&("FOO".to_string(), "bar".to_string())));
        // Explicit environments are not sanitized
        assert!(child.contains(&("TMUX".to_string(), "kept".to_string())));
        assert!(child.contains(&("TERM".to_string(), "xterm-256color".to_string())));
    }

    #[test]
    fn test_inherited_env_is_sanitized() {
        let child = SpawnOptions::default().child_env();
        for (key, _) in &child {
            assert!(!PARENT_TERMINAL_VARS.contains(&key.as_str()), "{} leaked", key);
        }
        assert_eq!(child.iter().filter(|(k, _)| k == "TERM").count(), 1);
    }
}
