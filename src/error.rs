//! Error types for PTY operations

use std::env::consts::{ARCH, OS};
use std::io;

/// Error type for PTY operations
#[derive(Debug, thiserror::Error)]
pub enum PtyError {
    #[error("Failed to create PTY on {platform}: {reason}")]
    PtyCreation {
        platform: &'static str,
        reason: String,
    },

    #[error("Invalid PTY dimensions {cols}x{rows}: columns and rows must be positive")]
    InvalidDimensions { cols: i64, rows: i64 },

    #[error("Executable not found: {file} (platform {platform}-{arch})")]
    ExecutableNotFound {
        file: String,
        platform: &'static str,
        arch: &'static str,
    },

    #[error("Operation '{operation}' is not supported on {platform}")]
    UnsupportedOperation {
        operation: &'static str,
        platform: &'static str,
    },

    #[error("Console process query failed: {0}")]
    ConsoleQuery(String),

    #[error("No native PTY implementation for platform {platform}-{arch}")]
    PlatformUnsupported {
        platform: &'static str,
        arch: &'static str,
    },

    #[error("Failed to spawn {file}: {stage} failed: {source}")]
    Spawn {
        file: String,
        stage: SpawnStage,
        #[source]
        source: io::Error,
    },

    #[error("Unknown signal: {0}")]
    InvalidSignal(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[cfg(unix)]
    #[error("System error: {0}")]
    Nix(#[from] nix::Error),
}

/// Step of the child launch sequence that failed after the process was created
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpawnStage {
    Chdir,
    Setgid,
    Setuid,
    Exec,
}

impl SpawnStage {
    pub(crate) fn to_code(self) -> i32 {
        match self {
            SpawnStage::Chdir => 1,
            SpawnStage::Setgid => 2,
            SpawnStage::Setuid => 3,
            SpawnStage::Exec => 4,
        }
    }

    pub(crate) fn from_code(code: i32) -> Option<Self> {
        match code {
            1 => Some(SpawnStage::Chdir),
            2 => Some(SpawnStage::Setgid),
            3 => Some(SpawnStage::Setuid),
            4 => Some(SpawnStage::Exec),
            _ => None,
        }
    }
}

impl std::fmt::Display for SpawnStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SpawnStage::Chdir => "chdir()",
            SpawnStage::Setgid => "setgid()",
            SpawnStage::Setuid => "setuid()",
            SpawnStage::Exec => "exec()",
        };
        f.write_str(name)
    }
}

impl PtyError {
    pub(crate) fn creation(reason: impl std::fmt::Display) -> Self {
        PtyError::PtyCreation {
            platform: OS,
            reason: reason.to_string(),
        }
    }

    pub(crate) fn not_found(file: impl Into<String>) -> Self {
        PtyError::ExecutableNotFound {
            file: file.into(),
            platform: OS,
            arch: ARCH,
        }
    }

    pub(crate) fn unsupported(operation: &'static str) -> Self {
        PtyError::UnsupportedOperation {
            operation,
            platform: OS,
        }
    }

    #[cfg(not(any(unix, windows)))]
    pub(crate) fn platform_unsupported() -> Self {
        PtyError::PlatformUnsupported {
            platform: OS,
            arch: ARCH,
        }
    }
}

/// Result type for PTY operations
pub type PtyResult<T> = Result<T, PtyError>;
