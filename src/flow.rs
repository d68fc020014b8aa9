//! Application-level flow control
//!
//! When enabled, an outbound write that is exactly the pause sequence stops
//! the forwarding of queued writes, and one that is exactly the resume
//! sequence restarts it. Both sequences are consumed. Only whole writes
//! match; a sequence embedded in a larger write is forwarded untouched.

use std::sync::atomic::{AtomicBool, Ordering};

/// XOFF
pub const DEFAULT_PAUSE: &str = "\x13";
/// XON
pub const DEFAULT_RESUME: &str = "\x11";

/// Forwarding state of the outbound queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FlowState {
    #[default]
    Running,
    Paused,
}

/// What to do with one outbound write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowAction {
    Pause,
    Resume,
    Forward,
}

#[derive(Debug)]
pub struct FlowControl {
    enabled: AtomicBool,
    pause: Vec<u8>,
    resume: Vec<u8>,
}

impl FlowControl {
    pub fn new(enabled: bool, pause: impl Into<Vec<u8>>, resume: impl Into<Vec<u8>>) -> Self {
        Self {
            enabled: AtomicBool::new(enabled),
            pause: pause.into(),
            resume: resume.into(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }

    pub fn pause_sequence(&self) -> &[u8] {
        &self.pause
    }

    pub fn resume_sequence(&self) -> &[u8] {
        &self.resume
    }

    pub fn classify(&self, data: &[u8]) -> FlowAction {
        if !self.is_enabled() {
            return FlowAction::Forward;
        }
        if !self.pause.is_empty() && data == self.pause.as_slice() {
            FlowAction::Pause
        } else if !self.resume.is_empty() && data == self.resume.as_slice() {
            FlowAction::Resume
        } else {
            FlowAction::Forward
        }
    }
}

impl Default for FlowControl {
    fn default() -> Self {
        Self::new(false, DEFAULT_PAUSE, DEFAULT_RESUME)
    }
}
