use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::protocol::{WhiteboardTarget, WhiteboardType};

/// Text every new whiteboard starts with
pub const DEFAULT_CODE: &str = "print(\"Hello world!\")";

/// A block of source text shown on one board
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Whiteboard {
    pub whiteboard_type: WhiteboardType,
    pub code: String,
}

impl Whiteboard {
    pub fn new(whiteboard_type: WhiteboardType) -> Self {
        Self::with_code(whiteboard_type, DEFAULT_CODE)
    }

    pub fn with_code(whiteboard_type: WhiteboardType, code: impl Into<String>) -> Self {
        Self {
            whiteboard_type,
            code: code.into(),
        }
    }
}

struct LiveWhiteboard {
    target: WhiteboardTarget,
    code: Mutex<String>,
    unsaved: AtomicBool,
}

/// A thread-safe handle to a whiteboard owned by a classroom session
///
/// Clones share the same text; reading `code()` always returns the latest
/// value without going through the session.
#[derive(Clone)]
pub struct WhiteboardHandle {
    inner: Arc<LiveWhiteboard>,
}

impl WhiteboardHandle {
    pub(crate) fn new(target: WhiteboardTarget, code: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(LiveWhiteboard {
                target,
                code: Mutex::new(code.into()),
                unsaved: AtomicBool::new(false),
            }),
        }
    }

    /// Get the whiteboard address
    pub fn target(&self) -> &WhiteboardTarget {
        &self.inner.target
    }

    /// Current text
    pub fn code(&self) -> String {
        self.inner
            .code
            .lock()
            .map(|code| code.clone())
            .unwrap_or_default()
    }

    /// Replace the text, returns true if it changed
    pub(crate) fn set_code(&self, code: &str) -> bool {
        match self.inner.code.lock() {
            Ok(mut current) if current.as_str() != code => {
                *current = code.to_string();
                true
            }
            _ => false,
        }
    }

    /// Check if the board has local edits not yet saved
    pub fn has_unsaved_changes(&self) -> bool {
        self.inner.unsaved.load(Ordering::Acquire)
    }

    pub(crate) fn mark_unsaved(&self) {
        self.inner.unsaved.store(true, Ordering::Release);
    }

    /// Mark the board as saved
    pub fn mark_saved(&self) {
        self.inner.unsaved.store(false, Ordering::Release);
    }

    /// Snapshot as a plain whiteboard
    pub fn to_whiteboard(&self) -> Whiteboard {
        Whiteboard::with_code(self.target().whiteboard_type(), self.code())
    }
}
