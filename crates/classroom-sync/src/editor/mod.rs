//! Editing surfaces that a synchronizer can drive
//!
//! A surface reports every content change to its listener synchronously,
//! before `set_content` or the keystroke that caused it returns.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tracing::debug;

/// What caused an editor content change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOrigin {
    /// Typed by the user
    Input,
    /// Written programmatically through `set_content`
    SetValue,
}

/// Callback invoked on every content change
pub type ChangeListener = Arc<dyn Fn(&str, ChangeOrigin) + Send + Sync>;

/// A text surface the user edits
pub trait EditorSurface: Send + Sync {
    /// Current text
    fn content(&self) -> String;

    /// Replace the text, notifying the listener with `ChangeOrigin::SetValue`
    fn set_content(&self, text: &str);

    /// Install the change listener, replacing any previous one
    fn set_change_listener(&self, listener: ChangeListener);

    /// Remove the change listener
    fn clear_change_listener(&self);

    fn is_editable(&self) -> bool;

    fn set_editable(&self, editable: bool);
}

/// In-memory editing surface
pub struct BufferEditor {
    content: Mutex<String>,
    editable: AtomicBool,
    listener: RwLock<Option<ChangeListener>>,
}

impl BufferEditor {
    pub fn new(initial: impl Into<String>) -> Self {
        Self {
            content: Mutex::new(initial.into()),
            editable: AtomicBool::new(true),
            listener: RwLock::new(None),
        }
    }

    /// Simulate the user replacing the text with `text`
    ///
    /// Returns false when the surface is read-only.
    pub fn type_text(&self, text: &str) -> bool {
        if !self.is_editable() {
            debug!("Ignoring keystroke on read-only editor");
            return false;
        }
        self.replace(text, ChangeOrigin::Input);
        true
    }

    fn replace(&self, text: &str, origin: ChangeOrigin) {
        if let Ok(mut content) = self.content.lock() {
            *content = text.to_string();
        }

        // Clone the listener out so it can call back into the editor
        let listener = self
            .listener
            .read()
            .ok()
            .and_then(|listener| listener.clone());
        if let Some(listener) = listener {
            listener(text, origin);
        }
    }
}

impl Default for BufferEditor {
    fn default() -> Self {
        Self::new(String::new())
    }
}

impl EditorSurface for BufferEditor {
    fn content(&self) -> String {
        self.content
            .lock()
            .map(|content| content.clone())
            .unwrap_or_default()
    }

    fn set_content(&self, text: &str) {
        self.replace(text, ChangeOrigin::SetValue);
    }

    fn set_change_listener(&self, listener: ChangeListener) {
        if let Ok(mut slot) = self.listener.write() {
            *slot = Some(listener);
        }
    }

    fn clear_change_listener(&self) {
        if let Ok(mut slot) = self.listener.write() {
            *slot = None;
        }
    }

    fn is_editable(&self) -> bool {
        self.editable.load(Ordering::Acquire)
    }

    fn set_editable(&self, editable: bool) {
        self.editable.store(editable, Ordering::Release);
    }
}
