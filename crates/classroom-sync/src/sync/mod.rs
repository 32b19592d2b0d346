use std::time::Duration;

pub mod debounce;
pub mod synchronizer;

pub use debounce::Debouncer;
pub use synchronizer::LiveEditSynchronizer;

/// Quiet period before a burst of local edits is sent
pub const DEFAULT_DEBOUNCE_WINDOW: Duration = Duration::from_millis(100);

/// Settings for a live edit synchronizer
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub debounce_window: Duration,
}

impl SyncConfig {
    /// Set the quiet period for outbound sends
    pub fn with_debounce_window(mut self, window: Duration) -> Self {
        self.debounce_window = window;
        self
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            debounce_window: DEFAULT_DEBOUNCE_WINDOW,
        }
    }
}
