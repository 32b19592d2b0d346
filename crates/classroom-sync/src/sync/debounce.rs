use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::trace;

struct DebounceState<T> {
    pending: Option<T>,
    timer: Option<JoinHandle<()>>,
    generation: u64,
}

type Sink<T> = Arc<dyn Fn(T) + Send + Sync>;

/// A cancellable trailing-edge timer
///
/// Every `schedule` call replaces the pending value and restarts the quiet
/// window. The sink receives the latest value once the window elapses with
/// no further calls. Each instance owns its own timer.
pub struct Debouncer<T: Send + 'static> {
    window: Duration,
    state: Arc<Mutex<DebounceState<T>>>,
    sink: Sink<T>,
}

impl<T: Send + 'static> Debouncer<T> {
    pub fn new(window: Duration, sink: impl Fn(T) + Send + Sync + 'static) -> Self {
        Self {
            window,
            state: Arc::new(Mutex::new(DebounceState {
                pending: None,
                timer: None,
                generation: 0,
            })),
            sink: Arc::new(sink),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Replace the pending value and restart the window
    ///
    /// Must be called from within a tokio runtime.
    pub fn schedule(&self, value: T) {
        let Ok(mut state) = self.state.lock() else {
            return;
        };

        state.pending = Some(value);
        state.generation += 1;
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }

        let generation = state.generation;
        let window = self.window;
        let shared = self.state.clone();
        let sink = self.sink.clone();

        state.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(window).await;

            let value = match shared.lock() {
                // A newer schedule or a cancel owns the slot now
                Ok(mut state) if state.generation == generation => {
                    state.timer = None;
                    state.pending.take()
                }
                _ => None,
            };

            if let Some(value) = value {
                trace!("Debounce window of {:?} elapsed", window);
                sink(value);
            }
        }));
    }

    /// Drop the pending value without firing
    pub fn cancel(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.generation += 1;
            state.pending = None;
            if let Some(timer) = state.timer.take() {
                timer.abort();
            }
        }
    }

    /// Fire the pending value now, returns true if there was one
    pub fn flush(&self) -> bool {
        let value = match self.state.lock() {
            Ok(mut state) => {
                state.generation += 1;
                if let Some(timer) = state.timer.take() {
                    timer.abort();
                }
                state.pending.take()
            }
            Err(_) => None,
        };

        match value {
            Some(value) => {
                (self.sink)(value);
                true
            }
            None => false,
        }
    }

    /// Check if a value is waiting for its window to elapse
    pub fn is_pending(&self) -> bool {
        self.state
            .lock()
            .map(|state| state.pending.is_some())
            .unwrap_or(false)
    }
}

impl<T: Send + 'static> Drop for Debouncer<T> {
    fn drop(&mut self) {
        self.cancel();
    }
}
