//! # classroom-sync - Live edits for shared classroom whiteboards
//!
//! Keeps a code editor and a classroom channel in step: local keystrokes are
//! debounced into `CODE_CHANGE` messages, inbound `CODE_CHANGE` messages from
//! other participants are applied to the editor, and programmatic updates are
//! never echoed back out.
//!
//! The `client` feature adds a WebSocket channel, the `axum` feature adds the
//! relay that routes messages between a teacher and their students.

pub mod channel;
pub mod editor;
pub mod error;
pub mod protocol;
pub mod session;
pub mod sync;

#[cfg(feature = "axum")]
pub mod server;

// Re-exports for convenience
pub use channel::{ChannelHandle, ReadyState, WireFormat};
pub use editor::{BufferEditor, ChangeOrigin, EditorSurface};
pub use error::{SyncError, SyncResult};
pub use protocol::{
    Action, Assignment, AssignmentStatus, ChannelMessage, ClassroomRole, Grading, UserAssignment,
    WhiteboardTarget, WhiteboardType,
};
pub use session::{ActionTag, ClassroomSession, SessionEvent, SessionHandle};
pub use sync::{LiveEditSynchronizer, SyncConfig};

#[cfg(feature = "client")]
pub use channel::{ClassroomClient, ClientConfig};

#[cfg(feature = "axum")]
pub use server::{router_with_relay, router_with_relay_state, ClassroomRegistry, RelayState};
