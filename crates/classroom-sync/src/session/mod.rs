pub mod action_tag;
pub mod classroom;
pub mod whiteboard;

pub use action_tag::ActionTag;
pub use classroom::{ChangeSource, ClassroomSession, SessionEvent, SessionHandle};
pub use whiteboard::{Whiteboard, WhiteboardHandle, DEFAULT_CODE};
