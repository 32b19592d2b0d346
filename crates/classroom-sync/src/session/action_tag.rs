use std::fmt;

/// Cause of the most recent whiteboard mutation
///
/// The tag moves through three states:
///
/// ```text
///   Idle --mark_remote_sync_start--> AwaitingRemoteApply --mark_remote_sync_done--> Idle
///   Idle --mark_user_edit--> UserEditing --mark_send_complete--> Idle
/// ```
///
/// While the tag is `AwaitingRemoteApply` every change notification comes from
/// applying inbound text and must not be sent back over the channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ActionTag {
    /// Nothing in flight, last sync completed
    #[default]
    Idle,
    /// Inbound text is being written to the editor
    AwaitingRemoteApply,
    /// A local edit is waiting for its debounced send
    UserEditing,
}

impl ActionTag {
    /// Inbound text is about to be applied, must happen before the mutation
    pub fn mark_remote_sync_start(self) -> ActionTag {
        ActionTag::AwaitingRemoteApply
    }

    /// The editor now holds the inbound text
    pub fn mark_remote_sync_done(self) -> ActionTag {
        match self {
            ActionTag::AwaitingRemoteApply => ActionTag::Idle,
            other => other,
        }
    }

    /// A genuine keystroke was accepted for sending
    ///
    /// Has no effect while a remote apply is in progress.
    pub fn mark_user_edit(self) -> ActionTag {
        match self {
            ActionTag::AwaitingRemoteApply => ActionTag::AwaitingRemoteApply,
            _ => ActionTag::UserEditing,
        }
    }

    /// The debounced send fired or was dropped
    pub fn mark_send_complete(self) -> ActionTag {
        match self {
            ActionTag::UserEditing => ActionTag::Idle,
            other => other,
        }
    }

    /// Whether a change observed in this state may be sent over the channel
    pub fn allows_outbound(self) -> bool {
        self != ActionTag::AwaitingRemoteApply
    }
}

impl fmt::Display for ActionTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ActionTag::Idle => "idle",
            ActionTag::AwaitingRemoteApply => "remote_sync",
            ActionTag::UserEditing => "user_edit",
        };
        f.write_str(name)
    }
}
