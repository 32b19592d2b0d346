use std::sync::{Arc, Mutex, Weak};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use super::{Debouncer, SyncConfig};
use crate::channel::ChannelHandle;
use crate::editor::{ChangeOrigin, EditorSurface};
use crate::protocol::{ChannelMessage, WhiteboardTarget};
use crate::session::{ActionTag, SessionHandle};

/// Keeps one editor surface and one whiteboard in step over a shared channel
///
/// Local keystrokes are sent as debounced `CODE_CHANGE` messages. Inbound
/// `CODE_CHANGE` messages for the bound whiteboard are written straight into
/// the editor; the action tag is set before the write so the change
/// notification the write triggers is recognized and not sent back.
pub struct LiveEditSynchronizer {
    session: SessionHandle,
    channel: ChannelHandle,
    editor: Arc<dyn EditorSurface>,
    target: WhiteboardTarget,
    debouncer: Debouncer<String>,
    apply_lock: Mutex<()>,
}

impl LiveEditSynchronizer {
    /// Bind `editor` to the whiteboard at `target`
    ///
    /// The editor is loaded with the session's current text and its change
    /// listener is replaced by the synchronizer.
    pub fn attach(
        session: SessionHandle,
        channel: ChannelHandle,
        editor: Arc<dyn EditorSurface>,
        target: WhiteboardTarget,
        config: &SyncConfig,
    ) -> Arc<Self> {
        let target = target.relative_to(session.user_id());

        let debouncer = {
            let session = session.clone();
            let channel = channel.clone();
            let target = target.clone();
            Debouncer::new(config.debounce_window, move |code: String| {
                send_code(&session, &channel, &target, &code);
            })
        };

        editor.set_content(&session.code(&target));

        let synchronizer = Arc::new(Self {
            session,
            channel,
            editor,
            target,
            debouncer,
            apply_lock: Mutex::new(()),
        });

        let weak: Weak<Self> = Arc::downgrade(&synchronizer);
        synchronizer
            .editor
            .set_change_listener(Arc::new(move |text: &str, origin: ChangeOrigin| {
                if let Some(synchronizer) = weak.upgrade() {
                    synchronizer.on_local_change(text, origin);
                }
            }));

        info!(
            "Attached synchronizer for '{}' on whiteboard '{}' (debounce {:?})",
            synchronizer.session.user_id(),
            synchronizer.target,
            synchronizer.debouncer.window()
        );
        synchronizer
    }

    /// Whiteboard this synchronizer is bound to
    pub fn target(&self) -> &WhiteboardTarget {
        &self.target
    }

    pub fn session(&self) -> &SessionHandle {
        &self.session
    }

    /// Check if a debounced send is waiting
    pub fn has_pending_send(&self) -> bool {
        self.debouncer.is_pending()
    }

    /// Send the pending edit now instead of waiting for the window
    pub fn flush(&self) -> bool {
        self.debouncer.flush()
    }

    /// Handle a content change reported by the editor
    ///
    /// The text always reaches the session. Returns true if a send was
    /// scheduled.
    pub fn on_local_change(&self, text: &str, origin: ChangeOrigin) -> bool {
        let tag = self.session.action_tag(&self.target);

        if tag == ActionTag::AwaitingRemoteApply {
            self.session.apply_remote_code(&self.target, text);
        } else {
            self.session.record_local_change(&self.target, text);
        }

        if origin != ChangeOrigin::Input || !tag.allows_outbound() {
            trace!(
                "Not sending {:?} change on '{}' (tag: {})",
                origin,
                self.target,
                tag
            );
            return false;
        }

        if !self.session.can_edit(&self.target) {
            debug!("Whiteboard '{}' is locked, keeping edit local", self.target);
            return false;
        }

        if !self.channel.is_open() {
            debug!(
                "Channel {}, keeping edit on '{}' local",
                self.channel.ready_state(),
                self.target
            );
            return false;
        }

        self.session.transition(&self.target, ActionTag::mark_user_edit);
        self.debouncer.schedule(text.to_string());
        true
    }

    /// Handle a message received on the channel
    ///
    /// Returns true if the message text was applied to the editor.
    pub fn on_remote_message(&self, message: &ChannelMessage) -> bool {
        if !message.is_code_change() {
            return false;
        }

        if message.user_id == self.session.user_id() {
            trace!("Ignoring relayed copy of our own change");
            return false;
        }

        let Some(target) = message.whiteboard_target() else {
            debug!("Ignoring code change without a valid whiteboard address");
            return false;
        };
        if target.relative_to(self.session.user_id()) != self.target {
            return false;
        }

        let Some(value) = message.value.as_deref() else {
            debug!("Ignoring code change without a value");
            return false;
        };

        debug!(
            "Applying code change from '{}' to '{}'",
            message.user_id, self.target
        );
        self.apply_remote(value);
        true
    }

    /// Reload the editor from the session's copy of the whiteboard
    pub fn resync_from_session(&self) {
        let code = self.session.code(&self.target);
        self.apply_remote(&code);
    }

    /// Drive `on_remote_message` from an inbound subscription
    ///
    /// The task ends when the channel closes or the synchronizer is dropped.
    pub fn spawn_remote_listener(
        self: &Arc<Self>,
        mut receiver: broadcast::Receiver<ChannelMessage>,
    ) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(message) => {
                        let Some(synchronizer) = weak.upgrade() else {
                            break;
                        };
                        synchronizer.on_remote_message(&message);
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(
                            "Remote listener lagged behind, skipped {} messages. Continuing...",
                            skipped
                        );
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            debug!("Remote listener ended");
        })
    }

    fn apply_remote(&self, value: &str) {
        let _guard = self.apply_lock.lock();

        // The inbound text replaces whatever was waiting to be sent
        self.debouncer.cancel();

        self.session.transition(&self.target, ActionTag::mark_remote_sync_start);
        self.editor.set_content(value);
        self.session.transition(&self.target, ActionTag::mark_remote_sync_done);
    }
}

impl Drop for LiveEditSynchronizer {
    fn drop(&mut self) {
        self.editor.clear_change_listener();
        self.debouncer.cancel();
        self.session.transition(&self.target, ActionTag::mark_send_complete);
    }
}

/// Fire a debounced send, skipping it if the channel closed meanwhile
fn send_code(
    session: &SessionHandle,
    channel: &ChannelHandle,
    target: &WhiteboardTarget,
    code: &str,
) {
    if channel.is_open() {
        match channel.send(session.code_change_message(target, code)) {
            Ok(()) => debug!("Sent code change for '{}'", target),
            Err(e) => debug!("Dropping code change for '{}': {}", target, e),
        }
    } else {
        debug!(
            "Channel {}, dropping code change for '{}'",
            channel.ready_state(),
            target
        );
    }
    session.transition(target, ActionTag::mark_send_complete);
}
