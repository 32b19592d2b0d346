use dashmap::DashMap;
use std::collections::BTreeSet;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tracing::{debug, info, trace, warn};

use super::{ActionTag, WhiteboardHandle, DEFAULT_CODE};
use crate::protocol::{
    Action, Assignment, ChannelMessage, ClassroomRole, ClassroomSnapshot, Grading,
    UserAssignment, WhiteboardTarget,
};

/// Where a whiteboard change came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeSource {
    Local,
    Remote,
}

/// Notifications published by a classroom session
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    CodeChanged {
        target: WhiteboardTarget,
        code: String,
        source: ChangeSource,
    },
    RosterChanged {
        users: Vec<String>,
    },
    EditableChanged(bool),
    /// An assignment was handed out, submitted or graded
    AssignmentUpdated(UserAssignment),
    ClassroomDeleted,
}

/// Client-side state of one user inside one classroom
///
/// The session owns every whiteboard the user can see, the classroom roster
/// and, per whiteboard, the action tag that tells local edits apart from
/// applied remote text.
pub struct ClassroomSession {
    classroom_id: String,
    user_id: String,
    role: ClassroomRole,
    whiteboards: DashMap<WhiteboardTarget, WhiteboardHandle>,
    assignments: DashMap<WhiteboardTarget, UserAssignment>,
    roster: Mutex<BTreeSet<String>>,
    teacher: Mutex<Option<String>>,
    editable: AtomicBool,
    deleted: AtomicBool,
    action_tags: DashMap<WhiteboardTarget, ActionTag>,
    last_action: Mutex<Action>,
    event_tx: broadcast::Sender<SessionEvent>,
}

impl ClassroomSession {
    /// Create a new session for `user_id` in `classroom_id`
    pub fn new(
        classroom_id: impl Into<String>,
        user_id: impl Into<String>,
        role: ClassroomRole,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(256);
        let session = Self {
            classroom_id: classroom_id.into(),
            user_id: user_id.into(),
            role,
            whiteboards: DashMap::new(),
            assignments: DashMap::new(),
            roster: Mutex::new(BTreeSet::new()),
            teacher: Mutex::new(None),
            editable: AtomicBool::new(true),
            deleted: AtomicBool::new(false),
            action_tags: DashMap::new(),
            last_action: Mutex::new(Action::None),
            event_tx,
        };

        info!(
            "Created session for user '{}' in classroom '{}'",
            session.user_id, session.classroom_id
        );
        session
    }

    pub fn classroom_id(&self) -> &str {
        &self.classroom_id
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn role(&self) -> ClassroomRole {
        self.role
    }

    /// Get the whiteboard at `target`, creating it with the default text
    pub fn whiteboard(&self, target: &WhiteboardTarget) -> WhiteboardHandle {
        let target = self.normalize(target.clone());
        self.whiteboards
            .entry(target.clone())
            .or_insert_with(|| {
                debug!(
                    "Creating whiteboard '{}' in session of '{}'",
                    target, self.user_id
                );
                WhiteboardHandle::new(target.clone(), DEFAULT_CODE)
            })
            .clone()
    }

    /// Current text of the whiteboard at `target`
    pub fn code(&self, target: &WhiteboardTarget) -> String {
        self.whiteboard(target).code()
    }

    /// List the addresses of every known whiteboard
    pub fn list_whiteboards(&self) -> Vec<WhiteboardTarget> {
        self.whiteboards
            .iter()
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Latest known state of the assignment board at `target`
    pub fn assignment(&self, target: &WhiteboardTarget) -> Option<UserAssignment> {
        let target = self.normalize(target.clone());
        self.assignments.get(&target).map(|work| work.value().clone())
    }

    /// Every assignment this session has heard of
    pub fn assignments(&self) -> Vec<UserAssignment> {
        self.assignments
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Record text produced by the local editor
    ///
    /// The board is marked as having unsaved changes.
    pub fn record_local_change(&self, target: &WhiteboardTarget, code: &str) {
        let board = self.whiteboard(target);
        if board.set_code(code) {
            board.mark_unsaved();
        }
        self.publish(SessionEvent::CodeChanged {
            target: board.target().clone(),
            code: code.to_string(),
            source: ChangeSource::Local,
        });
    }

    /// Record text received from the channel
    pub fn apply_remote_code(&self, target: &WhiteboardTarget, code: &str) {
        let board = self.whiteboard(target);
        if board.set_code(code) {
            self.publish(SessionEvent::CodeChanged {
                target: board.target().clone(),
                code: code.to_string(),
                source: ChangeSource::Remote,
            });
        }
    }

    pub fn has_unsaved_changes(&self, target: &WhiteboardTarget) -> bool {
        self.whiteboard(target).has_unsaved_changes()
    }

    pub fn mark_saved(&self, target: &WhiteboardTarget) {
        self.whiteboard(target).mark_saved()
    }

    /// Current action tag of the whiteboard at `target`
    pub fn action_tag(&self, target: &WhiteboardTarget) -> ActionTag {
        let target = self.normalize(target.clone());
        self.action_tags
            .get(&target)
            .map(|tag| *tag)
            .unwrap_or_default()
    }

    /// Apply one action tag transition to the whiteboard at `target`
    ///
    /// The step runs under the entry lock; returns the new tag.
    pub fn transition(
        &self,
        target: &WhiteboardTarget,
        step: fn(ActionTag) -> ActionTag,
    ) -> ActionTag {
        let target = self.normalize(target.clone());
        let mut tag = self.action_tags.entry(target.clone()).or_default();
        let next = step(*tag);
        if next != *tag {
            trace!(
                "Action tag of '{}' on '{}' moved {} -> {}",
                self.user_id,
                target,
                *tag,
                next
            );
        }
        *tag = next;
        next
    }

    /// Action of the last message handled by this session
    pub fn last_action(&self) -> Action {
        self.last_action
            .lock()
            .map(|action| *action)
            .unwrap_or(Action::None)
    }

    /// Other online users in the classroom
    pub fn roster(&self) -> Vec<String> {
        self.roster
            .lock()
            .map(|roster| roster.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn teacher(&self) -> Option<String> {
        self.teacher.lock().ok().and_then(|teacher| teacher.clone())
    }

    /// Whether students may edit the shared board
    pub fn is_editable(&self) -> bool {
        self.editable.load(Ordering::Acquire)
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted.load(Ordering::Acquire)
    }

    /// Whether the local user may change the whiteboard at `target`
    pub fn can_edit(&self, target: &WhiteboardTarget) -> bool {
        if self.is_deleted() {
            return false;
        }
        match (self.role, target) {
            (ClassroomRole::Student, WhiteboardTarget::Public) => self.is_editable(),
            _ => true,
        }
    }

    /// Subscribe to session events
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.event_tx.subscribe()
    }

    /// Update session state from a message received on the channel
    ///
    /// Returns false when the message was ignored.
    pub fn handle_server_message(&self, message: &ChannelMessage) -> bool {
        let handled = match message.action {
            Action::SyncData => self.apply_snapshot(message),
            Action::Join => match joined_user(message) {
                Some(user) if user != self.user_id => {
                    if joined_role(message) == Some(ClassroomRole::Teacher) {
                        debug!("Teacher '{}' joined classroom '{}'", user, self.classroom_id);
                        self.set_teacher(Some(user));
                    } else {
                        self.update_roster(|roster| {
                            roster.insert(user);
                        });
                    }
                    true
                }
                _ => false,
            },
            Action::Leave => match joined_user(message) {
                Some(user) => {
                    if self.teacher().as_deref() == Some(user.as_str()) {
                        self.set_teacher(None);
                    }
                    self.update_roster(|roster| {
                        roster.remove(&user);
                    });
                    true
                }
                None => false,
            },
            Action::LockCode | Action::UnlockCode => {
                let editable = message.action == Action::UnlockCode;
                self.editable.store(editable, Ordering::Release);
                self.publish(SessionEvent::EditableChanged(editable));
                true
            }
            Action::ClassroomDeleted => {
                self.deleted.store(true, Ordering::Release);
                info!("Classroom '{}' was deleted", self.classroom_id);
                self.publish(SessionEvent::ClassroomDeleted);
                true
            }
            Action::CodeChange | Action::GetData => {
                if message.action == Action::CodeChange && message.user_id == self.user_id {
                    false
                } else {
                    match (message.whiteboard_target(), message.value.as_deref()) {
                        (Some(target), Some(code)) => {
                            self.apply_remote_code(&target, code);
                            true
                        }
                        _ => {
                            debug!(
                                "Ignoring {} message without whiteboard text",
                                message.action
                            );
                            false
                        }
                    }
                }
            }
            Action::AssignmentCreate | Action::SubmitAssignment | Action::GradeAssignment => {
                self.apply_assignment(message)
            }
            Action::Error => {
                warn!(
                    "Classroom '{}' reported an error: {}",
                    self.classroom_id,
                    message.value.as_deref().unwrap_or("unknown")
                );
                true
            }
            _ => false,
        };

        if handled {
            if let Ok(mut last_action) = self.last_action.lock() {
                *last_action = message.action;
            }
        }
        handled
    }

    /// Message announcing the local user to the classroom
    pub fn join_message(&self) -> ChannelMessage {
        let action = match self.role {
            ClassroomRole::Teacher => Action::TeacherJoin,
            ClassroomRole::Student => Action::Join,
        };
        ChannelMessage::new(action, self.user_id.clone())
    }

    pub fn leave_message(&self) -> ChannelMessage {
        ChannelMessage::new(Action::Leave, self.user_id.clone())
    }

    /// Code change carrying `code` for the whiteboard at `target`
    pub fn code_change_message(&self, target: &WhiteboardTarget, code: &str) -> ChannelMessage {
        ChannelMessage::code_change(self.user_id.clone(), target, code)
    }

    /// Request for the current text of the whiteboard at `target`
    pub fn get_data_message(&self, target: &WhiteboardTarget) -> ChannelMessage {
        ChannelMessage::new(Action::GetData, self.user_id.clone()).with_target(target)
    }

    /// Lock or unlock the shared board for students
    pub fn lock_message(&self, locked: bool) -> ChannelMessage {
        let action = if locked {
            Action::LockCode
        } else {
            Action::UnlockCode
        };
        ChannelMessage::new(action, self.user_id.clone())
    }

    /// Hand out a new assignment to every student
    pub fn assignment_create_message(&self, assignment: &Assignment) -> ChannelMessage {
        let mut message = ChannelMessage::new(Action::AssignmentCreate, self.user_id.clone())
            .with_target(&WhiteboardTarget::assignment(assignment.name.clone()));
        message.data = serde_json::to_value(assignment).ok();
        message
    }

    /// Hand in the local user's assignment `name`
    pub fn submit_message(&self, name: &str) -> ChannelMessage {
        ChannelMessage::new(Action::SubmitAssignment, self.user_id.clone())
            .with_target(&WhiteboardTarget::assignment(name))
    }

    /// Grade `student`'s assignment `name`
    pub fn grade_message(&self, student: &str, name: &str, grading: &Grading) -> ChannelMessage {
        let target = WhiteboardTarget::Assignment {
            name: name.to_string(),
            owner: Some(student.to_string()),
        };
        let mut message =
            ChannelMessage::new(Action::GradeAssignment, self.user_id.clone()).with_target(&target);
        message.data = serde_json::to_value(grading).ok();
        message
    }

    fn normalize(&self, target: WhiteboardTarget) -> WhiteboardTarget {
        target.relative_to(&self.user_id)
    }

    fn apply_snapshot(&self, message: &ChannelMessage) -> bool {
        let Some(data) = message.data.clone() else {
            debug!("Ignoring SYNC_DATA without payload");
            return false;
        };
        let snapshot: ClassroomSnapshot = match serde_json::from_value(data) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!("Ignoring malformed SYNC_DATA payload: {}", e);
                return false;
            }
        };

        self.set_teacher(snapshot.teacher.clone());
        self.editable.store(snapshot.editable, Ordering::Release);
        if let Some(code) = &snapshot.shared_whiteboard {
            self.apply_remote_code(&WhiteboardTarget::Public, code);
        }
        if let Some(code) = &snapshot.personal_whiteboard {
            self.apply_remote_code(&WhiteboardTarget::Private { owner: None }, code);
        }
        for work in &snapshot.assignments {
            let target = self.normalize(work.target());
            self.apply_remote_code(&target, &work.code);
            self.assignments.insert(target, work.clone());
        }

        let user_id = self.user_id.clone();
        self.update_roster(|roster| {
            roster.clear();
            roster.extend(snapshot.users.into_iter().filter(|user| *user != user_id));
        });
        true
    }

    /// Track an assignment carried in the payload of an assignment message
    ///
    /// A newly created assignment also seeds the text of its board.
    fn apply_assignment(&self, message: &ChannelMessage) -> bool {
        let payload = message.data.clone().map(serde_json::from_value::<UserAssignment>);
        let work = match payload {
            Some(Ok(work)) => work,
            _ => {
                debug!(
                    "Ignoring {} without a student assignment payload",
                    message.action
                );
                return false;
            }
        };

        let target = self.normalize(work.target());
        if message.action == Action::AssignmentCreate {
            self.apply_remote_code(&target, &work.code);
        }
        debug!(
            "Assignment '{}' of '{}' is now {:?}",
            work.name(),
            work.user_id,
            work.status
        );
        self.assignments.insert(target, work.clone());
        self.publish(SessionEvent::AssignmentUpdated(work));
        true
    }

    fn set_teacher(&self, user: Option<String>) {
        if let Ok(mut teacher) = self.teacher.lock() {
            *teacher = user;
        }
    }

    fn update_roster(&self, update: impl FnOnce(&mut BTreeSet<String>)) {
        let users = match self.roster.lock() {
            Ok(mut roster) => {
                update(&mut roster);
                roster.iter().cloned().collect()
            }
            Err(_) => return,
        };
        self.publish(SessionEvent::RosterChanged { users });
    }

    fn publish(&self, event: SessionEvent) {
        if self.event_tx.send(event).is_err() {
            trace!("No session event subscribers for '{}'", self.user_id);
        }
    }
}

/// User a JOIN or LEAVE message is about
fn joined_user(message: &ChannelMessage) -> Option<String> {
    message
        .data
        .as_ref()
        .and_then(|data| data.get("user_id"))
        .and_then(|user| user.as_str())
        .map(str::to_string)
        .or_else(|| (!message.user_id.is_empty()).then(|| message.user_id.clone()))
}

/// Role announced with a JOIN, if any
fn joined_role(message: &ChannelMessage) -> Option<ClassroomRole> {
    message
        .data
        .as_ref()
        .and_then(|data| data.get("role"))
        .and_then(|role| serde_json::from_value(role.clone()).ok())
}

/// A thread-safe handle to a classroom session
#[derive(Clone)]
pub struct SessionHandle {
    inner: Arc<ClassroomSession>,
}

impl SessionHandle {
    pub fn new(session: ClassroomSession) -> Self {
        Self {
            inner: Arc::new(session),
        }
    }
}

impl Deref for SessionHandle {
    type Target = ClassroomSession;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn student_session() -> ClassroomSession {
        ClassroomSession::new("42", "bob", ClassroomRole::Student)
    }

    #[test]
    fn test_session_creation() {
        let session = student_session();
        assert_eq!(session.classroom_id(), "42");
        assert_eq!(session.user_id(), "bob");
        assert_eq!(session.action_tag(&WhiteboardTarget::Public), ActionTag::Idle);
        assert_eq!(session.last_action(), Action::None);
        assert!(session.is_editable());
        assert!(session.list_whiteboards().is_empty());
    }

    #[test]
    fn test_whiteboards_start_with_default_code() {
        let session = student_session();
        assert_eq!(session.code(&WhiteboardTarget::Public), DEFAULT_CODE);
        assert_eq!(session.list_whiteboards(), vec![WhiteboardTarget::Public]);
    }

    #[test]
    fn test_own_private_board_is_normalized() {
        let session = student_session();
        session.record_local_change(&WhiteboardTarget::private_of("bob"), "mine");
        assert_eq!(
            session.code(&WhiteboardTarget::Private { owner: None }),
            "mine"
        );
    }

    #[test]
    fn test_local_change_marks_unsaved_remote_does_not() {
        let session = student_session();
        let target = WhiteboardTarget::Public;

        session.apply_remote_code(&target, "x = 1");
        assert!(!session.has_unsaved_changes(&target));

        session.record_local_change(&target, "x = 2");
        assert!(session.has_unsaved_changes(&target));

        session.mark_saved(&target);
        assert!(!session.has_unsaved_changes(&target));
    }

    #[tokio::test]
    async fn test_local_change_publishes_event() {
        let session = student_session();
        let mut events = session.subscribe();

        session.record_local_change(&WhiteboardTarget::Public, "abc");

        let event = events.recv().await.unwrap();
        assert_eq!(
            event,
            SessionEvent::CodeChanged {
                target: WhiteboardTarget::Public,
                code: "abc".to_string(),
                source: ChangeSource::Local,
            }
        );
    }

    #[test]
    fn test_transition_updates_tag() {
        let session = student_session();
        let target = WhiteboardTarget::Public;
        assert_eq!(
            session.transition(&target, ActionTag::mark_remote_sync_start),
            ActionTag::AwaitingRemoteApply
        );
        assert_eq!(session.action_tag(&target), ActionTag::AwaitingRemoteApply);
        assert_eq!(
            session.transition(&target, ActionTag::mark_remote_sync_done),
            ActionTag::Idle
        );
    }

    #[test]
    fn test_tags_are_kept_per_whiteboard() {
        let session = student_session();
        session.transition(&WhiteboardTarget::Public, ActionTag::mark_remote_sync_start);

        assert_eq!(
            session.action_tag(&WhiteboardTarget::Private { owner: None }),
            ActionTag::Idle
        );
        // Own board addressed by owner id is the same board
        session.transition(&WhiteboardTarget::private_of("bob"), ActionTag::mark_user_edit);
        assert_eq!(
            session.action_tag(&WhiteboardTarget::Private { owner: None }),
            ActionTag::UserEditing
        );
        assert_eq!(
            session.action_tag(&WhiteboardTarget::Public),
            ActionTag::AwaitingRemoteApply
        );
    }

    #[test]
    fn test_sync_data_populates_session() {
        let session = student_session();
        let message = ChannelMessage::new(Action::SyncData, "").with_data(json!({
            "users": ["alice", "bob"],
            "teacher": "ms-smith",
            "editable": false,
            "shared_whiteboard": "shared = True",
            "personal_whiteboard": "mine = True"
        }));

        assert!(session.handle_server_message(&message));
        assert_eq!(session.roster(), vec!["alice".to_string()]);
        assert_eq!(session.teacher().as_deref(), Some("ms-smith"));
        assert!(!session.is_editable());
        assert_eq!(session.code(&WhiteboardTarget::Public), "shared = True");
        assert_eq!(
            session.code(&WhiteboardTarget::Private { owner: None }),
            "mine = True"
        );
        assert_eq!(session.last_action(), Action::SyncData);
    }

    #[test]
    fn test_malformed_sync_data_is_ignored() {
        let session = student_session();
        let message = ChannelMessage::new(Action::SyncData, "").with_data(json!({"users": 7}));
        assert!(!session.handle_server_message(&message));
        assert_eq!(session.last_action(), Action::None);
    }

    #[test]
    fn test_join_and_leave_update_roster() {
        let session = student_session();

        session.handle_server_message(&ChannelMessage::new(Action::Join, "alice"));
        session.handle_server_message(
            &ChannelMessage::new(Action::Join, "").with_data(json!({"user_id": "carol"})),
        );
        assert_eq!(session.roster(), vec!["alice".to_string(), "carol".to_string()]);

        session.handle_server_message(&ChannelMessage::new(Action::Leave, "alice"));
        assert_eq!(session.roster(), vec!["carol".to_string()]);

        // Our own join is not part of the roster
        assert!(!session.handle_server_message(&ChannelMessage::new(Action::Join, "bob")));
    }

    #[test]
    fn test_teacher_join_announcement_sets_teacher() {
        let session = student_session();
        let announcement = ChannelMessage::new(Action::Join, "ms-smith")
            .with_data(json!({ "user_id": "ms-smith", "role": "teacher" }));

        assert!(session.handle_server_message(&announcement));
        assert_eq!(session.teacher().as_deref(), Some("ms-smith"));
        assert!(session.roster().is_empty());

        session.handle_server_message(
            &ChannelMessage::new(Action::Join, "alice")
                .with_data(json!({ "user_id": "alice", "role": "student" })),
        );
        assert_eq!(session.roster(), vec!["alice".to_string()]);

        session.handle_server_message(
            &ChannelMessage::new(Action::Leave, "ms-smith")
                .with_data(json!({ "user_id": "ms-smith" })),
        );
        assert_eq!(session.teacher(), None);
        assert_eq!(session.roster(), vec!["alice".to_string()]);
    }

    #[tokio::test]
    async fn test_assignment_create_seeds_board() {
        let session = student_session();
        let mut events = session.subscribe();
        let work = UserAssignment::new("bob", Assignment::new("loops", "Count", "for i in x:"));
        let message = ChannelMessage::new(Action::AssignmentCreate, "ms-smith")
            .with_target(&work.target())
            .with_value(work.code.clone())
            .with_data(serde_json::to_value(&work).unwrap());

        assert!(session.handle_server_message(&message));

        let own = WhiteboardTarget::assignment("loops");
        assert_eq!(session.code(&own), "# Count\n\nfor i in x:\n");
        assert!(!session.has_unsaved_changes(&own));
        assert_eq!(session.assignment(&own), Some(work.clone()));

        let mut updated = None;
        while let Ok(event) = events.try_recv() {
            if let SessionEvent::AssignmentUpdated(work) = event {
                updated = Some(work);
            }
        }
        assert_eq!(updated, Some(work));
    }

    #[test]
    fn test_grade_updates_assignment_not_board() {
        let session = student_session();
        let own = WhiteboardTarget::assignment("loops");
        session.record_local_change(&own, "draft");

        let mut work = UserAssignment::new("bob", Assignment::new("loops", "", "pass"));
        work.grade(&Grading {
            grade: Some(5),
            feedback: None,
            status: crate::protocol::AssignmentStatus::Completed,
        });
        let message = ChannelMessage::new(Action::GradeAssignment, "ms-smith")
            .with_target(&work.target())
            .with_data(serde_json::to_value(&work).unwrap());

        assert!(session.handle_server_message(&message));
        assert_eq!(session.assignment(&own).unwrap().grade, Some(5));
        assert_eq!(session.code(&own), "draft");
    }

    #[test]
    fn test_teacher_keeps_assignments_per_student() {
        let session = ClassroomSession::new("42", "ms-smith", ClassroomRole::Teacher);
        for student in ["alice", "bob"] {
            let work = UserAssignment::new(student, Assignment::new("loops", "", "pass"));
            let submission = ChannelMessage::new(Action::SubmitAssignment, student)
                .with_target(&work.target())
                .with_data(serde_json::to_value(&work).unwrap());
            assert!(session.handle_server_message(&submission));
        }

        assert_eq!(session.assignments().len(), 2);
        let bob = WhiteboardTarget::Assignment {
            name: "loops".to_string(),
            owner: Some("bob".to_string()),
        };
        assert_eq!(session.assignment(&bob).unwrap().user_id, "bob");

        // The summary sent back to the teacher is not a student assignment
        let summary = ChannelMessage::new(Action::AssignmentCreate, "ms-smith")
            .with_data(json!({ "assignment": { "name": "loops" }, "students": ["alice"] }));
        assert!(!session.handle_server_message(&summary));
    }

    #[test]
    fn test_lock_blocks_students_on_public_board() {
        let session = student_session();
        assert!(session.can_edit(&WhiteboardTarget::Public));

        session.handle_server_message(&ChannelMessage::new(Action::LockCode, "ms-smith"));
        assert!(!session.can_edit(&WhiteboardTarget::Public));
        assert!(session.can_edit(&WhiteboardTarget::Private { owner: None }));

        session.handle_server_message(&ChannelMessage::new(Action::UnlockCode, "ms-smith"));
        assert!(session.can_edit(&WhiteboardTarget::Public));
    }

    #[test]
    fn test_teacher_ignores_lock() {
        let session = ClassroomSession::new("42", "ms-smith", ClassroomRole::Teacher);
        session.handle_server_message(&ChannelMessage::new(Action::LockCode, "ms-smith"));
        assert!(session.can_edit(&WhiteboardTarget::Public));
    }

    #[test]
    fn test_deleted_classroom_blocks_edits() {
        let session = student_session();
        session.handle_server_message(&ChannelMessage::new(Action::ClassroomDeleted, ""));
        assert!(session.is_deleted());
        assert!(!session.can_edit(&WhiteboardTarget::Private { owner: None }));
    }

    #[test]
    fn test_remote_code_change_updates_board() {
        let session = ClassroomSession::new("42", "ms-smith", ClassroomRole::Teacher);
        let target = WhiteboardTarget::private_of("bob");
        let message = ChannelMessage::code_change("bob", &target, "print(1)");

        assert!(session.handle_server_message(&message));
        assert_eq!(session.code(&target), "print(1)");
        assert!(!session.has_unsaved_changes(&target));
    }

    #[test]
    fn test_own_code_change_is_ignored() {
        let session = student_session();
        let message = ChannelMessage::code_change("bob", &WhiteboardTarget::Public, "echo");
        assert!(!session.handle_server_message(&message));
        assert_eq!(session.code(&WhiteboardTarget::Public), DEFAULT_CODE);
    }

    #[test]
    fn test_get_data_fills_requested_board() {
        let session = student_session();
        let message = ChannelMessage::new(Action::GetData, "")
            .with_target(&WhiteboardTarget::assignment("loops"))
            .with_value("for i in range(3): pass");

        assert!(session.handle_server_message(&message));
        assert_eq!(
            session.code(&WhiteboardTarget::assignment("loops")),
            "for i in range(3): pass"
        );
    }

    #[test]
    fn test_outbound_message_builders() {
        let session = ClassroomSession::new("42", "ms-smith", ClassroomRole::Teacher);
        assert_eq!(session.join_message().action, Action::TeacherJoin);
        assert_eq!(session.lock_message(true).action, Action::LockCode);
        assert_eq!(session.lock_message(false).action, Action::UnlockCode);

        let message = session.code_change_message(&WhiteboardTarget::private_of("bob"), "x");
        assert_eq!(message.user_id, "ms-smith");
        assert_eq!(message.target_user.as_deref(), Some("bob"));
        assert_eq!(message.value.as_deref(), Some("x"));

        assert_eq!(student_session().join_message().action, Action::Join);

        let create = session.assignment_create_message(&Assignment::new("loops", "", "pass"));
        assert_eq!(create.assignment_name.as_deref(), Some("loops"));
        assert_eq!(create.data.unwrap()["code"], "pass");

        let grading = Grading {
            grade: Some(3),
            feedback: Some("ok".to_string()),
            status: crate::protocol::AssignmentStatus::Correctable,
        };
        let grade = session.grade_message("bob", "loops", &grading);
        assert_eq!(grade.target_user.as_deref(), Some("bob"));
        assert_eq!(grade.data.unwrap()["status"], "correctable");

        let submit = student_session().submit_message("loops");
        assert_eq!(submit.action, Action::SubmitAssignment);
        assert_eq!(submit.target_user, None);
    }
}
