use serde_json::json;
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, info};

use crate::protocol::{
    Action, Assignment, AssignmentStatus, ChannelMessage, ClassroomRole, ClassroomSnapshot,
    Grading, UserAssignment, WhiteboardTarget, WhiteboardType,
};
use crate::session::Whiteboard;
use crate::{SyncError, SyncResult};

/// A message addressed to one connection
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub connection_id: String,
    pub message: ChannelMessage,
}

impl Delivery {
    fn new(connection_id: impl Into<String>, message: ChannelMessage) -> Self {
        Self {
            connection_id: connection_id.into(),
            message,
        }
    }
}

/// A participant of a classroom as tracked by the relay
#[derive(Debug, Clone)]
pub struct Member {
    pub user_id: String,
    pub role: ClassroomRole,
    pub online: bool,
    pub connection_id: Option<String>,
    pub whiteboard: Whiteboard,
    /// Students only, keyed by assignment name
    pub assignments: HashMap<String, UserAssignment>,
}

impl Member {
    fn new(user_id: &str, role: ClassroomRole, connection_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            role,
            online: true,
            connection_id: Some(connection_id.to_string()),
            whiteboard: Whiteboard::new(WhiteboardType::Private),
            assignments: HashMap::new(),
        }
    }

    fn assignment_mut(&mut self, name: &str) -> SyncResult<&mut UserAssignment> {
        match self.assignments.get_mut(name) {
            Some(work) => Ok(work),
            None => Err(SyncError::Protocol {
                message: format!("Unknown assignment '{}' for user {}", name, self.user_id),
            }),
        }
    }

    fn is_teacher(&self) -> bool {
        self.role == ClassroomRole::Teacher
    }

    fn online_connection(&self) -> Option<&str> {
        if self.online {
            self.connection_id.as_deref()
        } else {
            None
        }
    }
}

/// Relay-side state of one classroom
pub struct Classroom {
    id: String,
    members: BTreeMap<String, Member>,
    shared_whiteboard: Whiteboard,
    assignments: BTreeMap<String, Assignment>,
    editable: bool,
    deleted: bool,
}

impl Classroom {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            members: BTreeMap::new(),
            shared_whiteboard: Whiteboard::new(WhiteboardType::Public),
            assignments: BTreeMap::new(),
            editable: true,
            deleted: false,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn member(&self, user_id: &str) -> Option<&Member> {
        self.members.get(user_id)
    }

    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    pub fn shared_code(&self) -> &str {
        &self.shared_whiteboard.code
    }

    pub fn is_editable(&self) -> bool {
        self.editable
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    pub fn assignment(&self, name: &str) -> Option<&Assignment> {
        self.assignments.get(name)
    }

    /// Assignments handed out so far, by name
    pub fn assignments(&self) -> impl Iterator<Item = &Assignment> {
        self.assignments.values()
    }

    /// Check if any member is connected
    pub fn has_online_members(&self) -> bool {
        self.members.values().any(|member| member.online)
    }

    pub fn teacher(&self) -> Option<&Member> {
        self.members.values().find(|member| member.is_teacher())
    }

    /// Ids of the students currently online
    pub fn online_students(&self) -> Vec<String> {
        self.members
            .values()
            .filter(|member| !member.is_teacher() && member.online)
            .map(|member| member.user_id.clone())
            .collect()
    }

    /// Classroom state as seen by `user_id`
    pub fn snapshot_for(&self, user_id: &str) -> ClassroomSnapshot {
        let student = self
            .members
            .get(user_id)
            .filter(|member| !member.is_teacher());
        let personal_whiteboard = student.map(|member| member.whiteboard.code.clone());
        let assignments = student
            .map(|member| {
                self.assignments
                    .keys()
                    .filter_map(|name| member.assignments.get(name).cloned())
                    .collect()
            })
            .unwrap_or_default();

        ClassroomSnapshot {
            users: self.online_students(),
            teacher: self.teacher().map(|teacher| teacher.user_id.clone()),
            editable: self.editable,
            shared_whiteboard: Some(self.shared_whiteboard.code.clone()),
            personal_whiteboard,
            assignments,
        }
    }

    /// Process one message from `connection_id`
    ///
    /// Returns the messages to deliver in response.
    pub fn handle(
        &mut self,
        connection_id: &str,
        message: ChannelMessage,
    ) -> SyncResult<Vec<Delivery>> {
        match message.action {
            Action::Join => self.join(connection_id, &message.user_id, ClassroomRole::Student),
            Action::TeacherJoin => {
                self.join(connection_id, &message.user_id, ClassroomRole::Teacher)
            }
            Action::Leave => Ok(self.disconnect(connection_id)),
            Action::CodeChange => {
                let sender = self.sender_of(connection_id)?;
                self.code_change(&sender, message)
            }
            Action::GetData => {
                let sender = self.sender_of(connection_id)?;
                self.get_data(&sender, connection_id, &message)
            }
            Action::LockCode | Action::UnlockCode => {
                let sender = self.sender_of(connection_id)?;
                self.set_locked(&sender, message.action)
            }
            Action::ClassroomDeleted => {
                let sender = self.sender_of(connection_id)?;
                self.delete(&sender)
            }
            Action::AssignmentCreate => {
                let sender = self.sender_of(connection_id)?;
                self.create_assignment(&sender, &message)
            }
            Action::SubmitAssignment => {
                let sender = self.sender_of(connection_id)?;
                self.submit_assignment(&sender, &message)
            }
            Action::GradeAssignment => {
                let sender = self.sender_of(connection_id)?;
                self.grade_assignment(&sender, &message)
            }
            other => Err(SyncError::Protocol {
                message: format!("Unsupported action: {}", other),
            }),
        }
    }

    /// Mark the member on `connection_id` offline and tell the others
    pub fn disconnect(&mut self, connection_id: &str) -> Vec<Delivery> {
        let Some(member) = self
            .members
            .values_mut()
            .find(|member| member.connection_id.as_deref() == Some(connection_id))
        else {
            return Vec::new();
        };

        member.online = false;
        member.connection_id = None;
        let user_id = member.user_id.clone();
        info!("User '{}' left classroom '{}'", user_id, self.id);

        let leave = ChannelMessage::new(Action::Leave, user_id.clone())
            .with_data(json!({ "user_id": user_id }));
        self.online_connections(|member| member.user_id != user_id)
            .into_iter()
            .map(|connection_id| Delivery::new(connection_id, leave.clone()))
            .collect()
    }

    fn join(
        &mut self,
        connection_id: &str,
        user_id: &str,
        role: ClassroomRole,
    ) -> SyncResult<Vec<Delivery>> {
        if user_id.is_empty() {
            return Err(SyncError::Protocol {
                message: "Join without user_id".to_string(),
            });
        }

        let action = match role {
            ClassroomRole::Teacher => Action::TeacherJoin,
            ClassroomRole::Student => Action::Join,
        };
        let forbidden = || SyncError::Forbidden {
            action: action.to_string(),
            user_id: user_id.to_string(),
        };

        if let Ok(bound) = self.sender_of(connection_id) {
            if bound != user_id {
                return Err(SyncError::Protocol {
                    message: format!(
                        "Connection already joined classroom {} as {}",
                        self.id, bound
                    ),
                });
            }
        }

        if role == ClassroomRole::Teacher {
            if let Some(teacher) = self.teacher() {
                if teacher.user_id != user_id {
                    return Err(forbidden());
                }
            }
        }

        // A member can only be taken over in its own role and while offline
        if let Some(member) = self.members.get(user_id) {
            let online_elsewhere = member
                .online_connection()
                .is_some_and(|current| current != connection_id);
            if member.role != role || online_elsewhere {
                return Err(forbidden());
            }
        }

        match self.members.get_mut(user_id) {
            Some(member) => {
                member.online = true;
                member.connection_id = Some(connection_id.to_string());
                info!("User '{}' reconnected to classroom '{}'", user_id, self.id);
            }
            None => {
                let mut member = Member::new(user_id, role, connection_id);
                if role == ClassroomRole::Student {
                    member.assignments = self
                        .assignments
                        .values()
                        .map(|assignment| {
                            (
                                assignment.name.clone(),
                                UserAssignment::new(user_id, assignment.clone()),
                            )
                        })
                        .collect();
                }
                self.members.insert(user_id.to_string(), member);
                info!(
                    "User '{}' joined classroom '{}' as {:?}",
                    user_id, self.id, role
                );
            }
        }

        let snapshot = serde_json::to_value(self.snapshot_for(user_id))?;
        let mut deliveries = vec![Delivery::new(
            connection_id,
            ChannelMessage::new(Action::SyncData, user_id).with_data(snapshot),
        )];

        let role = self.members.get(user_id).map(|member| member.role);
        let announcement = ChannelMessage::new(Action::Join, user_id)
            .with_data(json!({ "user_id": user_id, "role": role }));
        deliveries.extend(
            self.online_connections(|member| member.user_id != user_id)
                .into_iter()
                .map(|connection_id| Delivery::new(connection_id, announcement.clone())),
        );

        Ok(deliveries)
    }

    fn code_change(
        &mut self,
        sender: &str,
        message: ChannelMessage,
    ) -> SyncResult<Vec<Delivery>> {
        let code = message.value.clone().ok_or_else(|| SyncError::Protocol {
            message: "CODE_CHANGE without value".to_string(),
        })?;
        let sender_is_teacher = self.is_teacher(sender);
        let whiteboard_type = message.whiteboard_type.unwrap_or(WhiteboardType::Public);

        match (sender_is_teacher, whiteboard_type) {
            (true, WhiteboardType::Public) => {
                self.shared_whiteboard.code = code.clone();
                let relay = ChannelMessage::code_change(sender, &WhiteboardTarget::Public, code);
                Ok(self.deliver_to(|member| !member.is_teacher(), relay))
            }
            (false, WhiteboardType::Public) => {
                if !self.editable {
                    debug!(
                        "Dropping public edit from '{}', classroom '{}' is locked",
                        sender, self.id
                    );
                    return Ok(Vec::new());
                }
                self.shared_whiteboard.code = code.clone();
                let relay = ChannelMessage::code_change(sender, &WhiteboardTarget::Public, code);
                Ok(self.deliver_to(|member| member.user_id != sender, relay))
            }
            (true, WhiteboardType::Private) => {
                let owner = self.student_target(&message)?;
                self.student_mut(&owner)?.whiteboard.code = code.clone();
                let relay =
                    ChannelMessage::code_change(sender, &WhiteboardTarget::private_of(&owner), code);
                Ok(self.deliver_to(|member| member.user_id == owner, relay))
            }
            (false, WhiteboardType::Private) => {
                self.student_mut(sender)?.whiteboard.code = code.clone();
                let relay =
                    ChannelMessage::code_change(sender, &WhiteboardTarget::private_of(sender), code);
                Ok(self.deliver_to(|member| member.is_teacher(), relay))
            }
            (true, WhiteboardType::Assignment) => {
                let owner = self.student_target(&message)?;
                let name = assignment_name(&message)?;
                let work = self.student_mut(&owner)?.assignment_mut(&name)?;
                work.code = code.clone();
                let relay = ChannelMessage::code_change(sender, &work.target(), code);
                Ok(self.deliver_to(|member| member.user_id == owner, relay))
            }
            (false, WhiteboardType::Assignment) => {
                let name = assignment_name(&message)?;
                let work = self.student_mut(sender)?.assignment_mut(&name)?;
                work.code = code.clone();
                if work.status == AssignmentStatus::NotStarted {
                    work.status = AssignmentStatus::InProgress;
                }
                let relay = ChannelMessage::code_change(sender, &work.target(), code);
                Ok(self.deliver_to(|member| member.is_teacher(), relay))
            }
        }
    }

    fn get_data(
        &mut self,
        sender: &str,
        connection_id: &str,
        message: &ChannelMessage,
    ) -> SyncResult<Vec<Delivery>> {
        let whiteboard_type = message.whiteboard_type.unwrap_or(WhiteboardType::Public);
        let owner = message
            .target_user
            .clone()
            .unwrap_or_else(|| sender.to_string());

        if whiteboard_type != WhiteboardType::Public && owner != sender && !self.is_teacher(sender)
        {
            return Err(SyncError::Forbidden {
                action: Action::GetData.to_string(),
                user_id: sender.to_string(),
            });
        }

        let (target, code) = match whiteboard_type {
            WhiteboardType::Public => (
                WhiteboardTarget::Public,
                self.shared_whiteboard.code.clone(),
            ),
            WhiteboardType::Private => {
                let code = self.student_mut(&owner)?.whiteboard.code.clone();
                (WhiteboardTarget::private_of(owner), code)
            }
            WhiteboardType::Assignment => {
                let name = assignment_name(message)?;
                let code = self.student_mut(&owner)?.assignment_mut(&name)?.code.clone();
                (
                    WhiteboardTarget::Assignment {
                        name,
                        owner: Some(owner),
                    },
                    code,
                )
            }
        };

        let reply = ChannelMessage::new(Action::GetData, sender)
            .with_target(&target)
            .with_value(code);
        Ok(vec![Delivery::new(connection_id, reply)])
    }

    fn set_locked(&mut self, sender: &str, action: Action) -> SyncResult<Vec<Delivery>> {
        self.require_teacher(sender, action)?;
        self.editable = action == Action::UnlockCode;
        info!(
            "Classroom '{}' is now {}",
            self.id,
            if self.editable { "editable" } else { "locked" }
        );
        Ok(self.deliver_to(
            |member| !member.is_teacher(),
            ChannelMessage::new(action, sender),
        ))
    }

    fn delete(&mut self, sender: &str) -> SyncResult<Vec<Delivery>> {
        self.require_teacher(sender, Action::ClassroomDeleted)?;
        self.deleted = true;
        info!("Classroom '{}' deleted by '{}'", self.id, sender);
        Ok(self.deliver_to(
            |member| !member.is_teacher(),
            ChannelMessage::new(Action::ClassroomDeleted, sender),
        ))
    }

    /// Hand an assignment to every student, present or not
    ///
    /// Online students get their seeded board, the teacher gets a summary.
    fn create_assignment(
        &mut self,
        sender: &str,
        message: &ChannelMessage,
    ) -> SyncResult<Vec<Delivery>> {
        self.require_teacher(sender, Action::AssignmentCreate)?;
        let data = message.data.clone().ok_or_else(|| SyncError::Protocol {
            message: "ASSIGNMENT_CREATE without data".to_string(),
        })?;
        let mut assignment: Assignment = serde_json::from_value(data)?;
        if let Some(name) = &message.assignment_name {
            assignment.name = name.clone();
        }
        if assignment.name.is_empty() {
            return Err(SyncError::Protocol {
                message: "ASSIGNMENT_CREATE without assignment name".to_string(),
            });
        }
        if self.assignments.contains_key(&assignment.name) {
            return Err(SyncError::Protocol {
                message: format!(
                    "Assignment '{}' already exists in classroom {}",
                    assignment.name, self.id
                ),
            });
        }

        self.assignments
            .insert(assignment.name.clone(), assignment.clone());
        info!(
            "Assignment '{}' created in classroom '{}'",
            assignment.name, self.id
        );

        let mut deliveries = Vec::new();
        let mut students = Vec::new();
        for member in self.members.values_mut().filter(|member| !member.is_teacher()) {
            let work = UserAssignment::new(&member.user_id, assignment.clone());
            if let Some(connection_id) = member.online_connection() {
                let notice = ChannelMessage::new(Action::AssignmentCreate, sender)
                    .with_target(&work.target())
                    .with_value(work.code.clone())
                    .with_data(serde_json::to_value(&work)?);
                deliveries.push(Delivery::new(connection_id, notice));
            }
            students.push(member.user_id.clone());
            member.assignments.insert(assignment.name.clone(), work);
        }

        let summary = ChannelMessage::new(Action::AssignmentCreate, sender)
            .with_target(&WhiteboardTarget::assignment(assignment.name.clone()))
            .with_data(json!({ "assignment": assignment, "students": students }));
        deliveries.extend(self.deliver_to(|member| member.is_teacher(), summary));
        Ok(deliveries)
    }

    fn submit_assignment(
        &mut self,
        sender: &str,
        message: &ChannelMessage,
    ) -> SyncResult<Vec<Delivery>> {
        if self.is_teacher(sender) {
            return Err(SyncError::Forbidden {
                action: Action::SubmitAssignment.to_string(),
                user_id: sender.to_string(),
            });
        }
        let name = submitted_name(message)?;
        let work = self.student_mut(sender)?.assignment_mut(&name)?;
        work.status = AssignmentStatus::Submitted;
        let notice = ChannelMessage::new(Action::SubmitAssignment, sender)
            .with_target(&work.target())
            .with_value(work.code.clone())
            .with_data(serde_json::to_value(&*work)?);

        info!(
            "User '{}' submitted '{}' in classroom '{}'",
            sender, name, self.id
        );
        Ok(self.deliver_to(|member| member.is_teacher(), notice))
    }

    fn grade_assignment(
        &mut self,
        sender: &str,
        message: &ChannelMessage,
    ) -> SyncResult<Vec<Delivery>> {
        self.require_teacher(sender, Action::GradeAssignment)?;
        let owner = self.student_target(message)?;
        let name = assignment_name(message)?;
        let grading: Grading = match message.data.clone() {
            Some(data) => serde_json::from_value(data)?,
            None => {
                return Err(SyncError::Protocol {
                    message: "GRADE_ASSIGNMENT without data".to_string(),
                })
            }
        };

        let work = self.student_mut(&owner)?.assignment_mut(&name)?;
        work.grade(&grading);
        let notice = ChannelMessage::new(Action::GradeAssignment, sender)
            .with_target(&work.target())
            .with_data(serde_json::to_value(&*work)?);

        info!(
            "Assignment '{}' of '{}' graded {:?} in classroom '{}'",
            name, owner, grading.grade, self.id
        );
        Ok(self.deliver_to(|member| member.user_id == owner, notice))
    }

    fn sender_of(&self, connection_id: &str) -> SyncResult<String> {
        self.members
            .values()
            .find(|member| member.connection_id.as_deref() == Some(connection_id))
            .map(|member| member.user_id.clone())
            .ok_or_else(|| SyncError::Protocol {
                message: format!("Connection has not joined classroom {}", self.id),
            })
    }

    fn is_teacher(&self, user_id: &str) -> bool {
        self.members
            .get(user_id)
            .map(Member::is_teacher)
            .unwrap_or(false)
    }

    fn require_teacher(&self, user_id: &str, action: Action) -> SyncResult<()> {
        if self.is_teacher(user_id) {
            Ok(())
        } else {
            Err(SyncError::Forbidden {
                action: action.to_string(),
                user_id: user_id.to_string(),
            })
        }
    }

    fn student_target(&self, message: &ChannelMessage) -> SyncResult<String> {
        message.target_user.clone().ok_or_else(|| SyncError::Protocol {
            message: format!("{} without target_user", message.action),
        })
    }

    fn student_mut(&mut self, user_id: &str) -> SyncResult<&mut Member> {
        match self.members.get_mut(user_id) {
            Some(member) if !member.is_teacher() => Ok(member),
            _ => Err(SyncError::UserNotFound {
                classroom_id: self.id.clone(),
                user_id: user_id.to_string(),
            }),
        }
    }

    fn online_connections(&self, include: impl Fn(&Member) -> bool) -> Vec<String> {
        self.members
            .values()
            .filter(|member| include(member))
            .filter_map(|member| member.online_connection().map(str::to_string))
            .collect()
    }

    fn deliver_to(&self, include: impl Fn(&Member) -> bool, message: ChannelMessage) -> Vec<Delivery> {
        self.online_connections(include)
            .into_iter()
            .map(|connection_id| Delivery::new(connection_id, message.clone()))
            .collect()
    }
}

fn assignment_name(message: &ChannelMessage) -> SyncResult<String> {
    message
        .assignment_name
        .clone()
        .ok_or_else(|| SyncError::Protocol {
            message: format!("{} without assignment_name", message.action),
        })
}

/// Assignment named by a submission, either in `assignment_name` or as a bare string in `data`
fn submitted_name(message: &ChannelMessage) -> SyncResult<String> {
    message
        .assignment_name
        .clone()
        .or_else(|| {
            message
                .data
                .as_ref()
                .and_then(|data| data.as_str())
                .map(str::to_string)
        })
        .ok_or_else(|| SyncError::Protocol {
            message: format!("{} without assignment_name", message.action),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::DEFAULT_CODE;
    use rstest::rstest;

    /// Classroom with a teacher on "c-teacher" and students on "c-alice", "c-bob"
    fn classroom() -> Classroom {
        let mut classroom = Classroom::new("42");
        classroom
            .handle("c-teacher", ChannelMessage::new(Action::TeacherJoin, "ms-smith"))
            .unwrap();
        classroom
            .handle("c-alice", ChannelMessage::new(Action::Join, "alice"))
            .unwrap();
        classroom
            .handle("c-bob", ChannelMessage::new(Action::Join, "bob"))
            .unwrap();
        classroom
    }

    fn create_loops(classroom: &mut Classroom) -> Vec<Delivery> {
        let create = ChannelMessage::new(Action::AssignmentCreate, "ms-smith").with_data(json!({
            "assignment_name": "loops",
            "assignment_description": "Print 1 to 3",
            "assignment_code": "for i in range(3):",
        }));
        classroom.handle("c-teacher", create).unwrap()
    }

    fn recipients(deliveries: &[Delivery]) -> Vec<&str> {
        let mut ids: Vec<&str> = deliveries
            .iter()
            .map(|delivery| delivery.connection_id.as_str())
            .collect();
        ids.sort();
        ids
    }

    #[test]
    fn test_join_replies_with_snapshot_and_announces() {
        let mut classroom = classroom();
        let deliveries = classroom
            .handle("c-carol", ChannelMessage::new(Action::Join, "carol"))
            .unwrap();

        assert_eq!(deliveries[0].connection_id, "c-carol");
        assert_eq!(deliveries[0].message.action, Action::SyncData);
        let snapshot: ClassroomSnapshot =
            serde_json::from_value(deliveries[0].message.data.clone().unwrap()).unwrap();
        assert_eq!(snapshot.teacher.as_deref(), Some("ms-smith"));
        assert_eq!(snapshot.users, vec!["alice", "bob", "carol"]);
        assert_eq!(snapshot.personal_whiteboard.as_deref(), Some(DEFAULT_CODE));

        assert_eq!(
            recipients(&deliveries[1..]),
            vec!["c-alice", "c-bob", "c-teacher"]
        );
        assert!(deliveries[1..]
            .iter()
            .all(|delivery| delivery.message.action == Action::Join));
    }

    #[test]
    fn test_join_requires_user_id() {
        let mut classroom = Classroom::new("42");
        assert!(classroom
            .handle("c-1", ChannelMessage::new(Action::Join, ""))
            .is_err());
    }

    #[test]
    fn test_second_teacher_is_rejected() {
        let mut classroom = classroom();
        let result = classroom.handle("c-2", ChannelMessage::new(Action::TeacherJoin, "mr-jones"));
        assert!(matches!(result, Err(SyncError::Forbidden { .. })));
    }

    #[test]
    fn test_teacher_cannot_be_taken_over() {
        let mut classroom = classroom();

        let result = classroom.handle("c-eve", ChannelMessage::new(Action::TeacherJoin, "ms-smith"));
        assert!(matches!(result, Err(SyncError::Forbidden { .. })));

        let result = classroom.handle("c-eve", ChannelMessage::new(Action::Join, "ms-smith"));
        assert!(matches!(result, Err(SyncError::Forbidden { .. })));

        assert_eq!(
            classroom.teacher().unwrap().connection_id.as_deref(),
            Some("c-teacher")
        );
        let deliveries = classroom
            .handle("c-teacher", ChannelMessage::new(Action::LockCode, "ms-smith"))
            .unwrap();
        assert_eq!(recipients(&deliveries), vec!["c-alice", "c-bob"]);
    }

    #[test]
    fn test_online_student_cannot_be_taken_over() {
        let mut classroom = classroom();
        let result = classroom.handle("c-eve", ChannelMessage::new(Action::Join, "alice"));
        assert!(matches!(result, Err(SyncError::Forbidden { .. })));
        assert_eq!(
            classroom.member("alice").unwrap().connection_id.as_deref(),
            Some("c-alice")
        );

        let result = classroom.handle("c-eve", ChannelMessage::new(Action::TeacherJoin, "bob"));
        assert!(matches!(result, Err(SyncError::Forbidden { .. })));
    }

    #[test]
    fn test_connection_joins_once() {
        let mut classroom = classroom();
        let result = classroom.handle("c-alice", ChannelMessage::new(Action::Join, "carol"));
        assert!(matches!(result, Err(SyncError::Protocol { .. })));
        assert!(classroom.member("carol").is_none());

        // Repeating the own join is harmless
        assert!(classroom
            .handle("c-alice", ChannelMessage::new(Action::Join, "alice"))
            .is_ok());
    }

    #[test]
    fn test_reconnect_keeps_whiteboard() {
        let mut classroom = classroom();
        classroom
            .handle(
                "c-alice",
                ChannelMessage::code_change("alice", &WhiteboardTarget::Private { owner: None }, "kept"),
            )
            .unwrap();
        classroom.disconnect("c-alice");
        assert!(!classroom.member("alice").unwrap().online);

        let deliveries = classroom
            .handle("c-alice-2", ChannelMessage::new(Action::Join, "alice"))
            .unwrap();
        let snapshot: ClassroomSnapshot =
            serde_json::from_value(deliveries[0].message.data.clone().unwrap()).unwrap();
        assert_eq!(snapshot.personal_whiteboard.as_deref(), Some("kept"));
        assert_eq!(classroom.member_count(), 3);
    }

    #[test]
    fn test_teacher_public_change_goes_to_students() {
        let mut classroom = classroom();
        let deliveries = classroom
            .handle(
                "c-teacher",
                ChannelMessage::code_change("ms-smith", &WhiteboardTarget::Public, "lesson()"),
            )
            .unwrap();

        assert_eq!(classroom.shared_code(), "lesson()");
        assert_eq!(recipients(&deliveries), vec!["c-alice", "c-bob"]);
        assert_eq!(deliveries[0].message.user_id, "ms-smith");
        assert_eq!(deliveries[0].message.value.as_deref(), Some("lesson()"));
    }

    #[test]
    fn test_student_public_change_goes_to_everyone_else() {
        let mut classroom = classroom();
        let deliveries = classroom
            .handle(
                "c-alice",
                ChannelMessage::code_change("alice", &WhiteboardTarget::Public, "abc"),
            )
            .unwrap();

        assert_eq!(recipients(&deliveries), vec!["c-bob", "c-teacher"]);
    }

    #[test]
    fn test_sender_identity_comes_from_connection() {
        let mut classroom = classroom();
        let deliveries = classroom
            .handle(
                "c-alice",
                ChannelMessage::code_change("ms-smith", &WhiteboardTarget::Public, "spoof"),
            )
            .unwrap();

        assert!(deliveries
            .iter()
            .all(|delivery| delivery.message.user_id == "alice"));
    }

    #[test]
    fn test_locked_classroom_drops_student_public_change() {
        let mut classroom = classroom();
        let deliveries = classroom
            .handle("c-teacher", ChannelMessage::new(Action::LockCode, "ms-smith"))
            .unwrap();
        assert_eq!(recipients(&deliveries), vec!["c-alice", "c-bob"]);
        assert!(!classroom.is_editable());

        let deliveries = classroom
            .handle(
                "c-alice",
                ChannelMessage::code_change("alice", &WhiteboardTarget::Public, "blocked"),
            )
            .unwrap();
        assert!(deliveries.is_empty());
        assert_eq!(classroom.shared_code(), DEFAULT_CODE);

        classroom
            .handle("c-teacher", ChannelMessage::new(Action::UnlockCode, "ms-smith"))
            .unwrap();
        assert!(classroom.is_editable());
    }

    #[test]
    fn test_students_cannot_lock() {
        let mut classroom = classroom();
        let result = classroom.handle("c-alice", ChannelMessage::new(Action::LockCode, "alice"));
        assert!(matches!(result, Err(SyncError::Forbidden { .. })));
    }

    #[test]
    fn test_private_changes_between_teacher_and_student() {
        let mut classroom = classroom();

        let deliveries = classroom
            .handle(
                "c-alice",
                ChannelMessage::code_change("alice", &WhiteboardTarget::Private { owner: None }, "mine"),
            )
            .unwrap();
        assert_eq!(recipients(&deliveries), vec!["c-teacher"]);
        assert_eq!(deliveries[0].message.target_user.as_deref(), Some("alice"));

        let deliveries = classroom
            .handle(
                "c-teacher",
                ChannelMessage::code_change("ms-smith", &WhiteboardTarget::private_of("alice"), "hint"),
            )
            .unwrap();
        assert_eq!(recipients(&deliveries), vec!["c-alice"]);
        assert_eq!(classroom.member("alice").unwrap().whiteboard.code, "hint");
    }

    #[test]
    fn test_teacher_private_change_requires_known_student() {
        let mut classroom = classroom();
        let result = classroom.handle(
            "c-teacher",
            ChannelMessage::code_change("ms-smith", &WhiteboardTarget::private_of("nobody"), "x"),
        );
        assert!(matches!(result, Err(SyncError::UserNotFound { .. })));
    }

    #[test]
    fn test_assignment_create_seeds_student_boards() {
        let mut classroom = classroom();
        classroom.disconnect("c-bob");
        let deliveries = create_loops(&mut classroom);

        assert_eq!(recipients(&deliveries), vec!["c-alice", "c-teacher"]);
        let seeded = "# Print 1 to 3\n\nfor i in range(3):\n";

        let to_alice = &deliveries[0].message;
        assert_eq!(to_alice.action, Action::AssignmentCreate);
        assert_eq!(to_alice.value.as_deref(), Some(seeded));
        assert_eq!(
            to_alice.whiteboard_target(),
            Some(WhiteboardTarget::Assignment {
                name: "loops".to_string(),
                owner: Some("alice".to_string()),
            })
        );
        let work: UserAssignment = serde_json::from_value(to_alice.data.clone().unwrap()).unwrap();
        assert_eq!(work.status, AssignmentStatus::NotStarted);

        let summary = deliveries[1].message.data.clone().unwrap();
        assert_eq!(summary["assignment"]["name"], "loops");
        assert_eq!(summary["students"], json!(["alice", "bob"]));

        // Offline students are seeded too and get their board on reconnect
        assert_eq!(classroom.member("bob").unwrap().assignments["loops"].code, seeded);
        let deliveries = classroom
            .handle("c-bob-2", ChannelMessage::new(Action::Join, "bob"))
            .unwrap();
        let snapshot: ClassroomSnapshot =
            serde_json::from_value(deliveries[0].message.data.clone().unwrap()).unwrap();
        assert_eq!(snapshot.assignments.len(), 1);
        assert_eq!(snapshot.assignments[0].code, seeded);
    }

    #[test]
    fn test_late_student_gets_existing_assignments() {
        let mut classroom = classroom();
        create_loops(&mut classroom);
        classroom
            .handle("c-carol", ChannelMessage::new(Action::Join, "carol"))
            .unwrap();

        let work = &classroom.member("carol").unwrap().assignments["loops"];
        assert_eq!(work.assignment, *classroom.assignment("loops").unwrap());
    }

    #[rstest]
    #[case("c-alice", json!({ "assignment_name": "x" }), "students create nothing")]
    #[case("c-teacher", json!({ "assignment_code": "pass" }), "name is required")]
    #[case("c-teacher", json!({ "assignment_name": "loops" }), "names are unique")]
    fn test_assignment_create_rejections(
        #[case] connection_id: &str,
        #[case] data: serde_json::Value,
        #[case] reason: &str,
    ) {
        let mut classroom = classroom();
        create_loops(&mut classroom);
        let create = ChannelMessage::new(Action::AssignmentCreate, "x").with_data(data);
        assert!(classroom.handle(connection_id, create).is_err(), "{}", reason);
        assert!(classroom.assignment("x").is_none());
    }

    #[test]
    fn test_unknown_assignment_is_rejected() {
        let mut classroom = classroom();
        let result = classroom.handle(
            "c-bob",
            ChannelMessage::code_change("bob", &WhiteboardTarget::assignment("loops"), "for"),
        );
        assert!(matches!(result, Err(SyncError::Protocol { .. })));
    }

    #[test]
    fn test_submit_and_grade_route_status() {
        let mut classroom = classroom();
        create_loops(&mut classroom);
        classroom
            .handle(
                "c-bob",
                ChannelMessage::code_change("bob", &WhiteboardTarget::assignment("loops"), "print(1)"),
            )
            .unwrap();
        assert_eq!(
            classroom.member("bob").unwrap().assignments["loops"].status,
            AssignmentStatus::InProgress
        );

        let submit = ChannelMessage::new(Action::SubmitAssignment, "bob").with_data(json!("loops"));
        let deliveries = classroom.handle("c-bob", submit).unwrap();
        assert_eq!(recipients(&deliveries), vec!["c-teacher"]);
        assert_eq!(deliveries[0].message.value.as_deref(), Some("print(1)"));
        assert_eq!(deliveries[0].message.target_user.as_deref(), Some("bob"));
        let work: UserAssignment =
            serde_json::from_value(deliveries[0].message.data.clone().unwrap()).unwrap();
        assert_eq!(work.status, AssignmentStatus::Submitted);

        let target = WhiteboardTarget::Assignment {
            name: "loops".to_string(),
            owner: Some("bob".to_string()),
        };
        let grade = ChannelMessage::new(Action::GradeAssignment, "ms-smith")
            .with_target(&target)
            .with_data(json!({ "grade": 5, "feedback": "Off by one" }));
        let deliveries = classroom.handle("c-teacher", grade).unwrap();
        assert_eq!(recipients(&deliveries), vec!["c-bob"]);

        let work = &classroom.member("bob").unwrap().assignments["loops"];
        assert_eq!(work.status, AssignmentStatus::Completed);
        assert_eq!(work.grade, Some(5));
        assert_eq!(work.feedback.as_deref(), Some("Off by one"));
        assert_eq!(work.grade_history.len(), 1);
    }

    #[test]
    fn test_grading_and_submitting_are_role_bound() {
        let mut classroom = classroom();
        create_loops(&mut classroom);

        let grade = ChannelMessage::new(Action::GradeAssignment, "alice")
            .with_target(&WhiteboardTarget::Assignment {
                name: "loops".to_string(),
                owner: Some("bob".to_string()),
            })
            .with_data(json!({ "grade": 6 }));
        let result = classroom.handle("c-alice", grade);
        assert!(matches!(result, Err(SyncError::Forbidden { .. })));

        let submit = ChannelMessage::new(Action::SubmitAssignment, "ms-smith")
            .with_target(&WhiteboardTarget::assignment("loops"));
        let result = classroom.handle("c-teacher", submit);
        assert!(matches!(result, Err(SyncError::Forbidden { .. })));
    }

    #[test]
    fn test_assignment_changes() {
        let mut classroom = classroom();
        create_loops(&mut classroom);

        let deliveries = classroom
            .handle(
                "c-bob",
                ChannelMessage::code_change("bob", &WhiteboardTarget::assignment("loops"), "for"),
            )
            .unwrap();
        assert_eq!(recipients(&deliveries), vec!["c-teacher"]);
        assert_eq!(
            deliveries[0].message.whiteboard_target(),
            Some(WhiteboardTarget::Assignment {
                name: "loops".to_string(),
                owner: Some("bob".to_string()),
            })
        );

        let target = WhiteboardTarget::Assignment {
            name: "loops".to_string(),
            owner: Some("bob".to_string()),
        };
        let deliveries = classroom
            .handle(
                "c-teacher",
                ChannelMessage::code_change("ms-smith", &target, "for i in x:"),
            )
            .unwrap();
        assert_eq!(recipients(&deliveries), vec!["c-bob"]);
        assert_eq!(
            classroom.member("bob").unwrap().assignments["loops"].code,
            "for i in x:"
        );
    }

    #[test]
    fn test_get_data_replies_to_requester_only() {
        let mut classroom = classroom();
        classroom
            .handle(
                "c-alice",
                ChannelMessage::code_change("alice", &WhiteboardTarget::Private { owner: None }, "mine"),
            )
            .unwrap();

        let request = ChannelMessage::new(Action::GetData, "ms-smith")
            .with_target(&WhiteboardTarget::private_of("alice"));
        let deliveries = classroom.handle("c-teacher", request).unwrap();

        assert_eq!(recipients(&deliveries), vec!["c-teacher"]);
        assert_eq!(deliveries[0].message.value.as_deref(), Some("mine"));
        assert_eq!(deliveries[0].message.target_user.as_deref(), Some("alice"));
    }

    #[test]
    fn test_students_cannot_read_other_private_boards() {
        let mut classroom = classroom();
        let request = ChannelMessage::new(Action::GetData, "bob")
            .with_target(&WhiteboardTarget::private_of("alice"));
        let result = classroom.handle("c-bob", request);
        assert!(matches!(result, Err(SyncError::Forbidden { .. })));
    }

    #[test]
    fn test_messages_before_join_are_rejected() {
        let mut classroom = classroom();
        let result = classroom.handle(
            "c-stranger",
            ChannelMessage::code_change("eve", &WhiteboardTarget::Public, "x"),
        );
        assert!(matches!(result, Err(SyncError::Protocol { .. })));
    }

    #[test]
    fn test_leave_notifies_online_members() {
        let mut classroom = classroom();
        let deliveries = classroom
            .handle("c-bob", ChannelMessage::new(Action::Leave, "bob"))
            .unwrap();

        assert_eq!(recipients(&deliveries), vec!["c-alice", "c-teacher"]);
        assert_eq!(classroom.online_students(), vec!["alice"]);
        assert!(classroom.disconnect("c-bob").is_empty());
    }

    #[test]
    fn test_delete_notifies_students() {
        let mut classroom = classroom();
        let deliveries = classroom
            .handle("c-teacher", ChannelMessage::new(Action::ClassroomDeleted, "ms-smith"))
            .unwrap();

        assert!(classroom.is_deleted());
        assert_eq!(recipients(&deliveries), vec!["c-alice", "c-bob"]);
    }

    #[test]
    fn test_unsupported_action() {
        let mut classroom = classroom();
        let result = classroom.handle(
            "c-teacher",
            ChannelMessage::new(Action::SyncData, "ms-smith"),
        );
        assert!(matches!(result, Err(SyncError::Protocol { .. })));
    }
}
