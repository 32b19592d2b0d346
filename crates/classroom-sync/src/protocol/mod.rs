use chrono::{DateTime, Utc};
use serde::de::{self, Deserializer};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::fmt;
use std::str::FromStr;

/// Action tags shared by every message of the classroom protocol
///
/// On the wire an action is written as its name (`"CODE_CHANGE"`). The
/// numeric codes used by older clients are accepted when decoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    None,
    Join,
    CodeChange,
    SyncData,
    Leave,
    GetData,
    LockCode,
    UnlockCode,
    TeacherJoin,
    ClassroomDeleted,
    AssignmentCreate,
    SubmitAssignment,
    GradeAssignment,
    /// Server-side rejection of a request, carries a message in `value`
    Error,
}

impl Action {
    const ALL: [Action; 14] = [
        Action::None,
        Action::Join,
        Action::CodeChange,
        Action::SyncData,
        Action::Leave,
        Action::GetData,
        Action::LockCode,
        Action::UnlockCode,
        Action::TeacherJoin,
        Action::ClassroomDeleted,
        Action::AssignmentCreate,
        Action::SubmitAssignment,
        Action::GradeAssignment,
        Action::Error,
    ];

    /// Wire name of the action
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::None => "NONE",
            Action::Join => "JOIN",
            Action::CodeChange => "CODE_CHANGE",
            Action::SyncData => "SYNC_DATA",
            Action::Leave => "LEAVE",
            Action::GetData => "GET_DATA",
            Action::LockCode => "LOCK_CODE",
            Action::UnlockCode => "UNLOCK_CODE",
            Action::TeacherJoin => "TEACHER_JOIN",
            Action::ClassroomDeleted => "CLASSROOM_DELETED",
            Action::AssignmentCreate => "ASSIGNMENT_CREATE",
            Action::SubmitAssignment => "SUBMIT_ASSIGNMENT",
            Action::GradeAssignment => "GRADE_ASSIGNMENT",
            Action::Error => "ERROR",
        }
    }

    /// Legacy numeric code of the action
    pub fn code(&self) -> u8 {
        match self {
            Action::None => 0,
            Action::Join => 1,
            Action::CodeChange => 2,
            Action::SyncData => 3,
            Action::Leave => 4,
            Action::GetData => 5,
            Action::LockCode => 6,
            Action::UnlockCode => 7,
            Action::TeacherJoin => 8,
            Action::ClassroomDeleted => 9,
            Action::AssignmentCreate => 10,
            Action::SubmitAssignment => 11,
            Action::GradeAssignment => 12,
            Action::Error => 255,
        }
    }

    /// Look up an action by its numeric code
    pub fn from_code(code: u8) -> crate::SyncResult<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|action| action.code() == code)
            .ok_or(crate::SyncError::UnknownAction(code))
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Action {
    type Err = crate::SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|action| action.as_str() == s)
            .ok_or_else(|| crate::SyncError::Protocol {
                message: format!("Unknown action name: {}", s),
            })
    }
}

impl Serialize for Action {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Action {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Code(u8),
            Name(String),
        }

        match Repr::deserialize(deserializer)? {
            Repr::Code(code) => Action::from_code(code).map_err(de::Error::custom),
            Repr::Name(name) => name.parse().map_err(de::Error::custom),
        }
    }
}

/// Kind of whiteboard a message refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WhiteboardType {
    /// The classroom's shared board
    Public,
    /// A student's personal board
    Private,
    /// A student's board for one assignment
    Assignment,
}

/// Role of a participant in a classroom
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClassroomRole {
    Student,
    Teacher,
}

/// Classroom state sent to a participant in a `SYNC_DATA` message
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClassroomSnapshot {
    /// Online students
    #[serde(default)]
    pub users: Vec<String>,
    #[serde(default)]
    pub teacher: Option<String>,
    #[serde(default = "default_editable")]
    pub editable: bool,
    #[serde(default)]
    pub shared_whiteboard: Option<String>,
    /// The receiver's own private board
    #[serde(default)]
    pub personal_whiteboard: Option<String>,
    /// The receiver's own assignments
    #[serde(default)]
    pub assignments: Vec<UserAssignment>,
}

fn default_editable() -> bool {
    true
}

/// Progress of one student on one assignment
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentStatus {
    #[default]
    NotStarted,
    InProgress,
    Submitted,
    Completed,
    Correctable,
}

/// An exercise handed out by the teacher
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assignment {
    #[serde(default, alias = "assignment_name")]
    pub name: String,
    #[serde(default, alias = "assignment_description")]
    pub description: String,
    /// Starter code
    #[serde(default, alias = "assignment_code")]
    pub code: String,
}

impl Assignment {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        code: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            code: code.into(),
        }
    }

    /// Text a student's board starts with: the description as comments above the starter code
    pub fn initial_code(&self) -> String {
        let mut text: String = self
            .description
            .lines()
            .map(|line| format!("# {}\n", line))
            .collect();
        if !text.is_empty() {
            text.push('\n');
        }
        text.push_str(&self.code);
        text.push('\n');
        text
    }
}

/// One grading pass, kept in a student's grade history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GradeRecord {
    pub grade: Option<u32>,
    pub feedback: Option<String>,
    pub graded_at: DateTime<Utc>,
}

/// A student's copy of an assignment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserAssignment {
    pub user_id: String,
    pub assignment: Assignment,
    /// Current text of the student's assignment board
    pub code: String,
    #[serde(default)]
    pub status: AssignmentStatus,
    #[serde(default)]
    pub grade: Option<u32>,
    #[serde(default)]
    pub feedback: Option<String>,
    #[serde(default)]
    pub grade_history: Vec<GradeRecord>,
}

impl UserAssignment {
    pub fn new(user_id: impl Into<String>, assignment: Assignment) -> Self {
        Self {
            user_id: user_id.into(),
            code: assignment.initial_code(),
            assignment,
            status: AssignmentStatus::NotStarted,
            grade: None,
            feedback: None,
            grade_history: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.assignment.name
    }

    /// Board address of this assignment from the relay's point of view
    pub fn target(&self) -> WhiteboardTarget {
        WhiteboardTarget::Assignment {
            name: self.assignment.name.clone(),
            owner: Some(self.user_id.clone()),
        }
    }

    /// Record a grade and push it onto the history
    pub fn grade(&mut self, grading: &Grading) {
        self.grade = grading.grade;
        self.feedback = grading.feedback.clone();
        self.status = grading.status;
        self.grade_history.push(GradeRecord {
            grade: grading.grade,
            feedback: grading.feedback.clone(),
            graded_at: Utc::now(),
        });
    }
}

/// Payload of a `GRADE_ASSIGNMENT` request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Grading {
    #[serde(default)]
    pub grade: Option<u32>,
    #[serde(default)]
    pub feedback: Option<String>,
    #[serde(default = "default_graded_status")]
    pub status: AssignmentStatus,
}

fn default_graded_status() -> AssignmentStatus {
    AssignmentStatus::Completed
}

/// Address of a single whiteboard inside a classroom
///
/// `owner` is the student the board belongs to. `None` means the local
/// user's own board on the client side.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum WhiteboardTarget {
    Public,
    Private {
        owner: Option<String>,
    },
    Assignment {
        name: String,
        owner: Option<String>,
    },
}

impl WhiteboardTarget {
    pub fn private_of(owner: impl Into<String>) -> Self {
        WhiteboardTarget::Private {
            owner: Some(owner.into()),
        }
    }

    pub fn assignment(name: impl Into<String>) -> Self {
        WhiteboardTarget::Assignment {
            name: name.into(),
            owner: None,
        }
    }

    pub fn whiteboard_type(&self) -> WhiteboardType {
        match self {
            WhiteboardTarget::Public => WhiteboardType::Public,
            WhiteboardTarget::Private { .. } => WhiteboardType::Private,
            WhiteboardTarget::Assignment { .. } => WhiteboardType::Assignment,
        }
    }

    pub fn owner(&self) -> Option<&str> {
        match self {
            WhiteboardTarget::Public => None,
            WhiteboardTarget::Private { owner } | WhiteboardTarget::Assignment { owner, .. } => {
                owner.as_deref()
            }
        }
    }

    pub fn assignment_name(&self) -> Option<&str> {
        match self {
            WhiteboardTarget::Assignment { name, .. } => Some(name),
            _ => None,
        }
    }

    /// Rewrite the owner as seen by `local_user`: their own boards lose the owner
    pub fn relative_to(self, local_user: &str) -> Self {
        match self {
            WhiteboardTarget::Private { owner } if owner.as_deref() == Some(local_user) => {
                WhiteboardTarget::Private { owner: None }
            }
            WhiteboardTarget::Assignment { name, owner } if owner.as_deref() == Some(local_user) => {
                WhiteboardTarget::Assignment { name, owner: None }
            }
            other => other,
        }
    }
}

impl fmt::Display for WhiteboardTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WhiteboardTarget::Public => write!(f, "public"),
            WhiteboardTarget::Private { owner: None } => write!(f, "private"),
            WhiteboardTarget::Private { owner: Some(owner) } => write!(f, "private:{}", owner),
            WhiteboardTarget::Assignment { name, owner: None } => write!(f, "assignment:{}", name),
            WhiteboardTarget::Assignment {
                name,
                owner: Some(owner),
            } => write!(f, "assignment:{}:{}", name, owner),
        }
    }
}

/// Envelope for every message exchanged over a classroom channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelMessage {
    pub action: Action,
    #[serde(default)]
    pub user_id: String,
    /// Full whiteboard text for code messages, human readable text for errors
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub whiteboard_type: Option<WhiteboardType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assignment_name: Option<String>,
    /// Structured payload (classroom snapshots, roster entries)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<JsonValue>,
}

impl ChannelMessage {
    pub fn new(action: Action, user_id: impl Into<String>) -> Self {
        Self {
            action,
            user_id: user_id.into(),
            value: None,
            whiteboard_type: None,
            target_user: None,
            assignment_name: None,
            data: None,
        }
    }

    /// A code change carrying the full text of `target`
    pub fn code_change(
        user_id: impl Into<String>,
        target: &WhiteboardTarget,
        code: impl Into<String>,
    ) -> Self {
        Self::new(Action::CodeChange, user_id)
            .with_target(target)
            .with_value(code)
    }

    /// An error reply from the relay
    pub fn error(message: impl Into<String>) -> Self {
        Self::new(Action::Error, String::new()).with_value(message)
    }

    pub fn with_value(mut self, value: impl Into<String>) -> Self {
        self.value = Some(value.into());
        self
    }

    pub fn with_data(mut self, data: JsonValue) -> Self {
        self.data = Some(data);
        self
    }

    /// Fill the whiteboard addressing fields from `target`
    pub fn with_target(mut self, target: &WhiteboardTarget) -> Self {
        self.whiteboard_type = Some(target.whiteboard_type());
        self.target_user = target.owner().map(str::to_string);
        self.assignment_name = target.assignment_name().map(str::to_string);
        self
    }

    pub fn is_code_change(&self) -> bool {
        self.action == Action::CodeChange
    }

    /// Whiteboard addressed by this message
    ///
    /// Messages without a whiteboard type address the public board. Returns
    /// `None` for assignment messages that lack an assignment name.
    pub fn whiteboard_target(&self) -> Option<WhiteboardTarget> {
        match self.whiteboard_type.unwrap_or(WhiteboardType::Public) {
            WhiteboardType::Public => Some(WhiteboardTarget::Public),
            WhiteboardType::Private => Some(WhiteboardTarget::Private {
                owner: self.target_user.clone(),
            }),
            WhiteboardType::Assignment => {
                self.assignment_name
                    .clone()
                    .map(|name| WhiteboardTarget::Assignment {
                        name,
                        owner: self.target_user.clone(),
                    })
            }
        }
    }
}

/// Encode a message as plain JSON text
pub fn encode_text(message: &ChannelMessage) -> crate::SyncResult<String> {
    Ok(serde_json::to_string(message)?)
}

/// Decode a message from JSON text
pub fn decode_text(text: &str) -> crate::SyncResult<ChannelMessage> {
    Ok(serde_json::from_str(text)?)
}

/// Encode a message using lib0 format
pub fn encode_message<T: Serialize>(message: &T) -> crate::SyncResult<Vec<u8>> {
    let json = serde_json::to_string(message)?;
    let mut encoder = Vec::new();
    lib0::encoding::Write::write_string(&mut encoder, &json);
    Ok(encoder)
}

/// Decode a message from lib0 format
pub fn decode_message<T: for<'de> Deserialize<'de>>(data: &[u8]) -> crate::SyncResult<T> {
    let mut decoder = lib0::decoding::Cursor::new(data);
    let json =
        lib0::decoding::Read::read_string(&mut decoder).map_err(|e| crate::SyncError::Protocol {
            message: format!("Failed to decode lib0 string: {}", e),
        })?;

    let message = serde_json::from_str(json)?;
    Ok(message)
}
