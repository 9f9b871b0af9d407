//! Workflow state types

use super::FieldValue;
use crate::identity::{EntityRole, Identity, StudentRecord};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Named multi-step conversations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Workflow {
    Registration,
    RoleAssignment,
    EntityCreation,
    PaymentSubmission,
    LessonMarking,
}

impl Workflow {
    pub fn as_str(self) -> &'static str {
        match self {
            Workflow::Registration => "registration",
            Workflow::RoleAssignment => "role_assignment",
            Workflow::EntityCreation => "entity_creation",
            Workflow::PaymentSubmission => "payment_submission",
            Workflow::LessonMarking => "lesson_marking",
        }
    }
}

/// An identity waiting in the staging list for a role
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagedUser {
    pub identity: Identity,
    pub name: String,
}

/// A student offered for selection, captured when the workflow started
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StudentChoice {
    pub telegram_id: Identity,
    pub name: String,
    pub payed_lessons: i64,
}

impl From<&StudentRecord> for StudentChoice {
    fn from(record: &StudentRecord) -> Self {
        Self {
            telegram_id: record.telegram_id,
            name: record.full_name(),
            payed_lessons: record.payed_lessons,
        }
    }
}

/// Current step of the active workflow, carrying the data gathered so far
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowState {
    // Registration
    AwaitingName,

    // RoleAssignment
    ChoosingUser {
        staged: Vec<StagedUser>,
    },
    ChoosingAssignedRole {
        user: StagedUser,
    },

    // EntityCreation
    ChoosingEntityRole,
    EnteringFields {
        role: EntityRole,
    },

    // PaymentSubmission
    ChoosingStudent {
        students: Vec<StudentChoice>,
    },
    EnteringLessonCount {
        student: StudentChoice,
    },
    AwaitingAttachment {
        student: StudentChoice,
        lessons: u32,
    },

    // LessonMarking
    SelectingStudents {
        students: Vec<StudentChoice>,
        #[serde(default)]
        selected: BTreeSet<Identity>,
    },
}

impl WorkflowState {
    pub fn workflow(&self) -> Workflow {
        match self {
            WorkflowState::AwaitingName => Workflow::Registration,
            WorkflowState::ChoosingUser { .. } | WorkflowState::ChoosingAssignedRole { .. } => {
                Workflow::RoleAssignment
            }
            WorkflowState::ChoosingEntityRole | WorkflowState::EnteringFields { .. } => {
                Workflow::EntityCreation
            }
            WorkflowState::ChoosingStudent { .. }
            | WorkflowState::EnteringLessonCount { .. }
            | WorkflowState::AwaitingAttachment { .. } => Workflow::PaymentSubmission,
            WorkflowState::SelectingStudents { .. } => Workflow::LessonMarking,
        }
    }

    pub fn step_name(&self) -> &'static str {
        match self {
            WorkflowState::AwaitingName => "awaiting_name",
            WorkflowState::ChoosingUser { .. } => "choosing_user",
            WorkflowState::ChoosingAssignedRole { .. } | WorkflowState::ChoosingEntityRole => {
                "choosing_role"
            }
            WorkflowState::EnteringFields { .. } => "entering_fields",
            WorkflowState::ChoosingStudent { .. } => "choosing_student",
            WorkflowState::EnteringLessonCount { .. } => "entering_lesson_count",
            WorkflowState::AwaitingAttachment { .. } => "awaiting_attachment",
            WorkflowState::SelectingStudents { .. } => "selecting_students",
        }
    }

    /// Step data gathered so far, in the order it was collected
    pub fn fields(&self) -> Vec<(&'static str, FieldValue)> {
        match self {
            WorkflowState::AwaitingName
            | WorkflowState::ChoosingUser { .. }
            | WorkflowState::ChoosingEntityRole
            | WorkflowState::ChoosingStudent { .. } => vec![],
            WorkflowState::ChoosingAssignedRole { user } => vec![
                ("telegram_id", FieldValue::Int(user.identity.0)),
                ("name", FieldValue::Text(user.name.clone())),
            ],
            WorkflowState::EnteringFields { role } => {
                vec![("role", FieldValue::Text(role.as_str().to_string()))]
            }
            WorkflowState::EnteringLessonCount { student } => student_fields(student),
            WorkflowState::AwaitingAttachment { student, lessons } => {
                let mut fields = student_fields(student);
                fields.push(("lessons", FieldValue::Int(i64::from(*lessons))));
                fields
            }
            WorkflowState::SelectingStudents { selected, .. } => selected
                .iter()
                .map(|id| ("student_id", FieldValue::Int(id.0)))
                .collect(),
        }
    }
}

fn student_fields(student: &StudentChoice) -> Vec<(&'static str, FieldValue)> {
    vec![
        ("student_id", FieldValue::Int(student.telegram_id.0)),
        ("student_name", FieldValue::Text(student.name.clone())),
    ]
}

/// Per-event context handed to the transition function (immutable)
#[derive(Debug, Clone, Copy)]
pub struct StepContext {
    pub identity: Identity,
}

impl StepContext {
    pub fn new(identity: Identity) -> Self {
        Self { identity }
    }
}
