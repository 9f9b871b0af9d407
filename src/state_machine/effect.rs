//! Effects produced by workflow transitions

use super::event::{Attachment, Selection};
use super::state::{StagedUser, StudentChoice};
use crate::identity::{EntityRecord, EntityRole, Identity};
use serde::{Deserialize, Serialize};

/// An interactive control offered alongside a message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Control {
    pub label: String,
    pub selection: Selection,
}

impl Control {
    pub fn new(label: impl Into<String>, selection: Selection) -> Self {
        Self {
            label: label.into(),
            selection,
        }
    }
}

/// Effects to be executed after a transition, in order.
///
/// Every effect except `Notify` must succeed before the new state is committed.
#[derive(Debug, Clone)]
pub enum Effect {
    /// Put an identity in the staging list (idempotent)
    StageUser { identity: Identity, name: String },

    /// Turn a staged user into an entity record of the chosen role
    AssignRole { user: StagedUser, role: EntityRole },

    /// Persist a record typed in by an administrator
    CreateEntity { record: EntityRecord },

    /// Store the attachment and queue the payment for review
    SubmitPayment {
        student: StudentChoice,
        lessons: u32,
        attachment: Attachment,
    },

    /// Take one paid lesson from each student
    DebitLessons { students: Vec<Identity> },

    /// Message the acting identity (best-effort)
    Notify {
        text: String,
        controls: Vec<Control>,
    },
}

impl Effect {
    pub fn notify(text: impl Into<String>) -> Self {
        Effect::Notify {
            text: text.into(),
            controls: vec![],
        }
    }

    pub fn notify_with_controls(text: impl Into<String>, controls: Vec<Control>) -> Self {
        Effect::Notify {
            text: text.into(),
            controls,
        }
    }

    pub fn is_notification(&self) -> bool {
        matches!(self, Effect::Notify { .. })
    }

    pub fn name(&self) -> &'static str {
        match self {
            Effect::StageUser { .. } => "stage_user",
            Effect::AssignRole { .. } => "assign_role",
            Effect::CreateEntity { .. } => "create_entity",
            Effect::SubmitPayment { .. } => "submit_payment",
            Effect::DebitLessons { .. } => "debit_lessons",
            Effect::Notify { .. } => "notify",
        }
    }
}
