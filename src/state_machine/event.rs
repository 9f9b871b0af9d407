//! Inputs that drive workflow transitions

use crate::approval::PaymentId;
use crate::identity::{EntityRole, Identity};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One inbound event, as delivered by the transport
#[derive(Debug, Clone)]
pub struct InboundEvent {
    pub identity: Identity,
    pub input: Input,
}

impl InboundEvent {
    pub fn text(identity: Identity, text: impl Into<String>) -> Self {
        Self {
            identity,
            input: Input::Text(text.into()),
        }
    }

    pub fn selection(identity: Identity, selection: Selection) -> Self {
        Self {
            identity,
            input: Input::Selection(selection),
        }
    }

    pub fn attachment(identity: Identity, attachment: Attachment) -> Self {
        Self {
            identity,
            input: Input::Attachment(attachment),
        }
    }
}

/// Input shapes a workflow step can accept
#[derive(Debug, Clone)]
pub enum Input {
    Text(String),
    Attachment(Attachment),
    Selection(Selection),
}

/// Raw file sent by a user
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub media_type: String,
    pub data: Vec<u8>,
}

impl Attachment {
    pub fn new(media_type: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            media_type: media_type.into(),
            data,
        }
    }

    pub fn is_image(&self) -> bool {
        self.media_type
            .split('/')
            .next()
            .is_some_and(|kind| kind.eq_ignore_ascii_case("image"))
            && !self.data.is_empty()
    }
}

/// A tapped interactive control
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Selection {
    StagedUser { identity: Identity },
    Role { role: EntityRole },
    Student { identity: Identity },
    Done,
    Review(ReviewAction),
}

/// Reviewer actions on the approval queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ReviewAction {
    Next,
    Stop,
    Approve { payment_id: PaymentId },
    Decline { payment_id: PaymentId },
}

// ============================================================================
// Commands
// ============================================================================

/// Slash commands recognised in text input
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Start,
    Cancel,
    Assign,
    CreateUser,
    DeleteUser { role: EntityRole, identity: Identity },
    LinkParent { student: Identity, parent: Identity },
    LinkTutor { student: Identity, tutor: Identity },
    Pay,
    Balance,
    Mark,
    Payments,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    #[error("Unknown command: {0}")]
    Unknown(String),
    #[error("Usage: {0}")]
    Usage(&'static str),
}

impl Command {
    /// Parse a slash command. Text that is not a command yields `Ok(None)`.
    pub fn parse(text: &str) -> Result<Option<Command>, CommandError> {
        let text = text.trim();
        if !text.starts_with('/') {
            return Ok(None);
        }
        let mut parts = text.split_whitespace();
        let name = parts.next().unwrap_or_default();
        // Commands addressed as /cmd@botname
        let name = name.split('@').next().unwrap_or(name);
        let args: Vec<&str> = parts.collect();

        let command = match name {
            "/start" => Command::Start,
            "/cancel" => Command::Cancel,
            "/assign" => Command::Assign,
            "/create_user" => Command::CreateUser,
            "/pay" => Command::Pay,
            "/balance" => Command::Balance,
            "/mark" => Command::Mark,
            "/payments" => Command::Payments,
            "/delete_user" => {
                const USAGE: &str = "/delete_user <role> <telegram_id>";
                let [role, id] = args.as_slice() else {
                    return Err(CommandError::Usage(USAGE));
                };
                Command::DeleteUser {
                    role: role.parse().map_err(|_| CommandError::Usage(USAGE))?,
                    identity: id.parse().map_err(|_| CommandError::Usage(USAGE))?,
                }
            }
            "/link_parent" => {
                const USAGE: &str = "/link_parent <student_id> <parent_id>";
                let (student, parent) = two_identities(&args).ok_or(CommandError::Usage(USAGE))?;
                Command::LinkParent { student, parent }
            }
            "/link_tutor" => {
                const USAGE: &str = "/link_tutor <student_id> <tutor_id>";
                let (student, tutor) = two_identities(&args).ok_or(CommandError::Usage(USAGE))?;
                Command::LinkTutor { student, tutor }
            }
            other => return Err(CommandError::Unknown(other.to_string())),
        };
        Ok(Some(command))
    }

    pub fn name(&self) -> &'static str {
        match self {
            Command::Start => "start",
            Command::Cancel => "cancel",
            Command::Assign => "assign",
            Command::CreateUser => "create_user",
            Command::DeleteUser { .. } => "delete_user",
            Command::LinkParent { .. } => "link_parent",
            Command::LinkTutor { .. } => "link_tutor",
            Command::Pay => "pay",
            Command::Balance => "balance",
            Command::Mark => "mark",
            Command::Payments => "payments",
        }
    }
}

fn two_identities(args: &[&str]) -> Option<(Identity, Identity)> {
    let [a, b] = args else {
        return None;
    };
    Some((a.parse().ok()?, b.parse().ok()?))
}
