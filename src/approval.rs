//! Shared review queue of pending payments
//!
//! Each pending item is resolved at most once, no matter how many reviewers act on
//! it concurrently. Resolution claims the item with a compare-and-swap before any
//! side effect runs; the loser of a race gets `AlreadyResolved` and touches nothing.

mod cursor;
mod queue;
mod review;

pub use cursor::ReviewerCursor;
pub use queue::ApprovalQueue;
pub use review::{CursorStep, ResolveError, ReviewDesk};

use crate::identity::Identity;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Unique id of a pending payment, assigned by the payment store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PaymentId(pub i64);

impl fmt::Display for PaymentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A payment submission before it has been stored
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewPayment {
    pub parent: Identity,
    pub parent_name: String,
    pub student: Identity,
    pub student_name: String,
    pub lessons: u32,
    pub file_path: String,
}

/// A payment awaiting a reviewer's decision
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingPayment {
    pub id: PaymentId,
    pub parent: Identity,
    pub parent_name: String,
    pub student: Identity,
    pub student_name: String,
    pub lessons: u32,
    pub file_path: String,
    pub created_at: DateTime<Utc>,
    /// Has been shown to a reviewer
    pub checked: bool,
}

impl PendingPayment {
    pub fn from_new(id: PaymentId, new: NewPayment, created_at: DateTime<Utc>) -> Self {
        Self {
            id,
            parent: new.parent,
            parent_name: new.parent_name,
            student: new.student,
            student_name: new.student_name,
            lessons: new.lessons,
            file_path: new.file_path,
            created_at,
            checked: false,
        }
    }

    pub fn caption(&self) -> String {
        format!(
            "Payment {}\nParent: {}\nStudent: {}\nLessons: {}\nReceipt: {}",
            self.id, self.parent_name, self.student_name, self.lessons, self.file_path
        )
    }
}

/// Binary reviewer decision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Approve,
    Decline,
}

impl Decision {
    pub fn as_str(self) -> &'static str {
        match self {
            Decision::Approve => "approved",
            Decision::Decline => "declined",
        }
    }
}

/// Terminal outcome recorded on a payment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub decision: Decision,
    pub resolver: Identity,
    pub resolver_name: String,
    pub resolved_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum QueueError {
    #[error("payment {0} not found")]
    NotFound(PaymentId),
    #[error("payment {0} was already resolved")]
    AlreadyResolved(PaymentId),
}
