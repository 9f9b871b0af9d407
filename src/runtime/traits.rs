//! Trait abstractions for the engine's collaborators
//!
//! These traits let the engine run against mock implementations in tests.

use crate::approval::{NewPayment, PaymentId, PendingPayment, Resolution};
use crate::db::{Database, DbError};
use crate::identity::{EntityRecord, EntityRole, Identity, StudentRecord};
use crate::state_machine::{Attachment, Control, StagedUser};
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

/// Failure reported by an external collaborator
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    /// Storage or transport outage; the caller may retry
    #[error("backend unavailable: {0}")]
    Unavailable(String),
    /// The write lost a race against an earlier one
    #[error("conflict: {0}")]
    Conflict(String),
    /// The request references something that does not exist or is malformed
    #[error("invalid request: {0}")]
    Invalid(String),
}

impl From<DbError> for BackendError {
    fn from(e: DbError) -> Self {
        match e {
            DbError::Sqlite(_) | DbError::Corrupt(_) => BackendError::Unavailable(e.to_string()),
            DbError::EntityExists { .. } | DbError::PaymentSettled(_) => {
                BackendError::Conflict(e.to_string())
            }
            DbError::EntityNotFound { .. } | DbError::PaymentNotFound(_) => {
                BackendError::Invalid(e.to_string())
            }
        }
    }
}

/// Records of one role
#[async_trait]
pub trait EntityStore: Send + Sync {
    async fn find_by_identity(&self, identity: Identity)
        -> Result<Option<EntityRecord>, BackendError>;

    /// Fails with `Conflict` if the identity already has a record of this role
    async fn create(&self, record: &EntityRecord) -> Result<(), BackendError>;

    /// Returns false if there was nothing to delete
    async fn delete(&self, identity: Identity) -> Result<bool, BackendError>;
}

/// Identities that registered and wait for a role
#[async_trait]
pub trait StagingList: Send + Sync {
    /// Idempotent. Returns false if the identity was already staged.
    async fn add(&self, identity: Identity, name: &str) -> Result<bool, BackendError>;

    /// Entries in registration order
    async fn list_all(&self) -> Result<Vec<StagedUser>, BackendError>;

    /// Atomic check-and-remove. Exactly one of two concurrent callers gets true.
    async fn remove(&self, identity: Identity) -> Result<bool, BackendError>;
}

/// Durable storage for user-supplied files
#[async_trait]
pub trait AttachmentStore: Send + Sync {
    /// Returns the storage path of the saved file
    async fn save(&self, attachment: &Attachment, owner: Identity) -> Result<String, BackendError>;

    /// Remove a saved file that ended up unused. Missing files are not an error.
    async fn discard(&self, path: &str) -> Result<(), BackendError>;
}

/// The only way the engine talks to users
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(
        &self,
        identity: Identity,
        text: &str,
        controls: &[Control],
    ) -> Result<(), BackendError>;
}

/// Durable record of payment submissions and their decisions
#[async_trait]
pub trait PaymentStore: Send + Sync {
    /// Assigns the id
    async fn insert(&self, payment: NewPayment) -> Result<PendingPayment, BackendError>;

    async fn mark_checked(&self, id: PaymentId) -> Result<(), BackendError>;

    /// Record a decision. An approval credits the student in the same atomic write.
    /// Fails with `Conflict` if the payment already carries a decision.
    async fn settle(
        &self,
        payment: &PendingPayment,
        resolution: &Resolution,
    ) -> Result<(), BackendError>;

    /// Payments without a decision, oldest first
    async fn load_unresolved(&self) -> Result<Vec<PendingPayment>, BackendError>;
}

/// Relations between students and the parents and tutors around them
#[async_trait]
pub trait StudentDirectory: Send + Sync {
    async fn students_of_parent(&self, parent: Identity)
        -> Result<Vec<StudentRecord>, BackendError>;

    async fn students_of_tutor(&self, tutor: Identity) -> Result<Vec<StudentRecord>, BackendError>;

    /// Take one lesson from each student atomically. Returns the updated records.
    async fn debit_lessons(&self, students: &[Identity])
        -> Result<Vec<StudentRecord>, BackendError>;

    async fn link_parent(&self, student: Identity, parent: Identity) -> Result<(), BackendError>;

    async fn link_tutor(&self, student: Identity, tutor: Identity) -> Result<(), BackendError>;
}

/// One entity store per role, probed in priority order
#[derive(Clone)]
pub struct EntityStores {
    pub admins: Arc<dyn EntityStore>,
    pub tutors: Arc<dyn EntityStore>,
    pub students: Arc<dyn EntityStore>,
    pub parents: Arc<dyn EntityStore>,
}

impl EntityStores {
    pub fn get(&self, role: EntityRole) -> &Arc<dyn EntityStore> {
        match role {
            EntityRole::Admin => &self.admins,
            EntityRole::Tutor => &self.tutors,
            EntityRole::Student => &self.students,
            EntityRole::Parent => &self.parents,
        }
    }

    /// One table-backed store per role over a shared database
    pub fn from_database(db: &Database) -> Self {
        let table = |role| Arc::new(RoleTable::new(db.clone(), role)) as Arc<dyn EntityStore>;
        Self {
            admins: table(EntityRole::Admin),
            tutors: table(EntityRole::Tutor),
            students: table(EntityRole::Student),
            parents: table(EntityRole::Parent),
        }
    }
}

// ============================================================================
// Production Adapters
// ============================================================================

/// Entity store for one role's table
#[derive(Clone)]
pub struct RoleTable {
    db: Database,
    role: EntityRole,
}

impl RoleTable {
    pub fn new(db: Database, role: EntityRole) -> Self {
        Self { db, role }
    }
}

#[async_trait]
impl EntityStore for RoleTable {
    async fn find_by_identity(
        &self,
        identity: Identity,
    ) -> Result<Option<EntityRecord>, BackendError> {
        Ok(self.db.find_entity(self.role, identity)?)
    }

    async fn create(&self, record: &EntityRecord) -> Result<(), BackendError> {
        if record.role() != self.role {
            return Err(BackendError::Invalid(format!(
                "{} record given to the {} table",
                record.role(),
                self.role
            )));
        }
        Ok(self.db.insert_entity(record)?)
    }

    async fn delete(&self, identity: Identity) -> Result<bool, BackendError> {
        Ok(self.db.delete_entity(self.role, identity)?)
    }
}

/// Adapter to use Database for staging, payments and student relations
#[derive(Clone)]
pub struct DatabaseBackend {
    db: Database,
}

impl DatabaseBackend {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

#[async_trait]
impl StagingList for DatabaseBackend {
    async fn add(&self, identity: Identity, name: &str) -> Result<bool, BackendError> {
        Ok(self.db.stage_user(identity, name)?)
    }

    async fn list_all(&self) -> Result<Vec<StagedUser>, BackendError> {
        Ok(self.db.list_staged()?)
    }

    async fn remove(&self, identity: Identity) -> Result<bool, BackendError> {
        Ok(self.db.unstage_user(identity)?)
    }
}

#[async_trait]
impl PaymentStore for DatabaseBackend {
    async fn insert(&self, payment: NewPayment) -> Result<PendingPayment, BackendError> {
        Ok(self.db.insert_payment(payment)?)
    }

    async fn mark_checked(&self, id: PaymentId) -> Result<(), BackendError> {
        Ok(self.db.mark_payment_checked(id)?)
    }

    async fn settle(
        &self,
        payment: &PendingPayment,
        resolution: &Resolution,
    ) -> Result<(), BackendError> {
        Ok(self.db.settle_payment(payment, resolution)?)
    }

    async fn load_unresolved(&self) -> Result<Vec<PendingPayment>, BackendError> {
        Ok(self.db.unresolved_payments()?)
    }
}

#[async_trait]
impl StudentDirectory for DatabaseBackend {
    async fn students_of_parent(
        &self,
        parent: Identity,
    ) -> Result<Vec<StudentRecord>, BackendError> {
        Ok(self.db.students_of_parent(parent)?)
    }

    async fn students_of_tutor(&self, tutor: Identity) -> Result<Vec<StudentRecord>, BackendError> {
        Ok(self.db.students_of_tutor(tutor)?)
    }

    async fn debit_lessons(
        &self,
        students: &[Identity],
    ) -> Result<Vec<StudentRecord>, BackendError> {
        Ok(self.db.debit_lessons(students)?)
    }

    async fn link_parent(&self, student: Identity, parent: Identity) -> Result<(), BackendError> {
        Ok(self.db.link_parent(student, parent)?)
    }

    async fn link_tutor(&self, student: Identity, tutor: Identity) -> Result<(), BackendError> {
        Ok(self.db.link_tutor(student, tutor)?)
    }
}
