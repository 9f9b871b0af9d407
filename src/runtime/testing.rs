//! Mock implementations for testing
//!
//! These mocks let the engine and review desk run without real I/O.

use super::engine::{Collaborators, WorkflowEngine};
use super::traits::*;
use crate::approval::{
    ApprovalQueue, Decision, NewPayment, PaymentId, PendingPayment, Resolution,
};
use crate::conversation::ConversationStore;
use crate::identity::{
    AdminRecord, EntityRecord, EntityRole, Identity, ParentRecord, StudentRecord, TutorRecord,
};
use crate::state_machine::{Attachment, Control, StagedUser};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

// ============================================================================
// In-memory backend
// ============================================================================

#[derive(Default)]
struct MemoryState {
    records: HashMap<(EntityRole, Identity), EntityRecord>,
    staged: Vec<StagedUser>,
    payments: BTreeMap<PaymentId, (PendingPayment, Option<Resolution>)>,
    next_payment_id: i64,
    tutor_links: BTreeSet<(Identity, Identity)>,
    failing_lookups: HashSet<EntityRole>,
    fail_next_payment_insert: bool,
    fail_next_settle: bool,
    fail_next_attachment_save: bool,
    settle_count: usize,
    attachments: Vec<(Identity, String)>,
    messages: Vec<(Identity, String, Vec<Control>)>,
}

/// Every collaborator trait over one shared in-memory state
#[derive(Default)]
pub struct InMemoryBackend {
    state: Mutex<MemoryState>,
    settle_delay: Duration,
}

#[allow(dead_code)]
impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hold every settle call open for a while, to widen race windows
    pub fn with_settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }

    pub fn entity_stores(self: &Arc<Self>) -> EntityStores {
        let table = |role| {
            Arc::new(MemoryTable {
                backend: Arc::clone(self),
                role,
            }) as Arc<dyn EntityStore>
        };
        EntityStores {
            admins: table(EntityRole::Admin),
            tutors: table(EntityRole::Tutor),
            students: table(EntityRole::Student),
            parents: table(EntityRole::Parent),
        }
    }

    // ---- seeding ----

    pub fn insert_record(&self, record: EntityRecord) {
        self.state
            .lock()
            .unwrap()
            .records
            .insert((record.role(), record.identity()), record);
    }

    pub fn add_admin(&self, id: i64, name: &str) {
        self.insert_record(EntityRecord::Admin(AdminRecord {
            telegram_id: Identity(id),
            name: name.to_string(),
            is_admin: true,
        }));
    }

    pub fn add_parent(&self, id: i64, name: &str) {
        self.insert_record(EntityRecord::Parent(ParentRecord {
            telegram_id: Identity(id),
            full_name: name.to_string(),
        }));
    }

    pub fn add_student(&self, id: i64, first_name: &str, parent: Option<i64>) {
        self.insert_record(EntityRecord::Student(StudentRecord {
            telegram_id: Identity(id),
            first_name: first_name.to_string(),
            last_name: String::new(),
            is_admin: false,
            payed_lessons: 0,
            parent: parent.map(Identity),
        }));
    }

    pub fn add_tutor(&self, id: i64, name: &str, students: &[i64]) {
        self.insert_record(EntityRecord::Tutor(TutorRecord {
            telegram_id: Identity(id),
            name: name.to_string(),
            is_admin: false,
        }));
        let mut state = self.state.lock().unwrap();
        for &student in students {
            state.tutor_links.insert((Identity(student), Identity(id)));
        }
    }

    pub fn stage(&self, id: i64, name: &str) {
        self.state.lock().unwrap().staged.push(StagedUser {
            identity: Identity(id),
            name: name.to_string(),
        });
    }

    pub fn set_balance(&self, student: i64, lessons: i64) {
        let mut state = self.state.lock().unwrap();
        if let Some(EntityRecord::Student(record)) = state
            .records
            .get_mut(&(EntityRole::Student, Identity(student)))
        {
            record.payed_lessons = lessons;
        }
    }

    // ---- fault injection ----

    pub fn fail_lookups(&self, role: EntityRole) {
        self.state.lock().unwrap().failing_lookups.insert(role);
    }

    pub fn restore_lookups(&self) {
        self.state.lock().unwrap().failing_lookups.clear();
    }

    pub fn fail_next_payment_insert(&self) {
        self.state.lock().unwrap().fail_next_payment_insert = true;
    }

    pub fn fail_next_settle(&self) {
        self.state.lock().unwrap().fail_next_settle = true;
    }

    pub fn fail_next_attachment_save(&self) {
        self.state.lock().unwrap().fail_next_attachment_save = true;
    }

    // ---- inspection ----

    pub fn record(&self, role: EntityRole, identity: Identity) -> Option<EntityRecord> {
        self.state
            .lock()
            .unwrap()
            .records
            .get(&(role, identity))
            .cloned()
    }

    pub fn balance(&self, student: i64) -> i64 {
        match self.record(EntityRole::Student, Identity(student)) {
            Some(EntityRecord::Student(record)) => record.payed_lessons,
            _ => panic!("no student {student}"),
        }
    }

    pub fn staged(&self) -> Vec<StagedUser> {
        self.state.lock().unwrap().staged.clone()
    }

    pub fn settle_count(&self) -> usize {
        self.state.lock().unwrap().settle_count
    }

    pub fn saved_attachments(&self) -> usize {
        self.state.lock().unwrap().attachments.len()
    }

    pub fn payment(&self, id: PaymentId) -> Option<(PendingPayment, Option<Resolution>)> {
        self.state.lock().unwrap().payments.get(&id).cloned()
    }

    pub fn messages_for(&self, identity: Identity) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .messages
            .iter()
            .filter(|(to, _, _)| *to == identity)
            .map(|(_, text, _)| text.clone())
            .collect()
    }

    pub fn last_controls_for(&self, identity: Identity) -> Vec<Control> {
        self.state
            .lock()
            .unwrap()
            .messages
            .iter()
            .rev()
            .find(|(to, _, _)| *to == identity)
            .map(|(_, _, controls)| controls.clone())
            .unwrap_or_default()
    }

    fn students_where(&self, keep: impl Fn(&StudentRecord) -> bool) -> Vec<StudentRecord> {
        let state = self.state.lock().unwrap();
        let mut students: Vec<StudentRecord> = state
            .records
            .values()
            .filter_map(|record| match record {
                EntityRecord::Student(student) if keep(student) => Some(student.clone()),
                _ => None,
            })
            .collect();
        students.sort_by_key(|s| s.telegram_id);
        students
    }
}

/// One role's view of the in-memory backend
struct MemoryTable {
    backend: Arc<InMemoryBackend>,
    role: EntityRole,
}

#[async_trait]
impl EntityStore for MemoryTable {
    async fn find_by_identity(
        &self,
        identity: Identity,
    ) -> Result<Option<EntityRecord>, BackendError> {
        let state = self.backend.state.lock().unwrap();
        if state.failing_lookups.contains(&self.role) {
            return Err(BackendError::Unavailable(format!("{} table offline", self.role)));
        }
        Ok(state.records.get(&(self.role, identity)).cloned())
    }

    async fn create(&self, record: &EntityRecord) -> Result<(), BackendError> {
        let mut state = self.backend.state.lock().unwrap();
        let key = (self.role, record.identity());
        if state.records.contains_key(&key) {
            return Err(BackendError::Conflict(format!(
                "{} {} already exists",
                self.role,
                record.identity()
            )));
        }
        state.records.insert(key, record.clone());
        Ok(())
    }

    async fn delete(&self, identity: Identity) -> Result<bool, BackendError> {
        let mut state = self.backend.state.lock().unwrap();
        Ok(state.records.remove(&(self.role, identity)).is_some())
    }
}

#[async_trait]
impl StagingList for InMemoryBackend {
    async fn add(&self, identity: Identity, name: &str) -> Result<bool, BackendError> {
        let mut state = self.state.lock().unwrap();
        if state.staged.iter().any(|u| u.identity == identity) {
            return Ok(false);
        }
        state.staged.push(StagedUser {
            identity,
            name: name.to_string(),
        });
        Ok(true)
    }

    async fn list_all(&self) -> Result<Vec<StagedUser>, BackendError> {
        Ok(self.staged())
    }

    async fn remove(&self, identity: Identity) -> Result<bool, BackendError> {
        let mut state = self.state.lock().unwrap();
        let before = state.staged.len();
        state.staged.retain(|u| u.identity != identity);
        Ok(state.staged.len() < before)
    }
}

#[async_trait]
impl PaymentStore for InMemoryBackend {
    async fn insert(&self, payment: NewPayment) -> Result<PendingPayment, BackendError> {
        let mut state = self.state.lock().unwrap();
        if std::mem::take(&mut state.fail_next_payment_insert) {
            return Err(BackendError::Unavailable("payments table locked".into()));
        }
        state.next_payment_id += 1;
        let id = PaymentId(state.next_payment_id);
        let stored = PendingPayment::from_new(id, payment, Utc::now());
        state.payments.insert(id, (stored.clone(), None));
        Ok(stored)
    }

    async fn mark_checked(&self, id: PaymentId) -> Result<(), BackendError> {
        let mut state = self.state.lock().unwrap();
        let (payment, _) = state
            .payments
            .get_mut(&id)
            .ok_or_else(|| BackendError::Invalid(format!("payment {id} not found")))?;
        payment.checked = true;
        Ok(())
    }

    async fn settle(
        &self,
        payment: &PendingPayment,
        resolution: &Resolution,
    ) -> Result<(), BackendError> {
        if !self.settle_delay.is_zero() {
            tokio::time::sleep(self.settle_delay).await;
        }
        let mut state = self.state.lock().unwrap();
        if std::mem::take(&mut state.fail_next_settle) {
            return Err(BackendError::Unavailable("settle failed".into()));
        }
        match state.payments.get(&payment.id) {
            None => return Err(BackendError::Invalid(format!("payment {} not found", payment.id))),
            Some((_, Some(_))) => {
                return Err(BackendError::Conflict(format!(
                    "payment {} already settled",
                    payment.id
                )))
            }
            Some((_, None)) => {}
        }
        if resolution.decision == Decision::Approve {
            let Some(EntityRecord::Student(student)) = state
                .records
                .get_mut(&(EntityRole::Student, payment.student))
            else {
                return Err(BackendError::Invalid(format!(
                    "student {} not found",
                    payment.student
                )));
            };
            student.payed_lessons += i64::from(payment.lessons);
        }
        if let Some((_, slot)) = state.payments.get_mut(&payment.id) {
            *slot = Some(resolution.clone());
        }
        state.settle_count += 1;
        Ok(())
    }

    async fn load_unresolved(&self) -> Result<Vec<PendingPayment>, BackendError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .payments
            .values()
            .filter(|(_, resolution)| resolution.is_none())
            .map(|(payment, _)| payment.clone())
            .collect())
    }
}

#[async_trait]
impl StudentDirectory for InMemoryBackend {
    async fn students_of_parent(
        &self,
        parent: Identity,
    ) -> Result<Vec<StudentRecord>, BackendError> {
        Ok(self.students_where(|s| s.parent == Some(parent)))
    }

    async fn students_of_tutor(&self, tutor: Identity) -> Result<Vec<StudentRecord>, BackendError> {
        let linked: HashSet<Identity> = self
            .state
            .lock()
            .unwrap()
            .tutor_links
            .iter()
            .filter(|(_, t)| *t == tutor)
            .map(|(s, _)| *s)
            .collect();
        Ok(self.students_where(|s| linked.contains(&s.telegram_id)))
    }

    async fn debit_lessons(
        &self,
        students: &[Identity],
    ) -> Result<Vec<StudentRecord>, BackendError> {
        let mut state = self.state.lock().unwrap();
        if let Some(missing) = students
            .iter()
            .find(|id| !state.records.contains_key(&(EntityRole::Student, **id)))
        {
            return Err(BackendError::Invalid(format!("student {missing} not found")));
        }
        let mut updated = Vec::new();
        for id in students {
            if let Some(EntityRecord::Student(student)) =
                state.records.get_mut(&(EntityRole::Student, *id))
            {
                student.payed_lessons -= 1;
                updated.push(student.clone());
            }
        }
        Ok(updated)
    }

    async fn link_parent(&self, student: Identity, parent: Identity) -> Result<(), BackendError> {
        let mut state = self.state.lock().unwrap();
        if !state.records.contains_key(&(EntityRole::Parent, parent)) {
            return Err(BackendError::Invalid(format!("parent {parent} not found")));
        }
        match state.records.get_mut(&(EntityRole::Student, student)) {
            Some(EntityRecord::Student(record)) => {
                record.parent = Some(parent);
                Ok(())
            }
            _ => Err(BackendError::Invalid(format!("student {student} not found"))),
        }
    }

    async fn link_tutor(&self, student: Identity, tutor: Identity) -> Result<(), BackendError> {
        let mut state = self.state.lock().unwrap();
        for (role, id) in [(EntityRole::Student, student), (EntityRole::Tutor, tutor)] {
            if !state.records.contains_key(&(role, id)) {
                return Err(BackendError::Invalid(format!("{role} {id} not found")));
            }
        }
        state.tutor_links.insert((student, tutor));
        Ok(())
    }
}

#[async_trait]
impl AttachmentStore for InMemoryBackend {
    async fn save(&self, attachment: &Attachment, owner: Identity) -> Result<String, BackendError> {
        let mut state = self.state.lock().unwrap();
        if std::mem::take(&mut state.fail_next_attachment_save) {
            return Err(BackendError::Unavailable("disk full".into()));
        }
        let path = format!(
            "uploads/{owner}/{}-{}.jpg",
            state.attachments.len(),
            attachment.data.len()
        );
        state.attachments.push((owner, path.clone()));
        Ok(path)
    }

    async fn discard(&self, path: &str) -> Result<(), BackendError> {
        self.state
            .lock()
            .unwrap()
            .attachments
            .retain(|(_, saved)| saved != path);
        Ok(())
    }
}

#[async_trait]
impl Notifier for InMemoryBackend {
    async fn send(
        &self,
        identity: Identity,
        text: &str,
        controls: &[Control],
    ) -> Result<(), BackendError> {
        self.state
            .lock()
            .unwrap()
            .messages
            .push((identity, text.to_string(), controls.to_vec()));
        Ok(())
    }
}

// ============================================================================
// Engine harness
// ============================================================================

/// A workflow engine wired to one in-memory backend
pub struct EngineHarness {
    pub engine: WorkflowEngine,
    pub backend: Arc<InMemoryBackend>,
}

impl EngineHarness {
    pub fn new(backend: InMemoryBackend) -> Self {
        let backend = Arc::new(backend);
        let collaborators = Collaborators {
            entities: backend.entity_stores(),
            staging: backend.clone(),
            students: backend.clone(),
            payments: backend.clone(),
            attachments: backend.clone(),
            notifier: backend.clone(),
        };
        let engine = WorkflowEngine::new(
            collaborators,
            Arc::new(ConversationStore::new(Duration::from_secs(1800))),
            Arc::new(ApprovalQueue::new()),
        );
        Self { engine, backend }
    }
}
