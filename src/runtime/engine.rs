//! Workflow engine: commands, review actions and step transitions for one event

use super::traits::{
    AttachmentStore, BackendError, EntityStores, Notifier, PaymentStore, StagingList,
    StudentDirectory,
};
use crate::approval::{
    ApprovalQueue, CursorStep, Decision, NewPayment, PaymentId, QueueError, ResolveError,
    ReviewDesk,
};
use crate::conversation::ConversationStore;
use crate::identity::{EntityRecord, Identity, Role};
use crate::role::{ResolutionFailed, ResolvedRole, RoleResolver};
use crate::state_machine::{
    begin, transition, Command, Control, Effect, InboundEvent, Input, Rejection, ReviewAction,
    Selection, Start, StepContext, StudentChoice, TransitionError, TransitionResult,
};
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;

/// What handling one event did
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Outcome {
    /// A workflow started or moved to its next step
    Advanced,
    /// A workflow or one-shot command finished
    Completed,
    /// Step input refused; the step is unchanged
    Rejected(Rejection),
    /// Malformed or unknown slash command
    CommandRejected { message: String },
    /// Input for no active or a superseded step
    Ignored,
    Review(ReviewOutcome),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum ReviewOutcome {
    Shown { payment_id: PaymentId },
    Exhausted,
    Stopped,
    Resolved {
        payment_id: PaymentId,
        decision: Decision,
    },
    AlreadyResolved { payment_id: PaymentId },
    NotFound { payment_id: PaymentId },
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    ResolutionFailed(#[from] ResolutionFailed),
    /// The staged user was taken by a concurrent assignment
    #[error("staged user {0} is no longer waiting for a role")]
    StaleSelection(Identity),
    #[error("/{command} is not available to role {role:?}")]
    Forbidden { command: &'static str, role: Role },
    #[error("{effect} failed: {source}")]
    Effect {
        effect: &'static str,
        #[source]
        source: BackendError,
    },
}

impl EngineError {
    fn effect(effect: &'static str) -> impl FnOnce(BackendError) -> Self {
        move |source| EngineError::Effect { effect, source }
    }
}

/// External collaborators the engine drives
#[derive(Clone)]
pub struct Collaborators {
    pub entities: EntityStores,
    pub staging: Arc<dyn StagingList>,
    pub students: Arc<dyn StudentDirectory>,
    pub payments: Arc<dyn PaymentStore>,
    pub attachments: Arc<dyn AttachmentStore>,
    pub notifier: Arc<dyn Notifier>,
}

const FAILURE_NOTICE: &str = "Something went wrong, please try again.";

pub struct WorkflowEngine {
    resolver: RoleResolver,
    entities: EntityStores,
    staging: Arc<dyn StagingList>,
    students: Arc<dyn StudentDirectory>,
    attachments: Arc<dyn AttachmentStore>,
    notifier: Arc<dyn Notifier>,
    conversations: Arc<ConversationStore>,
    desk: ReviewDesk,
}

impl WorkflowEngine {
    pub fn new(
        collaborators: Collaborators,
        conversations: Arc<ConversationStore>,
        queue: Arc<ApprovalQueue>,
    ) -> Self {
        let Collaborators {
            entities,
            staging,
            students,
            payments,
            attachments,
            notifier,
        } = collaborators;
        Self {
            resolver: RoleResolver::new(entities.clone()),
            entities,
            staging,
            students,
            attachments,
            notifier,
            conversations,
            desk: ReviewDesk::new(queue, payments),
        }
    }

    pub fn conversations(&self) -> &Arc<ConversationStore> {
        &self.conversations
    }

    pub fn desk(&self) -> &ReviewDesk {
        &self.desk
    }

    /// Handle one inbound event. Callers must not run two events for the same
    /// identity at once.
    pub async fn handle(&self, event: InboundEvent) -> Result<Outcome, EngineError> {
        let InboundEvent { identity, input } = event;

        // Commands interrupt any workflow
        if let Input::Text(text) = &input {
            match Command::parse(text) {
                Ok(Some(command)) => return self.run_command(identity, command).await,
                Ok(None) => {}
                Err(e) => {
                    let message = e.to_string();
                    self.notify(identity, &message, &[]).await;
                    return Ok(Outcome::CommandRejected { message });
                }
            }
        }

        if let Input::Selection(Selection::Review(action)) = &input {
            return self.review(identity, *action).await;
        }

        let Some(current) = self.conversations.get(identity).await else {
            return self.without_workflow(identity, &input).await;
        };

        match transition(&current.state, &StepContext::new(identity), input) {
            Ok(result) => self.apply(identity, result).await,
            Err(TransitionError::Rejected(rejection)) => {
                tracing::debug!(
                    %identity,
                    step = current.state.step_name(),
                    reason = %rejection,
                    "Step input rejected"
                );
                self.notify(identity, &rejection.to_string(), &[]).await;
                Ok(Outcome::Rejected(rejection))
            }
            Err(TransitionError::Stale) => {
                tracing::debug!(
                    %identity,
                    step = current.state.step_name(),
                    "Ignoring input for a superseded step"
                );
                Ok(Outcome::Ignored)
            }
        }
    }

    /// Unregistered identities are walked into registration on arrival. Anything
    /// else without an active workflow is stale.
    async fn without_workflow(
        &self,
        identity: Identity,
        input: &Input,
    ) -> Result<Outcome, EngineError> {
        if matches!(input, Input::Selection(_)) {
            tracing::debug!(%identity, "Ignoring selection with no active workflow");
            return Ok(Outcome::Ignored);
        }
        let resolved = self.resolver.resolve(identity).await?;
        if resolved.role == Role::Unknown {
            return self.start_registration(identity).await;
        }
        tracing::debug!(%identity, role = ?resolved.role, "Ignoring input with no active workflow");
        Ok(Outcome::Ignored)
    }

    // ========================================================================
    // Step application
    // ========================================================================

    /// Run a transition's effects in order, then commit the new state, then notify.
    /// A failing effect leaves the stored state as it was.
    async fn apply(
        &self,
        identity: Identity,
        result: TransitionResult,
    ) -> Result<Outcome, EngineError> {
        let (notifications, effects): (Vec<Effect>, Vec<Effect>) =
            result.effects.into_iter().partition(Effect::is_notification);

        for effect in effects {
            let name = effect.name();
            match self.execute(identity, effect).await {
                Ok(()) => {}
                Err(EngineError::StaleSelection(staged)) => {
                    tracing::info!(%identity, %staged, "Staged user already handled");
                    self.conversations.clear(identity).await;
                    self.notify(
                        identity,
                        "This user has already been handled by another administrator.",
                        &[],
                    )
                    .await;
                    return Err(EngineError::StaleSelection(staged));
                }
                Err(e) => {
                    tracing::error!(%identity, effect = name, error = %e, "Effect failed, state kept for retry");
                    self.notify(identity, FAILURE_NOTICE, &[]).await;
                    return Err(e);
                }
            }
        }

        let outcome = match result.new_state {
            Some(state) => {
                tracing::debug!(
                    %identity,
                    workflow = state.workflow().as_str(),
                    step = state.step_name(),
                    "Workflow advanced"
                );
                self.conversations.set(identity, state).await;
                Outcome::Advanced
            }
            None => {
                self.conversations.clear(identity).await;
                Outcome::Completed
            }
        };

        for notification in notifications {
            if let Effect::Notify { text, controls } = notification {
                self.notify(identity, &text, &controls).await;
            }
        }
        Ok(outcome)
    }

    async fn execute(&self, identity: Identity, effect: Effect) -> Result<(), EngineError> {
        let name = effect.name();
        match effect {
            Effect::StageUser { identity, name: display_name } => {
                let added = self
                    .staging
                    .add(identity, &display_name)
                    .await
                    .map_err(EngineError::effect(name))?;
                if added {
                    tracing::info!(%identity, name = %display_name, "User staged for role assignment");
                } else {
                    tracing::debug!(%identity, "User already staged");
                }
            }
            Effect::AssignRole { user, role } => {
                let taken = self
                    .staging
                    .remove(user.identity)
                    .await
                    .map_err(EngineError::effect(name))?;
                if !taken {
                    return Err(EngineError::StaleSelection(user.identity));
                }
                let record = EntityRecord::from_staged(role, user.identity, &user.name);
                if let Err(e) = self.entities.get(role).create(&record).await {
                    // Put the user back so the assignment can be retried
                    if let Err(restore) = self.staging.add(user.identity, &user.name).await {
                        tracing::error!(
                            staged = %user.identity,
                            error = %restore,
                            "Failed to restore staging entry"
                        );
                    }
                    return Err(EngineError::Effect {
                        effect: name,
                        source: e,
                    });
                }
                tracing::info!(admin = %identity, user = %user.identity, role = role.as_str(), "Role assigned");
            }
            Effect::CreateEntity { record } => {
                self.entities
                    .get(record.role())
                    .create(&record)
                    .await
                    .map_err(EngineError::effect(name))?;
                tracing::info!(
                    admin = %identity,
                    user = %record.identity(),
                    role = record.role().as_str(),
                    "Entity created"
                );
            }
            Effect::SubmitPayment {
                student,
                lessons,
                attachment,
            } => {
                let parent_name = self
                    .entities
                    .parents
                    .find_by_identity(identity)
                    .await
                    .map_err(EngineError::effect(name))?
                    .map_or_else(|| identity.to_string(), |record| record.display_name());
                let file_path = self
                    .attachments
                    .save(&attachment, identity)
                    .await
                    .map_err(EngineError::effect(name))?;
                let submitted = self
                    .desk
                    .submit(NewPayment {
                        parent: identity,
                        parent_name,
                        student: student.telegram_id,
                        student_name: student.name,
                        lessons,
                        file_path: file_path.clone(),
                    })
                    .await;
                if let Err(e) = submitted {
                    if let Err(discard) = self.attachments.discard(&file_path).await {
                        tracing::warn!(path = %file_path, error = %discard, "Failed to discard unused receipt");
                    }
                    return Err(EngineError::Effect {
                        effect: name,
                        source: e,
                    });
                }
            }
            Effect::DebitLessons { students } => {
                let updated = self
                    .students
                    .debit_lessons(&students)
                    .await
                    .map_err(EngineError::effect(name))?;
                tracing::info!(tutor = %identity, count = updated.len(), "Lessons marked");
            }
            Effect::Notify { text, controls } => self.notify(identity, &text, &controls).await,
        }
        Ok(())
    }

    async fn notify(&self, identity: Identity, text: &str, controls: &[Control]) {
        if let Err(e) = self.notifier.send(identity, text, controls).await {
            tracing::warn!(%identity, error = %e, "Notification not delivered");
        }
    }

    // ========================================================================
    // Commands
    // ========================================================================

    async fn run_command(
        &self,
        identity: Identity,
        command: Command,
    ) -> Result<Outcome, EngineError> {
        let resolved = self.resolver.resolve(identity).await?;
        tracing::info!(%identity, command = command.name(), role = ?resolved.role, "Command");

        if !is_allowed(&command, &resolved) {
            self.notify(identity, "You do not have access to this command.", &[])
                .await;
            return Err(EngineError::Forbidden {
                command: command.name(),
                role: resolved.role,
            });
        }

        match command {
            Command::Start if resolved.role == Role::Unknown => {
                self.start_registration(identity).await
            }
            Command::Start => {
                self.conversations.clear(identity).await;
                let name = resolved.display_name().unwrap_or_default();
                let menu = menu_for(&resolved);
                self.notify(identity, &format!("Hello, {name}!\n{menu}"), &[])
                    .await;
                Ok(Outcome::Completed)
            }
            Command::Cancel => {
                let text = if self.conversations.clear(identity).await {
                    "Cancelled."
                } else {
                    "Nothing to cancel."
                };
                self.notify(identity, text, &[]).await;
                Ok(Outcome::Completed)
            }
            Command::Assign => {
                let staged = self
                    .staging
                    .list_all()
                    .await
                    .map_err(EngineError::effect("list_staged"))?;
                self.apply(identity, begin(Start::RoleAssignment { staged }))
                    .await
            }
            Command::CreateUser => self.apply(identity, begin(Start::EntityCreation)).await,
            Command::DeleteUser {
                role,
                identity: target,
            } => {
                let deleted = self
                    .entities
                    .get(role)
                    .delete(target)
                    .await
                    .map_err(EngineError::effect("delete_entity"))?;
                let text = if deleted {
                    tracing::info!(admin = %identity, user = %target, role = role.as_str(), "Entity deleted");
                    format!("Deleted {role} {target}.")
                } else {
                    format!("No {role} with ID {target}.")
                };
                self.notify(identity, &text, &[]).await;
                Ok(Outcome::Completed)
            }
            Command::LinkParent { student, parent } => {
                self.students
                    .link_parent(student, parent)
                    .await
                    .map_err(EngineError::effect("link_parent"))?;
                self.notify(identity, &format!("Parent {parent} linked to student {student}."), &[])
                    .await;
                Ok(Outcome::Completed)
            }
            Command::LinkTutor { student, tutor } => {
                self.students
                    .link_tutor(student, tutor)
                    .await
                    .map_err(EngineError::effect("link_tutor"))?;
                self.notify(identity, &format!("Tutor {tutor} linked to student {student}."), &[])
                    .await;
                Ok(Outcome::Completed)
            }
            Command::Payments => {
                let step = self.desk.browse(identity).await;
                Ok(Outcome::Review(self.present(identity, step).await))
            }
            Command::Pay => {
                let students = self.linked_students(identity).await?;
                self.apply(identity, begin(Start::Payment { students }))
                    .await
            }
            Command::Mark => {
                let students = self
                    .students
                    .students_of_tutor(identity)
                    .await
                    .map_err(EngineError::effect("students_of_tutor"))?
                    .iter()
                    .map(StudentChoice::from)
                    .collect();
                self.apply(identity, begin(Start::LessonMarking { students }))
                    .await
            }
            Command::Balance => {
                let text = match &resolved.record {
                    Some(EntityRecord::Student(student)) => {
                        format!("Remaining lessons: {}", student.payed_lessons)
                    }
                    _ => {
                        let students = self.linked_students(identity).await?;
                        if students.is_empty() {
                            "You have no linked students yet.".to_string()
                        } else {
                            students
                                .iter()
                                .map(|s| format!("{}: {} lessons", s.name, s.payed_lessons))
                                .collect::<Vec<_>>()
                                .join("\n")
                        }
                    }
                };
                self.notify(identity, &text, &[]).await;
                Ok(Outcome::Completed)
            }
        }
    }

    async fn start_registration(&self, identity: Identity) -> Result<Outcome, EngineError> {
        let staged = self
            .staging
            .list_all()
            .await
            .map_err(EngineError::effect("list_staged"))?;
        if staged.iter().any(|user| user.identity == identity) {
            self.conversations.clear(identity).await;
            self.notify(
                identity,
                "You are already registered. Please wait for an administrator to assign your role.",
                &[],
            )
            .await;
            return Ok(Outcome::Completed);
        }
        self.apply(identity, begin(Start::Registration)).await
    }

    async fn linked_students(&self, parent: Identity) -> Result<Vec<StudentChoice>, EngineError> {
        Ok(self
            .students
            .students_of_parent(parent)
            .await
            .map_err(EngineError::effect("students_of_parent"))?
            .iter()
            .map(StudentChoice::from)
            .collect())
    }

    // ========================================================================
    // Review
    // ========================================================================

    async fn review(
        &self,
        identity: Identity,
        action: ReviewAction,
    ) -> Result<Outcome, EngineError> {
        let resolved = self.resolver.resolve(identity).await?;
        if !resolved.is_privileged {
            tracing::warn!(%identity, role = ?resolved.role, "Review action from unprivileged identity");
            self.notify(identity, "You do not have access to this command.", &[])
                .await;
            return Err(EngineError::Forbidden {
                command: "payments",
                role: resolved.role,
            });
        }

        let outcome = match action {
            ReviewAction::Next => {
                let step = self.desk.next(identity).await;
                self.present(identity, step).await
            }
            ReviewAction::Stop => {
                self.desk.stop(identity);
                self.notify(identity, "Review finished.", &[]).await;
                ReviewOutcome::Stopped
            }
            ReviewAction::Approve { payment_id } => {
                self.resolve(identity, &resolved, payment_id, Decision::Approve)
                    .await?
            }
            ReviewAction::Decline { payment_id } => {
                self.resolve(identity, &resolved, payment_id, Decision::Decline)
                    .await?
            }
        };
        Ok(Outcome::Review(outcome))
    }

    async fn resolve(
        &self,
        reviewer: Identity,
        resolved: &ResolvedRole,
        payment_id: PaymentId,
        decision: Decision,
    ) -> Result<ReviewOutcome, EngineError> {
        let reviewer_name = resolved
            .display_name()
            .unwrap_or_else(|| reviewer.to_string());
        match self
            .desk
            .resolve(payment_id, decision, reviewer, reviewer_name)
            .await
        {
            Ok((item, _)) => {
                let reviewer_text = format!("Payment {payment_id} {}.", decision.as_str());
                self.notify(reviewer, &reviewer_text, &browse_controls()).await;
                let submitter_text = match decision {
                    Decision::Approve => format!(
                        "Your payment for {} ({} lessons) has been approved.",
                        item.student_name, item.lessons
                    ),
                    Decision::Decline => format!(
                        "Your payment for {} ({} lessons) has been declined. Please contact the administrator.",
                        item.student_name, item.lessons
                    ),
                };
                self.notify(item.parent, &submitter_text, &[]).await;
                Ok(ReviewOutcome::Resolved {
                    payment_id,
                    decision,
                })
            }
            Err(ResolveError::Queue(QueueError::AlreadyResolved(_))) => {
                let text = match self.desk.queue().resolution(payment_id) {
                    Some(earlier) => format!(
                        "Payment {payment_id} was already {} by {}.",
                        earlier.decision.as_str(),
                        earlier.resolver_name
                    ),
                    None => format!("Payment {payment_id} has already been resolved."),
                };
                self.notify(reviewer, &text, &browse_controls()).await;
                Ok(ReviewOutcome::AlreadyResolved { payment_id })
            }
            Err(ResolveError::Queue(QueueError::NotFound(_))) => {
                self.notify(reviewer, &format!("Payment {payment_id} not found."), &[])
                    .await;
                Ok(ReviewOutcome::NotFound { payment_id })
            }
            Err(ResolveError::Settle { source, .. }) => {
                self.notify(reviewer, FAILURE_NOTICE, &[]).await;
                Err(EngineError::Effect {
                    effect: "settle_payment",
                    source,
                })
            }
        }
    }

    async fn present(&self, reviewer: Identity, step: CursorStep) -> ReviewOutcome {
        match step {
            CursorStep::Item(item) => {
                let payment_id = item.id;
                let mut controls = vec![
                    Control::new(
                        "Approve",
                        Selection::Review(ReviewAction::Approve { payment_id }),
                    ),
                    Control::new(
                        "Decline",
                        Selection::Review(ReviewAction::Decline { payment_id }),
                    ),
                ];
                controls.extend(browse_controls());
                self.notify(reviewer, &item.caption(), &controls).await;
                ReviewOutcome::Shown { payment_id }
            }
            CursorStep::Exhausted => {
                self.notify(reviewer, "No more pending payments.", &[]).await;
                ReviewOutcome::Exhausted
            }
        }
    }
}

fn browse_controls() -> Vec<Control> {
    vec![
        Control::new("Next", Selection::Review(ReviewAction::Next)),
        Control::new("Stop", Selection::Review(ReviewAction::Stop)),
    ]
}

fn is_allowed(command: &Command, resolved: &ResolvedRole) -> bool {
    match command {
        Command::Start | Command::Cancel => true,
        Command::Assign
        | Command::CreateUser
        | Command::DeleteUser { .. }
        | Command::LinkParent { .. }
        | Command::LinkTutor { .. }
        | Command::Payments => resolved.is_privileged,
        Command::Pay => resolved.role == Role::Parent,
        Command::Balance => matches!(resolved.role, Role::Student | Role::Parent),
        Command::Mark => resolved.role == Role::Tutor,
    }
}

fn menu_for(resolved: &ResolvedRole) -> String {
    let mut lines = Vec::new();
    match resolved.role {
        Role::Parent => lines.extend(["/pay - pay for lessons", "/balance - remaining lessons"]),
        Role::Student => lines.push("/balance - remaining lessons"),
        Role::Tutor => lines.push("/mark - mark attended lessons"),
        Role::Admin | Role::Unknown => {}
    }
    if resolved.is_privileged {
        lines.extend([
            "/assign - assign roles to new users",
            "/create_user - add a user by hand",
            "/delete_user <role> <id> - remove a user",
            "/link_parent <student> <parent> - link a parent",
            "/link_tutor <student> <tutor> - link a tutor",
            "/payments - review pending payments",
        ]);
    }
    lines.push("/cancel - cancel the current action");
    lines.join("\n")
}
