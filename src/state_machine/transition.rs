//! Pure workflow transition table
//!
//! Every workflow's states and transitions are declared here once. Given the same
//! state and input, `transition` always yields the same result and performs no I/O.

use super::effect::{Control, Effect};
use super::event::{Input, Selection};
use super::fields::split_values;
use super::state::{StagedUser, StepContext, StudentChoice, WorkflowState};
use crate::identity::{EntityRecord, EntityRole, FieldError};
use serde::Serialize;
use std::collections::BTreeSet;
use thiserror::Error;

/// Result of a state transition
#[derive(Debug)]
pub struct TransitionResult {
    /// `None` once the workflow has finished and its state must be cleared
    pub new_state: Option<WorkflowState>,
    pub effects: Vec<Effect>,
}

impl TransitionResult {
    pub fn advance(state: WorkflowState) -> Self {
        Self {
            new_state: Some(state),
            effects: vec![],
        }
    }

    pub fn finish() -> Self {
        Self {
            new_state: None,
            effects: vec![],
        }
    }

    pub fn with_effect(mut self, effect: Effect) -> Self {
        self.effects.push(effect);
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.new_state.is_none()
    }
}

/// Why a step input was refused. The identity stays in the same step.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum Rejection {
    #[error("Please send your surname and name as text.")]
    EmptyName,
    #[error("Expected {expected} comma-separated values ({fields}), got {got}.")]
    FieldCount {
        expected: usize,
        got: usize,
        fields: String,
    },
    #[error("{0}")]
    InvalidField(FieldError),
    #[error("Enter a positive whole number.")]
    NotPositiveInteger,
    #[error("Please send an image.")]
    NotAnImage,
    #[error("That option is not available, choose one of the buttons.")]
    UnknownChoice,
    #[error("Select at least one student first.")]
    EmptySelection,
    #[error("Please choose one of the buttons.")]
    ExpectedSelection,
    #[error("Please reply with text.")]
    ExpectedText,
}

/// Errors that can occur during transition
#[derive(Debug, Error)]
pub enum TransitionError {
    #[error(transparent)]
    Rejected(#[from] Rejection),
    /// A control from a superseded step or workflow
    #[error("input does not belong to the current step")]
    Stale,
}

/// How a workflow is entered, with the data its first step offers
#[derive(Debug, Clone)]
pub enum Start {
    Registration,
    RoleAssignment { staged: Vec<StagedUser> },
    EntityCreation,
    Payment { students: Vec<StudentChoice> },
    LessonMarking { students: Vec<StudentChoice> },
}

/// Enter a workflow. An empty offer finishes immediately with an explanation.
pub fn begin(start: Start) -> TransitionResult {
    match start {
        Start::Registration => TransitionResult::advance(WorkflowState::AwaitingName).with_effect(
            Effect::notify("Please enter your surname and name (for example: Ivanov Ivan)."),
        ),

        Start::RoleAssignment { staged } if staged.is_empty() => {
            TransitionResult::finish().with_effect(Effect::notify("No new users."))
        }
        Start::RoleAssignment { staged } => {
            let controls = staged
                .iter()
                .map(|user| {
                    Control::new(
                        format!("{} (ID: {})", user.name, user.identity),
                        Selection::StagedUser {
                            identity: user.identity,
                        },
                    )
                })
                .collect();
            TransitionResult::advance(WorkflowState::ChoosingUser { staged }).with_effect(
                Effect::notify_with_controls("Choose a user to assign a role to:", controls),
            )
        }

        Start::EntityCreation => TransitionResult::advance(WorkflowState::ChoosingEntityRole)
            .with_effect(Effect::notify_with_controls(
                "Choose the role of the new user:",
                role_controls(),
            )),

        Start::Payment { students } if students.is_empty() => TransitionResult::finish()
            .with_effect(Effect::notify("You have no linked students yet.")),
        Start::Payment { students } => {
            let mut text = String::from("Remaining lessons:\n");
            for s in &students {
                text.push_str(&format!("{}: {} lessons\n", s.name, s.payed_lessons));
            }
            let controls = students
                .iter()
                .map(|s| {
                    Control::new(
                        format!("Pay for {}", s.name),
                        Selection::Student {
                            identity: s.telegram_id,
                        },
                    )
                })
                .collect();
            TransitionResult::advance(WorkflowState::ChoosingStudent { students })
                .with_effect(Effect::notify_with_controls(text, controls))
        }

        Start::LessonMarking { students } if students.is_empty() => {
            TransitionResult::finish().with_effect(Effect::notify("You have no students yet."))
        }
        Start::LessonMarking { students } => {
            let controls = marking_controls(&students, &BTreeSet::new());
            TransitionResult::advance(WorkflowState::SelectingStudents {
                students,
                selected: BTreeSet::new(),
            })
            .with_effect(Effect::notify_with_controls(
                "Select the students who attended:",
                controls,
            ))
        }
    }
}

/// Pure transition function
pub fn transition(
    state: &WorkflowState,
    context: &StepContext,
    input: Input,
) -> Result<TransitionResult, TransitionError> {
    match (state, input) {
        // ============================================================
        // Registration
        // ============================================================
        (WorkflowState::AwaitingName, Input::Text(text)) => {
            let name = text.trim();
            if name.is_empty() {
                return Err(Rejection::EmptyName.into());
            }
            Ok(TransitionResult::finish()
                .with_effect(Effect::StageUser {
                    identity: context.identity,
                    name: name.to_string(),
                })
                .with_effect(Effect::notify(
                    "Thank you! Your details are saved. Please wait for an administrator to register you.",
                )))
        }

        // ============================================================
        // RoleAssignment
        // ============================================================
        (WorkflowState::ChoosingUser { staged }, Input::Selection(Selection::StagedUser { identity })) => {
            let user = staged
                .iter()
                .find(|u| u.identity == identity)
                .cloned()
                .ok_or(Rejection::UnknownChoice)?;
            let prompt = format!("Choose a role for {}:", user.name);
            Ok(TransitionResult::advance(WorkflowState::ChoosingAssignedRole { user })
                .with_effect(Effect::notify_with_controls(prompt, role_controls())))
        }

        (WorkflowState::ChoosingAssignedRole { user }, Input::Selection(Selection::Role { role })) => {
            Ok(TransitionResult::finish()
                .with_effect(Effect::AssignRole {
                    user: user.clone(),
                    role,
                })
                .with_effect(Effect::notify(format!(
                    "User {} (ID: {}) is now a {role}.",
                    user.name, user.identity
                ))))
        }

        // ============================================================
        // EntityCreation
        // ============================================================
        (WorkflowState::ChoosingEntityRole, Input::Selection(Selection::Role { role })) => {
            Ok(enter_fields(role))
        }
        (WorkflowState::ChoosingEntityRole, Input::Text(text)) => {
            let role = text
                .parse::<EntityRole>()
                .map_err(|_| Rejection::UnknownChoice)?;
            Ok(enter_fields(role))
        }

        (WorkflowState::EnteringFields { role }, Input::Text(text)) => {
            let fields = role.entry_fields();
            let values = split_values(&text);
            if values.len() != fields.len() {
                return Err(Rejection::FieldCount {
                    expected: fields.len(),
                    got: values.len(),
                    fields: fields.join(", "),
                }
                .into());
            }
            let record =
                EntityRecord::from_fields(*role, &values).map_err(Rejection::InvalidField)?;
            let confirmation = format!("Created {role} {}.", record.display_name());
            Ok(TransitionResult::finish()
                .with_effect(Effect::CreateEntity { record })
                .with_effect(Effect::notify(confirmation)))
        }

        // ============================================================
        // PaymentSubmission
        // ============================================================
        (WorkflowState::ChoosingStudent { students }, Input::Selection(Selection::Student { identity })) => {
            let student = find_student(students, identity)?;
            Ok(TransitionResult::advance(WorkflowState::EnteringLessonCount { student })
                .with_effect(Effect::notify("How many lessons would you like to pay for?")))
        }

        (WorkflowState::EnteringLessonCount { student }, Input::Text(text)) => {
            let lessons = parse_lesson_count(&text).ok_or(Rejection::NotPositiveInteger)?;
            Ok(TransitionResult::advance(WorkflowState::AwaitingAttachment {
                student: student.clone(),
                lessons,
            })
            .with_effect(Effect::notify("Please send a screenshot of the payment.")))
        }
        (WorkflowState::EnteringLessonCount { .. }, Input::Attachment(_)) => {
            Err(Rejection::NotPositiveInteger.into())
        }

        (WorkflowState::AwaitingAttachment { student, lessons }, Input::Attachment(attachment)) => {
            if !attachment.is_image() {
                return Err(Rejection::NotAnImage.into());
            }
            let confirmation = format!(
                "Thank you! We will check the payment and credit {lessons} lessons to {}.",
                student.name
            );
            Ok(TransitionResult::finish()
                .with_effect(Effect::SubmitPayment {
                    student: student.clone(),
                    lessons: *lessons,
                    attachment,
                })
                .with_effect(Effect::notify(confirmation)))
        }
        (WorkflowState::AwaitingAttachment { .. }, Input::Text(_)) => {
            Err(Rejection::NotAnImage.into())
        }

        // ============================================================
        // LessonMarking
        // ============================================================
        (
            WorkflowState::SelectingStudents { students, selected },
            Input::Selection(Selection::Student { identity }),
        ) => {
            find_student(students, identity)?;
            let mut selected = selected.clone();
            if !selected.remove(&identity) {
                selected.insert(identity);
            }
            let controls = marking_controls(students, &selected);
            Ok(TransitionResult::advance(WorkflowState::SelectingStudents {
                students: students.clone(),
                selected,
            })
            .with_effect(Effect::notify_with_controls(
                "Select the students who attended:",
                controls,
            )))
        }

        (WorkflowState::SelectingStudents { students, selected }, Input::Selection(Selection::Done)) => {
            if selected.is_empty() {
                return Err(Rejection::EmptySelection.into());
            }
            let names: Vec<&str> = students
                .iter()
                .filter(|s| selected.contains(&s.telegram_id))
                .map(|s| s.name.as_str())
                .collect();
            let summary = format!("Lessons marked for: {}", names.join(", "));
            Ok(TransitionResult::finish()
                .with_effect(Effect::DebitLessons {
                    students: selected.iter().copied().collect(),
                })
                .with_effect(Effect::notify(summary)))
        }

        // ============================================================
        // Shape mismatches
        // ============================================================

        // Controls from another step or workflow are stale
        (_, Input::Selection(_)) => Err(TransitionError::Stale),

        // Free input where a step expects a button
        (
            WorkflowState::ChoosingUser { .. }
            | WorkflowState::ChoosingAssignedRole { .. }
            | WorkflowState::ChoosingEntityRole
            | WorkflowState::ChoosingStudent { .. }
            | WorkflowState::SelectingStudents { .. },
            _,
        ) => Err(Rejection::ExpectedSelection.into()),

        // Files where a step expects text
        (WorkflowState::AwaitingName | WorkflowState::EnteringFields { .. }, Input::Attachment(_)) => {
            Err(Rejection::ExpectedText.into())
        }
    }
}

fn enter_fields(role: EntityRole) -> TransitionResult {
    let prompt = format!(
        "Enter the values for '{role}' separated by commas:\n{}",
        role.entry_fields().join(", ")
    );
    TransitionResult::advance(WorkflowState::EnteringFields { role })
        .with_effect(Effect::notify(prompt))
}

fn find_student(
    students: &[StudentChoice],
    identity: crate::identity::Identity,
) -> Result<StudentChoice, Rejection> {
    students
        .iter()
        .find(|s| s.telegram_id == identity)
        .cloned()
        .ok_or(Rejection::UnknownChoice)
}

/// Lesson counts are positive integers
pub fn parse_lesson_count(text: &str) -> Option<u32> {
    let count: i64 = text.trim().parse().ok()?;
    if count <= 0 {
        return None;
    }
    u32::try_from(count).ok()
}

fn role_controls() -> Vec<Control> {
    EntityRole::PRIORITY
        .iter()
        .map(|role| Control::new(role.as_str(), Selection::Role { role: *role }))
        .collect()
}

fn marking_controls(
    students: &[StudentChoice],
    selected: &BTreeSet<crate::identity::Identity>,
) -> Vec<Control> {
    let mut controls: Vec<Control> = students
        .iter()
        .map(|s| {
            let mark = if selected.contains(&s.telegram_id) {
                "✅"
            } else {
                "☐"
            };
            Control::new(
                format!("{mark} {}", s.name),
                Selection::Student {
                    identity: s.telegram_id,
                },
            )
        })
        .collect();
    controls.push(Control::new("Done", Selection::Done));
    controls
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Identity;
    use crate::state_machine::event::Attachment;

    fn ctx() -> StepContext {
        StepContext::new(Identity(100))
    }

    fn student(id: i64, name: &str) -> StudentChoice {
        StudentChoice {
            telegram_id: Identity(id),
            name: name.to_string(),
            payed_lessons: 0,
        }
    }

    #[test]
    fn test_registration_stages_trimmed_name() {
        let result = transition(
            &WorkflowState::AwaitingName,
            &ctx(),
            Input::Text("  Ivanov Ivan ".into()),
        )
        .unwrap();
        assert!(result.is_terminal());
        assert!(matches!(
            &result.effects[0],
            Effect::StageUser { identity, name } if *identity == Identity(100) && name == "Ivanov Ivan"
        ));
        // Notifications come after the persistence effect
        assert!(result.effects[1].is_notification());
    }

    #[test]
    fn test_registration_rejects_blank_name() {
        let err = transition(&WorkflowState::AwaitingName, &ctx(), Input::Text("   ".into()))
            .unwrap_err();
        assert!(matches!(err, TransitionError::Rejected(Rejection::EmptyName)));
    }

    #[test]
    fn test_entity_creation_count_mismatch_stays_in_place() {
        let state = WorkflowState::EnteringFields {
            role: EntityRole::Student,
        };
        let err = transition(&state, &ctx(), Input::Text("123, Ivan".into())).unwrap_err();
        assert!(matches!(
            err,
            TransitionError::Rejected(Rejection::FieldCount { expected: 3, got: 2, .. })
        ));

        let ok = transition(&state, &ctx(), Input::Text("123, Ivan, Petrov".into())).unwrap();
        assert!(ok.is_terminal());
        let Effect::CreateEntity { record } = &ok.effects[0] else {
            panic!("expected CreateEntity");
        };
        assert_eq!(record.identity(), Identity(123));
        assert_eq!(record.role(), EntityRole::Student);
    }

    #[test]
    fn test_entity_creation_accepts_typed_role_name() {
        let result = transition(
            &WorkflowState::ChoosingEntityRole,
            &ctx(),
            Input::Text("Родитель".into()),
        )
        .unwrap();
        assert_eq!(
            result.new_state,
            Some(WorkflowState::EnteringFields {
                role: EntityRole::Parent
            })
        );
    }

    #[test]
    fn test_lesson_count_boundaries() {
        let state = WorkflowState::EnteringLessonCount {
            student: student(5, "Ivan"),
        };
        for bad in ["0", "-5", "abc", "", "99999999999"] {
            let err = transition(&state, &ctx(), Input::Text(bad.into())).unwrap_err();
            assert!(
                matches!(err, TransitionError::Rejected(Rejection::NotPositiveInteger)),
                "input {bad:?} should be rejected"
            );
        }
        let ok = transition(&state, &ctx(), Input::Text(" 3 ".into())).unwrap();
        assert!(matches!(
            ok.new_state,
            Some(WorkflowState::AwaitingAttachment { lessons: 3, .. })
        ));
    }

    #[test]
    fn test_payment_requires_image_attachment() {
        let state = WorkflowState::AwaitingAttachment {
            student: student(5, "Ivan"),
            lessons: 3,
        };
        let err = transition(
            &state,
            &ctx(),
            Input::Attachment(Attachment::new("application/pdf", vec![1])),
        )
        .unwrap_err();
        assert!(matches!(err, TransitionError::Rejected(Rejection::NotAnImage)));

        let ok = transition(
            &state,
            &ctx(),
            Input::Attachment(Attachment::new("image/jpeg", vec![1, 2])),
        )
        .unwrap();
        assert!(ok.is_terminal());
        assert!(matches!(
            &ok.effects[0],
            Effect::SubmitPayment { lessons: 3, .. }
        ));
    }

    #[test]
    fn test_selection_from_other_workflow_is_stale() {
        let state = WorkflowState::EnteringFields {
            role: EntityRole::Tutor,
        };
        let err = transition(
            &state,
            &ctx(),
            Input::Selection(Selection::Student {
                identity: Identity(1),
            }),
        )
        .unwrap_err();
        assert!(matches!(err, TransitionError::Stale));
    }

    #[test]
    fn test_unknown_student_choice_is_rejected() {
        let state = WorkflowState::ChoosingStudent {
            students: vec![student(5, "Ivan")],
        };
        let err = transition(
            &state,
            &ctx(),
            Input::Selection(Selection::Student {
                identity: Identity(6),
            }),
        )
        .unwrap_err();
        assert!(matches!(err, TransitionError::Rejected(Rejection::UnknownChoice)));
    }

    #[test]
    fn test_lesson_marking_toggles_and_requires_selection() {
        let start = begin(Start::LessonMarking {
            students: vec![student(1, "Ann"), student(2, "Bob")],
        });
        let state = start.new_state.unwrap();

        let err = transition(&state, &ctx(), Input::Selection(Selection::Done)).unwrap_err();
        assert!(matches!(err, TransitionError::Rejected(Rejection::EmptySelection)));

        let pick = |state: &WorkflowState, id| {
            transition(
                state,
                &ctx(),
                Input::Selection(Selection::Student {
                    identity: Identity(id),
                }),
            )
            .unwrap()
            .new_state
            .unwrap()
        };
        let state = pick(&state, 1);
        let state = pick(&state, 2);
        let state = pick(&state, 1);

        let done = transition(&state, &ctx(), Input::Selection(Selection::Done)).unwrap();
        assert!(matches!(
            &done.effects[0],
            Effect::DebitLessons { students } if students == &vec![Identity(2)]
        ));
    }

    #[test]
    fn test_begin_with_empty_offer_finishes() {
        assert!(begin(Start::RoleAssignment { staged: vec![] }).is_terminal());
        assert!(begin(Start::Payment { students: vec![] }).is_terminal());
        assert!(!begin(Start::EntityCreation).is_terminal());
    }

    #[test]
    fn test_role_assignment_flow() {
        let staged = vec![StagedUser {
            identity: Identity(9),
            name: "Sidorov Petr".into(),
        }];
        let state = begin(Start::RoleAssignment { staged }).new_state.unwrap();
        let state = transition(
            &state,
            &ctx(),
            Input::Selection(Selection::StagedUser {
                identity: Identity(9),
            }),
        )
        .unwrap()
        .new_state
        .unwrap();
        assert_eq!(state.step_name(), "choosing_role");

        let done = transition(
            &state,
            &ctx(),
            Input::Selection(Selection::Role {
                role: EntityRole::Tutor,
            }),
        )
        .unwrap();
        assert!(matches!(
            &done.effects[0],
            Effect::AssignRole { user, role: EntityRole::Tutor } if user.identity == Identity(9)
        ));
    }
}
