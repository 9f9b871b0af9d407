//! Property-based tests for the workflow state machine
//!
//! These tests verify key invariants hold across all possible inputs.

use super::*;
use crate::approval::PaymentId;
use crate::identity::{EntityRole, Identity};
use proptest::prelude::*;
use std::collections::BTreeSet;

// ============================================================================
// Test Helpers
// ============================================================================

fn test_context() -> StepContext {
    StepContext::new(Identity(1000))
}

// ============================================================================
// Arbitrary Generators
// ============================================================================

fn arb_identity() -> impl Strategy<Value = Identity> {
    (1i64..20).prop_map(Identity)
}

fn arb_entity_role() -> impl Strategy<Value = EntityRole> {
    prop_oneof![
        Just(EntityRole::Admin),
        Just(EntityRole::Tutor),
        Just(EntityRole::Student),
        Just(EntityRole::Parent),
    ]
}

fn arb_student() -> impl Strategy<Value = StudentChoice> {
    (arb_identity(), "[A-Z][a-z]{2,8}", 0i64..20).prop_map(|(telegram_id, name, payed_lessons)| {
        StudentChoice {
            telegram_id,
            name,
            payed_lessons,
        }
    })
}

fn arb_staged() -> impl Strategy<Value = StagedUser> {
    (arb_identity(), "[A-Z][a-z]{2,8} [A-Z][a-z]{2,8}")
        .prop_map(|(identity, name)| StagedUser { identity, name })
}

fn arb_state() -> impl Strategy<Value = WorkflowState> {
    prop_oneof![
        Just(WorkflowState::AwaitingName),
        proptest::collection::vec(arb_staged(), 0..4)
            .prop_map(|staged| WorkflowState::ChoosingUser { staged }),
        arb_staged().prop_map(|user| WorkflowState::ChoosingAssignedRole { user }),
        Just(WorkflowState::ChoosingEntityRole),
        arb_entity_role().prop_map(|role| WorkflowState::EnteringFields { role }),
        proptest::collection::vec(arb_student(), 0..4)
            .prop_map(|students| WorkflowState::ChoosingStudent { students }),
        arb_student().prop_map(|student| WorkflowState::EnteringLessonCount { student }),
        (arb_student(), 1u32..50)
            .prop_map(|(student, lessons)| WorkflowState::AwaitingAttachment { student, lessons }),
        (
            proptest::collection::vec(arb_student(), 0..4),
            proptest::collection::btree_set(arb_identity(), 0..3)
        )
            .prop_map(|(students, selected)| WorkflowState::SelectingStudents {
                students,
                selected
            }),
    ]
}

fn arb_selection() -> impl Strategy<Value = Selection> {
    prop_oneof![
        arb_identity().prop_map(|identity| Selection::StagedUser { identity }),
        arb_entity_role().prop_map(|role| Selection::Role { role }),
        arb_identity().prop_map(|identity| Selection::Student { identity }),
        Just(Selection::Done),
        Just(Selection::Review(ReviewAction::Next)),
        (1i64..10).prop_map(|id| Selection::Review(ReviewAction::Approve {
            payment_id: PaymentId(id)
        })),
    ]
}

fn arb_input() -> impl Strategy<Value = Input> {
    prop_oneof![
        "[a-zA-Z0-9 ,.-]{0,30}".prop_map(Input::Text),
        ("(image/png|image/jpeg|application/pdf|text/plain)", proptest::collection::vec(any::<u8>(), 0..8))
            .prop_map(|(media_type, data)| Input::Attachment(Attachment::new(media_type, data))),
        arb_selection().prop_map(Input::Selection),
    ]
}

// ============================================================================
// Properties
// ============================================================================

proptest! {
    /// A step never hands the identity over to a different workflow
    #[test]
    fn prop_transitions_stay_within_workflow(state in arb_state(), input in arb_input()) {
        if let Ok(result) = transition(&state, &test_context(), input) {
            if let Some(next) = &result.new_state {
                prop_assert_eq!(next.workflow(), state.workflow());
            }
        }
    }

    /// Notifications always come after every persistence effect, so a failing
    /// effect can never be preceded by a success message
    #[test]
    fn prop_notifications_are_last(state in arb_state(), input in arb_input()) {
        if let Ok(result) = transition(&state, &test_context(), input) {
            let first_notify = result.effects.iter().position(Effect::is_notification);
            if let Some(idx) = first_notify {
                prop_assert!(result.effects[idx..].iter().all(Effect::is_notification));
            }
        }
    }

    /// Only terminal transitions carry persistence effects
    #[test]
    fn prop_effects_only_on_completion(state in arb_state(), input in arb_input()) {
        if let Ok(result) = transition(&state, &test_context(), input) {
            let persists = result.effects.iter().any(|e| !e.is_notification());
            prop_assert!(!persists || result.is_terminal());
        }
    }

    /// Same state and input always produce the same outcome
    #[test]
    fn prop_transition_is_deterministic(state in arb_state(), input in arb_input()) {
        let a = transition(&state, &test_context(), input.clone());
        let b = transition(&state, &test_context(), input);
        match (a, b) {
            (Ok(a), Ok(b)) => {
                prop_assert_eq!(a.new_state, b.new_state);
                prop_assert_eq!(a.effects.len(), b.effects.len());
            }
            (Err(TransitionError::Rejected(a)), Err(TransitionError::Rejected(b))) => {
                prop_assert_eq!(a, b);
            }
            (Err(TransitionError::Stale), Err(TransitionError::Stale)) => {}
            _ => prop_assert!(false, "transition outcome differed between calls"),
        }
    }

    /// Review controls never drive a workflow
    #[test]
    fn prop_review_selection_is_stale_for_workflows(state in arb_state(), id in 1i64..10) {
        let input = Input::Selection(Selection::Review(ReviewAction::Decline { payment_id: PaymentId(id) }));
        let result = transition(&state, &test_context(), input);
        prop_assert!(matches!(result, Err(TransitionError::Stale)));
    }

    #[test]
    fn prop_non_positive_lesson_counts_rejected(student in arb_student(), n in i64::MIN..=0) {
        let state = WorkflowState::EnteringLessonCount { student };
        let result = transition(&state, &test_context(), Input::Text(n.to_string()));
        prop_assert!(matches!(
            result,
            Err(TransitionError::Rejected(Rejection::NotPositiveInteger))
        ));
    }

    #[test]
    fn prop_positive_lesson_counts_accepted(student in arb_student(), n in 1u32..=u32::MAX) {
        let state = WorkflowState::EnteringLessonCount { student: student.clone() };
        let result = transition(&state, &test_context(), Input::Text(n.to_string())).unwrap();
        prop_assert_eq!(
            result.new_state,
            Some(WorkflowState::AwaitingAttachment { student, lessons: n })
        );
    }

    /// Field count mismatches never advance entity creation
    #[test]
    fn prop_field_count_mismatch_rejected(role in arb_entity_role(), extra in 1usize..4, fewer in any::<bool>()) {
        let expected = role.entry_fields().len();
        let count = if fewer { expected.saturating_sub(extra).max(1) } else { expected + extra };
        prop_assume!(count != expected);
        let text = vec!["42"; count].join(", ");
        let state = WorkflowState::EnteringFields { role };
        let result = transition(&state, &test_context(), Input::Text(text));
        let is_count_rejection = matches!(
            result,
            Err(TransitionError::Rejected(Rejection::FieldCount { got, .. })) if got == count
        );
        prop_assert!(is_count_rejection);
    }

    /// Toggling the same student twice leaves the selection unchanged
    #[test]
    fn prop_double_toggle_is_identity(students in proptest::collection::vec(arb_student(), 1..4), pick in 0usize..4) {
        let target = students[pick % students.len()].telegram_id;
        let state = WorkflowState::SelectingStudents { students, selected: BTreeSet::new() };
        let input = || Input::Selection(Selection::Student { identity: target });
        let once = transition(&state, &test_context(), input()).unwrap().new_state.unwrap();
        let twice = transition(&once, &test_context(), input()).unwrap().new_state.unwrap();
        prop_assert_eq!(twice, state);
    }
}
