//! Workflow state machine
//!
//! Pure transitions over typed inputs, Elm style: the engine feeds an input and the
//! current step in, and gets the next step plus the effects to run back.

mod effect;
pub mod event;
mod fields;
pub mod state;
mod transition;

#[cfg(test)]
mod proptests;

pub use effect::{Control, Effect};
pub use event::{Attachment, Command, InboundEvent, Input, ReviewAction, Selection};
pub use fields::{EnteredField, FieldValue};
pub use state::{StagedUser, StepContext, StudentChoice, WorkflowState};
pub use transition::{begin, transition, Rejection, Start, TransitionError, TransitionResult};
