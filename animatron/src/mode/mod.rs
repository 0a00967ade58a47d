//! Operating modes and the transition state machine

mod machine;
mod setup;
mod types;

pub use machine::{DEFAULT_TRANSITION_TIMEOUT, ModeStateMachine};
pub use setup::{CollaboratorSetup, MODE_SOURCE, ModeSetup, SetupError};
pub use types::{Mode, ParseModeError, Transition, TransitionRejected, TransitionStatus};
