//! Durable workflow data model: `WorkflowRun`, `StepAttempt`, and the
//! serialised-error shape that crosses the backend boundary.

#![forbid(unsafe_code)]

mod attempt;
mod error;
mod run;

pub use attempt::{SleepContext, StepAttempt, StepAttemptStatus, StepKind};
pub use error::SerializedError;
pub use run::{WorkflowRun, WorkflowRunStatus};
