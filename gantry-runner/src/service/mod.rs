//! Service layer
//!
//! Step execution, log buffering and the lifecycle of one claimed stage.

mod executor;
mod log_buffer;
mod stage;

pub use executor::{ShellExecutor, StepContext, StepExecutor, StepOutcome};
pub use log_buffer::LogBuffer;
pub use stage::StageRunner;
