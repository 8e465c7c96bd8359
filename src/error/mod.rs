pub mod build_error;
pub mod workflow_error;

pub use build_error::{BuildError, BuildErrorKind, ErrorList};
pub use workflow_error::WorkflowError;
