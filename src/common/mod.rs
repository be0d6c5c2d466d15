pub mod content_type;
pub mod error;

pub use error::{PipelineError, Result};
