pub mod core;
pub mod error;
pub mod services;

pub use error::{MetadataError, PipelineError, Result, TransportError};
