//! YAML configuration for the pipeline, the model service and the sandbox.

pub mod loader;
pub mod types;

pub use loader::ConfigLoader;
pub use types::*;
