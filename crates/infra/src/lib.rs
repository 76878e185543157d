//! Infrastructure layer: stores, job system, version chain, rollback and
//! pipeline wiring for website generation.

pub mod artifacts;
pub mod config;
pub mod error;
pub mod jobs;
pub mod pipeline;
pub mod requests;
pub mod rollback;
pub mod sites;
pub mod usage;
pub mod versioning;


pub use config::PipelineConfig;
pub use error::{PipelineError, TerminalGenerationError};
pub use pipeline::Pipeline;
