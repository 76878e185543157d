//! `sitegen-ai`
//!
//! **Responsibility:** boundary to the external generation backend.
//!
//! This crate is intentionally **not** part of the pipeline state machine:
//! - It must not touch request records or stores.
//! - It turns a prompt (plus optional existing files) into a file bundle.
//! - It classifies every failure as transient or permanent, so callers never
//!   inspect provider-specific error strings.

pub mod backend;
pub mod error;
pub mod http;
pub mod scripted;

pub use backend::GenerationBackend;
pub use error::{BackendError, ErrorClass};
pub use http::{HttpBackendConfig, HttpGenerationBackend};
pub use scripted::{ScriptedBackend, ScriptedCall};
