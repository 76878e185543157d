//! `sitegen-core` — domain foundation for the website generation pipeline.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns):
//! identifiers, the versioned generation request and its state machine, and
//! the generated file bundle.

pub mod error;
pub mod files;
pub mod id;
pub mod request;
pub mod revision;

pub use error::{DomainError, DomainResult};
pub use files::FileBundle;
pub use id::{AccountId, RequestId, WebsiteId};
pub use request::{NewRequest, Request, RequestStatus};
pub use revision::ExpectedRevision;
