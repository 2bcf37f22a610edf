//! Backend Control Client
//!
//! Adapters implementing [`crate::domain::ports::BackendControl`]:
//! - [`JivaBackend`]: Jiva management API plus the per-volume controller
//!   process API, over HTTP

pub mod jiva;

pub use jiva::{JivaBackend, JivaBackendConfig};
