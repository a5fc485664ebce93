//! Common utilities and types shared across profilesync modules.
//!
//! This module provides the record model, the error taxonomy and the
//! timestamp rules that every other crate in the workspace relies on.

pub mod error;
pub mod timestamp;
pub mod types;

pub use error::{Error, Result};
pub use types::{Document, Record, RecordId};
