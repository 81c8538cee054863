//! Common types shared across the relay crates.
//!
//! This crate provides the turn/message data model, the opaque side channel
//! that carries cross-turn continuity state, the error taxonomy, and the
//! output sink abstraction every component writes the user-visible answer to.

pub mod credential;
pub mod error;
pub mod message;
pub mod output;

pub use credential::Credential;
pub use error::{RelayError, Result};
pub use message::{Attachment, CustomContent, Message, Role, StateMap, Turn};
pub use output::{Output, OutputSink, StageGuard, StageId};
