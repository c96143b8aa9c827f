//! Shared protocol types for the gateway and its integrators.
//!
//! This crate defines the message traits, connection identifiers and
//! strongly-typed error enums shared across the workspace.

pub mod error;
pub mod message;

/// Re-export of all protocol error types.
pub use error::*;
/// Re-export of message identity types.
pub use message::{AgentId, Message, NamedMessage};
