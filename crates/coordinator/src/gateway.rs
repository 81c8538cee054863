//! The seam between the coordinator and the backend agents.

use async_trait::async_trait;
use relay_common::{Credential, Message, Output, Result, Turn};

use crate::routing::AgentKind;

/// Append routing guidance to the user's content.
///
/// Blank instructions leave the content untouched.
pub fn augment_with_instructions(content: &str, instructions: Option<&str>) -> String {
    match instructions.filter(|s| !s.trim().is_empty()) {
        Some(instructions) => format!("{content}\n\nAdditional instructions: {instructions}"),
        None => content.to_string(),
    }
}

/// Everything a gateway needs to answer one turn.
#[derive(Clone, Copy)]
pub struct Dispatch<'a> {
    pub turn: &'a Turn,
    pub instructions: Option<&'a str>,
    /// Credential resolved by the caller. Gateways that need one and get
    /// `None` fall back to the request metadata.
    pub credential: Option<&'a Credential>,
}

impl<'a> Dispatch<'a> {
    pub fn new(turn: &'a Turn) -> Self {
        Self {
            turn,
            instructions: None,
            credential: None,
        }
    }

    pub fn with_instructions(mut self, instructions: Option<&'a str>) -> Self {
        self.instructions = instructions;
        self
    }

    pub fn with_credential(mut self, credential: Option<&'a Credential>) -> Self {
        self.credential = credential;
        self
    }

    /// The latest user content with the routing guidance appended.
    pub fn augmented_content(&self) -> String {
        augment_with_instructions(&self.turn.latest().content, self.instructions)
    }
}

/// A backend agent that answers a turn, streaming into `output` as it goes.
///
/// The returned message carries the full content plus whatever
/// continuity state the next turn needs to resume this backend.
#[async_trait]
pub trait BackendGateway: Send + Sync {
    fn kind(&self) -> AgentKind;

    async fn respond(&self, dispatch: Dispatch<'_>, output: Output<'_>) -> Result<Message>;
}
