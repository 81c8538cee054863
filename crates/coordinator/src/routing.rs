//! Routing decision types and their wire schema.

use relay_common::{RelayError, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;

/// Identifies which backend agent answers the turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AgentKind {
    /// Users Management Service agent
    #[serde(rename = "UMS")]
    Ums,

    /// General-purpose agent (web search, document RAG, code interpreter)
    #[serde(rename = "GPA")]
    Gpa,
}

impl AgentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ums => "UMS",
            Self::Gpa => "GPA",
        }
    }

    /// Name of the output section opened while this agent answers.
    pub fn stage_name(&self) -> String {
        format!("{} Agent Response", self.as_str())
    }
}

impl fmt::Display for AgentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The result of classifying one turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RoutingDecision {
    /// The chosen agent
    pub agent_kind: AgentKind,

    /// Extra guidance appended to the user's message for the agent
    #[serde(default)]
    pub additional_instructions: Option<String>,
}

impl RoutingDecision {
    pub fn new(agent_kind: AgentKind) -> Self {
        Self {
            agent_kind,
            additional_instructions: None,
        }
    }

    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.additional_instructions = Some(instructions.into());
        self
    }

    /// Instructions, with blank values treated as absent.
    pub fn instructions(&self) -> Option<&str> {
        self.additional_instructions
            .as_deref()
            .filter(|s| !s.trim().is_empty())
    }

    /// JSON schema the routing LLM must answer with.
    ///
    /// Strict mode requires every property to be listed as required, so the
    /// optional field is expressed as nullable.
    pub fn schema() -> Value {
        json!({
            "type": "object",
            "properties": {
                "agentKind": {
                    "type": "string",
                    "enum": ["UMS", "GPA"],
                    "description": "Agent that should handle the request"
                },
                "additionalInstructions": {
                    "type": ["string", "null"],
                    "description": "Optional instructions for the selected agent"
                }
            },
            "required": ["agentKind", "additionalInstructions"],
            "additionalProperties": false
        })
    }

    /// Parse and validate the routing LLM's answer.
    pub fn parse(content: &str) -> Result<Self> {
        serde_json::from_str(content.trim()).map_err(|e| {
            RelayError::RoutingDecisionInvalid(format!(
                "{e}; content: {}",
                content.chars().take(200).collect::<String>()
            ))
        })
    }
}
