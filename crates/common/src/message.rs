//! Message types exchanged with the caller, the routing LLM and the backends.

use crate::{RelayError, Result};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;

/// Opaque continuity state carried on an assistant message.
pub type StateMap = Map<String, Value>;

/// Role of a message sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// An artifact reference attached to a message or a stage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference_type: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference_url: Option<String>,
}

impl Attachment {
    pub fn link(title: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            title: Some(title.into()),
            url: Some(url.into()),
            ..Default::default()
        }
    }
}

/// Side channel of a message: attachments plus opaque state.
///
/// `state` on an assistant message only ever carries cross-turn continuity
/// and is never rendered to the user.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CustomContent {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<StateMap>,
}

impl CustomContent {
    pub fn with_state(state: StateMap) -> Self {
        Self {
            attachments: Vec::new(),
            state: Some(state),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.attachments.is_empty() && self.state.as_ref().map_or(true, Map::is_empty)
    }
}

/// A single chat message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,

    #[serde(default, deserialize_with = "null_as_empty")]
    pub content: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_content: Option<CustomContent>,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            custom_content: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn with_custom_content(mut self, custom_content: CustomContent) -> Self {
        self.custom_content = Some(custom_content);
        self
    }

    /// Continuity state, if this message carries any.
    pub fn state(&self) -> Option<&StateMap> {
        self.custom_content.as_ref()?.state.as_ref()
    }

    /// Copy of this message with the side channel removed.
    pub fn content_only(&self) -> Self {
        Self::new(self.role, self.content.clone())
    }
}

fn null_as_empty<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}

/// One conversational turn: every prior message plus the new user message,
/// together with the inbound request metadata.
///
/// A `Turn` always holds at least one message and the last one is from the
/// user.
#[derive(Debug, Clone)]
pub struct Turn {
    messages: Vec<Message>,
    headers: HashMap<String, String>,
}

impl Turn {
    pub fn new<I, K, V>(messages: Vec<Message>, headers: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        match messages.last() {
            None => return Err(RelayError::InvalidTurn("turn has no messages".into())),
            Some(last) if last.role != Role::User => {
                return Err(RelayError::InvalidTurn(format!(
                    "last message must come from the user, got {:?}",
                    last.role
                )));
            }
            Some(_) => {}
        }

        let headers = headers
            .into_iter()
            .map(|(k, v)| (k.as_ref().to_ascii_lowercase(), v.into()))
            .collect();

        Ok(Self { messages, headers })
    }

    /// Turn without request metadata.
    pub fn from_messages(messages: Vec<Message>) -> Result<Self> {
        Self::new(messages, std::iter::empty::<(&str, String)>())
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// The new user message.
    pub fn latest(&self) -> &Message {
        &self.messages[self.messages.len() - 1]
    }

    /// Everything before the new user message.
    pub fn history(&self) -> &[Message] {
        &self.messages[..self.messages.len() - 1]
    }

    /// Case-insensitive request header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }
}
