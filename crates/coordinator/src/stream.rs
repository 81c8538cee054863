//! Decoding and merging of a streamed agent reply.
//!
//! Each chunk of a streamed chat completion is decoded into a closed set of
//! [`StreamEvent`]s, which [`StreamMerger`] folds into one assistant message
//! while relaying content and stages to the output as they arrive.

use std::collections::HashMap;

use relay_common::{Attachment, CustomContent, Message, Output, RelayError, Result, StageId, StateMap};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::continuity;

/// One decoded piece of a streamed reply.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// Text to append to the answer
    Content(String),

    /// Artifact attached to the final message
    Attachment(Attachment),

    /// Keys to merge into the backend's continuity state
    State(StateMap),

    /// Creation or update of a labeled sub-section
    Stage(StageDelta),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageStatus {
    Completed,
    Failed,
}

impl StageStatus {
    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// A stage event, keyed by an index unique within one response.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StageDelta {
    pub index: usize,
    pub name: Option<String>,
    pub content: Option<String>,
    pub attachments: Vec<Attachment>,
    pub status: Option<StageStatus>,
}

#[derive(Deserialize)]
struct WireChunk {
    #[serde(default)]
    choices: Vec<WireChoice>,
    #[serde(default)]
    error: Option<Value>,
}

#[derive(Deserialize)]
struct WireChoice {
    #[serde(default)]
    delta: Option<WireDelta>,
}

#[derive(Deserialize)]
struct WireDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    custom_content: Option<Value>,
}

#[derive(Deserialize)]
struct WireStage {
    #[serde(default)]
    index: Option<usize>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    attachments: Option<Vec<Attachment>>,
    #[serde(default)]
    status: Option<String>,
}

const SIDE_CHANNEL_KEYS: [&str; 3] = ["attachments", "state", "stages"];

/// Message of an in-stream error frame (`{"error": ...}`), if `error` is set.
pub(crate) fn stream_error_message(error: &Value) -> Option<String> {
    match error {
        Value::Null => None,
        Value::String(message) => Some(message.clone()),
        other => Some(
            other
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("backend reported an error during streaming")
                .to_string(),
        ),
    }
}

impl StreamEvent {
    /// Decode one `data:` payload.
    ///
    /// Events come out in a fixed order: content, attachments, state, then
    /// stages. Payloads that are not a chat-completion chunk fail with
    /// [`RelayError::MalformedStreamEvent`]. An error frame fails with
    /// [`RelayError::BackendUnreachable`]. Side-channel items that cannot be
    /// used are logged and dropped one by one; the rest of the chunk is kept.
    pub fn decode_chunk(raw: &str) -> Result<Vec<StreamEvent>> {
        let chunk: WireChunk = serde_json::from_str(raw).map_err(|e| {
            RelayError::MalformedStreamEvent(format!(
                "{e}; chunk: {}",
                raw.chars().take(200).collect::<String>()
            ))
        })?;

        if let Some(message) = chunk.error.as_ref().and_then(stream_error_message) {
            return Err(RelayError::BackendUnreachable(format!(
                "agent stream error: {message}"
            )));
        }

        let Some(delta) = chunk.choices.into_iter().next().and_then(|c| c.delta) else {
            return Ok(Vec::new());
        };

        let mut events = Vec::new();

        if let Some(content) = delta.content.filter(|c| !c.is_empty()) {
            events.push(StreamEvent::Content(content));
        }

        let custom = match delta.custom_content {
            Some(Value::Object(custom)) => custom,
            Some(Value::Null) | None => return Ok(events),
            Some(other) => {
                warn!(kind = value_kind(&other), "Ignoring non-object side channel");
                return Ok(events);
            }
        };

        let unknown: Vec<&str> = custom
            .keys()
            .map(String::as_str)
            .filter(|k| !SIDE_CHANNEL_KEYS.contains(k))
            .collect();
        if !unknown.is_empty() {
            debug!(keys = ?unknown, "Ignoring unknown side-channel keys");
        }

        for item in items(custom.get("attachments"), "attachments") {
            match serde_json::from_value::<Attachment>(item.clone()) {
                Ok(attachment) => events.push(StreamEvent::Attachment(attachment)),
                Err(e) => warn!(error = %e, "Ignoring unusable attachment"),
            }
        }

        match custom.get("state") {
            Some(Value::Object(state)) if !state.is_empty() => {
                events.push(StreamEvent::State(state.clone()));
            }
            Some(Value::Object(_)) | Some(Value::Null) | None => {}
            Some(other) => {
                warn!(kind = value_kind(other), "Ignoring non-object state delta");
            }
        }

        for item in items(custom.get("stages"), "stages") {
            let stage = match serde_json::from_value::<WireStage>(item.clone()) {
                Ok(stage) => stage,
                Err(e) => {
                    warn!(error = %e, "Ignoring unusable stage event");
                    continue;
                }
            };
            let Some(index) = stage.index else {
                warn!(name = ?stage.name, "Ignoring stage event without index");
                continue;
            };
            let status = stage.status.as_deref().and_then(|raw| {
                let status = StageStatus::parse(raw);
                if status.is_none() {
                    debug!(index, status = raw, "Unrecognised stage status");
                }
                status
            });
            events.push(StreamEvent::Stage(StageDelta {
                index,
                name: stage.name,
                content: stage.content,
                attachments: stage.attachments.unwrap_or_default(),
                status,
            }));
        }

        Ok(events)
    }
}

/// Elements of a side-channel list; anything but an array yields nothing.
fn items<'a>(value: Option<&'a Value>, field: &'static str) -> &'a [Value] {
    match value {
        Some(Value::Array(items)) => items,
        Some(Value::Null) | None => &[],
        Some(other) => {
            warn!(field, kind = value_kind(other), "Ignoring non-array side-channel field");
            &[]
        }
    }
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// A sub-section opened on behalf of the backend.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackedStage {
    pub name: String,
    /// `None` when the sink refused to open the section
    pub id: Option<StageId>,
    pub attachments: usize,
    pub closed: bool,
}

/// Folds stream events into the final message, in arrival order.
#[derive(Debug, Default)]
pub struct StreamMerger {
    content: String,
    attachments: Vec<Attachment>,
    state: StateMap,
    stages: HashMap<usize, TrackedStage>,
}

impl StreamMerger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&mut self, event: StreamEvent, output: Output<'_>) {
        match event {
            StreamEvent::Content(text) => {
                output.append(&text);
                self.content.push_str(&text);
            }
            StreamEvent::Attachment(attachment) => self.attachments.push(attachment),
            StreamEvent::State(state) => {
                // Last writer per key wins within one response.
                self.state.extend(state);
            }
            StreamEvent::Stage(delta) => self.apply_stage(delta, output),
        }
    }

    fn apply_stage(&mut self, delta: StageDelta, output: Output<'_>) {
        let index = delta.index;
        let stage = self.stages.entry(index).or_insert_with(|| {
            let name = delta
                .name
                .clone()
                .unwrap_or_else(|| format!("Stage {index}"));
            debug!(index, name = %name, "Opening backend stage");
            TrackedStage {
                id: output.open_stage(&name),
                name,
                attachments: 0,
                closed: false,
            }
        });

        // Stage text belongs to the overall answer, not to the section.
        if let Some(content) = delta.content.as_deref().filter(|c| !c.is_empty()) {
            output.append(content);
        }

        for attachment in &delta.attachments {
            if stage.closed {
                debug!(index, "Dropping attachment for closed stage");
                continue;
            }
            output.add_stage_attachment(stage.id, attachment);
            stage.attachments += 1;
        }

        if delta.status.is_some() {
            if stage.closed {
                debug!(index, "Stage already closed");
            } else {
                output.close_stage(stage.id);
                stage.closed = true;
            }
        }
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn attachments(&self) -> &[Attachment] {
        &self.attachments
    }

    /// The merged backend state, without the continuity marker.
    pub fn state(&self) -> &StateMap {
        &self.state
    }

    pub fn stages(&self) -> &HashMap<usize, TrackedStage> {
        &self.stages
    }

    /// Close any stage the backend left open and build the final message.
    ///
    /// A non-empty merged state is stored under the GPA continuity marker.
    pub fn finish(mut self, output: Output<'_>) -> Message {
        let mut open: Vec<_> = self
            .stages
            .iter_mut()
            .filter(|(_, s)| !s.closed)
            .collect();
        open.sort_by_key(|(index, _)| **index);
        for (index, stage) in open {
            debug!(index, name = %stage.name, "Closing stage left open by backend");
            output.close_stage(stage.id);
            stage.closed = true;
        }

        let state = (!self.state.is_empty()).then(|| continuity::gpa_state(self.state));
        let message = Message::assistant(self.content);

        if self.attachments.is_empty() && state.is_none() {
            message
        } else {
            message.with_custom_content(CustomContent {
                attachments: self.attachments,
                state,
            })
        }
    }
}
