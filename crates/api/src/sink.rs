//! Output sinks backing the chat-completions endpoint.
//!
//! [`ChunkSink`] turns every sink call into a chat-completion chunk pushed
//! down an SSE channel. [`CollectingSink`] keeps the stage log for
//! non-streaming responses.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use relay_common::{Attachment, CustomContent, OutputSink, RelayError, Result, StageId};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::mpsc::UnboundedSender;

/// Status reported for a stage once it is closed.
const STAGE_COMPLETED: &str = "completed";

pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

/// A stage as reported to the caller.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StageRecord {
    pub index: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<&'static str>,
}

/// Builds `chat.completion.chunk` payloads for one response.
#[derive(Debug, Clone)]
pub struct ChunkFrame {
    id: String,
    model: String,
    created: u64,
}

impl ChunkFrame {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            id: format!("chatcmpl-{}", uuid::Uuid::new_v4()),
            model: model.into(),
            created: unix_now(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    fn chunk(&self, delta: Value, finish_reason: Option<&str>) -> String {
        json!({
            "id": self.id,
            "object": "chat.completion.chunk",
            "created": self.created,
            "model": self.model,
            "choices": [{
                "index": 0,
                "delta": delta,
                "finish_reason": finish_reason,
            }]
        })
        .to_string()
    }

    pub fn role(&self) -> String {
        self.chunk(json!({"role": "assistant"}), None)
    }

    pub fn content(&self, text: &str) -> String {
        self.chunk(json!({"content": text}), None)
    }

    pub fn stage(&self, stage: &StageRecord) -> String {
        self.chunk(json!({"custom_content": {"stages": [stage]}}), None)
    }

    /// Attachments and continuity state of the final message.
    pub fn custom_content(&self, custom: &CustomContent) -> String {
        self.chunk(json!({"custom_content": custom}), None)
    }

    pub fn finish(&self) -> String {
        self.chunk(json!({}), Some("stop"))
    }

    pub fn error(message: &str, code: &str) -> String {
        json!({"error": {"message": message, "code": code}}).to_string()
    }
}

/// Streams sink calls to the client as SSE chunks.
pub struct ChunkSink {
    frame: ChunkFrame,
    tx: UnboundedSender<String>,
    next_stage: AtomicUsize,
}

impl ChunkSink {
    pub fn new(frame: ChunkFrame, tx: UnboundedSender<String>) -> Self {
        Self {
            frame,
            tx,
            next_stage: AtomicUsize::new(0),
        }
    }

    pub fn frame(&self) -> &ChunkFrame {
        &self.frame
    }

    /// Push a raw `data:` payload.
    pub fn send(&self, data: String) -> Result<()> {
        self.tx
            .send(data)
            .map_err(|_| RelayError::OutputSink("client disconnected".to_string()))
    }
}

impl OutputSink for ChunkSink {
    fn append_content(&self, text: &str) -> Result<()> {
        self.send(self.frame.content(text))
    }

    fn open_stage(&self, name: &str) -> Result<StageId> {
        let index = self.next_stage.fetch_add(1, Ordering::SeqCst);
        self.send(self.frame.stage(&StageRecord {
            index,
            name: Some(name.to_string()),
            ..Default::default()
        }))?;
        Ok(StageId(index))
    }

    fn add_stage_attachment(&self, stage: StageId, attachment: &Attachment) -> Result<()> {
        self.send(self.frame.stage(&StageRecord {
            index: stage.0,
            attachments: vec![attachment.clone()],
            ..Default::default()
        }))
    }

    fn close_stage(&self, stage: StageId) -> Result<()> {
        self.send(self.frame.stage(&StageRecord {
            index: stage.0,
            status: Some(STAGE_COMPLETED),
            ..Default::default()
        }))
    }
}

/// Keeps the stage log of a non-streaming response. Content is dropped:
/// the returned message already holds it.
#[derive(Debug, Default)]
pub struct CollectingSink {
    stages: Mutex<Vec<StageRecord>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn into_stages(self) -> Vec<StageRecord> {
        self.stages.into_inner().unwrap_or_else(|e| e.into_inner())
    }

    fn with_stage<T>(&self, stage: StageId, f: impl FnOnce(&mut StageRecord) -> T) -> Result<T> {
        let mut stages = self.stages.lock().unwrap_or_else(|e| e.into_inner());
        stages
            .get_mut(stage.0)
            .map(f)
            .ok_or_else(|| RelayError::OutputSink(format!("unknown stage {}", stage.0)))
    }
}

impl OutputSink for CollectingSink {
    fn append_content(&self, _text: &str) -> Result<()> {
        Ok(())
    }

    fn open_stage(&self, name: &str) -> Result<StageId> {
        let mut stages = self.stages.lock().unwrap_or_else(|e| e.into_inner());
        let index = stages.len();
        stages.push(StageRecord {
            index,
            name: Some(name.to_string()),
            ..Default::default()
        });
        Ok(StageId(index))
    }

    fn add_stage_attachment(&self, stage: StageId, attachment: &Attachment) -> Result<()> {
        self.with_stage(stage, |s| s.attachments.push(attachment.clone()))
    }

    fn close_stage(&self, stage: StageId) -> Result<()> {
        self.with_stage(stage, |s| s.status = Some(STAGE_COMPLETED))
    }
}
