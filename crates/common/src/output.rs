//! Output channel abstraction.
//!
//! The caller exposes an append-only, ordered [`OutputSink`]. Components never
//! talk to it directly; they go through [`Output`], which applies the
//! fire-and-forget policy: a failed sink call is logged and dropped, it never
//! interrupts the turn or the stream aggregation.

use crate::{Attachment, Result};
use tracing::warn;

/// Handle for a labeled section ("stage") opened on a sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StageId(pub usize);

/// Ordered output sink supplied by the caller.
pub trait OutputSink: Send + Sync {
    /// Append text to the turn's user-visible answer.
    fn append_content(&self, text: &str) -> Result<()>;

    /// Open a new labeled section.
    fn open_stage(&self, name: &str) -> Result<StageId>;

    /// Attach an artifact to an open section.
    fn add_stage_attachment(&self, stage: StageId, attachment: &Attachment) -> Result<()>;

    /// Close a section.
    fn close_stage(&self, stage: StageId) -> Result<()>;
}

/// Fire-and-forget view over an [`OutputSink`].
#[derive(Clone, Copy)]
pub struct Output<'a> {
    sink: &'a dyn OutputSink,
}

impl<'a> Output<'a> {
    pub fn new(sink: &'a dyn OutputSink) -> Self {
        Self { sink }
    }

    pub fn append(&self, text: &str) {
        if let Err(e) = self.sink.append_content(text) {
            warn!(error = %e, len = text.len(), "Could not append content to output");
        }
    }

    /// Open a section. Returns `None` when the sink refused it.
    pub fn open_stage(&self, name: &str) -> Option<StageId> {
        match self.sink.open_stage(name) {
            Ok(id) => Some(id),
            Err(e) => {
                warn!(error = %e, stage = name, "Could not open output stage");
                None
            }
        }
    }

    pub fn add_stage_attachment(&self, stage: Option<StageId>, attachment: &Attachment) {
        let Some(stage) = stage else {
            return;
        };
        if let Err(e) = self.sink.add_stage_attachment(stage, attachment) {
            warn!(error = %e, stage = stage.0, "Could not attach artifact to output stage");
        }
    }

    pub fn close_stage(&self, stage: Option<StageId>) {
        let Some(stage) = stage else {
            return;
        };
        if let Err(e) = self.sink.close_stage(stage) {
            warn!(error = %e, stage = stage.0, "Could not close output stage");
        }
    }

    /// Open a section that is closed when the guard is closed or dropped.
    pub fn stage(&self, name: &str) -> StageGuard<'a> {
        StageGuard {
            output: *self,
            id: self.open_stage(name),
            closed: false,
        }
    }
}

/// A section that closes itself exactly once, on `close()` or on drop,
/// regardless of how the enclosing scope is left.
pub struct StageGuard<'a> {
    output: Output<'a>,
    id: Option<StageId>,
    closed: bool,
}

impl StageGuard<'_> {
    pub fn id(&self) -> Option<StageId> {
        self.id
    }

    pub fn close(mut self) {
        self.close_once();
    }

    fn close_once(&mut self) {
        if !self.closed {
            self.closed = true;
            self.output.close_stage(self.id);
        }
    }
}

impl Drop for StageGuard<'_> {
    fn drop(&mut self) {
        self.close_once();
    }
}

#[cfg(any(test, feature = "testing"))]
pub mod testing {
    //! In-memory sink that records every call in order.

    use super::{OutputSink, StageId};
    use crate::{Attachment, RelayError, Result};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Debug, Clone, PartialEq)]
    pub enum SinkCall {
        Content(String),
        OpenStage { id: StageId, name: String },
        StageAttachment { id: StageId, attachment: Attachment },
        CloseStage(StageId),
    }

    /// Records sink calls. When built with [`RecordingSink::failing`] every
    /// call is still recorded but reports an error.
    #[derive(Debug, Default)]
    pub struct RecordingSink {
        calls: Mutex<Vec<SinkCall>>,
        next_stage: AtomicUsize,
        fail: bool,
    }

    impl RecordingSink {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn failing() -> Self {
            Self {
                fail: true,
                ..Self::default()
            }
        }

        pub fn calls(&self) -> Vec<SinkCall> {
            self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
        }

        /// All appended content, concatenated.
        pub fn content(&self) -> String {
            self.calls()
                .into_iter()
                .filter_map(|c| match c {
                    SinkCall::Content(text) => Some(text),
                    _ => None,
                })
                .collect()
        }

        pub fn stage_names(&self) -> Vec<String> {
            self.calls()
                .into_iter()
                .filter_map(|c| match c {
                    SinkCall::OpenStage { name, .. } => Some(name),
                    _ => None,
                })
                .collect()
        }

        pub fn close_count(&self, id: StageId) -> usize {
            self.calls()
                .iter()
                .filter(|c| **c == SinkCall::CloseStage(id))
                .count()
        }

        pub fn attachments_of(&self, id: StageId) -> Vec<Attachment> {
            self.calls()
                .into_iter()
                .filter_map(|c| match c {
                    SinkCall::StageAttachment { id: sid, attachment } if sid == id => {
                        Some(attachment)
                    }
                    _ => None,
                })
                .collect()
        }

        /// Number of sections currently open.
        pub fn open_stages(&self) -> usize {
            let calls = self.calls();
            let opened = calls
                .iter()
                .filter(|c| matches!(c, SinkCall::OpenStage { .. }))
                .count();
            let closed = calls
                .iter()
                .filter(|c| matches!(c, SinkCall::CloseStage(_)))
                .count();
            opened.saturating_sub(closed)
        }

        fn record(&self, call: SinkCall) -> Result<()> {
            self.calls
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(call);
            if self.fail {
                Err(RelayError::OutputSink("sink rejected the call".into()))
            } else {
                Ok(())
            }
        }
    }

    impl OutputSink for RecordingSink {
        fn append_content(&self, text: &str) -> Result<()> {
            self.record(SinkCall::Content(text.to_string()))
        }

        fn open_stage(&self, name: &str) -> Result<StageId> {
            let id = StageId(self.next_stage.fetch_add(1, Ordering::SeqCst));
            self.record(SinkCall::OpenStage {
                id,
                name: name.to_string(),
            })?;
            Ok(id)
        }

        fn add_stage_attachment(&self, stage: StageId, attachment: &Attachment) -> Result<()> {
            self.record(SinkCall::StageAttachment {
                id: stage,
                attachment: attachment.clone(),
            })
        }

        fn close_stage(&self, stage: StageId) -> Result<()> {
            self.record(SinkCall::CloseStage(stage))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{RecordingSink, SinkCall};
    use super::*;

    #[test]
    fn guard_closes_on_drop() {
        let sink = RecordingSink::new();
        let output = Output::new(&sink);
        {
            let _stage = output.stage("Coordination Request");
        }
        assert_eq!(sink.close_count(StageId(0)), 1);
        assert_eq!(sink.open_stages(), 0);
    }

    #[test]
    fn explicit_close_is_not_repeated_on_drop() {
        let sink = RecordingSink::new();
        let output = Output::new(&sink);
        let stage = output.stage("GPA Agent Response");
        stage.close();
        assert_eq!(sink.close_count(StageId(0)), 1);
    }

    #[test]
    fn guard_closes_when_scope_exits_with_error() {
        fn failing_step(output: Output<'_>) -> std::result::Result<(), &'static str> {
            let _stage = output.stage("step");
            Err("boom")
        }

        let sink = RecordingSink::new();
        assert!(failing_step(Output::new(&sink)).is_err());
        assert_eq!(sink.open_stages(), 0);
    }

    #[test]
    fn sink_failures_are_swallowed() {
        let sink = RecordingSink::failing();
        let output = Output::new(&sink);

        output.append("hello");
        let stage = output.stage("refused");
        assert!(stage.id().is_none());
        drop(stage);

        assert_eq!(sink.calls()[0], SinkCall::Content("hello".into()));
    }

    #[test]
    fn content_is_forwarded_in_order() {
        let sink = RecordingSink::new();
        let output = Output::new(&sink);
        output.append("A");
        output.append("B");
        output.append("C");
        assert_eq!(sink.content(), "ABC");
    }
}
