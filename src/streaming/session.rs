//! Per-call progress session.
//!
//! Takes transport events one at a time, dispatches progress messages to the
//! call's subscribers and settles the outcome exactly once.

use crate::deferred::{Progress, Settlement};
use crate::error::{CallError, Result};
use crate::streaming::protocol::{FrameDecoder, Phase};
use crate::transport::{TransportEvent, TransportKind};
use serde_json::Value;

pub struct ProgressSession {
    kind: TransportKind,
    decoder: FrameDecoder,
    progress: Progress,
    settlement: Settlement<Value>,
    dropped: u64,
}

impl ProgressSession {
    pub fn new(kind: TransportKind, progress: Progress) -> Self {
        Self {
            kind,
            decoder: FrameDecoder::new(),
            progress,
            settlement: Settlement::Pending,
            dropped: 0,
        }
    }

    /// Current framing phase. Channel sessions never leave `Streaming`.
    pub fn phase(&self) -> Phase {
        self.decoder.phase()
    }

    pub fn is_settled(&self) -> bool {
        !self.settlement.is_pending()
    }

    /// Progress frames dropped because they did not parse.
    pub fn dropped_frames(&self) -> u64 {
        self.dropped
    }

    /// Process one transport event. Events after settlement are ignored.
    pub fn handle(&mut self, event: TransportEvent) {
        if self.is_settled() {
            tracing::trace!(?event, "event after settlement ignored");
            return;
        }

        match event {
            TransportEvent::Chunk(chunk) => self.on_chunk(&chunk),
            TransportEvent::Progress(message) => self.dispatch(&message),
            TransportEvent::Result(value) => self.fulfill(value),
            TransportEvent::Closed => self.on_close(),
        }
    }

    fn on_chunk(&mut self, chunk: &[u8]) {
        for frame in self.decoder.decode(chunk) {
            match frame {
                Ok(message) => self.dispatch(&message),
                Err(e) => {
                    self.dropped += 1;
                    tracing::warn!(raw = %e.raw, "{}", e);
                }
            }
        }
    }

    fn dispatch(&mut self, message: &Value) {
        tracing::debug!(%message, "progress");
        self.progress.emit(message);
    }

    fn on_close(&mut self) {
        match self.kind {
            TransportKind::Pipe => {
                let raw = self.decoder.finish();
                match serde_json::from_slice(&raw) {
                    Ok(value) => self.fulfill(value),
                    Err(source) => self.fail(CallError::MalformedResult {
                        raw: String::from_utf8_lossy(&raw).into_owned(),
                        source,
                    }),
                }
            }
            TransportKind::Channel => {
                tracing::debug!("channel closed before a result");
                self.fail(CallError::Cancelled);
            }
        }
    }

    fn fulfill(&mut self, value: Value) {
        if self.settlement.fulfill(value) {
            self.progress.settle();
        }
    }

    /// Reject the call unless it already settled.
    pub fn fail(&mut self, error: CallError) {
        if self.settlement.reject(error) {
            self.progress.settle();
        }
    }

    pub fn cancel(&mut self) {
        self.fail(CallError::Cancelled);
    }

    /// The outcome, once. Later calls return `None`.
    pub fn take_outcome(&mut self) -> Option<Result<Value>> {
        self.settlement.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use serde_json::json;
    use std::sync::{Arc, Mutex};

    fn chunk(bytes: &'static [u8]) -> TransportEvent {
        TransportEvent::Chunk(Bytes::from_static(bytes))
    }

    fn pipe_session() -> (ProgressSession, Arc<Mutex<Vec<Value>>>) {
        let progress = Progress::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        progress.subscribe(move |v| sink.lock().unwrap().push(v.clone()));
        (ProgressSession::new(TransportKind::Pipe, progress), seen)
    }

    #[test]
    fn test_finished_frame_then_close_with_empty_output() {
        let (mut session, seen) = pipe_session();

        session.handle(chunk(b"{\"progress\":1}\0"));
        session.handle(chunk(b"{\"progress\":2,\"finished\":true}\0"));
        assert!(!session.is_settled());
        session.handle(TransportEvent::Closed);

        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                json!({"progress": 1}),
                json!({"progress": 2, "finished": true})
            ]
        );
        let err = session.take_outcome().unwrap().unwrap_err();
        assert!(matches!(err, CallError::MalformedResult { ref raw, .. } if raw.is_empty()));
    }

    #[test]
    fn test_unterminated_finished_chunk_is_the_result() {
        let (mut session, seen) = pipe_session();

        session.handle(chunk(b"{\"progress\":1}\0"));
        session.handle(chunk(b"{\"progress\":2,\"finished\":true}"));
        assert_eq!(session.phase(), Phase::Draining);
        session.handle(TransportEvent::Closed);

        assert_eq!(*seen.lock().unwrap(), vec![json!({"progress": 1})]);
        assert_eq!(
            session.take_outcome().unwrap().unwrap(),
            json!({"progress": 2, "finished": true})
        );
    }

    #[test]
    fn test_progress_run_then_final_document() {
        let (mut session, seen) = pipe_session();

        session.handle(chunk(b"{\"progress\":1}\0{\"progress\":2}\0{\"succ"));
        session.handle(chunk(b"ess\": true,\n"));
        session.handle(chunk(b" \"actions\": []}\n"));
        session.handle(TransportEvent::Closed);

        assert_eq!(seen.lock().unwrap().len(), 2);
        assert_eq!(
            session.take_outcome().unwrap().unwrap(),
            json!({"success": true, "actions": []})
        );
    }

    #[test]
    fn test_no_progress_frames_at_all() {
        let (mut session, seen) = pipe_session();

        session.handle(chunk(b"{\"channels\": "));
        session.handle(chunk(b"[\"defaults\"]}"));
        session.handle(TransportEvent::Closed);

        assert!(seen.lock().unwrap().is_empty());
        assert_eq!(
            session.take_outcome().unwrap().unwrap(),
            json!({"channels": ["defaults"]})
        );
    }

    #[test]
    fn test_multi_phase_progress_before_settlement() {
        let (mut session, seen) = pipe_session();

        session.handle(chunk(
            b"{\"fetch\":\"a\",\"progress\":0}\0{\"fetch\":\"a\",\"progress\":1,\"finished\":true}\0{\"name\":\"a\",\"progress\":0}\0",
        ));
        assert!(!session.is_settled());
        session.handle(chunk(
            b"{\"name\":\"a\",\"progress\":1,\"finished\":true}\0{\"success\":true}",
        ));
        session.handle(TransportEvent::Closed);

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 4);
        assert_eq!(seen[2], json!({"name": "a", "progress": 0}));
        assert_eq!(
            session.take_outcome().unwrap().unwrap(),
            json!({"success": true})
        );
    }

    #[test]
    fn test_malformed_frame_is_skipped() {
        let (mut session, seen) = pipe_session();

        session.handle(chunk(b"{\"progress\":1}\0{\"progr"));
        session.handle(chunk(b"ess\":}\0{\"progress\":3}\0{\"ok\":1}"));
        session.handle(TransportEvent::Closed);

        assert_eq!(
            *seen.lock().unwrap(),
            vec![json!({"progress": 1}), json!({"progress": 3})]
        );
        assert_eq!(session.dropped_frames(), 1);
        assert_eq!(session.take_outcome().unwrap().unwrap(), json!({"ok": 1}));
    }

    #[test]
    fn test_duplicate_close_settles_once() {
        let (mut session, _) = pipe_session();

        session.handle(chunk(b"{\"ok\":1}"));
        session.handle(TransportEvent::Closed);
        session.handle(TransportEvent::Closed);
        session.handle(chunk(b"garbage"));
        session.fail(CallError::Cancelled);

        assert_eq!(session.take_outcome().unwrap().unwrap(), json!({"ok": 1}));
        assert!(session.take_outcome().is_none());
        assert!(session.is_settled());
    }

    #[test]
    fn test_no_progress_after_settlement() {
        let (mut session, seen) = pipe_session();

        session.cancel();
        session.handle(chunk(b"{\"progress\":1}\0"));

        assert!(seen.lock().unwrap().is_empty());
        assert!(session.take_outcome().unwrap().unwrap_err().is_cancelled());
    }

    #[test]
    fn test_channel_events() {
        let progress = Progress::new();
        let mut rx = progress.stream();
        let mut session = ProgressSession::new(TransportKind::Channel, progress.clone());

        session.handle(TransportEvent::Progress(json!({"progress": 1})));
        session.handle(TransportEvent::Progress(json!({"progress": 2})));
        session.handle(TransportEvent::Result(json!({"success": true})));
        session.handle(TransportEvent::Progress(json!({"progress": 3})));

        assert_eq!(rx.try_recv().unwrap(), json!({"progress": 1}));
        assert_eq!(rx.try_recv().unwrap(), json!({"progress": 2}));
        assert!(rx.try_recv().is_err());
        assert!(progress.is_settled());
        assert_eq!(session.phase(), Phase::Streaming);
        assert_eq!(
            session.take_outcome().unwrap().unwrap(),
            json!({"success": true})
        );
    }

    #[test]
    fn test_channel_close_without_result_is_cancelled() {
        let mut session = ProgressSession::new(TransportKind::Channel, Progress::new());
        session.handle(TransportEvent::Progress(json!(1)));
        session.handle(TransportEvent::Closed);

        assert!(session.take_outcome().unwrap().unwrap_err().is_cancelled());
    }
}
