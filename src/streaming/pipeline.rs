//! Call driver.
//!
//! Opens the transport, pumps its events through a [`ProgressSession`] until
//! the call settles, then closes the transport.

use crate::deferred::{Deferred, Progress};
use crate::error::{CallError, Result};
use crate::streaming::session::ProgressSession;
use crate::transport::{Transport, TransportEvent};
use serde_json::Value;
use std::future::Future;
use tokio_util::sync::CancellationToken;

/// Drive one call to completion.
///
/// Cancellation is checked before opening and between transport events.
pub async fn drive<T, F>(open: F, progress: Progress, cancel: CancellationToken) -> Result<Value>
where
    T: Transport,
    F: Future<Output = Result<T>>,
{
    let opened = tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(CallError::Cancelled),
        opened = open => opened,
    };
    let mut transport = match opened {
        Ok(transport) => transport,
        Err(e) => {
            tracing::debug!("transport did not start: {}", e);
            progress.settle();
            return Err(e);
        }
    };

    let kind = transport.kind();
    let mut session = ProgressSession::new(kind, progress);
    let mut events = 0u64;

    while !session.is_settled() {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tracing::debug!(%kind, events, "call cancelled");
                session.cancel();
            }
            event = transport.next_event() => {
                events += 1;
                match event {
                    Ok(Some(event)) => session.handle(event),
                    Ok(None) => session.handle(TransportEvent::Closed),
                    Err(e) => session.fail(e),
                }
            }
        }
    }

    if let Err(e) = transport.close().await {
        tracing::warn!(%kind, "failed to close transport: {}", e);
    }

    if session.dropped_frames() > 0 {
        tracing::warn!(
            dropped = session.dropped_frames(),
            "call finished with malformed progress frames"
        );
    }
    tracing::debug!(%kind, events, "call settled");

    session.take_outcome().unwrap_or(Err(CallError::Cancelled))
}

/// Wrap an already opened transport in a [`Deferred`].
pub fn start<T>(transport: T) -> Deferred<Value>
where
    T: Transport + 'static,
{
    Deferred::new(move |progress, cancel| {
        drive(async move { Ok::<_, CallError>(transport) }, progress, cancel)
    })
}
