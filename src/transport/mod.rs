//! Transports - where the bytes (or messages) of a call come from.
//!
//! Two variants sit behind [`Transport`]:
//! - [`PipeTransport`]: spawned `conda` process, raw stdout chunks, then `Closed`
//! - [`ChannelTransport`]: WebSocket to a relay, already-framed `Progress`
//!   messages, then one `Result`
//!
//! Only chunk events go through the NUL-sentinel frame decoder.

pub mod channel;
pub mod pipe;

pub use channel::{ChannelTransport, Envelope};
pub use pipe::PipeTransport;

use crate::error::Result;
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Spawn the command locally and read its stdout.
    #[default]
    Pipe,
    /// Ask a relay to run the command over a WebSocket.
    Channel,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportKind::Pipe => f.write_str("pipe"),
            TransportKind::Channel => f.write_str("channel"),
        }
    }
}

/// One event delivered by a transport.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// Raw stdout bytes, arbitrary boundaries (pipe).
    Chunk(Bytes),
    /// One progress message (channel).
    Progress(Value),
    /// The final payload (channel). Terminal.
    Result(Value),
    /// The source ended. Terminal.
    Closed,
}

#[async_trait]
pub trait Transport: Send {
    fn kind(&self) -> TransportKind;

    /// Next event, or `None` once the transport has nothing more to deliver
    /// (after its terminal event, or after [`Transport::close`]).
    async fn next_event(&mut self) -> Result<Option<TransportEvent>>;

    /// Stop the transport. Idempotent; no event is delivered afterwards.
    async fn close(&mut self) -> Result<()>;
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for Box<T> {
    fn kind(&self) -> TransportKind {
        (**self).kind()
    }

    async fn next_event(&mut self) -> Result<Option<TransportEvent>> {
        (**self).next_event().await
    }

    async fn close(&mut self) -> Result<()> {
        (**self).close().await
    }
}
