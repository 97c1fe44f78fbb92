//! Channel transport - WebSocket connection to a relay.
//!
//! The client opens the socket and sends the [`Invocation`] as JSON. The relay
//! answers with one text message per event:
//!
//! ```text
//! {"progress": {...}}     any number of times
//! {"finished": {...}}     once, the result
//! {"error": "..."}        instead of "finished" when the relay failed
//! ```

use super::{Transport, TransportEvent, TransportKind};
use crate::error::{CallError, Result};
use crate::invocation::Invocation;
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

/// One message of the relay protocol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Envelope {
    Progress(Value),
    Finished(Value),
    Error(String),
}

impl Envelope {
    pub fn parse(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }

    pub fn to_message(&self) -> Message {
        // Envelope holds only JSON values and strings; serializing cannot fail.
        Message::text(serde_json::to_string(self).unwrap_or_default())
    }
}

/// A WebSocket carrying one call.
pub struct ChannelTransport<S> {
    socket: WebSocketStream<S>,
    closed: bool,
}

impl ChannelTransport<MaybeTlsStream<TcpStream>> {
    /// Connect to `url` and submit `invocation`.
    pub async fn connect(url: &str, invocation: &Invocation) -> Result<Self> {
        let (socket, response) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| CallError::transport_start(url, e))?;
        tracing::debug!(url, status = %response.status(), "channel connected");
        Self::start(socket, invocation).await
    }
}

impl<S> ChannelTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Submit `invocation` over an already established socket.
    pub async fn start(mut socket: WebSocketStream<S>, invocation: &Invocation) -> Result<Self> {
        let request = serde_json::to_string(invocation)
            .map_err(|e| CallError::transport_start("channel", e))?;
        socket
            .send(Message::text(request))
            .await
            .map_err(|e| CallError::transport_start("channel", e))?;

        Ok(Self {
            socket,
            closed: false,
        })
    }
}

#[async_trait]
impl<S> Transport for ChannelTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    fn kind(&self) -> TransportKind {
        TransportKind::Channel
    }

    async fn next_event(&mut self) -> Result<Option<TransportEvent>> {
        loop {
            if self.closed {
                return Ok(None);
            }

            let message = match self.socket.next().await {
                Some(message) => message.map_err(CallError::transport)?,
                None => {
                    self.closed = true;
                    return Ok(Some(TransportEvent::Closed));
                }
            };

            let text = match message {
                Message::Text(text) => text.as_str().to_owned(),
                Message::Binary(data) => String::from_utf8_lossy(&data).into_owned(),
                Message::Close(frame) => {
                    tracing::debug!(?frame, "channel closed by peer");
                    self.closed = true;
                    return Ok(Some(TransportEvent::Closed));
                }
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
            };

            match Envelope::parse(&text) {
                Ok(Envelope::Progress(value)) => return Ok(Some(TransportEvent::Progress(value))),
                Ok(Envelope::Finished(value)) => return Ok(Some(TransportEvent::Result(value))),
                Ok(Envelope::Error(message)) => return Err(CallError::Remote { message }),
                Err(e) => {
                    tracing::warn!(raw = %text, "dropping malformed channel message: {}", e);
                }
            }
        }
    }

    async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        if let Err(e) = self.socket.close(None).await {
            tracing::debug!("channel close: {}", e);
        }
        Ok(())
    }
}
