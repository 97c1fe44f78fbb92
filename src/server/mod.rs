//! Relay mode - runs when invoked as `conda-stream serve`
//!
//! Accepts WebSocket connections, runs each requested call locally over the
//! pipe transport and forwards its progress and result as channel envelopes.
//! One call per connection; the socket is closed after the result. If the
//! client closes or drops the socket first, the call is cancelled, which
//! kills the conda process.

use anyhow::{Context, Result};
use futures::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use crate::client::Client;
use crate::invocation::Invocation;
use crate::transport::{Envelope, TransportKind};

/// Pause after a failed accept, e.g. while out of file descriptors.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Main relay loop. Runs until the task is dropped.
pub async fn serve(listener: TcpListener, client: Client) -> Result<()> {
    let addr = listener.local_addr()?;
    tracing::info!(%addr, "relay listening");

    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                tracing::warn!("failed to accept connection: {}", e);
                tokio::time::sleep(ACCEPT_BACKOFF).await;
                continue;
            }
        };
        let client = client.clone();

        tokio::spawn(async move {
            if let Err(e) = handle_tcp(stream, &client).await {
                tracing::warn!(%peer, "relay connection failed: {:#}", e);
            }
        });
    }
}

async fn handle_tcp(stream: TcpStream, client: &Client) -> Result<()> {
    let socket = tokio_tungstenite::accept_async(stream)
        .await
        .context("WebSocket handshake failed")?;
    serve_connection(socket, client).await
}

/// Handle one connection: read the request, relay the call, close.
pub async fn serve_connection<S>(mut socket: WebSocketStream<S>, client: &Client) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let invocation = match read_request(&mut socket).await? {
        Some(Ok(invocation)) => invocation,
        Some(Err(e)) => {
            let reply = Envelope::Error(format!("invalid request: {}", e));
            socket.send(reply.to_message()).await?;
            let _ = socket.close(None).await;
            return Ok(());
        }
        None => return Ok(()),
    };

    tracing::info!(
        subcommand = %invocation.subcommand,
        positional = ?invocation.positional,
        "relaying call"
    );

    let mut call = client.invoke(TransportKind::Pipe, invocation);
    let mut progress = call.progress().stream();
    let cancel = call.cancel_handle();
    let (mut sink, mut incoming) = socket.split();
    let mut client_gone = false;

    let outcome = loop {
        tokio::select! {
            Some(message) = progress.recv(), if !client_gone => {
                if let Err(e) = sink.send(Envelope::Progress(message).to_message()).await {
                    tracing::info!("failed to forward progress, cancelling call: {}", e);
                    client_gone = true;
                    cancel.cancel();
                }
            }
            message = incoming.next(), if !client_gone => {
                match message {
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => {
                        tracing::info!("client went away, cancelling call");
                        client_gone = true;
                        cancel.cancel();
                    }
                    Some(Ok(_)) => {}
                }
            }
            outcome = &mut call => break outcome,
        }
    };

    if client_gone {
        tracing::debug!(cancelled = outcome.is_err(), "call ended without a client");
        return Ok(());
    }

    // Progress emitted just before settlement is still queued
    while let Ok(message) = progress.try_recv() {
        sink.send(Envelope::Progress(message).to_message()).await?;
    }

    let reply = match outcome {
        Ok(value) => Envelope::Finished(value),
        Err(e) => {
            tracing::warn!("relayed call failed: {}", e);
            Envelope::Error(e.to_string())
        }
    };
    sink.send(reply.to_message())
        .await
        .context("Failed to send result")?;
    let _ = sink.close().await;

    Ok(())
}

/// First text message of the connection, parsed as an [`Invocation`].
/// `None` if the peer went away first.
async fn read_request<S>(
    socket: &mut WebSocketStream<S>,
) -> Result<Option<serde_json::Result<Invocation>>>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    while let Some(message) = socket.next().await {
        match message.context("Failed to read request")? {
            Message::Text(text) => return Ok(Some(serde_json::from_str(text.as_str()))),
            Message::Binary(data) => return Ok(Some(serde_json::from_slice(&data))),
            Message::Close(_) => return Ok(None),
            Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
        }
    }
    Ok(None)
}
