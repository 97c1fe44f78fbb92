//! Entry point for callers: turn an [`Invocation`] into a [`Deferred`].

use crate::config::Config;
use crate::deferred::Deferred;
use crate::error::CallError;
use crate::invocation::Invocation;
use crate::streaming::drive;
use crate::transport::{ChannelTransport, PipeTransport, TransportKind};
use serde_json::Value;

#[derive(Debug, Clone, Default)]
pub struct Client {
    config: Config,
}

impl Client {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Start `invocation` over the given transport.
    ///
    /// Nothing is spawned or connected until the returned `Deferred` is
    /// polled. Start failures reject it with [`CallError::TransportStart`].
    pub fn invoke(&self, kind: TransportKind, invocation: Invocation) -> Deferred<Value> {
        tracing::debug!(%kind, subcommand = %invocation.subcommand, "invoke");
        match kind {
            TransportKind::Pipe => self.invoke_pipe(invocation),
            TransportKind::Channel => self.invoke_channel(invocation),
        }
    }

    fn invoke_pipe(&self, invocation: Invocation) -> Deferred<Value> {
        let conda = self.config.conda.clone();
        let read_size = self.config.transport.read_chunk_size;

        Deferred::new(move |progress, cancel| {
            let open = async move {
                let args = conda.args.iter().cloned().chain(invocation.to_args());
                PipeTransport::spawn(&conda.program, args, &conda.env, read_size)
            };
            drive(open, progress, cancel)
        })
    }

    fn invoke_channel(&self, invocation: Invocation) -> Deferred<Value> {
        let url = self.config.transport.channel_url.clone();

        Deferred::new(move |progress, cancel| {
            let open = async move {
                let url = url.ok_or_else(|| {
                    CallError::transport_start("channel", "no channel_url configured")
                })?;
                ChannelTransport::connect(&url, &invocation).await
            };
            drive(open, progress, cancel)
        })
    }
}

/// [`Client::invoke`] with the default configuration.
pub fn invoke(kind: TransportKind, invocation: Invocation) -> Deferred<Value> {
    Client::default().invoke(kind, invocation)
}
