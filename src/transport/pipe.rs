//! Pipe transport - spawns `conda` and streams its stdout.

use super::{Transport, TransportEvent, TransportKind};
use crate::error::{CallError, Result};
use async_trait::async_trait;
use bytes::BytesMut;
use std::collections::HashMap;
use std::ffi::OsStr;
use std::process::Stdio;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};

/// Default number of bytes requested per stdout read.
pub const DEFAULT_READ_SIZE: usize = 8 * 1024;

type Reader = Box<dyn AsyncRead + Send + Unpin>;

/// Spawned process whose stdout is delivered as raw chunks.
pub struct PipeTransport {
    child: Option<Child>,
    stdout: Option<Reader>,
    buf: BytesMut,
    read_size: usize,
}

impl PipeTransport {
    /// Spawn `program args...` with stdout piped.
    ///
    /// The child is killed if the transport is dropped before it exits.
    pub fn spawn<I, S>(
        program: impl AsRef<OsStr>,
        args: I,
        env: &HashMap<String, String>,
        read_size: usize,
    ) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let program = program.as_ref();
        let mut cmd = Command::new(program);

        cmd.args(args);
        cmd.envs(env);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::inherit());
        cmd.kill_on_drop(true);

        let target = program.to_string_lossy().into_owned();
        let mut child = cmd
            .spawn()
            .map_err(|e| CallError::transport_start(&target, e))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| CallError::transport_start(&target, "stdout was not captured"))?;

        tracing::debug!(program = %target, pid = ?child.id(), "spawned");

        Ok(Self {
            child: Some(child),
            stdout: Some(Box::new(stdout)),
            buf: BytesMut::new(),
            read_size: read_size.max(1),
        })
    }

    /// Stream from an existing reader instead of a child process.
    pub fn from_reader<R>(reader: R, read_size: usize) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        Self {
            child: None,
            stdout: Some(Box::new(reader)),
            buf: BytesMut::new(),
            read_size: read_size.max(1),
        }
    }

    /// Wait for the child after stdout hit EOF. Exit status is informational:
    /// conda reports failures inside its JSON output.
    async fn reap(&mut self) {
        let Some(child) = self.child.as_mut() else {
            return;
        };
        match child.wait().await {
            Ok(status) => tracing::debug!(%status, "process exited"),
            Err(e) => tracing::warn!("failed to wait for process: {}", e),
        }
        self.child = None;
    }
}

#[async_trait]
impl Transport for PipeTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Pipe
    }

    async fn next_event(&mut self) -> Result<Option<TransportEvent>> {
        let Some(stdout) = self.stdout.as_mut() else {
            return Ok(None);
        };

        self.buf.resize(self.read_size, 0);
        let n = stdout
            .read(&mut self.buf[..])
            .await
            .map_err(CallError::transport)?;
        self.buf.truncate(n);

        if n == 0 {
            self.stdout = None;
            self.reap().await;
            return Ok(Some(TransportEvent::Closed));
        }

        Ok(Some(TransportEvent::Chunk(self.buf.split().freeze())))
    }

    async fn close(&mut self) -> Result<()> {
        self.stdout = None;
        if let Some(mut child) = self.child.take() {
            if let Ok(None) = child.try_wait() {
                tracing::debug!(pid = ?child.id(), "killing process");
                let _ = child.start_kill();
                let _ = child.wait().await;
            }
        }
        Ok(())
    }
}
