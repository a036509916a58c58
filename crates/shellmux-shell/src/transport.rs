use std::io;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::local::{LocalShell, LocalShellConfig};
use crate::remote::{RemoteParams, RemoteShell};

/// Whether a session talks to a local process or a remote shell channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionKind {
    Local,
    Remote,
}

/// Errors from transport operations.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to connect to {host}:{port}: {source}")]
    Connect {
        host: String,
        port: u16,
        #[source]
        source: io::Error,
    },
    #[error("authentication rejected for {user}@{host}")]
    AuthRejected { user: String, host: String },
    #[error("SSH error: {0}")]
    Ssh(#[from] ssh2::Error),
    #[error("failed to launch shell `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("shell process has no {0} pipe")]
    MissingPipe(&'static str),
    #[error("transport I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("transport is not connected")]
    NotConnected,
}

/// Coarse classification used to pick the user-facing status message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Network or authentication failure while connecting.
    Connection,
    /// The local shell binary could not be launched.
    Spawn,
    /// Read or write failure on an established transport.
    Io,
}

impl TransportError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            TransportError::Connect { .. }
            | TransportError::AuthRejected { .. }
            | TransportError::Ssh(_) => ErrorCategory::Connection,
            TransportError::Spawn { .. } | TransportError::MissingPipe(_) => ErrorCategory::Spawn,
            TransportError::Io(_) | TransportError::NotConnected => ErrorCategory::Io,
        }
    }
}

/// Outcome of one non-blocking read attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReadStatus {
    /// `n` bytes were written into the buffer.
    Data(usize),
    /// Nothing to read yet; the stream is still open.
    Idle,
    /// The stream has ended.
    Closed,
}

/// One output stream of a connected transport.
///
/// Sources are handed to reader threads at connect time, so they must not
/// borrow from the transport.
pub trait OutputSource: Send {
    /// Read whatever is currently available.
    fn poll_read(&mut self, buf: &mut [u8]) -> io::Result<ReadStatus>;

    /// How long the reader sleeps after an [`ReadStatus::Idle`] poll.
    fn idle_backoff(&self) -> Duration;

    /// Size of the read buffer the reader should allocate.
    fn buffer_size(&self) -> usize {
        4096
    }

    /// Short name used for thread names and logs.
    fn label(&self) -> &str;
}

/// Capability set shared by the local and remote shells.
pub trait Transport: Send {
    fn kind(&self) -> ConnectionKind;

    /// Establish the connection and return its output streams.
    ///
    /// Blocking; callers run it off the session's owning task.
    fn connect(&mut self) -> Result<Vec<Box<dyn OutputSource>>, TransportError>;

    /// Write raw bytes and flush them immediately.
    fn write(&mut self, data: &[u8]) -> Result<(), TransportError>;

    fn write_str(&mut self, text: &str) -> Result<(), TransportError> {
        self.write(text.as_bytes())
    }

    /// Tear the connection down. Idempotent and never fails.
    fn disconnect(&mut self);

    fn is_connected(&mut self) -> bool;

    /// Human-readable target, e.g. `/bin/sh` or `user@host:22`.
    fn describe(&self) -> String;
}

/// Connection parameters for one session, as read from configuration.
#[derive(Clone, Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ConnectionSpec {
    Local(LocalShellConfig),
    Remote(RemoteParams),
}

impl ConnectionSpec {
    pub fn kind(&self) -> ConnectionKind {
        match self {
            ConnectionSpec::Local(_) => ConnectionKind::Local,
            ConnectionSpec::Remote(_) => ConnectionKind::Remote,
        }
    }

    /// Build the (not yet connected) transport for this spec.
    pub fn into_transport(self) -> Box<dyn Transport> {
        match self {
            ConnectionSpec::Local(config) => Box::new(LocalShell::new(config)),
            ConnectionSpec::Remote(params) => Box::new(RemoteShell::new(params)),
        }
    }
}
