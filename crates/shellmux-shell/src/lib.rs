//! shellmux-shell: terminal session engine for shellmux.
//!
//! This crate owns everything between a shell and its rendered scrollback: it
//! connects a local process or a remote SSH shell, pumps its output through
//! the ANSI decoder into an [`OutputBuffer`](shellmux_vt::OutputBuffer), and
//! routes keystrokes back to the shell.
//!
//! # Architecture
//!
//! - [`Transport`] — Local process or remote shell channel behind one trait.
//! - [`reader`] — Per-source OS thread polling a transport's output.
//! - [`InputRouter`] — Turns key and text events into bytes for the transport.
//! - [`SessionHandle`] — Front door to a session's owning task.
//! - [`SessionRegistry`] — Non-owning set of open sessions, used for broadcast.

pub mod input;
pub mod local;
pub mod reader;
pub mod registry;
pub mod remote;
pub mod session;
pub mod transport;

#[cfg(test)]
mod testing;

pub use input::{InputEvent, InputMode, InputRouter, KeyCode, KeyEvent, Modifiers};
pub use local::{LocalShell, LocalShellConfig};
pub use registry::SessionRegistry;
pub use remote::{effective_port, RemoteAuth, RemoteParams, RemoteShell};
pub use session::{
    spawn_session, ConnectionState, OutputSink, SessionError, SessionHandle, SessionId,
    SessionSnapshot, SessionStatus,
};
pub use transport::{
    ConnectionKind, ConnectionSpec, ErrorCategory, OutputSource, ReadStatus, Transport,
    TransportError,
};
