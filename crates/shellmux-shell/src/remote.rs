use std::fmt;
use std::io::{self, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Deserialize;
use ssh2::{Channel, Session};

use crate::transport::{ConnectionKind, OutputSource, ReadStatus, Transport, TransportError};

/// Reader backoff after an empty poll of the shell channel.
pub const REMOTE_IDLE_BACKOFF: Duration = Duration::from_millis(50);

/// Terminal type requested for the pseudo-terminal.
pub const PTY_TERM: &str = "xterm";
/// Pseudo-terminal geometry: columns, rows, pixel width, pixel height.
pub const PTY_GEOMETRY: (u32, u32, u32, u32) = (80, 24, 800, 600);
/// Bytes read from the channel per poll.
pub const REMOTE_READ_BUFFER: usize = 1024;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const WRITE_RETRY_DELAY: Duration = Duration::from_millis(5);

const DEFAULT_SSH_PORT: u16 = 22;
const FTP_PORT: u16 = 21;

/// Port actually dialed for a configured port.
///
/// Profiles often carry the file-transfer port; 21 is taken to mean the host's
/// SSH port.
pub fn effective_port(port: u16) -> u16 {
    match port {
        FTP_PORT | 0 => DEFAULT_SSH_PORT,
        other => other,
    }
}

fn default_port() -> u16 {
    DEFAULT_SSH_PORT
}

/// Credentials for the remote login.
#[derive(Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteAuth {
    Password(String),
    KeyFile {
        path: PathBuf,
        #[serde(default)]
        passphrase: Option<String>,
    },
}

impl fmt::Debug for RemoteAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RemoteAuth::Password(_) => f.write_str("Password(<redacted>)"),
            RemoteAuth::KeyFile { path, .. } => {
                f.debug_struct("KeyFile").field("path", path).finish_non_exhaustive()
            }
        }
    }
}

/// Where and as whom to open the remote shell.
#[derive(Clone, Debug, Deserialize)]
pub struct RemoteParams {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub username: String,
    pub auth: RemoteAuth,
}

/// An authenticated SSH connection with an interactive shell channel.
///
/// The channel is put in non-blocking mode once the shell is running, so the
/// reader thread can poll it while input is written from the session task.
/// No local echo happens here; the remote side echoes.
pub struct RemoteShell {
    params: RemoteParams,
    session: Option<Session>,
    channel: Option<Arc<Mutex<Channel>>>,
}

impl RemoteShell {
    pub fn new(params: RemoteParams) -> Self {
        Self {
            params,
            session: None,
            channel: None,
        }
    }

    pub fn params(&self) -> &RemoteParams {
        &self.params
    }

    fn open(&mut self) -> Result<(Session, Channel), TransportError> {
        let host = self.params.host.clone();
        let port = effective_port(self.params.port);
        let connect_err = |source: io::Error| TransportError::Connect {
            host: host.clone(),
            port,
            source,
        };

        let addr = (host.as_str(), port)
            .to_socket_addrs()
            .map_err(connect_err)?
            .next()
            .ok_or_else(|| {
                connect_err(io::Error::new(
                    io::ErrorKind::NotFound,
                    "host name resolved to no addresses",
                ))
            })?;
        let tcp = TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT).map_err(connect_err)?;

        let mut session = Session::new()?;
        session.set_timeout(CONNECT_TIMEOUT.as_millis() as u32);
        session.set_tcp_stream(tcp);
        session.handshake()?;

        match &self.params.auth {
            RemoteAuth::Password(password) => {
                session.userauth_password(&self.params.username, password)?
            }
            RemoteAuth::KeyFile { path, passphrase } => session.userauth_pubkey_file(
                &self.params.username,
                None,
                path,
                passphrase.as_deref(),
            )?,
        }
        if !session.authenticated() {
            return Err(TransportError::AuthRejected {
                user: self.params.username.clone(),
                host,
            });
        }

        let mut channel = session.channel_session()?;
        channel.request_pty(PTY_TERM, None, Some(PTY_GEOMETRY))?;
        channel.shell()?;

        session.set_timeout(0);
        session.set_blocking(false);
        Ok((session, channel))
    }
}

impl Transport for RemoteShell {
    fn kind(&self) -> ConnectionKind {
        ConnectionKind::Remote
    }

    fn connect(&mut self) -> Result<Vec<Box<dyn OutputSource>>, TransportError> {
        if self.session.is_some() {
            self.disconnect();
        }

        let (session, channel) = self.open()?;
        log::info!("opened shell channel to {}", self.describe());

        let channel = Arc::new(Mutex::new(channel));
        self.session = Some(session);
        self.channel = Some(Arc::clone(&channel));

        Ok(vec![Box::new(ChannelSource { channel })])
    }

    fn write(&mut self, data: &[u8]) -> Result<(), TransportError> {
        let channel = self.channel.as_ref().ok_or(TransportError::NotConnected)?;

        let mut written = 0;
        while written < data.len() {
            let result = {
                let mut channel = lock_channel(channel)?;
                channel.write(&data[written..])
            };
            match result {
                Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero).into()),
                Ok(n) => written += n,
                // The lock is released here so the reader can drain the window.
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    std::thread::sleep(WRITE_RETRY_DELAY)
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    fn disconnect(&mut self) {
        if let Some(channel) = self.channel.take() {
            if let Ok(mut channel) = channel.lock() {
                let _ = channel.send_eof();
                let _ = channel.close();
            }
        }
        if let Some(session) = self.session.take() {
            let _ = session.disconnect(None, "session closed", None);
            log::info!("closed shell channel to {}", self.describe());
        }
    }

    fn is_connected(&mut self) -> bool {
        match &self.channel {
            Some(channel) => channel.lock().map(|c| !c.eof()).unwrap_or(false),
            None => false,
        }
    }

    fn describe(&self) -> String {
        format!(
            "{}@{}:{}",
            self.params.username,
            self.params.host,
            effective_port(self.params.port)
        )
    }
}

impl Drop for RemoteShell {
    fn drop(&mut self) {
        self.disconnect();
    }
}

fn lock_channel(channel: &Mutex<Channel>) -> io::Result<std::sync::MutexGuard<'_, Channel>> {
    channel
        .lock()
        .map_err(|_| io::Error::new(io::ErrorKind::Other, "shell channel lock poisoned"))
}

/// The shell channel's output, shared with the transport for writes.
struct ChannelSource {
    channel: Arc<Mutex<Channel>>,
}

impl OutputSource for ChannelSource {
    fn poll_read(&mut self, buf: &mut [u8]) -> io::Result<ReadStatus> {
        let mut channel = lock_channel(&self.channel)?;
        match channel.read(buf) {
            Ok(0) if channel.eof() => Ok(ReadStatus::Closed),
            Ok(0) => Ok(ReadStatus::Idle),
            Ok(n) => Ok(ReadStatus::Data(n)),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(ReadStatus::Idle),
            Err(e) => Err(e),
        }
    }

    fn idle_backoff(&self) -> Duration {
        REMOTE_IDLE_BACKOFF
    }

    fn buffer_size(&self) -> usize {
        REMOTE_READ_BUFFER
    }

    fn label(&self) -> &str {
        "channel"
    }
}
