use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, Command, Stdio};
use std::time::Duration;

use serde::Deserialize;

use crate::transport::{ConnectionKind, OutputSource, ReadStatus, Transport, TransportError};

/// Reader backoff after an empty poll of a local pipe.
pub const LOCAL_IDLE_BACKOFF: Duration = Duration::from_millis(100);

#[cfg(windows)]
const ROOT_DIR: &str = "C:\\";
#[cfg(not(windows))]
const ROOT_DIR: &str = "/";

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

/// How to launch a local shell.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct LocalShellConfig {
    /// Shell binary. `None` uses the platform default.
    #[serde(default)]
    pub program: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    /// Project directory the shell starts in. `None` starts at the root.
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
}

impl LocalShellConfig {
    pub fn with_program(program: impl Into<String>) -> Self {
        Self {
            program: Some(program.into()),
            ..Self::default()
        }
    }

    pub fn resolved_program(&self) -> String {
        self.program.clone().unwrap_or_else(default_shell)
    }

    pub fn resolved_working_dir(&self) -> PathBuf {
        match &self.working_dir {
            Some(dir) if !dir.as_os_str().is_empty() => dir.clone(),
            _ => PathBuf::from(ROOT_DIR),
        }
    }
}

/// Returns the user's default shell: `$SHELL`, falling back to `/bin/sh`
/// (`cmd.exe` on Windows).
fn default_shell() -> String {
    if cfg!(windows) {
        "cmd.exe".to_string()
    } else {
        std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string())
    }
}

/// A shell child process with redirected stdin, stdout and stderr.
///
/// The child is not attached to a terminal, so it does not echo input; the
/// input router echoes locally instead. Ctrl+C is delivered as an ETX byte on
/// stdin, which reaches the child's input stream but does not signal it.
pub struct LocalShell {
    config: LocalShellConfig,
    child: Option<Child>,
    stdin: Option<ChildStdin>,
}

impl LocalShell {
    pub fn new(config: LocalShellConfig) -> Self {
        Self {
            config,
            child: None,
            stdin: None,
        }
    }

    pub fn config(&self) -> &LocalShellConfig {
        &self.config
    }

    fn spawn(&mut self) -> Result<Vec<Box<dyn OutputSource>>, TransportError> {
        let program = self.config.resolved_program();
        let mut cmd = Command::new(&program);
        cmd.args(&self.config.args)
            .current_dir(self.config.resolved_working_dir())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        #[cfg(windows)]
        {
            use std::os::windows::process::CommandExt;
            cmd.creation_flags(CREATE_NO_WINDOW);
        }

        let mut child = cmd
            .spawn()
            .map_err(|source| TransportError::Spawn { program, source })?;

        let pipes = (child.stdin.take(), child.stdout.take(), child.stderr.take());
        let (Some(stdin), Some(stdout), Some(stderr)) = pipes else {
            let _ = child.kill();
            let _ = child.wait();
            return Err(TransportError::MissingPipe("stdio"));
        };

        log::debug!("spawned local shell pid {}", child.id());
        self.child = Some(child);
        self.stdin = Some(stdin);

        Ok(vec![
            Box::new(PipeSource::new("stdout", stdout)),
            Box::new(PipeSource::new("stderr", stderr)),
        ])
    }
}

impl Transport for LocalShell {
    fn kind(&self) -> ConnectionKind {
        ConnectionKind::Local
    }

    fn connect(&mut self) -> Result<Vec<Box<dyn OutputSource>>, TransportError> {
        if self.child.is_some() {
            self.disconnect();
        }
        self.spawn()
    }

    fn write(&mut self, data: &[u8]) -> Result<(), TransportError> {
        let stdin = self.stdin.as_mut().ok_or(TransportError::NotConnected)?;
        stdin.write_all(data)?;
        stdin.flush()?;
        Ok(())
    }

    fn disconnect(&mut self) {
        // Closing stdin first lets a well-behaved shell exit on its own.
        self.stdin.take();
        if let Some(mut child) = self.child.take() {
            let _ = child.kill();
            let _ = child.wait();
            log::debug!("local shell {} stopped", self.config.resolved_program());
        }
    }

    fn is_connected(&mut self) -> bool {
        match self.child.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    fn describe(&self) -> String {
        self.config.resolved_program()
    }
}

impl Drop for LocalShell {
    fn drop(&mut self) {
        self.disconnect();
    }
}

/// One redirected pipe of the child process.
struct PipeSource<R> {
    label: &'static str,
    reader: R,
}

impl<R: Read + Send> PipeSource<R> {
    fn new(label: &'static str, reader: R) -> Self {
        Self { label, reader }
    }
}

impl<R: Read + Send> OutputSource for PipeSource<R> {
    fn poll_read(&mut self, buf: &mut [u8]) -> io::Result<ReadStatus> {
        match self.reader.read(buf) {
            Ok(0) => Ok(ReadStatus::Closed),
            Ok(n) => Ok(ReadStatus::Data(n)),
            Err(e)
                if e.kind() == io::ErrorKind::Interrupted
                    || e.kind() == io::ErrorKind::WouldBlock =>
            {
                Ok(ReadStatus::Idle)
            }
            Err(e) => Err(e),
        }
    }

    fn idle_backoff(&self) -> Duration {
        LOCAL_IDLE_BACKOFF
    }

    fn label(&self) -> &str {
        self.label
    }
}
