//! In-memory transport and sink used by the session and registry tests.

use std::io;
use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use shellmux_vt::BufferEdit;

use crate::session::{ConnectionState, OutputSink, SessionHandle, SessionSnapshot, SessionStatus};
use crate::transport::{ConnectionKind, OutputSource, ReadStatus, Transport, TransportError};

/// Everything a fake transport and sink observed, in order.
#[derive(Default)]
pub struct Journal {
    pub entries: Vec<String>,
}

pub type SharedJournal = Arc<Mutex<Journal>>;

#[derive(Default)]
pub struct FakeState {
    pub writes: Vec<Vec<u8>>,
    pub connects: usize,
    pub disconnects: usize,
    pub fail_connect: bool,
    pub fail_writes: bool,
    /// How long `connect` blocks before answering.
    pub connect_delay: Duration,
    /// How long each `write` blocks, like a full pipe.
    pub write_delay: Duration,
    /// Open a second, silent output stream, like a local shell's stderr.
    pub second_stream: bool,
    /// Report the "process" as gone from `is_connected`.
    pub exited: bool,
    pub feeder: Option<Sender<Vec<u8>>>,
    pub second_feeder: Option<Sender<Vec<u8>>>,
}

impl FakeState {
    /// Push a chunk of "shell output" to the connected session.
    pub fn emit(&self, bytes: &[u8]) {
        if let Some(feeder) = &self.feeder {
            let _ = feeder.send(bytes.to_vec());
        }
    }
}

pub struct FakeTransport {
    kind: ConnectionKind,
    state: Arc<Mutex<FakeState>>,
    journal: SharedJournal,
    connected: bool,
}

impl FakeTransport {
    pub fn new(kind: ConnectionKind, journal: SharedJournal) -> (Self, Arc<Mutex<FakeState>>) {
        let state = Arc::new(Mutex::new(FakeState::default()));
        let transport = Self {
            kind,
            state: Arc::clone(&state),
            journal,
            connected: false,
        };
        (transport, state)
    }
}

impl Transport for FakeTransport {
    fn kind(&self) -> ConnectionKind {
        self.kind
    }

    fn connect(&mut self) -> Result<Vec<Box<dyn OutputSource>>, TransportError> {
        let delay = self.state.lock().unwrap().connect_delay;
        std::thread::sleep(delay);

        let mut state = self.state.lock().unwrap();
        state.connects += 1;
        if state.fail_connect {
            return Err(TransportError::AuthRejected {
                user: "ops".into(),
                host: "fake".into(),
            });
        }
        let (tx, rx) = mpsc::channel();
        state.feeder = Some(tx);
        let mut sources: Vec<Box<dyn OutputSource>> = vec![Box::new(FakeSource { rx })];
        if state.second_stream {
            let (tx, rx) = mpsc::channel();
            state.second_feeder = Some(tx);
            sources.push(Box::new(FakeSource { rx }));
        }
        state.exited = false;
        self.connected = true;
        Ok(sources)
    }

    fn write(&mut self, data: &[u8]) -> Result<(), TransportError> {
        let delay = self.state.lock().unwrap().write_delay;
        std::thread::sleep(delay);

        let mut state = self.state.lock().unwrap();
        if state.fail_writes {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "pipe closed").into());
        }
        state.writes.push(data.to_vec());
        self.journal
            .lock()
            .unwrap()
            .entries
            .push(format!("write:{}", String::from_utf8_lossy(data)));
        Ok(())
    }

    fn disconnect(&mut self) {
        let mut state = self.state.lock().unwrap();
        state.disconnects += 1;
        // Dropping the feeders closes the sources.
        state.feeder = None;
        state.second_feeder = None;
        self.connected = false;
    }

    fn is_connected(&mut self) -> bool {
        self.connected && !self.state.lock().unwrap().exited
    }

    fn describe(&self) -> String {
        "fake".to_string()
    }
}

struct FakeSource {
    rx: Receiver<Vec<u8>>,
}

impl OutputSource for FakeSource {
    fn poll_read(&mut self, buf: &mut [u8]) -> io::Result<ReadStatus> {
        match self.rx.try_recv() {
            Ok(chunk) => {
                buf[..chunk.len()].copy_from_slice(&chunk);
                Ok(ReadStatus::Data(chunk.len()))
            }
            Err(TryRecvError::Empty) => Ok(ReadStatus::Idle),
            Err(TryRecvError::Disconnected) => Ok(ReadStatus::Closed),
        }
    }

    fn idle_backoff(&self) -> Duration {
        Duration::from_millis(5)
    }

    fn label(&self) -> &str {
        "fake"
    }
}

#[derive(Default)]
pub struct SinkLog {
    pub edits: Vec<BufferEdit>,
    pub statuses: Vec<SessionStatus>,
    pub scrolls: usize,
}

pub struct RecordingSink {
    log: Arc<Mutex<SinkLog>>,
    journal: SharedJournal,
}

impl RecordingSink {
    pub fn new(journal: SharedJournal) -> (Self, Arc<Mutex<SinkLog>>) {
        let log = Arc::new(Mutex::new(SinkLog::default()));
        let sink = Self {
            log: Arc::clone(&log),
            journal,
        };
        (sink, log)
    }
}

impl OutputSink for RecordingSink {
    fn apply(&mut self, edit: &BufferEdit) {
        self.journal
            .lock()
            .unwrap()
            .entries
            .push(format!("edit:{edit:?}"));
        self.log.lock().unwrap().edits.push(edit.clone());
    }

    fn status_changed(&mut self, status: &SessionStatus) {
        self.log.lock().unwrap().statuses.push(status.clone());
    }

    fn scroll_to_bottom(&mut self) {
        self.log.lock().unwrap().scrolls += 1;
    }
}

/// Poll the session until `pred` holds, or panic after two seconds.
pub async fn wait_for<F>(handle: &SessionHandle, what: &str, pred: F) -> SessionSnapshot
where
    F: Fn(&SessionSnapshot) -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        let snapshot = handle.snapshot().await.expect("session closed");
        if pred(&snapshot) {
            return snapshot;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}; last snapshot: {snapshot:?}");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

pub async fn wait_for_state(handle: &SessionHandle, state: ConnectionState) -> SessionSnapshot {
    wait_for(handle, &format!("{state:?}"), |s| s.state == state).await
}
