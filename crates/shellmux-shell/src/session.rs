use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use shellmux_vt::{AnsiDecoder, BufferEdit, Color, Line, OutputBuffer, Style};

use crate::input::{InputEvent, InputMode, InputRouter, KeyEvent};
use crate::reader::{spawn_reader, ReaderEvent, ReaderExit};
use crate::registry::SessionRegistry;
use crate::transport::{ConnectionKind, ErrorCategory, OutputSource, Transport, TransportError};

/// Unique identifier for a terminal session.
pub type SessionId = u64;

const COMMAND_CAPACITY: usize = 64;
const EVENT_CAPACITY: usize = 256;

/// Connection lifecycle of a session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// The last connect attempt failed. The session can be reconnected.
    Failed,
}

impl ConnectionState {
    /// Color of the status indicator shown next to the session.
    pub fn indicator(&self) -> Color {
        match self {
            ConnectionState::Disconnected => Color::BrightBlack,
            ConnectionState::Connecting => Color::Yellow,
            ConnectionState::Connected => Color::Green,
            ConnectionState::Failed => Color::Red,
        }
    }
}

/// A state change plus the human-readable message for the status bar.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionStatus {
    pub session: SessionId,
    pub state: ConnectionState,
    pub message: String,
}

impl SessionStatus {
    pub fn indicator(&self) -> Color {
        self.state.indicator()
    }
}

/// Receives everything a session wants shown.
///
/// Called only from the session's own task, so implementations never see two
/// calls at once for the same session.
pub trait OutputSink: Send + 'static {
    /// Mirror one buffer edit.
    fn apply(&mut self, edit: &BufferEdit);

    fn status_changed(&mut self, status: &SessionStatus);

    /// The caret is at the end of the buffer; bring it into view.
    fn scroll_to_bottom(&mut self) {}
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session {0} is closed")]
    Closed(SessionId),
}

/// Point-in-time copy of a session's state and buffer.
#[derive(Clone, Debug)]
pub struct SessionSnapshot {
    pub id: SessionId,
    pub kind: ConnectionKind,
    pub state: ConnectionState,
    /// Whether typed input currently reaches the transport.
    pub input_enabled: bool,
    pub target: String,
    pub lines: Vec<Line>,
    pub text: String,
}

enum SessionCommand {
    Connect,
    Disconnect,
    Input(InputEvent),
    Submit(String),
    SetInputEnabled(bool),
    Clear,
    Snapshot(oneshot::Sender<SessionSnapshot>),
    Close,
}

/// Work arriving from threads other than the session task.
enum DriverEvent {
    Reader(ReaderEvent),
    ConnectFinished {
        generation: u64,
        transport: Box<dyn Transport>,
        result: Result<Vec<Box<dyn OutputSource>>, TransportError>,
    },
}

impl From<ReaderEvent> for DriverEvent {
    fn from(event: ReaderEvent) -> Self {
        DriverEvent::Reader(event)
    }
}

/// Cloneable front door to a running session.
///
/// Every method enqueues a command for the session's task; that task is the
/// only place the session's buffer and transport are touched.
#[derive(Clone)]
pub struct SessionHandle {
    id: SessionId,
    kind: ConnectionKind,
    tx: mpsc::Sender<SessionCommand>,
}

impl SessionHandle {
    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn kind(&self) -> ConnectionKind {
        self.kind
    }

    /// Returns `true` once the session task has exited.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    async fn send(&self, command: SessionCommand) -> Result<(), SessionError> {
        self.tx
            .send(command)
            .await
            .map_err(|_| SessionError::Closed(self.id))
    }

    /// Start connecting. Progress and failures arrive through the sink.
    ///
    /// Connecting an already connected session disconnects it first.
    pub async fn connect(&self) -> Result<(), SessionError> {
        self.send(SessionCommand::Connect).await
    }

    pub async fn disconnect(&self) -> Result<(), SessionError> {
        self.send(SessionCommand::Disconnect).await
    }

    pub async fn input(&self, event: InputEvent) -> Result<(), SessionError> {
        self.send(SessionCommand::Input(event)).await
    }

    pub async fn key(&self, key: KeyEvent) -> Result<(), SessionError> {
        self.input(InputEvent::Key(key)).await
    }

    pub async fn text(&self, text: &str) -> Result<(), SessionError> {
        self.input(InputEvent::Text(text.to_string())).await
    }

    /// Echo `command` and, if connected, send it followed by a line
    /// terminator.
    pub async fn submit_command(&self, command: &str) -> Result<(), SessionError> {
        self.send(SessionCommand::Submit(command.to_string())).await
    }

    pub async fn set_input_enabled(&self, enabled: bool) -> Result<(), SessionError> {
        self.send(SessionCommand::SetInputEnabled(enabled)).await
    }

    pub async fn clear(&self) -> Result<(), SessionError> {
        self.send(SessionCommand::Clear).await
    }

    pub async fn snapshot(&self) -> Result<SessionSnapshot, SessionError> {
        let (tx, rx) = oneshot::channel();
        self.send(SessionCommand::Snapshot(tx)).await?;
        rx.await.map_err(|_| SessionError::Closed(self.id))
    }

    /// Disconnect, leave the registry, and stop the session task.
    pub async fn close(&self) -> Result<(), SessionError> {
        self.send(SessionCommand::Close).await
    }

    pub(crate) fn downgrade(&self) -> WeakSessionHandle {
        WeakSessionHandle {
            id: self.id,
            kind: self.kind,
            tx: self.tx.downgrade(),
        }
    }
}

/// Registry entry that does not keep the session alive.
#[derive(Clone)]
pub(crate) struct WeakSessionHandle {
    id: SessionId,
    kind: ConnectionKind,
    tx: mpsc::WeakSender<SessionCommand>,
}

impl WeakSessionHandle {
    pub(crate) fn upgrade(&self) -> Option<SessionHandle> {
        self.tx.upgrade().map(|tx| SessionHandle {
            id: self.id,
            kind: self.kind,
            tx,
        })
    }
}

/// Start a session's task and register it.
///
/// The session starts disconnected; call [`SessionHandle::connect`]. It runs
/// until [`SessionHandle::close`] is called or every handle is dropped, and
/// then removes itself from `registry`. Must be called within a tokio
/// runtime.
pub fn spawn_session(
    id: SessionId,
    transport: Box<dyn Transport>,
    sink: Box<dyn OutputSink>,
    registry: Arc<SessionRegistry>,
) -> SessionHandle {
    let kind = transport.kind();
    let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CAPACITY);
    let (event_tx, event_rx) = mpsc::channel(EVENT_CAPACITY);

    let handle = SessionHandle {
        id,
        kind,
        tx: cmd_tx,
    };
    registry.register(&handle);

    let driver = SessionDriver {
        id,
        kind,
        target: transport.describe(),
        transport: Some(transport),
        state: ConnectionState::Disconnected,
        buffer: OutputBuffer::new(),
        decoder: AnsiDecoder::new(),
        router: InputRouter::new(InputMode::from(kind)),
        sink,
        registry,
        event_tx,
        connected: Arc::new(AtomicBool::new(false)),
        generation: 0,
        live_readers: 0,
        reconnect_pending: false,
        connect_in_flight: false,
    };
    tokio::spawn(driver.run(cmd_rx, event_rx));

    log::info!("session {id} opened ({kind:?})");
    handle
}

/// The session's owning task state.
struct SessionDriver {
    id: SessionId,
    kind: ConnectionKind,
    target: String,
    /// `None` only while a connect attempt owns it.
    transport: Option<Box<dyn Transport>>,
    state: ConnectionState,
    buffer: OutputBuffer,
    decoder: AnsiDecoder,
    router: InputRouter,
    sink: Box<dyn OutputSink>,
    registry: Arc<SessionRegistry>,
    event_tx: mpsc::Sender<DriverEvent>,
    /// Shared with the current connection's reader threads.
    connected: Arc<AtomicBool>,
    /// Bumped on every connect and teardown; tags reader and connect events.
    generation: u64,
    live_readers: usize,
    /// A connect was requested while a cancelled attempt still held the
    /// transport; retry once it comes back.
    reconnect_pending: bool,
    connect_in_flight: bool,
}

impl SessionDriver {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<SessionCommand>,
        mut events: mpsc::Receiver<DriverEvent>,
    ) {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(SessionCommand::Close) | None => break,
                    Some(command) => self.handle_command(command).await,
                },
                Some(event) = events.recv() => self.handle_event(event),
            }
        }

        self.teardown_transport();
        self.registry.unregister(self.id);
        self.set_state(ConnectionState::Disconnected, "Session closed".to_string());
        log::info!("session {} closed", self.id);
    }

    async fn handle_command(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::Connect => self.connect(),
            SessionCommand::Disconnect => self.disconnect(),
            SessionCommand::Input(event) => self.input(event).await,
            SessionCommand::Submit(command) => self.submit(&command).await,
            SessionCommand::SetInputEnabled(enabled) => self.router.set_enabled(enabled),
            SessionCommand::Clear => {
                self.buffer.clear();
                self.flush_edits(true);
            }
            SessionCommand::Snapshot(reply) => {
                let _ = reply.send(self.snapshot());
            }
            // Handled by the run loop.
            SessionCommand::Close => {}
        }
    }

    fn handle_event(&mut self, event: DriverEvent) {
        match event {
            DriverEvent::ConnectFinished {
                generation,
                transport,
                result,
            } => self.connect_finished(generation, transport, result),
            DriverEvent::Reader(ReaderEvent::Output { generation, bytes }) => {
                if generation != self.generation {
                    return;
                }
                self.decoder.feed(&bytes, &mut self.buffer);
                if self.flush_edits(true) > 0 {
                    self.router.output_arrived();
                }
            }
            DriverEvent::Reader(ReaderEvent::Exited {
                generation,
                source,
                exit,
            }) => {
                if generation != self.generation {
                    return;
                }
                self.reader_exited(&source, exit);
            }
        }
    }

    fn connect(&mut self) {
        if self.state == ConnectionState::Connected {
            self.teardown_transport();
        }
        let Some(mut transport) = self.transport.take() else {
            if !self.connect_in_flight {
                self.fail("Transport lost; reopen the session".to_string());
                return;
            }
            if self.state == ConnectionState::Connecting {
                log::debug!("session {}: connect already in progress", self.id);
                return;
            }
            // A cancelled attempt still owns the transport.
            self.reconnect_pending = true;
            self.set_state(
                ConnectionState::Connecting,
                format!("Connecting to {} once the previous attempt ends...", self.target),
            );
            return;
        };
        self.reconnect_pending = false;
        self.connect_in_flight = true;

        self.generation += 1;
        let generation = self.generation;
        self.set_state(
            ConnectionState::Connecting,
            format!("Connecting to {}...", self.target),
        );

        let tx = self.event_tx.clone();
        tokio::task::spawn_blocking(move || {
            let result = transport.connect();
            let _ = tx.blocking_send(DriverEvent::ConnectFinished {
                generation,
                transport,
                result,
            });
        });
    }

    fn connect_finished(
        &mut self,
        generation: u64,
        mut transport: Box<dyn Transport>,
        result: Result<Vec<Box<dyn OutputSource>>, TransportError>,
    ) {
        self.connect_in_flight = false;
        if generation != self.generation {
            // Disconnected while the attempt was in flight.
            transport.disconnect();
            self.transport = Some(transport);
            if self.reconnect_pending {
                self.connect();
            }
            return;
        }
        self.transport = Some(transport);

        let sources = match result {
            Ok(sources) => sources,
            Err(e) => {
                log::warn!("session {}: connect to {} failed: {e}", self.id, self.target);
                let message = match e.category() {
                    ErrorCategory::Connection => format!("Connection failed: {e}"),
                    ErrorCategory::Spawn => format!("Could not start shell: {e}"),
                    ErrorCategory::Io => format!("Connection error: {e}"),
                };
                self.fail(message);
                return;
            }
        };

        let connected = Arc::new(AtomicBool::new(true));
        let name = format!("session-{}", self.id);
        let mut started = 0;
        for source in sources {
            match spawn_reader(
                &name,
                generation,
                source,
                Arc::clone(&connected),
                self.event_tx.clone(),
            ) {
                Ok(_) => started += 1,
                Err(e) => log::warn!("session {}: failed to start reader: {e}", self.id),
            }
        }
        self.connected = connected;
        self.live_readers = started;

        if started == 0 {
            self.teardown_transport();
            self.fail("Connection failed: no output stream could be read".to_string());
            return;
        }

        log::info!("session {} connected to {}", self.id, self.target);
        self.set_state(
            ConnectionState::Connected,
            format!("Connected to {}", self.target),
        );
    }

    fn disconnect(&mut self) {
        self.reconnect_pending = false;
        self.teardown_transport();
        if self.state != ConnectionState::Disconnected {
            self.set_state(ConnectionState::Disconnected, "Disconnected".to_string());
        }
    }

    fn reader_exited(&mut self, source: &str, exit: ReaderExit) {
        log::debug!("session {}: reader {source} exited: {exit:?}", self.id);
        self.live_readers = self.live_readers.saturating_sub(1);

        let message = match exit {
            ReaderExit::Failed(msg) => format!("Connection lost: {msg}"),
            // Wait for the remaining streams while the shell is still alive.
            _ if self.live_readers > 0 && self.transport_alive() => return,
            _ => "Disconnected".to_string(),
        };
        self.teardown_transport();
        self.set_state(ConnectionState::Disconnected, message);
    }

    fn transport_alive(&mut self) -> bool {
        self.transport
            .as_mut()
            .map_or(false, |transport| transport.is_connected())
    }

    async fn input(&mut self, event: InputEvent) {
        if self.state != ConnectionState::Connected {
            log::debug!("session {}: not connected, dropping input", self.id);
            return;
        }
        let bytes = self.router.route(event, &mut self.buffer);
        self.flush_edits(false);
        self.write(bytes).await;
    }

    async fn submit(&mut self, command: &str) {
        let bytes = self.router.submit_line(command, &mut self.buffer);
        self.flush_edits(true);
        if self.state == ConnectionState::Connected {
            self.write(bytes).await;
        } else {
            log::debug!("session {}: not connected, command only echoed", self.id);
        }
    }

    /// Write on the blocking pool: a full pipe or a closed SSH window must
    /// not park a runtime worker. The task waits, so writes stay ordered.
    async fn write(&mut self, bytes: Vec<u8>) {
        if bytes.is_empty() {
            return;
        }
        let Some(mut transport) = self.transport.take() else {
            return;
        };
        let joined = tokio::task::spawn_blocking(move || {
            let result = transport.write(&bytes);
            (transport, result)
        })
        .await;

        let result = match joined {
            Ok((transport, result)) => {
                self.transport = Some(transport);
                result
            }
            Err(e) => {
                log::error!("session {}: write task failed: {e}", self.id);
                self.connected.store(false, Ordering::Release);
                self.generation += 1;
                self.live_readers = 0;
                self.set_state(ConnectionState::Failed, "Transport lost".to_string());
                return;
            }
        };
        if let Err(e) = result {
            log::warn!("session {}: write failed: {e}", self.id);
            self.teardown_transport();
            self.set_state(ConnectionState::Disconnected, format!("Connection lost: {e}"));
        }
    }

    /// Stop reader threads and close the transport. Safe to call repeatedly.
    fn teardown_transport(&mut self) {
        self.connected.store(false, Ordering::Release);
        self.generation += 1;
        self.live_readers = 0;
        if let Some(transport) = self.transport.as_mut() {
            transport.disconnect();
        }
    }

    /// Record a failed connect: red inline message, red status.
    fn fail(&mut self, message: String) {
        if !self.buffer.last_line().is_empty() {
            self.buffer.append("\n", Style::DEFAULT);
        }
        self.buffer
            .append(&format!("{message}\n"), Style::fg(Color::Red));
        self.flush_edits(true);
        self.set_state(ConnectionState::Failed, message);
    }

    fn set_state(&mut self, state: ConnectionState, message: String) {
        self.state = state;
        self.sink.status_changed(&SessionStatus {
            session: self.id,
            state,
            message,
        });
    }

    /// Forward pending buffer edits to the sink, then pin the view to the
    /// bottom.
    fn flush_edits(&mut self, always_scroll: bool) -> usize {
        let edits = self.buffer.take_edits();
        for edit in &edits {
            self.sink.apply(edit);
        }
        if always_scroll || !edits.is_empty() {
            self.sink.scroll_to_bottom();
        }
        edits.len()
    }

    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            id: self.id,
            kind: self.kind,
            state: self.state,
            input_enabled: self.state == ConnectionState::Connected && self.router.is_enabled(),
            target: self.target.clone(),
            lines: self.buffer.lines().to_vec(),
            text: self.buffer.text(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input::KeyCode;
    use crate::testing::{
        wait_for, wait_for_state, FakeState, FakeTransport, Journal, RecordingSink, SharedJournal,
        SinkLog,
    };
    use shellmux_vt::StyledRun;
    use std::sync::Mutex;

    struct Fixture {
        handle: SessionHandle,
        state: Arc<Mutex<FakeState>>,
        log: Arc<Mutex<SinkLog>>,
        journal: SharedJournal,
        registry: Arc<SessionRegistry>,
    }

    fn open(kind: ConnectionKind) -> Fixture {
        let journal: SharedJournal = Arc::new(Mutex::new(Journal::default()));
        let (transport, state) = FakeTransport::new(kind, Arc::clone(&journal));
        let (sink, log) = RecordingSink::new(Arc::clone(&journal));
        let registry = Arc::new(SessionRegistry::new());
        let handle = spawn_session(
            registry.next_session_id(),
            Box::new(transport),
            Box::new(sink),
            Arc::clone(&registry),
        );
        Fixture {
            handle,
            state,
            log,
            journal,
            registry,
        }
    }

    async fn open_connected(kind: ConnectionKind) -> Fixture {
        let fx = open(kind);
        fx.handle.connect().await.unwrap();
        wait_for_state(&fx.handle, ConnectionState::Connected).await;
        fx
    }

    fn states(log: &Arc<Mutex<SinkLog>>) -> Vec<ConnectionState> {
        log.lock().unwrap().statuses.iter().map(|s| s.state).collect()
    }

    #[tokio::test]
    async fn test_connect_reports_status_and_enables_input() {
        let fx = open(ConnectionKind::Local);
        let snapshot = fx.handle.snapshot().await.unwrap();
        assert_eq!(snapshot.state, ConnectionState::Disconnected);
        assert!(!snapshot.input_enabled);

        fx.handle.connect().await.unwrap();
        let snapshot = wait_for_state(&fx.handle, ConnectionState::Connected).await;

        assert!(snapshot.input_enabled);
        assert_eq!(
            states(&fx.log),
            vec![ConnectionState::Connecting, ConnectionState::Connected]
        );
        let last = fx.log.lock().unwrap().statuses.last().cloned().unwrap();
        assert_eq!(last.indicator(), Color::Green);
        assert_eq!(fx.state.lock().unwrap().connects, 1);
    }

    #[tokio::test]
    async fn test_output_is_decoded_into_buffer() {
        let fx = open_connected(ConnectionKind::Remote).await;

        fx.state.lock().unwrap().emit(b"\x1b[32mOK\x1b[0m fine");
        let snapshot = wait_for(&fx.handle, "decoded output", |s| s.text == "OK fine").await;

        assert_eq!(
            snapshot.lines[0].runs(),
            &[
                StyledRun::new("OK", Style::fg(Color::Green)),
                StyledRun::new(" fine", Style::DEFAULT),
            ]
        );
        let log = fx.log.lock().unwrap();
        assert_eq!(log.edits.len(), 2);
        assert!(log.scrolls >= 1);
    }

    #[tokio::test]
    async fn test_style_carries_across_chunks() {
        let fx = open_connected(ConnectionKind::Remote).await;

        fx.state.lock().unwrap().emit(b"\x1b[31m");
        fx.state.lock().unwrap().emit(b"error");
        let snapshot = wait_for(&fx.handle, "red text", |s| s.text == "error").await;
        assert_eq!(snapshot.lines[0].runs()[0].style, Style::fg(Color::Red));
    }

    #[tokio::test]
    async fn test_local_enter_echoes_then_sends_once() {
        let fx = open_connected(ConnectionKind::Local).await;

        fx.handle.text("ls").await.unwrap();
        fx.handle.key(KeyEvent::new(KeyCode::Enter)).await.unwrap();
        let snapshot = wait_for(&fx.handle, "echoed line", |s| s.text == "ls\n").await;
        assert_eq!(snapshot.lines.len(), 2);

        assert_eq!(fx.state.lock().unwrap().writes, vec![b"ls\n".to_vec()]);

        let journal = fx.journal.lock().unwrap();
        let newline = journal
            .entries
            .iter()
            .position(|e| e.starts_with("edit:NewLine"))
            .expect("newline echoed");
        let write = journal
            .entries
            .iter()
            .position(|e| e.starts_with("write:"))
            .expect("line written");
        assert!(newline < write, "echo must precede the write: {:?}", journal.entries);
    }

    #[tokio::test]
    async fn test_local_backspace_is_not_forwarded() {
        let fx = open_connected(ConnectionKind::Local).await;

        fx.handle.text("lsx").await.unwrap();
        fx.handle.key(KeyEvent::new(KeyCode::Backspace)).await.unwrap();
        let snapshot = fx.handle.snapshot().await.unwrap();

        assert_eq!(snapshot.text, "ls");
        assert!(fx.state.lock().unwrap().writes.is_empty());
    }

    #[tokio::test]
    async fn test_remote_keys_are_forwarded_without_echo() {
        let fx = open_connected(ConnectionKind::Remote).await;

        fx.handle.text("ls").await.unwrap();
        fx.handle.key(KeyEvent::new(KeyCode::Backspace)).await.unwrap();
        fx.handle.key(KeyEvent::new(KeyCode::Up)).await.unwrap();
        fx.handle.key(KeyEvent::ctrl_c()).await.unwrap();
        fx.handle.key(KeyEvent::new(KeyCode::Enter)).await.unwrap();
        let snapshot = fx.handle.snapshot().await.unwrap();

        assert_eq!(snapshot.text, "");
        assert_eq!(
            fx.state.lock().unwrap().writes,
            vec![
                b"ls".to_vec(),
                b"\x08".to_vec(),
                b"\x1b[A".to_vec(),
                vec![0x03],
                b"\r".to_vec(),
            ]
        );
    }

    #[tokio::test]
    async fn test_input_dropped_while_disconnected() {
        let fx = open(ConnectionKind::Remote);

        fx.handle.text("ls").await.unwrap();
        fx.handle.key(KeyEvent::new(KeyCode::Enter)).await.unwrap();
        fx.handle.snapshot().await.unwrap();

        assert!(fx.state.lock().unwrap().writes.is_empty());
    }

    #[tokio::test]
    async fn test_typing_toggle_discards_input() {
        let fx = open_connected(ConnectionKind::Remote).await;

        fx.handle.set_input_enabled(false).await.unwrap();
        fx.handle.text("ignored").await.unwrap();
        let snapshot = fx.handle.snapshot().await.unwrap();
        assert!(!snapshot.input_enabled);

        fx.handle.set_input_enabled(true).await.unwrap();
        fx.handle.text("kept").await.unwrap();
        fx.handle.snapshot().await.unwrap();

        assert_eq!(fx.state.lock().unwrap().writes, vec![b"kept".to_vec()]);
    }

    #[tokio::test]
    async fn test_connect_failure_is_reported_inline() {
        let fx = open(ConnectionKind::Remote);
        fx.state.lock().unwrap().fail_connect = true;

        fx.handle.connect().await.unwrap();
        let snapshot = wait_for_state(&fx.handle, ConnectionState::Failed).await;

        assert!(!snapshot.input_enabled);
        let run = &snapshot.lines[0].runs()[0];
        assert!(run.text.starts_with("Connection failed:"), "got {run:?}");
        assert_eq!(run.style, Style::fg(Color::Red));

        let last = fx.log.lock().unwrap().statuses.last().cloned().unwrap();
        assert_eq!(last.indicator(), Color::Red);

        // Still open and reconnectable.
        fx.state.lock().unwrap().fail_connect = false;
        fx.handle.connect().await.unwrap();
        wait_for_state(&fx.handle, ConnectionState::Connected).await;
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let fx = open_connected(ConnectionKind::Local).await;

        fx.handle.disconnect().await.unwrap();
        fx.handle.disconnect().await.unwrap();
        let snapshot = fx.handle.snapshot().await.unwrap();

        assert_eq!(snapshot.state, ConnectionState::Disconnected);
        let disconnected = states(&fx.log)
            .into_iter()
            .filter(|s| *s == ConnectionState::Disconnected)
            .count();
        assert_eq!(disconnected, 1);
        assert!(fx.state.lock().unwrap().disconnects >= 1);
    }

    #[tokio::test]
    async fn test_connect_while_connected_reconnects() {
        let fx = open_connected(ConnectionKind::Remote).await;

        fx.handle.connect().await.unwrap();
        wait_for(&fx.handle, "second connect", |s| {
            s.state == ConnectionState::Connected
        })
        .await;
        wait_for(&fx.handle, "reconnect", |_| fx.state.lock().unwrap().connects == 2).await;

        let state = fx.state.lock().unwrap();
        assert!(state.disconnects >= 1, "old connection must be torn down first");
    }

    #[tokio::test]
    async fn test_connect_after_cancelled_attempt_reconnects() {
        let fx = open(ConnectionKind::Remote);
        fx.state.lock().unwrap().connect_delay = std::time::Duration::from_millis(300);

        fx.handle.connect().await.unwrap();
        fx.handle.disconnect().await.unwrap();
        fx.handle.connect().await.unwrap();

        let pending = fx.handle.snapshot().await.unwrap();
        assert_eq!(pending.state, ConnectionState::Connecting);
        let last = fx.log.lock().unwrap().statuses.last().cloned().unwrap();
        assert!(last.message.contains("previous attempt"), "got {last:?}");

        wait_for_state(&fx.handle, ConnectionState::Connected).await;
        let state = fx.state.lock().unwrap();
        assert_eq!(state.connects, 2);
        assert!(state.disconnects >= 1, "cancelled attempt must be closed");
    }

    #[tokio::test]
    async fn test_disconnect_cancels_queued_reconnect() {
        let fx = open(ConnectionKind::Remote);
        fx.state.lock().unwrap().connect_delay = std::time::Duration::from_millis(100);

        fx.handle.connect().await.unwrap();
        fx.handle.disconnect().await.unwrap();
        fx.handle.connect().await.unwrap();
        fx.handle.disconnect().await.unwrap();

        wait_for(&fx.handle, "cancelled attempt returned", |_| {
            fx.state.lock().unwrap().connects == 1
        })
        .await;
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let snapshot = fx.handle.snapshot().await.unwrap();
        assert_eq!(snapshot.state, ConnectionState::Disconnected);
        assert_eq!(fx.state.lock().unwrap().connects, 1);
    }

    #[tokio::test]
    async fn test_local_backspace_leaves_shell_output_alone() {
        let fx = open_connected(ConnectionKind::Local).await;

        fx.handle.text("ab").await.unwrap();
        wait_for(&fx.handle, "echo", |s| s.text == "ab").await;
        fx.state.lock().unwrap().emit(b"out");
        wait_for(&fx.handle, "shell output", |s| s.text == "about").await;

        fx.handle.key(KeyEvent::new(KeyCode::Backspace)).await.unwrap();
        fx.handle.key(KeyEvent::new(KeyCode::Enter)).await.unwrap();
        let snapshot = fx.handle.snapshot().await.unwrap();

        assert_eq!(snapshot.text, "about\n");
        assert_eq!(fx.state.lock().unwrap().writes, vec![b"a\n".to_vec()]);
    }

    #[tokio::test]
    async fn test_local_paste_with_newline_is_sent() {
        let fx = open_connected(ConnectionKind::Local).await;

        fx.handle.text("uname -a\n").await.unwrap();
        let snapshot = fx.handle.snapshot().await.unwrap();

        assert_eq!(snapshot.text, "uname -a\n");
        assert_eq!(fx.state.lock().unwrap().writes, vec![b"uname -a\n".to_vec()]);
    }

    #[tokio::test]
    async fn test_exited_shell_disconnects_with_stream_still_open() {
        let fx = open(ConnectionKind::Local);
        fx.state.lock().unwrap().second_stream = true;
        fx.handle.connect().await.unwrap();
        wait_for_state(&fx.handle, ConnectionState::Connected).await;

        // The process is gone but something still holds its second stream.
        {
            let mut state = fx.state.lock().unwrap();
            state.exited = true;
            state.feeder = None;
        }
        wait_for_state(&fx.handle, ConnectionState::Disconnected).await;
    }

    #[tokio::test]
    async fn test_slow_write_does_not_stall_other_sessions() {
        let stuck = open_connected(ConnectionKind::Remote).await;
        let other = open_connected(ConnectionKind::Remote).await;
        stuck.state.lock().unwrap().write_delay = std::time::Duration::from_millis(500);

        stuck.handle.text("x").await.unwrap();
        // Let the stuck session pick up its write.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let started = std::time::Instant::now();
        other.handle.snapshot().await.unwrap();
        assert!(
            started.elapsed() < std::time::Duration::from_millis(250),
            "other session blocked for {:?}",
            started.elapsed()
        );

        wait_for(&stuck.handle, "slow write", |_| {
            !stuck.state.lock().unwrap().writes.is_empty()
        })
        .await;
    }

    #[tokio::test]
    async fn test_stream_close_marks_disconnected_but_keeps_session() {
        let fx = open_connected(ConnectionKind::Remote).await;

        // Dropping the feeder closes the fake stream, as a dead shell would.
        fx.state.lock().unwrap().feeder = None;
        let snapshot = wait_for_state(&fx.handle, ConnectionState::Disconnected).await;

        assert!(!snapshot.input_enabled);
        assert!(!fx.handle.is_closed());
        assert!(fx.registry.contains(fx.handle.id()));
    }

    #[tokio::test]
    async fn test_write_failure_disconnects() {
        let fx = open_connected(ConnectionKind::Remote).await;
        fx.state.lock().unwrap().fail_writes = true;

        fx.handle.text("ls").await.unwrap();
        wait_for_state(&fx.handle, ConnectionState::Disconnected).await;

        let last = fx.log.lock().unwrap().statuses.last().cloned().unwrap();
        assert!(last.message.starts_with("Connection lost"), "got {last:?}");
    }

    #[tokio::test]
    async fn test_submit_command_while_disconnected_only_echoes() {
        let fx = open(ConnectionKind::Local);

        fx.handle.submit_command("uptime").await.unwrap();
        let snapshot = fx.handle.snapshot().await.unwrap();

        assert_eq!(snapshot.text, "uptime\n");
        assert!(fx.state.lock().unwrap().writes.is_empty());
    }

    #[tokio::test]
    async fn test_clear_empties_buffer() {
        let fx = open_connected(ConnectionKind::Remote).await;
        fx.state.lock().unwrap().emit(b"lots of output\n");
        wait_for(&fx.handle, "output", |s| !s.text.is_empty()).await;

        fx.handle.clear().await.unwrap();
        let snapshot = fx.handle.snapshot().await.unwrap();
        assert_eq!(snapshot.text, "");
        assert_eq!(fx.log.lock().unwrap().edits.last(), Some(&BufferEdit::Clear));
    }

    #[tokio::test]
    async fn test_close_unregisters_and_stops() {
        let fx = open_connected(ConnectionKind::Local).await;
        let id = fx.handle.id();
        assert!(fx.registry.contains(id));

        fx.handle.close().await.unwrap();
        let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(2);
        while !fx.handle.is_closed() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }

        assert!(fx.handle.is_closed());
        assert!(!fx.registry.contains(id));
        assert!(matches!(
            fx.handle.snapshot().await,
            Err(SessionError::Closed(closed)) if closed == id
        ));
        assert!(fx.state.lock().unwrap().disconnects >= 1);
    }
}
