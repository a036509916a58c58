use bitflags::bitflags;

use shellmux_vt::{OutputBuffer, Style};

use crate::transport::ConnectionKind;

/// End-of-text, sent for Ctrl+C.
pub const ETX: u8 = 0x03;

const LOCAL_LINE_TERMINATOR: &str = "\n";
const REMOTE_LINE_TERMINATOR: &str = "\r";

bitflags! {
    /// Modifier keys held during a key press.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct Modifiers: u8 {
        const SHIFT = 0b0000_0001;
        const CTRL  = 0b0000_0010;
        const ALT   = 0b0000_0100;
    }
}

/// Discrete keys the router understands.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum KeyCode {
    Enter,
    Backspace,
    Tab,
    Up,
    Down,
    Left,
    Right,
    Space,
    Char(char),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct KeyEvent {
    pub code: KeyCode,
    pub modifiers: Modifiers,
}

impl KeyEvent {
    pub const fn new(code: KeyCode) -> Self {
        Self {
            code,
            modifiers: Modifiers::empty(),
        }
    }

    pub const fn with_modifiers(code: KeyCode, modifiers: Modifiers) -> Self {
        Self { code, modifiers }
    }

    pub const fn ctrl_c() -> Self {
        Self::with_modifiers(KeyCode::Char('c'), Modifiers::CTRL)
    }

    pub fn is_ctrl_c(&self) -> bool {
        self.modifiers.contains(Modifiers::CTRL) && matches!(self.code, KeyCode::Char('c' | 'C'))
    }
}

/// A key press or a chunk of composed text (paste, IME commit).
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InputEvent {
    Key(KeyEvent),
    Text(String),
}

impl From<KeyEvent> for InputEvent {
    fn from(key: KeyEvent) -> Self {
        InputEvent::Key(key)
    }
}

impl From<&str> for InputEvent {
    fn from(text: &str) -> Self {
        InputEvent::Text(text.to_string())
    }
}

/// How input reaches the shell.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InputMode {
    /// Echo locally, edit a pending line, send it on Enter.
    Local,
    /// Forward every byte as typed; the remote side echoes.
    Remote,
}

impl From<ConnectionKind> for InputMode {
    fn from(kind: ConnectionKind) -> Self {
        match kind {
            ConnectionKind::Local => InputMode::Local,
            ConnectionKind::Remote => InputMode::Remote,
        }
    }
}

/// Maps input events to the bytes a session's transport expects.
///
/// In local mode the spawned process has no terminal and does not echo, so
/// the router echoes into the buffer itself and holds the typed line until
/// Enter; Backspace edits that pending line and is never sent. In remote mode
/// nothing is echoed and every key becomes bytes immediately.
#[derive(Debug)]
pub struct InputRouter {
    mode: InputMode,
    enabled: bool,
    pending: String,
    /// Trailing chars of `pending` whose echo still sits at the buffer tail.
    echoed: usize,
}

impl InputRouter {
    pub fn new(mode: InputMode) -> Self {
        Self {
            mode,
            enabled: true,
            pending: String::new(),
            echoed: 0,
        }
    }

    pub fn mode(&self) -> InputMode {
        self.mode
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Toggle typing. While disabled, events are discarded, not queued.
    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    /// The local line typed since the last Enter.
    pub fn pending_line(&self) -> &str {
        &self.pending
    }

    /// Shell output was appended after the echo of the pending line.
    ///
    /// The echo is no longer at the tail, so later Backspaces edit the pending
    /// line only and leave the shell's output alone.
    pub fn output_arrived(&mut self) {
        self.echoed = 0;
    }

    /// Route one event. Returns the bytes to write to the transport, which
    /// may be empty.
    pub fn route(&mut self, event: InputEvent, buffer: &mut OutputBuffer) -> Vec<u8> {
        if !self.enabled {
            log::trace!("typing disabled, dropping {event:?}");
            return Vec::new();
        }
        match self.mode {
            InputMode::Remote => remote_bytes(&event),
            InputMode::Local => self.route_local(event, buffer),
        }
    }

    /// Echo `command` as a complete line and return it with the line
    /// terminator. Used for broadcast, so it ignores the typing flag.
    pub fn submit_line(&mut self, command: &str, buffer: &mut OutputBuffer) -> Vec<u8> {
        if !self.pending.is_empty() {
            // Abandon the half-typed line; it would otherwise be sent later
            // without its echo.
            self.pending.clear();
            self.echoed = 0;
            buffer.append("\n", Style::DEFAULT);
        }
        buffer.append(command, Style::DEFAULT);
        buffer.append("\n", Style::DEFAULT);

        let terminator = match self.mode {
            InputMode::Local => LOCAL_LINE_TERMINATOR,
            InputMode::Remote => REMOTE_LINE_TERMINATOR,
        };
        format!("{command}{terminator}").into_bytes()
    }

    fn route_local(&mut self, event: InputEvent, buffer: &mut OutputBuffer) -> Vec<u8> {
        let key = match event {
            // Pasted line breaks submit like Enter.
            InputEvent::Text(text) => {
                let mut sent = Vec::new();
                for (i, segment) in text.split('\n').enumerate() {
                    if i > 0 {
                        sent.extend(self.submit_pending(buffer));
                    }
                    self.type_local(segment.trim_end_matches('\r'), buffer);
                }
                return sent;
            }
            InputEvent::Key(key) => key,
        };

        if key.is_ctrl_c() {
            self.pending.clear();
            self.echoed = 0;
            buffer.append("^C\n", Style::DEFAULT);
            return vec![ETX];
        }

        match key.code {
            KeyCode::Enter => self.submit_pending(buffer),
            KeyCode::Backspace => {
                if self.pending.pop().is_some() && self.echoed > 0 {
                    self.echoed -= 1;
                    buffer.backspace();
                }
                Vec::new()
            }
            KeyCode::Tab => {
                self.type_local("\t", buffer);
                Vec::new()
            }
            KeyCode::Space => {
                self.type_local(" ", buffer);
                Vec::new()
            }
            KeyCode::Char(c) if !key.modifiers.intersects(Modifiers::CTRL | Modifiers::ALT) => {
                self.type_local(c.encode_utf8(&mut [0u8; 4]), buffer);
                Vec::new()
            }
            // No line-editing protocol for local shells.
            KeyCode::Up | KeyCode::Down | KeyCode::Left | KeyCode::Right | KeyCode::Char(_) => {
                Vec::new()
            }
        }
    }

    fn submit_pending(&mut self, buffer: &mut OutputBuffer) -> Vec<u8> {
        buffer.append("\n", Style::DEFAULT);
        self.echoed = 0;
        let mut line = std::mem::take(&mut self.pending);
        line.push_str(LOCAL_LINE_TERMINATOR);
        line.into_bytes()
    }

    fn type_local(&mut self, text: &str, buffer: &mut OutputBuffer) {
        if text.is_empty() {
            return;
        }
        buffer.append(text, Style::DEFAULT);
        self.pending.push_str(text);
        self.echoed += text.chars().count();
    }
}

fn remote_bytes(event: &InputEvent) -> Vec<u8> {
    let key = match event {
        InputEvent::Text(text) => return text.as_bytes().to_vec(),
        InputEvent::Key(key) => key,
    };

    match key.code {
        KeyCode::Enter => b"\r".to_vec(),
        KeyCode::Backspace => b"\x08".to_vec(),
        KeyCode::Tab => b"\t".to_vec(),
        KeyCode::Space => b" ".to_vec(),
        KeyCode::Up => b"\x1b[A".to_vec(),
        KeyCode::Down => b"\x1b[B".to_vec(),
        KeyCode::Right => b"\x1b[C".to_vec(),
        KeyCode::Left => b"\x1b[D".to_vec(),
        KeyCode::Char(c) if key.modifiers.contains(Modifiers::CTRL) => {
            // Ctrl+letter maps onto C0: Ctrl+C is ETX, Ctrl+D is EOT.
            if c.is_ascii_alphabetic() {
                vec![(c.to_ascii_lowercase() as u8) & 0x1f]
            } else {
                Vec::new()
            }
        }
        KeyCode::Char(c) => c.to_string().into_bytes(),
    }
}
