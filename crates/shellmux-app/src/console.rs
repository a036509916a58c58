//! Terminal front-end: mirrors the focused session onto stdout.

use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use shellmux_shell::{OutputSink, SessionId, SessionStatus};
use shellmux_vt::{BufferEdit, Color, Line, Style, StyledRun};

const RESET: &str = "\x1b[0m";
const CLEAR_SCREEN: &str = "\x1b[2J\x1b[H";
/// Rub out the character left of the caret.
const ERASE_LAST: &str = "\x08 \x08";

/// Which session currently owns the screen.
#[derive(Clone, Default)]
pub struct Focus(Arc<AtomicU64>);

impl Focus {
    pub fn get(&self) -> SessionId {
        self.0.load(Ordering::Acquire)
    }

    pub fn set(&self, id: SessionId) {
        self.0.store(id, Ordering::Release);
    }

    pub fn is(&self, id: SessionId) -> bool {
        self.get() == id
    }
}

/// [`OutputSink`] that writes one session's edits to a terminal while that
/// session has focus. Status changes are printed regardless of focus.
pub struct ConsoleSink<W> {
    session: SessionId,
    name: String,
    focus: Focus,
    out: W,
}

impl<W: Write + Send + 'static> ConsoleSink<W> {
    pub fn new(session: SessionId, name: impl Into<String>, focus: Focus, out: W) -> Self {
        Self {
            session,
            name: name.into(),
            focus,
            out,
        }
    }

    fn emit(&mut self, text: &str) {
        if let Err(e) = self
            .out
            .write_all(text.as_bytes())
            .and_then(|_| self.out.flush())
        {
            log::warn!("console write failed: {e}");
        }
    }
}

impl<W: Write + Send + 'static> OutputSink for ConsoleSink<W> {
    fn apply(&mut self, edit: &BufferEdit) {
        if self.focus.is(self.session) {
            let text = render_edit(edit);
            self.emit(&text);
        }
    }

    fn status_changed(&mut self, status: &SessionStatus) {
        let line = format!("{}\n", render_status(&self.name, status));
        self.emit(&line);
    }
}

/// Terminal bytes that reproduce `edit` at the caret.
pub fn render_edit(edit: &BufferEdit) -> String {
    match edit {
        BufferEdit::Append { run, .. } => render_run(run),
        BufferEdit::NewLine { .. } => "\n".to_string(),
        BufferEdit::DeleteLast { .. } => ERASE_LAST.to_string(),
        BufferEdit::Clear => CLEAR_SCREEN.to_string(),
    }
}

pub fn render_run(run: &StyledRun) -> String {
    paint(&run.text, run.style)
}

/// Redraw a whole scrollback, used when focus moves to another session.
pub fn render_lines(lines: &[Line]) -> String {
    let mut out = String::from(CLEAR_SCREEN);
    for (i, line) in lines.iter().enumerate() {
        if i > 0 {
            out.push('\n');
        }
        for run in line.runs() {
            out.push_str(&render_run(run));
        }
    }
    out
}

/// `[name] State: message`, with the state in its indicator color.
pub fn render_status(name: &str, status: &SessionStatus) -> String {
    let state = paint(
        &format!("{:?}", status.state),
        Style::fg(status.indicator()),
    );
    format!("[{name}] {state}: {}", status.message)
}

fn paint(text: &str, style: Style) -> String {
    match style.color() {
        None => text.to_string(),
        Some(color) => format!("{}{text}{RESET}", fg_sequence(color)),
    }
}

/// 24-bit foreground SGR for a palette color.
fn fg_sequence(color: Color) -> String {
    let rgb = color.rgb();
    format!("\x1b[38;2;{};{};{}m", rgb.r, rgb.g, rgb.b)
}
