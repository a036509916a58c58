use vte::{Params, Parser, Perform};

use crate::buffer::OutputBuffer;
use crate::style::{apply_sgr, Style};

const BACKSPACE: u8 = 0x08;

/// Stateful decoder from raw shell output to buffer edits.
///
/// Wraps a VTE parser. Printable text is appended to the buffer in the
/// current style, `ESC [ ... m` updates that style, and backspace deletes the
/// last character of the buffer. All other control sequences (bracketed paste
/// toggles, erase-line, cursor movement, window titles) are swallowed.
///
/// Both the style and the parser state live as long as the decoder, so a
/// sequence or UTF-8 character split across two chunks is completed by the
/// second one.
pub struct AnsiDecoder {
    parser: Parser,
    style: Style,
}

impl AnsiDecoder {
    pub fn new() -> Self {
        Self {
            parser: Parser::new(),
            style: Style::DEFAULT,
        }
    }

    /// The style that the next printed text will carry.
    pub fn style(&self) -> Style {
        self.style
    }

    /// Decode one chunk of shell output into `buffer`.
    pub fn feed(&mut self, bytes: &[u8], buffer: &mut OutputBuffer) {
        let mut performer = BufferPerformer {
            buffer,
            style: &mut self.style,
            pending: String::new(),
        };
        self.parser.advance(&mut performer, bytes);
        performer.flush();
    }

    pub fn feed_str(&mut self, text: &str, buffer: &mut OutputBuffer) {
        self.feed(text.as_bytes(), buffer);
    }

    /// Forget the current style and any partially received sequence.
    pub fn reset(&mut self) {
        self.parser = Parser::new();
        self.style = Style::DEFAULT;
    }
}

impl Default for AnsiDecoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Performer for one `feed` call.
///
/// Text is collected into `pending` and flushed as a single run whenever the
/// style changes, a backspace arrives, or the chunk ends.
struct BufferPerformer<'a> {
    buffer: &'a mut OutputBuffer,
    style: &'a mut Style,
    pending: String,
}

impl BufferPerformer<'_> {
    fn flush(&mut self) {
        if !self.pending.is_empty() {
            self.buffer.append(&self.pending, *self.style);
            self.pending.clear();
        }
    }
}

impl Perform for BufferPerformer<'_> {
    fn print(&mut self, c: char) {
        self.pending.push(c);
    }

    fn execute(&mut self, byte: u8) {
        match byte {
            b'\n' => self.pending.push('\n'),
            b'\t' => self.pending.push('\t'),
            BACKSPACE => {
                self.flush();
                self.buffer.backspace();
            }
            // `\r` included: line breaks come from `\n` alone.
            _ => {}
        }
    }

    fn csi_dispatch(&mut self, params: &Params, intermediates: &[u8], ignore: bool, action: char) {
        if action != 'm' || !intermediates.is_empty() || ignore {
            log::trace!("ignoring CSI {intermediates:?} {action}");
            return;
        }

        self.flush();
        let codes: Vec<u16> = params.iter().flatten().copied().collect();
        *self.style = apply_sgr(*self.style, &codes);
    }
}
