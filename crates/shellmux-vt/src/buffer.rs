use crate::style::Style;

/// A contiguous span of text sharing one style.
///
/// Runs never span a line boundary and are never empty.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StyledRun {
    pub text: String,
    pub style: Style,
}

impl StyledRun {
    pub fn new(text: impl Into<String>, style: Style) -> Self {
        Self {
            text: text.into(),
            style,
        }
    }
}

/// One line of output: an ordered list of runs.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Line {
    runs: Vec<StyledRun>,
}

impl Line {
    pub fn runs(&self) -> &[StyledRun] {
        &self.runs
    }

    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }

    /// Plain text of the line with styles dropped.
    pub fn text(&self) -> String {
        self.runs.iter().map(|r| r.text.as_str()).collect()
    }

    /// Number of characters on the line.
    pub fn char_len(&self) -> usize {
        self.runs.iter().map(|r| r.text.chars().count()).sum()
    }
}

/// A single mutation of an [`OutputBuffer`], in the order it happened.
///
/// Renderers replay these to mirror the buffer without re-reading it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BufferEdit {
    /// `run` was appended to the end of line `line`.
    Append { line: usize, run: StyledRun },
    /// A new, empty line was started at index `line`.
    NewLine { line: usize },
    /// The last character of line `line` was removed.
    DeleteLast { line: usize },
    /// Everything was removed; the buffer is back to one empty line.
    Clear,
}

/// Scrollback of styled lines, edited only at its tail.
///
/// Appends and backspaces always target the last run of the last line. There
/// is no cursor addressing: the caret is pinned to [`end_position`].
///
/// [`end_position`]: OutputBuffer::end_position
#[derive(Clone, Debug)]
pub struct OutputBuffer {
    lines: Vec<Line>,
    edits: Vec<BufferEdit>,
}

impl OutputBuffer {
    /// Create a buffer holding a single empty line.
    pub fn new() -> Self {
        Self {
            lines: vec![Line::default()],
            edits: Vec::new(),
        }
    }

    /// Append `text` to the last line, starting a new line at every `\n`.
    pub fn append(&mut self, text: &str, style: Style) {
        let mut segments = text.split('\n');
        if let Some(first) = segments.next() {
            self.push_run(first, style);
        }
        for segment in segments {
            self.lines.push(Line::default());
            self.edits.push(BufferEdit::NewLine {
                line: self.lines.len() - 1,
            });
            self.push_run(segment, style);
        }
    }

    fn push_run(&mut self, text: &str, style: Style) {
        if text.is_empty() {
            return;
        }
        let line = self.lines.len() - 1;
        let run = StyledRun::new(text, style);
        self.lines[line].runs.push(run.clone());
        self.edits.push(BufferEdit::Append { line, run });
    }

    /// Delete the last character of the last line.
    ///
    /// A run emptied by the delete is removed. Deleting on an empty last line
    /// is a no-op: this never reaches back into the previous line. Returns
    /// whether anything was deleted.
    pub fn backspace(&mut self) -> bool {
        let line = self.lines.len() - 1;
        let runs = &mut self.lines[line].runs;
        let Some(run) = runs.last_mut() else {
            return false;
        };

        run.text.pop();
        if run.text.is_empty() {
            runs.pop();
        }
        self.edits.push(BufferEdit::DeleteLast { line });
        true
    }

    /// Drop all content, leaving one empty line.
    pub fn clear(&mut self) {
        self.lines.clear();
        self.lines.push(Line::default());
        self.edits.push(BufferEdit::Clear);
    }

    pub fn lines(&self) -> &[Line] {
        &self.lines
    }

    pub fn last_line(&self) -> &Line {
        // The buffer always holds at least one line.
        &self.lines[self.lines.len() - 1]
    }

    /// Plain text of the whole buffer, lines joined with `\n`.
    pub fn text(&self) -> String {
        self.lines
            .iter()
            .map(Line::text)
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// The caret position: (last line index, character column at its end).
    pub fn end_position(&self) -> (usize, usize) {
        (self.lines.len() - 1, self.last_line().char_len())
    }

    /// Drain the edits recorded since the last call.
    pub fn take_edits(&mut self) -> Vec<BufferEdit> {
        std::mem::take(&mut self.edits)
    }
}

impl Default for OutputBuffer {
    fn default() -> Self {
        Self::new()
    }
}
