//! shellmux-vt: styled scrollback model and ANSI decoding for shellmux.
//!
//! This crate turns the raw byte stream of a shell into an editable list of
//! styled lines. It tracks a single foreground color, treats backspace as an
//! edit of the tail of the buffer, and swallows every escape sequence that is
//! not a color change. It is a scrollback terminal, not a cursor-addressable
//! grid.
//!
//! # Architecture
//!
//! - [`Style`] / [`Color`] — The foreground color carried by each text run.
//! - [`OutputBuffer`] — Lines of [`StyledRun`]s, edited only at the tail.
//! - [`AnsiDecoder`] — Feeds shell output through a VT parser into the buffer.

pub mod buffer;
pub mod decoder;
pub mod style;

pub use buffer::{BufferEdit, Line, OutputBuffer, StyledRun};
pub use decoder::AnsiDecoder;
pub use style::{apply_sgr, Color, Rgb, Style};
