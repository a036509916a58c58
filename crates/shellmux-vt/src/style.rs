/// RGB color value.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Rgb {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Rgb {
    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }
}

/// One of the 16 ANSI palette colors, in palette order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Color {
    Black,
    Red,
    Green,
    Yellow,
    Blue,
    Magenta,
    Cyan,
    White,
    BrightBlack,
    BrightRed,
    BrightGreen,
    BrightYellow,
    BrightBlue,
    BrightMagenta,
    BrightCyan,
    BrightWhite,
}

/// Standard xterm palette, indexed by `Color as usize`.
const PALETTE: [Rgb; 16] = [
    Rgb::new(0, 0, 0),       // Black
    Rgb::new(205, 0, 0),     // Red
    Rgb::new(0, 205, 0),     // Green
    Rgb::new(205, 205, 0),   // Yellow
    Rgb::new(0, 0, 238),     // Blue
    Rgb::new(205, 0, 205),   // Magenta
    Rgb::new(0, 205, 205),   // Cyan
    Rgb::new(229, 229, 229), // White
    Rgb::new(127, 127, 127), // Bright Black
    Rgb::new(255, 0, 0),     // Bright Red
    Rgb::new(0, 255, 0),     // Bright Green
    Rgb::new(255, 255, 0),   // Bright Yellow
    Rgb::new(92, 92, 255),   // Bright Blue
    Rgb::new(255, 0, 255),   // Bright Magenta
    Rgb::new(0, 255, 255),   // Bright Cyan
    Rgb::new(255, 255, 255), // Bright White
];

const COLORS: [Color; 16] = [
    Color::Black,
    Color::Red,
    Color::Green,
    Color::Yellow,
    Color::Blue,
    Color::Magenta,
    Color::Cyan,
    Color::White,
    Color::BrightBlack,
    Color::BrightRed,
    Color::BrightGreen,
    Color::BrightYellow,
    Color::BrightBlue,
    Color::BrightMagenta,
    Color::BrightCyan,
    Color::BrightWhite,
];

impl Color {
    /// Look up a palette entry by its ANSI index (0..16).
    pub fn from_index(idx: u16) -> Option<Self> {
        COLORS.get(idx as usize).copied()
    }

    /// Resolve to the fixed xterm palette.
    pub fn rgb(self) -> Rgb {
        PALETTE[self as usize]
    }
}

/// Foreground style of a text run.
///
/// `None` means "inherit the renderer's default"; anything else is an
/// explicit palette color. Bold, underline and background are not modeled.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Style(pub Option<Color>);

impl Style {
    pub const DEFAULT: Style = Style(None);

    pub const fn fg(color: Color) -> Self {
        Style(Some(color))
    }

    pub fn color(&self) -> Option<Color> {
        self.0
    }

    pub fn is_default(&self) -> bool {
        self.0.is_none()
    }
}

/// Fold one SGR parameter list into `current`.
///
/// Codes are applied left to right and the last recognized one wins; codes
/// that do not map to a color leave the style untouched. An empty list is a
/// reset, same as `ESC[m`.
pub fn apply_sgr(current: Style, codes: &[u16]) -> Style {
    if codes.is_empty() {
        return Style::DEFAULT;
    }

    let mut style = current;
    let mut i = 0;
    while i < codes.len() {
        let code = codes[i];
        match code {
            0 | 39 => style = Style::DEFAULT,
            // No weight is tracked; bold approximates to intense white.
            1 => style = Style::fg(Color::BrightWhite),
            30..=37 => {
                if let Some(color) = Color::from_index(code - 30) {
                    style = Style::fg(color);
                }
            }
            90..=97 => {
                if let Some(color) = Color::from_index(code - 90 + 8) {
                    style = Style::fg(color);
                }
            }
            // Extended colors: swallow their arguments so `38;5;32` is not
            // read as a bare `32`.
            38 | 48 => match codes.get(i + 1) {
                Some(5) => {
                    if code == 38 {
                        if let Some(color) = codes.get(i + 2).and_then(|&n| Color::from_index(n)) {
                            style = Style::fg(color);
                        }
                    }
                    i += 2;
                }
                Some(2) => i += 4,
                _ => {}
            },
            _ => {}
        }
        i += 1;
    }
    style
}
