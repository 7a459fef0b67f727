//! In-memory terminal screen fed from the shell channel.
//!
//! `TerminalScreen` wraps a `vt100::Parser` and adds what the embedder
//! needs for incremental repaint: a dirty-row set cleared on fetch,
//! page-up/page-down over the scrollback, and plain-data `Cell` snapshots
//! so readers never touch emulator internals while the receive worker is
//! feeding it.

use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, BTreeSet};
use std::hash::{Hash, Hasher};

use serde::Serialize;

/// A cell color. `name()` yields the conventional color names the rendering
/// layer maps to its palette.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Color {
    Default,
    Indexed(u8),
    Rgb(u8, u8, u8),
}

impl Default for Color {
    fn default() -> Self {
        Self::Default
    }
}

const BASE_COLOR_NAMES: [&str; 16] = [
    "black",
    "red",
    "green",
    "yellow",
    "blue",
    "magenta",
    "cyan",
    "white",
    "brightblack",
    "brightred",
    "brightgreen",
    "brightyellow",
    "brightblue",
    "brightmagenta",
    "brightcyan",
    "brightwhite",
];

impl Color {
    pub fn name(&self) -> String {
        match self {
            Self::Default => "default".to_string(),
            Self::Indexed(i) if (*i as usize) < BASE_COLOR_NAMES.len() => {
                BASE_COLOR_NAMES[*i as usize].to_string()
            }
            Self::Indexed(i) => format!("color{i}"),
            Self::Rgb(r, g, b) => format!("#{r:02x}{g:02x}{b:02x}"),
        }
    }
}

impl From<vt100::Color> for Color {
    fn from(color: vt100::Color) -> Self {
        match color {
            vt100::Color::Default => Self::Default,
            vt100::Color::Idx(i) => Self::Indexed(i),
            vt100::Color::Rgb(r, g, b) => Self::Rgb(r, g, b),
        }
    }
}

/// Snapshot of one screen cell.
///
/// The emulator does not track blink or strikethrough; those bits are
/// carried for the rendering layer and stay false.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize)]
pub struct Cell {
    pub contents: String,
    pub fg: Color,
    pub bg: Color,
    pub bold: bool,
    pub italic: bool,
    pub underline: bool,
    pub strikethrough: bool,
    pub reverse: bool,
    pub blink: bool,
}

/// Virtual screen with scrollback, dirty tracking, and a stable cursor.
pub struct TerminalScreen {
    parser: vt100::Parser,
    history: usize,
    /// Rows the visible window is shifted back into history.
    scroll_offset: usize,
    dirty: BTreeSet<u16>,
    row_hashes: Vec<u64>,
}

impl TerminalScreen {
    pub fn new(cols: u16, rows: u16, history: usize) -> Self {
        let parser = vt100::Parser::new(rows, cols, history);
        let mut screen = Self {
            parser,
            history,
            scroll_offset: 0,
            dirty: BTreeSet::new(),
            row_hashes: Vec::new(),
        };
        screen.row_hashes = screen.hash_rows();
        screen.mark_all_dirty();
        screen
    }

    /// Consume raw bytes from the shell channel. Malformed or unknown
    /// sequences are ignored by the emulator; partial sequences are buffered
    /// across calls.
    pub fn feed(&mut self, bytes: &[u8]) {
        self.parser.process(bytes);
        self.refresh_dirty();
    }

    /// Text snapshot of the visible screen, one string per row.
    pub fn display(&self) -> Vec<String> {
        let (_, cols) = self.size();
        self.parser.screen().rows(0, cols).collect()
    }

    /// The visible screen joined with newlines.
    pub fn display_as_text(&self) -> String {
        self.display().join("\n")
    }

    /// Rows changed since the last call, as `row -> col -> Cell`, clearing
    /// the dirty set.
    pub fn changes(&mut self) -> BTreeMap<u16, BTreeMap<u16, Cell>> {
        let (_, cols) = self.size();
        let mut out = BTreeMap::new();
        for &row in &self.dirty {
            let mut cells = BTreeMap::new();
            for col in 0..cols {
                cells.insert(col, self.cell_at(row, col));
            }
            out.insert(row, cells);
        }
        self.dirty.clear();
        out
    }

    /// Cursor position as `(row, col)`, always within the screen bounds.
    pub fn cursor(&self) -> (u16, u16) {
        self.parser.screen().cursor_position()
    }

    /// Screen dimensions as `(rows, cols)`.
    pub fn size(&self) -> (u16, u16) {
        self.parser.screen().size()
    }

    /// Resize preserving content; the cursor is clamped and every row
    /// becomes dirty.
    pub fn resize(&mut self, rows: u16, cols: u16) {
        self.parser.set_size(rows, cols);
        self.row_hashes = self.hash_rows();
        self.mark_all_dirty();
    }

    /// Shift the visible window one page back into history. The emulator
    /// clamps to the rows it actually retains.
    pub fn prev_page(&mut self) {
        let (rows, _) = self.size();
        self.scroll_offset = (self.scroll_offset + rows as usize).min(self.history);
        self.parser.set_scrollback(self.scroll_offset);
        self.row_hashes = self.hash_rows();
        self.mark_all_dirty();
    }

    /// Shift the visible window one page toward the present.
    pub fn next_page(&mut self) {
        let (rows, _) = self.size();
        self.scroll_offset = self.scroll_offset.saturating_sub(rows as usize);
        self.parser.set_scrollback(self.scroll_offset);
        self.row_hashes = self.hash_rows();
        self.mark_all_dirty();
    }

    fn cell_at(&self, row: u16, col: u16) -> Cell {
        match self.parser.screen().cell(row, col) {
            Some(cell) => Cell {
                contents: cell.contents(),
                fg: cell.fgcolor().into(),
                bg: cell.bgcolor().into(),
                bold: cell.bold(),
                italic: cell.italic(),
                underline: cell.underline(),
                strikethrough: false,
                reverse: cell.inverse(),
                blink: false,
            },
            None => Cell::default(),
        }
    }

    fn hash_rows(&self) -> Vec<u64> {
        let (rows, cols) = self.size();
        (0..rows)
            .map(|row| {
                let mut hasher = DefaultHasher::new();
                for col in 0..cols {
                    self.cell_at(row, col).hash(&mut hasher);
                }
                hasher.finish()
            })
            .collect()
    }

    fn refresh_dirty(&mut self) {
        let hashes = self.hash_rows();
        for (row, hash) in hashes.iter().enumerate() {
            if self.row_hashes.get(row) != Some(hash) {
                self.dirty.insert(row as u16);
            }
        }
        self.row_hashes = hashes;
    }

    fn mark_all_dirty(&mut self) {
        let (rows, _) = self.size();
        self.dirty = (0..rows).collect();
    }
}

impl std::fmt::Debug for TerminalScreen {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (rows, cols) = self.size();
        f.debug_struct("TerminalScreen")
            .field("rows", &rows)
            .field("cols", &cols)
            .field("dirty", &self.dirty.len())
            .finish()
    }
}
