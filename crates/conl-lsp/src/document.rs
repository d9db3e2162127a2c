//! Open text documents and position translation.
//!
//! Protocol positions are (line, UTF-16 code unit) pairs; the engine
//! works in byte offsets. Translation is forgiving: a column past the
//! end of a line clamps to the newline, a column landing inside a
//! surrogate pair steps back one unit, and an offset past the end of
//! content clamps to the end. Each inconsistency logs at WARN; none is
//! fatal.

use std::sync::OnceLock;

use regex::Regex;
use tracing::warn;

use crate::protocol::{DocumentUri, Position, Range, TextDocumentContentChangeEvent};

fn newline_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\r\n?").expect("static pattern"))
}

/// Normalize line endings to bare `\n`.
pub fn normalize(text: &str) -> String {
    newline_re().replace_all(text, "\n").into_owned()
}

/// An open document. Edits derive a new value rather than mutating in
/// place, so validation tasks hold a consistent snapshot.
#[derive(Debug, Clone)]
pub struct TextDocument {
    pub uri: DocumentUri,
    pub version: i32,
    pub language: String,
    pub content: String,
}

impl TextDocument {
    pub fn new(uri: DocumentUri, language: String, version: i32, text: &str) -> TextDocument {
        TextDocument {
            uri,
            version,
            language,
            content: normalize(text),
        }
    }

    /// Apply one change event. A change without a range replaces the
    /// whole content.
    pub fn apply_change(&mut self, change: &TextDocumentContentChangeEvent) {
        let text = normalize(&change.text);
        match change.range {
            None => self.content = text,
            Some(Range { start, end }) => {
                let start = self.resolve(start);
                let end = self.resolve(end).max(start);
                self.content.replace_range(start..end, &text);
            }
        }
    }

    /// Byte offset of a protocol position within `content`.
    pub fn resolve(&self, position: Position) -> usize {
        let mut line = position.line;
        let mut character = position.character;
        for (ix, c) in self.content.char_indices() {
            if line == 0 {
                if character == 0 {
                    return ix;
                }
                if c == '\n' {
                    warn!(uri = %self.uri, ?position, "position past end of line");
                    return ix;
                }
                let mut width = c.len_utf16() as u32;
                if character == 1 && width == 2 {
                    warn!(uri = %self.uri, ?position, "position splits a surrogate pair");
                    width = 1;
                }
                character -= width.min(character);
            } else if c == '\n' {
                line -= 1;
            }
        }
        if line > 0 || character > 0 {
            warn!(uri = %self.uri, ?position, "position past end of content");
        }
        self.content.len()
    }

    /// Protocol position of a byte offset within `content`.
    pub fn unresolve(&self, offset: usize) -> Position {
        let mut line = 0;
        let mut character = 0;
        for c in self.content[..offset.min(self.content.len())].chars() {
            if c == '\n' {
                line += 1;
                character = 0;
            } else {
                character += c.len_utf16() as u32;
            }
        }
        Position { line, character }
    }

    /// The document's lines. Unlike `str::lines`, content ending in a
    /// newline has a final empty line, which is where the cursor sits
    /// when the user starts typing a new entry.
    pub fn lines(&self) -> impl Iterator<Item = &str> {
        self.content.split('\n')
    }

    /// The line addressed by a zero-based line number.
    pub fn line(&self, lno: u32) -> Option<&str> {
        self.lines().nth(lno as usize)
    }

    /// Byte offset of the start of a zero-based line.
    pub fn line_start(&self, lno: u32) -> usize {
        let mut offset = 0;
        let mut remaining = lno;
        for c in self.content.chars() {
            if remaining == 0 {
                break;
            }
            if c == '\n' {
                remaining -= 1;
            }
            offset += c.len_utf8();
        }
        offset
    }
}

/// Byte offset within `line` of a UTF-16 column, clamped to the end.
pub fn column_to_byte(line: &str, character: u32) -> usize {
    let mut remaining = character;
    for (ix, c) in line.char_indices() {
        if remaining == 0 {
            return ix;
        }
        let width = c.len_utf16() as u32;
        remaining -= width.min(remaining);
    }
    line.len()
}
