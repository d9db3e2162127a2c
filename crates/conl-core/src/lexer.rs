//! Line tokenizer for CONL.
//!
//! CONL is line-oriented: each line is at most an indent, a key, an
//! `=` separator, a value, and a trailing comment. The tokenizer works
//! on one line at a time and reports byte spans into that line, which
//! the LSP layer needs for diagnostics and cursor classification.

/// The kind of a [`Token`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    /// The key part of a `key = value` line.
    MapKey,
    /// A scalar value (after `=`, or the whole line in a list item).
    Scalar,
    /// The bare `=` of a list item line.
    ListItem,
    /// A `;` comment running to the end of the line.
    Comment,
}

/// One token within a single line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token<'a> {
    pub kind: TokenKind,
    pub text: &'a str,
    /// Byte offset of the token's first byte within the line.
    pub start: usize,
    /// Byte offset one past the token's last byte.
    pub end: usize,
}

/// The number of leading space/tab bytes on a line.
pub fn indent_width(line: &str) -> usize {
    line.bytes().take_while(|b| *b == b' ' || *b == b'\t').count()
}

/// Tokenize a single line of CONL.
///
/// Quoted literals (`"..."` with backslash escapes) are opaque: an `=`
/// or `;` inside one neither separates key from value nor starts a
/// comment. The separator itself is not reported as a token except on
/// list-item lines, where the leading `=` is a [`TokenKind::ListItem`].
pub fn tokens(line: &str) -> Vec<Token<'_>> {
    let mut out = Vec::new();
    let indent = indent_width(line);
    let rest = &line[indent..];

    if rest.is_empty() {
        return out;
    }
    if rest.starts_with(';') {
        out.push(Token {
            kind: TokenKind::Comment,
            text: &line[indent..],
            start: indent,
            end: line.len(),
        });
        return out;
    }

    if rest.starts_with('=') {
        // List item: `= value`.
        out.push(Token {
            kind: TokenKind::ListItem,
            text: "=",
            start: indent,
            end: indent + 1,
        });
        push_value(line, indent + 1, &mut out);
        return out;
    }

    match find_unquoted(rest, '=') {
        Some(eq) => {
            let key_end = indent + trimmed_end(&rest[..eq]);
            if key_end > indent {
                out.push(Token {
                    kind: TokenKind::MapKey,
                    text: &line[indent..key_end],
                    start: indent,
                    end: key_end,
                });
            }
            push_value(line, indent + eq + 1, &mut out);
        }
        None => {
            // Key-only line; a trailing comment may still follow.
            match find_unquoted(rest, ';') {
                Some(semi) => {
                    let key_end = indent + trimmed_end(&rest[..semi]);
                    if key_end > indent {
                        out.push(Token {
                            kind: TokenKind::MapKey,
                            text: &line[indent..key_end],
                            start: indent,
                            end: key_end,
                        });
                    }
                    out.push(Token {
                        kind: TokenKind::Comment,
                        text: &line[indent + semi..],
                        start: indent + semi,
                        end: line.len(),
                    });
                }
                None => {
                    let key_end = indent + trimmed_end(rest);
                    out.push(Token {
                        kind: TokenKind::MapKey,
                        text: &line[indent..key_end],
                        start: indent,
                        end: key_end,
                    });
                }
            }
        }
    }
    out
}

/// Tokenize the value region starting at `from` (just past `=`).
fn push_value<'a>(line: &'a str, from: usize, out: &mut Vec<Token<'a>>) {
    let region = &line[from..];
    let leading = indent_width(region);
    let rest = &region[leading..];
    if rest.is_empty() {
        return;
    }
    if rest.starts_with(';') {
        out.push(Token {
            kind: TokenKind::Comment,
            text: &line[from + leading..],
            start: from + leading,
            end: line.len(),
        });
        return;
    }
    let (scalar_end, comment_at) = match find_unquoted(rest, ';') {
        Some(semi) => (trimmed_end(&rest[..semi]), Some(semi)),
        None => (trimmed_end(rest), None),
    };
    let start = from + leading;
    if scalar_end > 0 {
        out.push(Token {
            kind: TokenKind::Scalar,
            text: &line[start..start + scalar_end],
            start,
            end: start + scalar_end,
        });
    }
    if let Some(semi) = comment_at {
        out.push(Token {
            kind: TokenKind::Comment,
            text: &line[start + semi..],
            start: start + semi,
            end: line.len(),
        });
    }
}

/// Byte index of the first occurrence of `sep` outside quoted
/// literals.
pub fn find_unquoted(s: &str, sep: char) -> Option<usize> {
    let mut in_quote = false;
    let mut escaped = false;
    for (ix, c) in s.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' if in_quote => escaped = true,
            '"' => in_quote = !in_quote,
            c if c == sep && !in_quote => return Some(ix),
            _ => {}
        }
    }
    None
}

/// Length of `s` with trailing whitespace removed.
fn trimmed_end(s: &str) -> usize {
    s.trim_end().len()
}
