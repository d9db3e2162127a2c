//! Schema documents.
//!
//! A schema is itself a CONL document. Each top-level key names an
//! allowed document key. The value is a regular expression the
//! document value must match, or an indented list of permitted
//! literals:
//!
//! ```text
//! name = .+ ; The package name
//! kind          ; The package kind
//!   = binary    ; An executable
//!   = library   ; A linkable library
//! ```
//!
//! Trailing comments become the documentation shown on hover.

use regex::Regex;
use thiserror::Error;

use crate::lexer::{indent_width, tokens, TokenKind};

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("line {lno}: invalid pattern `{pattern}`: {source}")]
    InvalidPattern {
        lno: usize,
        pattern: String,
        source: regex::Error,
    },
    #[error("line {lno}: list item without a preceding key")]
    OrphanItem { lno: usize },
}

/// A permitted literal value, with its documentation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Suggestion {
    pub value: String,
    pub docs: String,
}

/// How a key's value is checked.
#[derive(Debug, Clone)]
pub(crate) enum ValueRule {
    /// Anything goes (no pattern, no enumeration).
    Any,
    /// The value must match the anchored pattern.
    Pattern(Regex),
    /// The value must be one of the listed literals.
    OneOf(Vec<Suggestion>),
}

#[derive(Debug, Clone)]
pub(crate) struct KeyDef {
    pub name: String,
    pub docs: String,
    pub rule: ValueRule,
}

/// A parsed schema.
#[derive(Debug, Clone)]
pub struct Schema {
    pub(crate) keys: Vec<KeyDef>,
    /// Set for the permissive schema used when no reference is given.
    pub(crate) accept_all: bool,
}

impl Schema {
    /// The schema that accepts every document.
    pub fn any() -> Schema {
        Schema {
            keys: Vec::new(),
            accept_all: true,
        }
    }

    /// Parse a schema from its CONL source.
    pub fn parse(content: &str) -> Result<Schema, SchemaError> {
        let mut keys: Vec<KeyDef> = Vec::new();
        for (ix, line) in content.lines().enumerate() {
            let lno = ix + 1;
            let toks = tokens(line);
            if toks.is_empty() || toks[0].kind == TokenKind::Comment {
                continue;
            }
            let indented = indent_width(line) > 0;
            if toks[0].kind == TokenKind::ListItem {
                let Some(last) = keys.last_mut() else {
                    return Err(SchemaError::OrphanItem { lno });
                };
                if !indented {
                    return Err(SchemaError::OrphanItem { lno });
                }
                let value = toks
                    .iter()
                    .find(|t| t.kind == TokenKind::Scalar)
                    .map(|t| unquote(t.text))
                    .unwrap_or_default();
                let docs = comment_text(&toks);
                match &mut last.rule {
                    ValueRule::OneOf(items) => items.push(Suggestion { value, docs }),
                    rule => *rule = ValueRule::OneOf(vec![Suggestion { value, docs }]),
                }
                continue;
            }
            if indented {
                // Nested maps are not supported; skip the subtree.
                continue;
            }
            let name = toks
                .iter()
                .find(|t| t.kind == TokenKind::MapKey)
                .map(|t| unquote(t.text))
                .unwrap_or_default();
            if name.is_empty() {
                continue;
            }
            let docs = comment_text(&toks);
            let rule = match toks.iter().find(|t| t.kind == TokenKind::Scalar) {
                Some(value) => {
                    let pattern = unquote(value.text);
                    let anchored = format!("^(?:{pattern})$");
                    let re = Regex::new(&anchored).map_err(|source| {
                        SchemaError::InvalidPattern {
                            lno,
                            pattern,
                            source,
                        }
                    })?;
                    ValueRule::Pattern(re)
                }
                None => ValueRule::Any,
            };
            keys.push(KeyDef { name, docs, rule });
        }
        Ok(Schema {
            keys,
            accept_all: false,
        })
    }

    /// True for the permissive schema from [`Schema::any`].
    pub fn is_any(&self) -> bool {
        self.accept_all
    }

    /// The keys this schema defines, in declaration order.
    pub fn key_names(&self) -> impl Iterator<Item = &str> {
        self.keys.iter().map(|k| k.name.as_str())
    }

    pub(crate) fn key(&self, name: &str) -> Option<&KeyDef> {
        self.keys.iter().find(|k| k.name == name)
    }
}

/// The text of the trailing comment, without the `;` and surrounding
/// whitespace.
pub(crate) fn comment_text(toks: &[crate::lexer::Token<'_>]) -> String {
    toks.iter()
        .find(|t| t.kind == TokenKind::Comment)
        .map(|t| t.text.trim_start_matches(';').trim().to_string())
        .unwrap_or_default()
}

/// Strip one level of quoting, resolving backslash escapes.
pub(crate) fn unquote(s: &str) -> String {
    let Some(inner) = s.strip_prefix('"').and_then(|s| s.strip_suffix('"')) else {
        return s.to_string();
    };
    let mut out = String::with_capacity(inner.len());
    let mut escaped = false;
    for c in inner.chars() {
        if escaped {
            out.push(c);
            escaped = false;
        } else if c == '\\' {
            escaped = true;
        } else {
            out.push(c);
        }
    }
    out
}
