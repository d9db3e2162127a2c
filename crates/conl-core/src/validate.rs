//! Document validation against a declared schema.
//!
//! A document opts in to validation with a top-level `schema = <ref>`
//! entry. The reference is opaque to this crate; the caller supplies a
//! [`SchemaResolver`] that turns it into a [`Schema`] (reading a file,
//! fetching a URL, or consulting another open document).

use std::collections::HashMap;
use std::sync::Arc;

use crate::lexer::{indent_width, tokens, Token, TokenKind};
use crate::schema::{unquote, Schema, Suggestion, ValueRule};

/// Turns a schema reference into a schema.
pub trait SchemaResolver {
    fn resolve(&mut self, reference: &str) -> anyhow::Result<Arc<Schema>>;
}

impl<F> SchemaResolver for F
where
    F: FnMut(&str) -> anyhow::Result<Arc<Schema>>,
{
    fn resolve(&mut self, reference: &str) -> anyhow::Result<Arc<Schema>> {
        self(reference)
    }
}

/// One diagnostic. `start..end` is a byte span within line `lno`
/// (1-based).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub lno: usize,
    pub start: usize,
    pub end: usize,
    pub message: String,
}

/// The outcome of [`validate`]: diagnostics plus enough structure to
/// answer per-line completion and documentation queries.
pub struct ValidationResult {
    schema: Arc<Schema>,
    /// 1-based line number of a top-level key line -> key name.
    line_keys: HashMap<usize, String>,
    /// 1-based line number -> that line's scalar value, unquoted.
    line_values: HashMap<usize, String>,
    errors: Vec<ValidationError>,
}

/// Validate `content` against its declared schema.
///
/// A resolver failure is reported as a single diagnostic on the
/// `schema =` line rather than an error; the rest of the document is
/// then checked against the permissive schema.
pub fn validate<R: SchemaResolver>(content: &str, resolver: &mut R) -> ValidationResult {
    let mut errors = Vec::new();
    let mut line_keys = HashMap::new();
    let mut line_values = HashMap::new();

    let reference = schema_reference(content);
    let schema = match resolver.resolve(reference.as_ref().map_or("", |(_, r)| r.as_str())) {
        Ok(schema) => schema,
        Err(err) => {
            let (lno, span) = match &reference {
                Some((lno, _)) => {
                    let line = content.lines().nth(lno - 1).unwrap_or("");
                    (*lno, value_span(line))
                }
                None => (1, (0, 0)),
            };
            errors.push(ValidationError {
                lno,
                start: span.0,
                end: span.1,
                message: format!("{err:#}"),
            });
            Arc::new(Schema::any())
        }
    };

    for (ix, line) in content.lines().enumerate() {
        let lno = ix + 1;
        if indent_width(line) > 0 {
            continue;
        }
        let toks = tokens(line);
        let Some(key_tok) = toks.iter().find(|t| t.kind == TokenKind::MapKey) else {
            continue;
        };
        let key = unquote(key_tok.text);
        line_keys.insert(lno, key.clone());
        if let Some(scalar) = toks.iter().find(|t| t.kind == TokenKind::Scalar) {
            line_values.insert(lno, unquote(scalar.text));
        }
        if key == "schema" {
            continue;
        }
        if let Some(err) = check_entry(&schema, &key, key_tok, &toks, lno) {
            errors.push(err);
        }
    }

    ValidationResult {
        schema,
        line_keys,
        line_values,
        errors,
    }
}

fn check_entry(
    schema: &Schema,
    key: &str,
    key_tok: &Token<'_>,
    toks: &[Token<'_>],
    lno: usize,
) -> Option<ValidationError> {
    if schema.accept_all {
        return None;
    }
    let Some(def) = schema.key(key) else {
        return Some(ValidationError {
            lno,
            start: key_tok.start,
            end: key_tok.end,
            message: format!("unknown key `{key}`"),
        });
    };
    let scalar = toks.iter().find(|t| t.kind == TokenKind::Scalar);
    let value = scalar.map(|t| unquote(t.text)).unwrap_or_default();
    let (start, end) = scalar
        .map(|t| (t.start, t.end))
        .unwrap_or((key_tok.start, key_tok.end));
    match &def.rule {
        ValueRule::Any => None,
        ValueRule::Pattern(re) if re.is_match(&value) => None,
        ValueRule::Pattern(re) => Some(ValidationError {
            lno,
            start,
            end,
            message: format!("`{value}` does not match `{}`", re.as_str()),
        }),
        ValueRule::OneOf(items) if items.iter().any(|i| i.value == value) => None,
        ValueRule::OneOf(_) => Some(ValidationError {
            lno,
            start,
            end,
            message: format!("`{value}` is not a permitted value for `{key}`"),
        }),
    }
}

/// The first top-level `schema = <ref>` entry, as (1-based lno, ref).
fn schema_reference(content: &str) -> Option<(usize, String)> {
    for (ix, line) in content.lines().enumerate() {
        if indent_width(line) > 0 {
            continue;
        }
        let toks = tokens(line);
        let Some(key) = toks.iter().find(|t| t.kind == TokenKind::MapKey) else {
            continue;
        };
        if unquote(key.text) != "schema" {
            continue;
        }
        let value = toks
            .iter()
            .find(|t| t.kind == TokenKind::Scalar)
            .map(|t| unquote(t.text))
            .unwrap_or_default();
        return Some((ix + 1, value));
    }
    None
}

/// The byte span of the value on a line, falling back to the whole
/// line when there is none.
fn value_span(line: &str) -> (usize, usize) {
    let toks = tokens(line);
    toks.iter()
        .find(|t| t.kind == TokenKind::Scalar)
        .map(|t| (t.start, t.end))
        .unwrap_or((indent_width(line), line.len()))
}

impl ValidationResult {
    pub fn errors(&self) -> &[ValidationError] {
        &self.errors
    }

    /// Keys that may be introduced by a line whose parent is line
    /// `parent_lno` (0 for a top-level line). Schemas are flat, so
    /// only top-level lines get suggestions.
    pub fn suggested_keys(&self, parent_lno: usize) -> Vec<Suggestion> {
        if parent_lno != 0 {
            return Vec::new();
        }
        self.schema
            .keys
            .iter()
            .map(|def| Suggestion {
                value: def.name.clone(),
                docs: def.docs.clone(),
            })
            .collect()
    }

    /// Permitted values for the key introduced on line `lno`
    /// (1-based). Empty unless the key enumerates its values.
    pub fn suggested_values(&self, lno: usize) -> Vec<Suggestion> {
        let Some(def) = self.line_keys.get(&lno).and_then(|k| self.schema.key(k)) else {
            return Vec::new();
        };
        match &def.rule {
            ValueRule::OneOf(items) => items.clone(),
            _ => Vec::new(),
        }
    }

    /// Documentation for the key introduced on line `lno`, if any.
    pub fn docs_for_key(&self, lno: usize) -> Option<&str> {
        let def = self.line_keys.get(&lno).and_then(|k| self.schema.key(k))?;
        if def.docs.is_empty() {
            None
        } else {
            Some(&def.docs)
        }
    }

    /// Documentation for the value on line `lno`, if the schema
    /// enumerates it.
    pub fn docs_for_value(&self, lno: usize) -> Option<&str> {
        let def = self.line_keys.get(&lno).and_then(|k| self.schema.key(k))?;
        let ValueRule::OneOf(items) = &def.rule else {
            return None;
        };
        let value = self.line_values.get(&lno)?;
        let item = items.iter().find(|i| &i.value == value)?;
        if item.docs.is_empty() {
            None
        } else {
            Some(&item.docs)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixed(schema: Schema) -> impl FnMut(&str) -> anyhow::Result<Arc<Schema>> {
        let schema = Arc::new(schema);
        move |_: &str| Ok(schema.clone())
    }

    fn sample_schema() -> Schema {
        Schema::parse(
            "name = .+ ; The name\nkind ; The kind\n  = binary ; Run it\n  = library ; Link it\n",
        )
        .unwrap()
    }

    #[test]
    fn test_valid_document() {
        let result = validate(
            "schema = ./x.conl\nname = apple\nkind = binary\n",
            &mut fixed(sample_schema()),
        );
        assert!(result.errors().is_empty());
    }

    #[test]
    fn test_unknown_key() {
        let result = validate("schema = ./x.conl\ncolor = red\n", &mut fixed(sample_schema()));
        assert_eq!(result.errors().len(), 1);
        let err = &result.errors()[0];
        assert_eq!(err.lno, 2);
        assert_eq!((err.start, err.end), (0, 5));
        assert_eq!(err.message, "unknown key `color`");
    }

    #[test]
    fn test_pattern_mismatch() {
        let result = validate("schema = x\nname =\n", &mut fixed(sample_schema()));
        assert_eq!(result.errors().len(), 1);
        assert!(result.errors()[0].message.contains("does not match"));
    }

    #[test]
    fn test_value_not_in_enumeration() {
        let result = validate("schema = x\nkind = shared\n", &mut fixed(sample_schema()));
        let err = &result.errors()[0];
        assert_eq!(err.lno, 2);
        assert_eq!((err.start, err.end), (7, 13));
        assert_eq!(err.message, "`shared` is not a permitted value for `kind`");
    }

    #[test]
    fn test_no_schema_line_uses_empty_reference() {
        let mut seen = None;
        let result = validate("name = apple\n", &mut |reference: &str| {
            seen = Some(reference.to_string());
            Ok(Arc::new(Schema::any()))
        });
        assert_eq!(seen.as_deref(), Some(""));
        assert!(result.errors().is_empty());
    }

    #[test]
    fn test_resolver_failure_is_a_diagnostic() {
        let result = validate("schema = ./missing.conl\nname = apple\n", &mut |_: &str| {
            Err(anyhow::anyhow!("no such file"))
        });
        assert_eq!(result.errors().len(), 1);
        let err = &result.errors()[0];
        assert_eq!(err.lno, 1);
        assert_eq!((err.start, err.end), (9, 23));
        assert!(err.message.contains("no such file"));
    }

    #[test]
    fn test_indented_lines_are_not_checked() {
        let result = validate("schema = x\nkind = binary\n  note = deep\n", &mut fixed(sample_schema()));
        assert!(result.errors().is_empty());
    }

    #[test]
    fn test_suggested_keys() {
        let result = validate("schema = x\n", &mut fixed(sample_schema()));
        let keys: Vec<_> = result
            .suggested_keys(0)
            .into_iter()
            .map(|s| s.value)
            .collect();
        assert_eq!(keys, vec!["name", "kind"]);
        assert!(result.suggested_keys(1).is_empty());
    }

    #[test]
    fn test_suggested_values() {
        let result = validate("schema = x\nkind = \n", &mut fixed(sample_schema()));
        let values: Vec<_> = result
            .suggested_values(2)
            .into_iter()
            .map(|s| s.value)
            .collect();
        assert_eq!(values, vec!["binary", "library"]);
        assert!(result.suggested_values(1).is_empty());
    }

    #[test]
    fn test_docs_lookups() {
        let result = validate("schema = x\nkind = binary\n", &mut fixed(sample_schema()));
        assert_eq!(result.docs_for_key(2), Some("The kind"));
        assert_eq!(result.docs_for_value(2), Some("Run it"));
        assert_eq!(result.docs_for_key(3), None);
    }

    #[test]
    fn test_docs_for_unknown_value() {
        let result = validate("schema = x\nkind = shared\n", &mut fixed(sample_schema()));
        assert_eq!(result.docs_for_value(2), None);
    }

    #[test]
    fn test_accept_all_schema() {
        let result = validate("anything = goes\n", &mut fixed(Schema::any()));
        assert!(result.errors().is_empty());
        assert!(result.suggested_keys(0).is_empty());
    }
}
