//! # conl-core
//!
//! Tokenizer and schema validation engine for CONL, a small
//! indentation-based configuration language.
//!
//! A CONL document is a sequence of `key = value` lines, with `;`
//! comments and `"..."` quoted literals. A document may declare a
//! schema with a top-level `schema = <reference>` entry; the schema is
//! itself a CONL document describing the allowed keys and values.
//!
//! The entry point is [`validate`], which checks a document against
//! its declared schema (loaded through a caller-supplied resolver) and
//! answers per-line completion and documentation queries.

pub mod lexer;
pub mod schema;
pub mod validate;

pub use lexer::{find_unquoted, indent_width, tokens, Token, TokenKind};
pub use schema::{Schema, SchemaError, Suggestion};
pub use validate::{validate, SchemaResolver, ValidationError, ValidationResult};
