//! The language session: document lifecycle, diagnostics, completion
//! and hover.
//!
//! All method handlers are registered here. Shared state sits behind a
//! `std::sync::RwLock` that is only ever held for map access, never
//! across an await; validation (which reads disk and network through
//! the schema resolver) runs on `spawn_blocking`.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use anyhow::{anyhow, Context};
use conl_core::{find_unquoted, indent_width, tokens, TokenKind, ValidationResult};
use tracing::{debug, warn};

use crate::connection::{Connection, Outbound};
use crate::document::{column_to_byte, TextDocument};
use crate::protocol::{
    CompletionItem, CompletionList, CompletionOptions, CompletionParams, Diagnostic,
    DiagnosticSeverity, DidChangeTextDocumentParams, DidCloseTextDocumentParams,
    DidOpenTextDocumentParams, DocumentUri, Hover, HoverParams, InitializeParams,
    InitializeResult, MarkupContent, Null, PublishDiagnosticsParams, Range,
    ServerCapabilities, ServerInfo, TextDocumentSyncOptions,
};
use crate::schema_cache::{Fetcher, SchemaCache};

struct State {
    open_docs: HashMap<DocumentUri, Arc<TextDocument>>,
}

pub struct Session {
    state: RwLock<State>,
    cache: SchemaCache,
    outbound: Outbound,
}

impl Session {
    pub fn new(outbound: Outbound, fetch: Fetcher) -> Arc<Session> {
        Arc::new(Session {
            state: RwLock::new(State {
                open_docs: HashMap::new(),
            }),
            cache: SchemaCache::new(fetch),
            outbound,
        })
    }

    /// Register every method this server understands.
    pub fn register(self: &Arc<Session>, conn: &mut Connection) {
        let session = self.clone();
        conn.handle_request("initialize", move |params: InitializeParams| {
            let session = session.clone();
            async move { session.initialize(params) }
        });

        conn.handle_request("shutdown", |_: Null| async move { Ok::<_, anyhow::Error>(Null) });

        let session = self.clone();
        conn.handle_notification("exit", move |_: Null| {
            let session = session.clone();
            async move { session.outbound.exit() }
        });

        conn.handle_notification("initialized", |_: serde_json::Value| async move {});

        let session = self.clone();
        conn.handle_notification(
            "textDocument/didOpen",
            move |params: DidOpenTextDocumentParams| {
                let session = session.clone();
                async move { session.did_open(params) }
            },
        );

        let session = self.clone();
        conn.handle_notification(
            "textDocument/didChange",
            move |params: DidChangeTextDocumentParams| {
                let session = session.clone();
                async move { session.did_change(params) }
            },
        );

        let session = self.clone();
        conn.handle_notification(
            "textDocument/didClose",
            move |params: DidCloseTextDocumentParams| {
                let session = session.clone();
                async move { session.did_close(params) }
            },
        );

        let session = self.clone();
        conn.handle_request("textDocument/completion", move |params: CompletionParams| {
            let session = session.clone();
            async move { session.completion(params).await }
        });

        let session = self.clone();
        conn.handle_request("textDocument/hover", move |params: HoverParams| {
            let session = session.clone();
            async move { session.hover(params).await }
        });
    }

    fn initialize(&self, params: InitializeParams) -> anyhow::Result<InitializeResult> {
        debug!(process_id = ?params.process_id, "initialize");
        Ok(InitializeResult {
            capabilities: ServerCapabilities {
                position_encoding: "utf-16".to_string(),
                text_document_sync: TextDocumentSyncOptions {
                    open_close: true,
                    change: 2,
                },
                completion_provider: CompletionOptions {
                    trigger_characters: vec!["=".to_string(), " ".to_string()],
                },
                hover_provider: true,
            },
            server_info: ServerInfo {
                name: "conl-lsp".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
        })
    }

    fn did_open(self: &Arc<Session>, params: DidOpenTextDocumentParams) {
        let item = params.text_document;
        let doc = Arc::new(TextDocument::new(
            item.uri.clone(),
            item.language_id,
            item.version,
            &item.text,
        ));
        self.state
            .write()
            .unwrap()
            .open_docs
            .insert(item.uri.clone(), doc);
        self.refresh(item.uri);
    }

    fn did_change(self: &Arc<Session>, params: DidChangeTextDocumentParams) {
        let uri = params.text_document.uri;
        {
            let mut state = self.state.write().unwrap();
            let Some(doc) = state.open_docs.get(&uri) else {
                debug!(%uri, "change for unopened document");
                return;
            };
            let mut next = doc.as_ref().clone();
            for change in &params.content_changes {
                next.apply_change(change);
            }
            next.version = params.text_document.version;
            state.open_docs.insert(uri.clone(), Arc::new(next));
        }
        // This document may be someone else's schema.
        for dependent in self.cache.dependents(&uri) {
            if dependent != uri {
                self.refresh(dependent);
            }
        }
        self.refresh(uri);
    }

    fn did_close(self: &Arc<Session>, params: DidCloseTextDocumentParams) {
        let uri = params.text_document.uri;
        let removed = self.state.write().unwrap().open_docs.remove(&uri);
        self.cache.forget(&uri);
        if let Some(doc) = removed {
            self.outbound.notify(
                "textDocument/publishDiagnostics",
                &PublishDiagnosticsParams {
                    uri,
                    version: params.text_document.version.unwrap_or(doc.version),
                    diagnostics: Vec::new(),
                },
            );
        }
    }

    async fn completion(self: &Arc<Session>, params: CompletionParams) -> anyhow::Result<CompletionList> {
        let (doc, line, cursor) = self.locate(&params)?;
        let prefix = &line[..cursor];
        let lno = params.position.line as usize + 1;
        let result = self.validation_of(doc.clone()).await?;

        // Inside a comment nothing completes.
        if find_unquoted(prefix, ';').is_some() {
            return Ok(empty_completions());
        }

        // Only text left of the cursor counts; anything after it is
        // what the completion would replace.
        let toks = tokens(prefix);
        let in_value = find_unquoted(prefix, '=').is_some();
        let items = if in_value {
            let has_value = toks.iter().any(|t| t.kind == TokenKind::Scalar);
            if has_value && prefix.ends_with(' ') {
                return Ok(empty_completions());
            }
            let pad = prefix.trim_end().ends_with('=') && !prefix.ends_with(' ');
            result
                .suggested_values(lno)
                .into_iter()
                .map(|s| completion_item(s, pad))
                .collect()
        } else {
            let has_key = toks
                .iter()
                .any(|t| t.kind == TokenKind::MapKey || t.kind == TokenKind::ListItem);
            if has_key && prefix.ends_with(' ') {
                return Ok(empty_completions());
            }
            let parent = parent_line(&doc, params.position.line);
            result
                .suggested_keys(parent)
                .into_iter()
                .map(|s| completion_item(s, false))
                .collect()
        };
        Ok(CompletionList {
            is_incomplete: false,
            items,
        })
    }

    async fn hover(self: &Arc<Session>, params: HoverParams) -> anyhow::Result<Option<Hover>> {
        let (doc, line, cursor) = self.locate(&params)?;
        let lno = params.position.line as usize + 1;
        let result = self.validation_of(doc).await?;

        let has_value = tokens(&line).iter().any(|t| t.kind == TokenKind::Scalar);
        let in_value = find_unquoted(&line, '=').is_some_and(|ix| cursor > ix);
        let docs = if in_value && has_value {
            result.docs_for_value(lno)
        } else {
            result.docs_for_key(lno)
        };
        Ok(docs.map(|d| Hover {
            contents: MarkupContent::markdown(d),
        }))
    }

    /// Shared lookup for position-based requests: the document
    /// snapshot, the addressed line, and the cursor's byte column.
    fn locate(
        &self,
        params: &crate::protocol::TextDocumentPositionParams,
    ) -> anyhow::Result<(Arc<TextDocument>, String, usize)> {
        let uri = &params.text_document.uri;
        let doc = self
            .snapshot(uri)
            .ok_or_else(|| anyhow!("document {uri} not found"))?;
        let line = doc
            .line(params.position.line)
            .ok_or_else(|| anyhow!("invalid position"))?
            .to_string();
        let cursor = column_to_byte(&line, params.position.character);
        Ok((doc, line, cursor))
    }

    fn snapshot(&self, uri: &DocumentUri) -> Option<Arc<TextDocument>> {
        self.state.read().unwrap().open_docs.get(uri).cloned()
    }

    fn open_content(&self, uri: &DocumentUri) -> Option<String> {
        self.snapshot(uri).map(|doc| doc.content.clone())
    }

    /// Validate a snapshot on the blocking pool; the resolver does
    /// disk and network I/O.
    async fn validation_of(self: &Arc<Session>, doc: Arc<TextDocument>) -> anyhow::Result<ValidationResult> {
        let session = self.clone();
        tokio::task::spawn_blocking(move || {
            let mut resolver = |reference: &str| {
                session
                    .cache
                    .resolve(&doc.uri, reference, |uri| session.open_content(uri))
            };
            conl_core::validate(&doc.content, &mut resolver)
        })
        .await
        .context("validation task failed")
    }

    /// Recompute and publish diagnostics for a document on its own
    /// task. Failures are logged, never surfaced to the client.
    fn refresh(self: &Arc<Session>, uri: DocumentUri) {
        let session = self.clone();
        tokio::spawn(async move {
            if let Err(err) = session.publish_diagnostics(&uri).await {
                warn!(%uri, "diagnostics update failed: {err:#}");
            }
        });
    }

    async fn publish_diagnostics(self: &Arc<Session>, uri: &DocumentUri) -> anyhow::Result<()> {
        let Some(doc) = self.snapshot(uri) else {
            // Closed in the meantime.
            return Ok(());
        };
        let result = self.validation_of(doc.clone()).await?;
        let diagnostics = result
            .errors()
            .iter()
            .map(|err| {
                let line_start = doc.line_start(err.lno as u32 - 1);
                Diagnostic {
                    range: Range {
                        start: doc.unresolve(line_start + err.start),
                        end: doc.unresolve(line_start + err.end),
                    },
                    severity: DiagnosticSeverity::Error,
                    message: err.message.clone(),
                }
            })
            .collect();
        self.outbound.notify(
            "textDocument/publishDiagnostics",
            &PublishDiagnosticsParams {
                uri: doc.uri.clone(),
                version: doc.version,
                diagnostics,
            },
        );
        Ok(())
    }
}

fn empty_completions() -> CompletionList {
    CompletionList {
        is_incomplete: false,
        items: Vec::new(),
    }
}

fn completion_item(suggestion: conl_core::Suggestion, pad: bool) -> CompletionItem {
    CompletionItem {
        insert_text: pad.then(|| format!(" {}", suggestion.value)),
        documentation: (!suggestion.docs.is_empty())
            .then(|| MarkupContent::markdown(suggestion.docs)),
        label: suggestion.value,
    }
}

/// The 1-based line number of the entry this line nests under, or 0
/// for a top-level line. Blank lines, comments, and deeper-indented
/// lines are skipped on the way up.
fn parent_line(doc: &TextDocument, lno: u32) -> usize {
    let my_indent = doc.line(lno).map(indent_width).unwrap_or(0);
    let mut ix = lno;
    while ix > 0 {
        ix -= 1;
        let Some(line) = doc.line(ix) else {
            continue;
        };
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with(';') {
            continue;
        }
        if indent_width(line) < my_indent {
            return ix as usize + 1;
        }
    }
    0
}
