//! Schema resolution and the remote schema cache.
//!
//! A document names its schema with a reference that is joined against
//! the document's own URI. Resolution prefers live content: an open
//! document at the resolved URI wins over its on-disk copy, `file`
//! URIs are re-read on every validation, and only `http(s)` schemas
//! are cached. Remote results are cached whether they succeeded or
//! failed; a cached failure is retried only when the document's
//! reference changes.
//!
//! Everything here is blocking (disk, network, condvar waits) and runs
//! inside `spawn_blocking`.

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex, RwLock};

use anyhow::{anyhow, bail, Context};
use conl_core::Schema;
use tracing::debug;

use crate::protocol::DocumentUri;

/// Fetches the source text of a remote schema.
pub type Fetcher = Arc<dyn Fn(&DocumentUri) -> anyhow::Result<String> + Send + Sync>;

/// The blocking HTTP fetcher used in production.
pub fn http_fetcher() -> Fetcher {
    Arc::new(|uri: &DocumentUri| {
        let response = reqwest::blocking::get(uri.0.clone())
            .with_context(|| format!("fetching {uri}"))?
            .error_for_status()
            .with_context(|| format!("fetching {uri}"))?;
        Ok(response.text()?)
    })
}

enum RemoteEntry {
    /// A fetch is in flight; waiters block on the condvar.
    Fetching,
    Ready(Result<Arc<Schema>, String>),
}

pub struct SchemaCache {
    /// Which schema URI each open document depends on.
    edges: RwLock<HashMap<DocumentUri, DocumentUri>>,
    remote: Mutex<HashMap<DocumentUri, RemoteEntry>>,
    ready: Condvar,
    fetch: Fetcher,
}

impl SchemaCache {
    pub fn new(fetch: Fetcher) -> SchemaCache {
        SchemaCache {
            edges: RwLock::new(HashMap::new()),
            remote: Mutex::new(HashMap::new()),
            ready: Condvar::new(),
            fetch,
        }
    }

    /// Resolve `reference` for the document at `doc_uri`, recording
    /// the dependency edge as a side effect.
    ///
    /// `open_doc` looks up live content of an open document by URI.
    pub fn resolve(
        &self,
        doc_uri: &DocumentUri,
        reference: &str,
        open_doc: impl Fn(&DocumentUri) -> Option<String>,
    ) -> anyhow::Result<Arc<Schema>> {
        if reference.is_empty() {
            self.forget(doc_uri);
            return Ok(Arc::new(Schema::any()));
        }
        let schema_uri = match doc_uri.join(reference) {
            Ok(uri) => uri,
            Err(err) => {
                self.forget(doc_uri);
                return Err(anyhow!("invalid schema reference `{reference}`: {err}"));
            }
        };
        let edge_changed = {
            let mut edges = self.edges.write().unwrap();
            edges.insert(doc_uri.clone(), schema_uri.clone()).as_ref() != Some(&schema_uri)
        };
        if let Some(content) = open_doc(&schema_uri) {
            return parse(&schema_uri, &content);
        }
        match schema_uri.scheme() {
            "file" => {
                let path = schema_uri
                    .0
                    .to_file_path()
                    .map_err(|()| anyhow!("`{schema_uri}` is not a file path"))?;
                let content = std::fs::read_to_string(&path)
                    .with_context(|| format!("reading {}", path.display()))?;
                parse(&schema_uri, &content)
            }
            "http" | "https" => self.fetch_remote(&schema_uri, edge_changed),
            scheme => bail!("unsupported schema location `{scheme}:`"),
        }
    }

    fn fetch_remote(
        &self,
        schema_uri: &DocumentUri,
        edge_changed: bool,
    ) -> anyhow::Result<Arc<Schema>> {
        let mut entries = self.remote.lock().unwrap();
        loop {
            match entries.get(schema_uri) {
                Some(RemoteEntry::Ready(Ok(schema))) => return Ok(schema.clone()),
                Some(RemoteEntry::Ready(Err(message))) if !edge_changed => {
                    return Err(anyhow!("{message}"));
                }
                Some(RemoteEntry::Ready(Err(_))) => {
                    // The reference was just (re)declared; give the
                    // failed schema another chance.
                    entries.remove(schema_uri);
                    break;
                }
                Some(RemoteEntry::Fetching) => {
                    entries = self.ready.wait(entries).unwrap();
                }
                None => break,
            }
        }
        entries.insert(schema_uri.clone(), RemoteEntry::Fetching);
        drop(entries);

        debug!(uri = %schema_uri, "fetching remote schema");
        let outcome = (self.fetch)(schema_uri).and_then(|source| parse(schema_uri, &source));
        let cached = match &outcome {
            Ok(schema) => Ok(schema.clone()),
            Err(err) => Err(format!("{err:#}")),
        };
        let mut entries = self.remote.lock().unwrap();
        entries.insert(schema_uri.clone(), RemoteEntry::Ready(cached));
        self.ready.notify_all();
        outcome
    }

    /// Drop the dependency edge for a document (on close, or when it
    /// stops declaring a schema).
    pub fn forget(&self, doc_uri: &DocumentUri) {
        self.edges.write().unwrap().remove(doc_uri);
    }

    /// Open documents whose schema is the document at `uri`.
    pub fn dependents(&self, uri: &DocumentUri) -> Vec<DocumentUri> {
        self.edges
            .read()
            .unwrap()
            .iter()
            .filter(|&(_, target)| target == uri)
            .map(|(doc, _)| doc.clone())
            .collect()
    }

    #[cfg(test)]
    fn edge(&self, doc_uri: &DocumentUri) -> Option<DocumentUri> {
        self.edges.read().unwrap().get(doc_uri).cloned()
    }
}

fn parse(schema_uri: &DocumentUri, content: &str) -> anyhow::Result<Arc<Schema>> {
    Schema::parse(content)
        .map(Arc::new)
        .with_context(|| format!("invalid schema at {schema_uri}"))
}
