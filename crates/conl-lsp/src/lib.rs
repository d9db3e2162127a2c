//! # conl-lsp
//!
//! A language server for CONL configuration files: schema-driven
//! diagnostics, completion, and hover over the LSP base protocol on
//! stdio.
//!
//! The layers, bottom to top: [`frames`] (Content-Length framing and
//! JSON-RPC bodies), [`connection`] (handler registry and dispatch),
//! [`protocol`] (the LSP 3.17 subset as serde structs), [`document`]
//! (open documents and UTF-16 position translation), [`schema_cache`]
//! (schema resolution with a remote cache), and [`session`] (the
//! method handlers).

use tokio::io::{AsyncBufRead, AsyncWrite};

pub mod connection;
pub mod document;
pub mod frames;
pub mod protocol;
pub mod schema_cache;
pub mod session;

pub use connection::{Connection, Outbound};
pub use schema_cache::{http_fetcher, Fetcher};
pub use session::Session;

/// Wire up a full server and run it over a stream pair.
pub async fn serve<R, W>(reader: R, writer: W, fetch: Fetcher) -> anyhow::Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let mut conn = Connection::new();
    let session = Session::new(conn.outbound(), fetch);
    session.register(&mut conn);
    conn.serve(reader, writer).await
}
