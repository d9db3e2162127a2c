//! The JSON-RPC connection: handler registry, dispatch loop, and the
//! outbound notification handle.
//!
//! Handlers are plain async closures over their concrete param and
//! result types; registration erases the types by capturing the serde
//! round trip in a boxed closure. The registry is fixed before
//! [`Connection::serve`] runs, so dispatch needs no locking.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, OnceLock};

use anyhow::anyhow;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::value::RawValue;
use tokio::io::{AsyncBufRead, AsyncWrite};
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use crate::frames::{
    Frame, FrameError, FrameReader, FrameWriter, INTERNAL_ERROR, INVALID_PARAMS, INVALID_REQUEST,
    METHOD_NOT_FOUND, PARSE_ERROR,
};
use crate::protocol::{MessageType, ShowMessageParams};

type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

enum Handler {
    Notification(Box<dyn Fn(&RawValue) -> Result<BoxFuture<()>, serde_json::Error> + Send + Sync>),
    Request(
        Box<
            dyn Fn(&RawValue) -> Result<BoxFuture<anyhow::Result<Box<RawValue>>>, serde_json::Error>
                + Send
                + Sync,
        >,
    ),
}

/// A cheap-to-clone handle for sending server-initiated messages.
/// Sends after the connection has closed are silent no-ops.
#[derive(Clone)]
pub struct Outbound {
    tx: mpsc::UnboundedSender<Frame>,
    cancel: Arc<watch::Sender<bool>>,
}

impl Outbound {
    /// Send a notification to the client.
    pub fn notify(&self, method: &str, params: &impl Serialize) {
        match Frame::notification(method, params) {
            Ok(frame) => {
                let _ = self.tx.send(frame);
            }
            Err(err) => warn!(method, "dropping unserializable notification: {err}"),
        }
    }

    /// Stop the connection: the read loop exits and the writer drains.
    pub fn exit(&self) {
        let _ = self.cancel.send(true);
    }

    fn send(&self, frame: Frame) {
        let _ = self.tx.send(frame);
    }
}

pub struct Connection {
    handlers: HashMap<String, Handler>,
    outbound: Outbound,
    rx: mpsc::UnboundedReceiver<Frame>,
    cancel: watch::Receiver<bool>,
}

impl Connection {
    pub fn new() -> Connection {
        let (tx, rx) = mpsc::unbounded_channel();
        let (cancel_tx, cancel) = watch::channel(false);
        Connection {
            handlers: HashMap::new(),
            outbound: Outbound {
                tx,
                cancel: Arc::new(cancel_tx),
            },
            rx,
            cancel,
        }
    }

    pub fn outbound(&self) -> Outbound {
        self.outbound.clone()
    }

    /// Register a notification handler. If the client attaches an id
    /// anyway, an invalid-request error is returned and the handler
    /// still runs.
    pub fn handle_notification<P, Fut>(
        &mut self,
        method: &str,
        handler: impl Fn(P) -> Fut + Send + Sync + 'static,
    ) where
        P: DeserializeOwned,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.handlers.insert(
            method.to_string(),
            Handler::Notification(Box::new(move |raw| {
                let params: P = serde_json::from_str(raw.get())?;
                Ok(Box::pin(handler(params)) as BoxFuture<()>)
            })),
        );
    }

    /// Register a request handler. A handler error becomes an
    /// internal-error response; a missing id leaves the frame inert.
    pub fn handle_request<P, R, Fut>(
        &mut self,
        method: &str,
        handler: impl Fn(P) -> Fut + Send + Sync + 'static,
    ) where
        P: DeserializeOwned,
        R: Serialize,
        Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
    {
        self.handlers.insert(
            method.to_string(),
            Handler::Request(Box::new(move |raw| {
                let params: P = serde_json::from_str(raw.get())?;
                let fut = handler(params);
                Ok(Box::pin(async move {
                    let result = fut.await?;
                    Ok(serde_json::value::to_raw_value(&result)?)
                }) as BoxFuture<anyhow::Result<Box<RawValue>>>)
            })),
        );
    }

    /// Run the connection over a stream pair until the peer
    /// disconnects, `exit` is signalled, or a fatal error occurs.
    pub async fn serve<R, W>(self, reader: R, writer: W) -> anyhow::Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let writer_task = tokio::spawn(FrameWriter::new(writer, self.rx).run(self.cancel.clone()));
        let mut reader = FrameReader::new(reader);
        let mut cancel = self.cancel;

        let served: anyhow::Result<()> = loop {
            let frame = tokio::select! {
                _ = cancel.changed() => break Ok(()),
                frame = reader.next() => frame,
            };
            match frame {
                Ok(Some(frame)) => {
                    if let Err(err) = dispatch(&self.handlers, &self.outbound, frame).await {
                        break Err(err);
                    }
                }
                Ok(None) => break Ok(()),
                Err(FrameError::Json(err)) => {
                    debug!("unparseable frame: {err}");
                    self.outbound
                        .send(Frame::error_response(None, PARSE_ERROR, err.to_string()));
                }
                Err(err) => break Err(err.into()),
            }
        };

        // Stop the writer whichever way the loop ended; it drains
        // queued frames before shutting the stream down.
        self.outbound.exit();
        writer_task.await.map_err(|err| anyhow!("writer task failed: {err}"))??;
        served
    }
}

impl Default for Connection {
    fn default() -> Connection {
        Connection::new()
    }
}

async fn dispatch(
    handlers: &HashMap<String, Handler>,
    outbound: &Outbound,
    frame: Frame,
) -> anyhow::Result<()> {
    if frame.batch.is_some() {
        outbound.send(Frame::error_response(
            None,
            INVALID_REQUEST,
            "batch requests are not supported",
        ));
        return Ok(());
    }
    let Some(method) = frame.method.clone() else {
        // A response frame; this server sends no requests.
        debug!("ignoring unexpected response frame");
        return Ok(());
    };
    let Some(handler) = handlers.get(&method) else {
        if let Some(id) = frame.id {
            outbound.send(Frame::error_response(
                Some(id),
                METHOD_NOT_FOUND,
                format!("method `{method}` not found"),
            ));
        } else {
            debug!(%method, "ignoring unknown notification");
        }
        return Ok(());
    };
    let params = frame.params.as_deref().unwrap_or_else(|| null_params());

    match handler {
        Handler::Notification(build) => {
            if let Some(id) = &frame.id {
                outbound.send(Frame::error_response(
                    Some(id.clone()),
                    INVALID_REQUEST,
                    format!("`{method}` is a notification"),
                ));
            }
            match build(params) {
                Ok(fut) => fut.await,
                Err(err) => debug!(%method, "bad notification params: {err}"),
            }
            Ok(())
        }
        Handler::Request(build) => {
            let Some(id) = frame.id else {
                debug!(%method, "dropping request without id");
                return Ok(());
            };
            let fut = match build(params) {
                Ok(fut) => fut,
                Err(err) => {
                    outbound.send(Frame::error_response(
                        Some(id),
                        INVALID_PARAMS,
                        err.to_string(),
                    ));
                    return Ok(());
                }
            };
            // Run on a task so a panic surfaces as a JoinError here
            // instead of unwinding through the read loop.
            match tokio::spawn(fut).await {
                Ok(Ok(result)) => {
                    outbound.send(Frame::response(id, result));
                    Ok(())
                }
                Ok(Err(err)) => {
                    outbound.send(Frame::error_response(
                        Some(id),
                        INTERNAL_ERROR,
                        format!("{err:#}"),
                    ));
                    Ok(())
                }
                Err(join_err) => {
                    outbound.notify(
                        "window/showMessage",
                        &ShowMessageParams {
                            message_type: MessageType::Error,
                            message: format!("conl-lsp crashed handling `{method}`"),
                        },
                    );
                    outbound.send(Frame::error_response(
                        Some(id),
                        INTERNAL_ERROR,
                        "request handler panicked",
                    ));
                    Err(anyhow!("handler for `{method}` panicked: {join_err}"))
                }
            }
        }
    }
}

fn null_params() -> &'static RawValue {
    static NULL: OnceLock<Box<RawValue>> = OnceLock::new();
    NULL.get_or_init(|| {
        serde_json::value::to_raw_value(&serde_json::Value::Null).expect("null is valid JSON")
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frames::encode;
    use serde_json::json;
    use tokio::io::{AsyncWriteExt, BufReader};

    fn request(id: i64, method: &str, params: serde_json::Value) -> Frame {
        Frame {
            id: Some(serde_json::value::to_raw_value(&id).unwrap()),
            method: Some(method.to_string()),
            params: Some(serde_json::value::to_raw_value(&params).unwrap()),
            ..Frame::default()
        }
    }

    /// Feed raw bytes to a connection, shut the input down, and
    /// collect every reply frame.
    async fn exchange(
        setup: impl FnOnce(&mut Connection),
        input: Vec<u8>,
    ) -> (Vec<Frame>, anyhow::Result<()>) {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let (client_read, mut client_write) = tokio::io::split(client);
        let (server_read, server_write) = tokio::io::split(server);

        let mut conn = Connection::new();
        setup(&mut conn);
        let serve = tokio::spawn(conn.serve(BufReader::new(server_read), server_write));

        client_write.write_all(&input).await.unwrap();
        client_write.shutdown().await.unwrap();

        let mut reader = FrameReader::new(BufReader::new(client_read));
        let mut replies = Vec::new();
        while let Ok(Some(frame)) = reader.next().await {
            replies.push(frame);
        }
        (replies, serve.await.unwrap())
    }

    fn error_code(frame: &Frame) -> i64 {
        frame.error.as_ref().unwrap().code
    }

    #[tokio::test]
    async fn test_request_reply() {
        let (replies, served) = exchange(
            |conn| {
                conn.handle_request("sum", |params: Vec<i64>| async move {
                    Ok::<_, anyhow::Error>(params.iter().sum::<i64>())
                });
            },
            encode(&request(1, "sum", json!([2, 3]))).unwrap(),
        )
        .await;
        served.unwrap();
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].id.as_ref().unwrap().get(), "1");
        assert_eq!(replies[0].result.as_ref().unwrap().get(), "5");
    }

    #[tokio::test]
    async fn test_method_not_found() {
        let (replies, served) = exchange(|_| {}, encode(&request(4, "nope", json!(null))).unwrap()).await;
        served.unwrap();
        assert_eq!(error_code(&replies[0]), METHOD_NOT_FOUND);
        assert_eq!(replies[0].id.as_ref().unwrap().get(), "4");
    }

    #[tokio::test]
    async fn test_unknown_notification_ignored() {
        let input = encode(&Frame {
            method: Some("nope".to_string()),
            ..Frame::default()
        })
        .unwrap();
        let (replies, served) = exchange(|_| {}, input).await;
        served.unwrap();
        assert!(replies.is_empty());
    }

    #[tokio::test]
    async fn test_invalid_params() {
        let (replies, served) = exchange(
            |conn| {
                conn.handle_request("sum", |params: Vec<i64>| async move {
                    Ok::<_, anyhow::Error>(params.len())
                });
            },
            encode(&request(2, "sum", json!({"not": "a list"}))).unwrap(),
        )
        .await;
        served.unwrap();
        assert_eq!(error_code(&replies[0]), INVALID_PARAMS);
    }

    #[tokio::test]
    async fn test_handler_error_is_internal_error() {
        let (replies, served) = exchange(
            |conn| {
                conn.handle_request("fail", |_: serde_json::Value| async move {
                    Err::<(), _>(anyhow!("it broke"))
                });
            },
            encode(&request(3, "fail", json!(null))).unwrap(),
        )
        .await;
        served.unwrap();
        assert_eq!(error_code(&replies[0]), INTERNAL_ERROR);
        assert!(replies[0].error.as_ref().unwrap().message.contains("it broke"));
    }

    #[tokio::test]
    async fn test_request_without_id_is_dropped() {
        let input = encode(&Frame {
            method: Some("sum".to_string()),
            params: Some(serde_json::value::to_raw_value(&json!([1])).unwrap()),
            ..Frame::default()
        })
        .unwrap();
        let (replies, served) = exchange(
            |conn| {
                conn.handle_request("sum", |params: Vec<i64>| async move {
                    Ok::<_, anyhow::Error>(params.len())
                });
            },
            input,
        )
        .await;
        served.unwrap();
        assert!(replies.is_empty());
    }

    #[tokio::test]
    async fn test_notification_with_id_errors_and_still_runs() {
        let (ran_tx, mut ran_rx) = mpsc::unbounded_channel();
        let input = encode(&request(9, "note", json!("hello"))).unwrap();
        let (replies, served) = exchange(
            move |conn| {
                conn.handle_notification("note", move |text: String| {
                    let ran_tx = ran_tx.clone();
                    async move {
                        let _ = ran_tx.send(text);
                    }
                });
            },
            input,
        )
        .await;
        served.unwrap();
        assert_eq!(error_code(&replies[0]), INVALID_REQUEST);
        assert_eq!(ran_rx.try_recv().unwrap(), "hello");
    }

    #[tokio::test]
    async fn test_batch_rejected_with_null_id() {
        let body = br#"[{"jsonrpc":"2.0","id":1,"method":"sum"}]"#;
        let mut input = format!("Content-Length: {}\r\n\r\n", body.len()).into_bytes();
        input.extend_from_slice(body);
        let (replies, served) = exchange(|_| {}, input).await;
        served.unwrap();
        assert_eq!(error_code(&replies[0]), INVALID_REQUEST);
        assert_eq!(replies[0].id.as_ref().unwrap().get(), "null");
        assert!(replies[0]
            .error
            .as_ref()
            .unwrap()
            .message
            .contains("batch"));
    }

    #[tokio::test]
    async fn test_null_id_request_is_answered() {
        let body = br#"{"jsonrpc":"2.0","id":null,"method":"ping","params":null}"#;
        let mut input = format!("Content-Length: {}\r\n\r\n", body.len()).into_bytes();
        input.extend_from_slice(body);
        let (replies, served) = exchange(
            |conn| {
                conn.handle_request("ping", |_: Option<serde_json::Value>| async move {
                    Ok::<_, anyhow::Error>("pong")
                });
            },
            input,
        )
        .await;
        served.unwrap();
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].id.as_ref().unwrap().get(), "null");
        assert_eq!(replies[0].result.as_ref().unwrap().get(), r#""pong""#);
    }

    #[tokio::test]
    async fn test_parse_error_then_recovery() {
        let mut input = b"Content-Length: 4\r\n\r\n{oo}".to_vec();
        input.extend(encode(&request(5, "ping", json!(null))).unwrap());
        let (replies, served) = exchange(
            |conn| {
                conn.handle_request("ping", |_: serde_json::Value| async move {
                    Ok::<_, anyhow::Error>("pong")
                });
            },
            input,
        )
        .await;
        served.unwrap();
        assert_eq!(replies.len(), 2);
        assert_eq!(error_code(&replies[0]), PARSE_ERROR);
        assert_eq!(replies[0].id.as_ref().unwrap().get(), "null");
        assert_eq!(replies[1].result.as_ref().unwrap().get(), r#""pong""#);
    }

    #[tokio::test]
    async fn test_panicking_handler_is_fatal_but_reported() {
        let (replies, served) = exchange(
            |conn| {
                conn.handle_request("boom", |_: serde_json::Value| async move {
                    panic!("kaboom");
                    #[allow(unreachable_code)]
                    Ok::<_, anyhow::Error>(())
                });
            },
            encode(&request(6, "boom", json!(null))).unwrap(),
        )
        .await;
        assert!(served.is_err());
        let methods: Vec<_> = replies.iter().filter_map(|f| f.method.clone()).collect();
        assert!(methods.contains(&"window/showMessage".to_string()));
        let reply = replies.iter().find(|f| f.error.is_some()).unwrap();
        assert_eq!(error_code(reply), INTERNAL_ERROR);
    }

    #[tokio::test]
    async fn test_exit_stops_serving() {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let (_client_read, _client_write) = tokio::io::split(client);
        let (server_read, server_write) = tokio::io::split(server);
        let conn = Connection::new();
        let outbound = conn.outbound();
        let serve = tokio::spawn(conn.serve(BufReader::new(server_read), server_write));
        outbound.exit();
        serve.await.unwrap().unwrap();
    }
}
