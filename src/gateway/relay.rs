//! Bidirectional websocket relay

use std::sync::Arc;

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::WebSocketStream;
use tracing::debug;

use super::audit::AuditLogger;

/// Relay messages between the client socket and the in-container PTY
/// socket until either side ends. Frames are forwarded exactly as
/// received: binary stays binary, text stays text. Client input is
/// audited; PTY output is not.
///
/// Whichever direction finishes first cancels the other; dropping the
/// halves closes both underlying sockets.
pub async fn relay<C, P>(
    client: WebSocketStream<C>,
    pty: WebSocketStream<P>,
    audit: Arc<AuditLogger>,
) where
    C: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    P: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (client_sink, client_stream) = client.split();
    let (pty_sink, pty_stream) = pty.split();

    let mut client_to_pty = tokio::spawn(forward(
        client_stream,
        pty_sink,
        Some(audit),
        "client->pty",
    ));
    let mut pty_to_client = tokio::spawn(forward(pty_stream, client_sink, None, "pty->client"));

    tokio::select! {
        _ = &mut client_to_pty => pty_to_client.abort(),
        _ = &mut pty_to_client => client_to_pty.abort(),
    }
}

async fn forward<S, K>(
    mut from: S,
    mut to: K,
    audit: Option<Arc<AuditLogger>>,
    label: &'static str,
) -> u64
where
    S: Stream<Item = Result<Message, WsError>> + Unpin + Send,
    K: Sink<Message, Error = WsError> + Unpin + Send,
{
    let mut forwarded = 0u64;

    while let Some(next) = from.next().await {
        match next {
            Ok(message @ (Message::Text(_) | Message::Binary(_))) => {
                if let Some(audit) = &audit {
                    audit.record(&message);
                }
                if to.send(message).await.is_err() {
                    break;
                }
                forwarded += 1;
            }
            Ok(Message::Close(_)) => break,
            // Ping/pong are answered by the protocol layer
            Ok(_) => {}
            Err(e) => {
                debug!("{} ended: {}", label, e);
                break;
            }
        }
    }

    // Propagate end-of-stream to the other peer
    let _ = to.close().await;
    debug!("{} relay ended after {} message(s)", label, forwarded);
    forwarded
}
