//! Terminal gateway
//!
//! Websocket server brokering authenticated terminal sessions into
//! running sandboxes. Per connection: parse the URL, validate the token
//! against the internal endpoint, resolve the container's bridge IP,
//! dial the in-container PTY server, then relay bytes both ways with an
//! audit trail on client input. Connections are independent; the two
//! relay directions within one connection share nothing but the sockets
//! and the audit logger.

mod audit;
mod relay;

pub use audit::{AuditEntry, AuditLogger};
pub use relay::relay;

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::json;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::{accept_hdr_async, connect_async, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

use crate::config::Configuration;
use crate::docker::ContainerRuntime;

/// Close codes surfaced to the client.
pub const CLOSE_BAD_REQUEST: u16 = 4400;
pub const CLOSE_UNAUTHORIZED: u16 = 4401;
pub const CLOSE_UPSTREAM_FAILED: u16 = 4502;
pub const CLOSE_NOT_RUNNING: u16 = 4503;

/// Timeout for the internal validate call.
const VALIDATE_TIMEOUT: Duration = Duration::from_secs(5);

/// Timeout for dialing the in-container PTY server.
const PTY_DIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// PTY subprotocol negotiated with the in-container server.
const PTY_SUBPROTOCOL: &str = "tty";

/// Extract `(project_id, token)` from a request path of the form
/// `/terminal/{project_id}?token={jwt}`. `None` when the path shape is
/// wrong; the token is `None` when absent.
pub fn parse_ws_url(path: &str) -> Option<(Uuid, Option<String>)> {
    let url = Url::parse(&format!("ws://gateway{}", path)).ok()?;

    let mut segments = url.path_segments()?;
    if segments.next() != Some("terminal") {
        return None;
    }
    let project_id = Uuid::parse_str(segments.next()?).ok()?;
    if segments.next().is_some() {
        return None;
    }

    let token = url
        .query_pairs()
        .find(|(key, _)| key == "token")
        .map(|(_, value)| value.into_owned())
        .filter(|token| !token.is_empty());

    Some((project_id, token))
}

/// Terminal gateway server
pub struct TerminalGateway {
    runtime: Arc<dyn ContainerRuntime>,
    http: reqwest::Client,

    /// Internal validate endpoint
    validate_url: String,

    /// Shared secret for the internal endpoint
    internal_secret: Option<String>,

    /// PTY server port inside each sandbox
    pty_port: u16,
}

impl TerminalGateway {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, config: &Configuration) -> Self {
        Self::with_endpoints(
            runtime,
            &format!("{}/internal/validate", config.network.project_service_url),
            config.auth.internal_secret.clone(),
            config.network.pty_port,
        )
    }

    /// Constructor with explicit endpoints. Used by tests.
    pub fn with_endpoints(
        runtime: Arc<dyn ContainerRuntime>,
        validate_url: &str,
        internal_secret: Option<String>,
        pty_port: u16,
    ) -> Self {
        let http = reqwest::Client::builder()
            .timeout(VALIDATE_TIMEOUT)
            .build()
            .expect("reqwest client");

        Self {
            runtime,
            http,
            validate_url: validate_url.to_string(),
            internal_secret,
            pty_port,
        }
    }

    /// Accept connections until the shutdown token fires.
    pub async fn serve(self: Arc<Self>, listener: TcpListener, shutdown: CancellationToken) {
        info!(
            "Terminal gateway listening on {}",
            listener.local_addr().map(|a| a.to_string()).unwrap_or_default()
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!("Terminal gateway stopped");
                    return;
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            let gateway = self.clone();
                            tokio::spawn(async move {
                                debug!("New terminal connection from {}", peer);
                                gateway.handle_connection(stream).await;
                            });
                        }
                        Err(e) => warn!("Accept error: {}", e),
                    }
                }
            }
        }
    }

    /// Drive one connection through the full session lifecycle.
    pub async fn handle_connection(&self, stream: TcpStream) {
        let mut request_path = String::new();
        let callback = |request: &Request, response: Response| {
            request_path = request.uri().to_string();
            Ok(response)
        };

        let ws = match accept_hdr_async(stream, callback).await {
            Ok(ws) => ws,
            Err(e) => {
                debug!("Handshake failed: {}", e);
                return;
            }
        };

        let Some((project_id, token)) = parse_ws_url(&request_path) else {
            warn!("Rejected terminal connection: invalid path {}", request_path);
            close_with(ws, CLOSE_BAD_REQUEST, "Invalid path").await;
            return;
        };

        let Some(token) = token else {
            warn!("[{}] Rejected terminal connection: no token", project_id);
            close_with(ws, CLOSE_BAD_REQUEST, "Token required").await;
            return;
        };

        let Some(user_id) = self.validate_token(&token, project_id).await else {
            warn!("[{}] Rejected terminal connection: auth failed", project_id);
            close_with(ws, CLOSE_UNAUTHORIZED, "Unauthorized").await;
            return;
        };
        info!("[{}] Terminal session authenticated (user={})", project_id, user_id);

        // The side-car must sit on the sandbox network before dialing in
        if let Err(e) = self.runtime.connect_proxy_to_network(project_id).await {
            warn!("[{}] Proxy attach failed: {}", project_id, e);
            close_with(ws, CLOSE_NOT_RUNNING, "Container not running").await;
            return;
        }

        let ip = match self.runtime.get_container_ip(project_id).await {
            Ok(ip) => ip,
            Err(e) => {
                warn!("[{}] Container not reachable: {}", project_id, e);
                close_with(ws, CLOSE_NOT_RUNNING, "Container not running").await;
                return;
            }
        };

        let pty_ws = match self.dial_pty(&ip).await {
            Ok(pty_ws) => pty_ws,
            Err(e) => {
                warn!("[{}] PTY dial failed: {}", project_id, e);
                close_with(ws, CLOSE_UPSTREAM_FAILED, "Backend connection failed").await;
                return;
            }
        };

        info!("[{}] Relay started (pty at {})", project_id, ip);
        let audit = Arc::new(AuditLogger::new(project_id, &user_id));
        relay(ws, pty_ws, audit).await;
        info!("[{}] Terminal session ended", project_id);
    }

    /// Validate the token via the internal endpoint. Returns the owning
    /// user's id, or `None` on any failure.
    async fn validate_token(&self, token: &str, project_id: Uuid) -> Option<String> {
        #[derive(Deserialize)]
        struct Validated {
            user_id: String,
        }

        let mut request = self.http.post(&self.validate_url).json(&json!({
            "token": token,
            "project_id": project_id.to_string(),
        }));
        if let Some(secret) = &self.internal_secret {
            request = request.header("X-Internal-Secret", secret);
        }

        match request.send().await {
            Ok(response) if response.status().is_success() => response
                .json::<Validated>()
                .await
                .ok()
                .map(|v| v.user_id),
            Ok(response) => {
                debug!("Validate returned {}", response.status());
                None
            }
            Err(e) => {
                warn!("Validate request failed: {}", e);
                None
            }
        }
    }

    /// Dial the PTY server inside the container, negotiating its
    /// subprotocol.
    async fn dial_pty(
        &self,
        ip: &str,
    ) -> Result<
        WebSocketStream<tokio_tungstenite::MaybeTlsStream<TcpStream>>,
        Box<dyn std::error::Error + Send + Sync>,
    > {
        let url = format!("ws://{}:{}/ws", ip, self.pty_port);

        let mut request = url.into_client_request()?;
        request
            .headers_mut()
            .insert("Sec-WebSocket-Protocol", HeaderValue::from_static(PTY_SUBPROTOCOL));

        let (pty_ws, _) = tokio::time::timeout(PTY_DIAL_TIMEOUT, connect_async(request)).await??;
        Ok(pty_ws)
    }
}

/// Close the socket with a library close code.
async fn close_with(mut ws: WebSocketStream<TcpStream>, code: u16, reason: &'static str) {
    let frame = CloseFrame {
        code: CloseCode::from(code),
        reason: reason.into(),
    };
    if let Err(e) = ws.close(Some(frame)).await {
        debug!("Close failed: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_well_formed_terminal_urls() {
        let id = Uuid::new_v4();
        let (parsed, token) =
            parse_ws_url(&format!("/terminal/{}?token=abc.def.ghi", id)).unwrap();
        assert_eq!(parsed, id);
        assert_eq!(token.as_deref(), Some("abc.def.ghi"));
    }

    #[test]
    fn missing_token_is_reported_as_absent() {
        let id = Uuid::new_v4();
        let (_, token) = parse_ws_url(&format!("/terminal/{}", id)).unwrap();
        assert!(token.is_none());

        let (_, token) = parse_ws_url(&format!("/terminal/{}?token=", id)).unwrap();
        assert!(token.is_none());
    }

    #[test]
    fn rejects_malformed_paths() {
        let id = Uuid::new_v4();
        assert!(parse_ws_url("/").is_none());
        assert!(parse_ws_url("/console/abc?token=t").is_none());
        assert!(parse_ws_url("/terminal/not-a-uuid?token=t").is_none());
        assert!(parse_ws_url(&format!("/terminal/{}/extra?token=t", id)).is_none());
    }
}
