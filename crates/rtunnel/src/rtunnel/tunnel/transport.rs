use std::sync::Arc;

use url::Url;

use crate::rtunnel::tunnel::session::{ClientConfig, SecureSession, SecureTransport, SessionError};

pub mod ws;

const DEFAULT_PORT: u16 = 22;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// Secure session straight over a TCP socket.
    Raw,
    /// Secure session over a web-socket byte stream.
    WebSocket,
}

pub fn is_ws_scheme(scheme: &str) -> bool {
    matches!(scheme, "ws" | "wss")
}

pub fn transport_kind(endpoint: &Url) -> TransportKind {
    if is_ws_scheme(endpoint.scheme()) {
        TransportKind::WebSocket
    } else {
        TransportKind::Raw
    }
}

/// `endpoint` as it may appear in errors and logs: user-info is dropped.
pub fn redacted(endpoint: &Url) -> String {
    let mut u = endpoint.clone();
    let _ = u.set_password(None);
    let _ = u.set_username("");
    u.to_string()
}

/// `host:port` to dial for a raw endpoint.
pub fn raw_addr(endpoint: &Url) -> Result<String, SessionError> {
    let host = endpoint
        .host_str()
        .filter(|h| !h.is_empty())
        .ok_or_else(|| SessionError::Handshake(format!("endpoint {} has no host", redacted(endpoint))))?;
    let port = endpoint.port().unwrap_or(DEFAULT_PORT);
    Ok(format!("{host}:{port}"))
}

/// Copy of `endpoint` carrying `user` as its user-info.
pub fn credential_url(endpoint: &Url, user: &str) -> Result<Url, SessionError> {
    let mut u = endpoint.clone();
    u.set_username(user)
        .and_then(|_| u.set_password(Some("")))
        .map_err(|_| {
            SessionError::WebSocket(format!(
                "endpoint {} cannot carry credentials",
                redacted(endpoint)
            ))
        })?;
    Ok(u)
}

pub async fn open_session(
    transport: &dyn SecureTransport,
    endpoint: &Url,
    cfg: &ClientConfig,
) -> Result<Arc<dyn SecureSession>, SessionError> {
    match transport_kind(endpoint) {
        TransportKind::WebSocket => {
            let u = credential_url(endpoint, &cfg.user)?;
            let stream = ws::connect(&u).await?;
            tracing::debug!(endpoint = %redacted(endpoint), transport = %transport.name(), "tunnel: web-socket connected");
            transport.handshake(stream, cfg).await
        }
        TransportKind::Raw => {
            let addr = raw_addr(endpoint)?;
            tracing::debug!(addr = %addr, transport = %transport.name(), "tunnel: dialing");
            transport.dial(&addr, cfg).await
        }
    }
}
