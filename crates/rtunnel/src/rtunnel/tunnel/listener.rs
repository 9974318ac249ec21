use std::sync::Arc;

use crate::rtunnel::tunnel::{
    error::TunnelError,
    session::{ReverseListener, SecureSession},
};

/// Asks the relay to route channels for `key` back over `session`.
pub async fn request_listener(
    session: &dyn SecureSession,
    endpoint: &str,
    key: &str,
) -> Result<Arc<dyn ReverseListener>, TunnelError> {
    match session.listen(key).await {
        Ok(ln) => {
            tracing::info!(key = %key, "tunnel: reverse listener ready");
            Ok(ln)
        }
        Err(source) => Err(TunnelError::Listener {
            endpoint: endpoint.to_string(),
            key: key.to_string(),
            source,
        }),
    }
}

/// Closes the listener before the session that carries it. Either may be
/// absent.
pub async fn teardown(
    listener: Option<Arc<dyn ReverseListener>>,
    session: Option<Arc<dyn SecureSession>>,
) {
    if let Some(ln) = listener {
        ln.close().await;
        tracing::debug!(key = %ln.key(), "tunnel: reverse listener closed");
    }
    if let Some(s) = session {
        s.close().await;
        tracing::debug!("tunnel: session closed");
    }
}
