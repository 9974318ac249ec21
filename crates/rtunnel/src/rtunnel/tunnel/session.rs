use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::rtunnel::tunnel::session::protocol::ProtocolError;

/// Anything a session can run over: a TCP socket, a web-socket adapter or a
/// forwarded yamux stream.
pub trait AsyncStream: tokio::io::AsyncRead + tokio::io::AsyncWrite {}
impl<T> AsyncStream for T where T: tokio::io::AsyncRead + tokio::io::AsyncWrite + ?Sized {}

pub type BoxedStream = Box<dyn AsyncStream + Unpin + Send>;

/// Message emitted when the peer accepted none of the offered keys.
pub const NO_ACCEPTABLE_AUTH: &str = "unable to authenticate, attempted methods [none]";

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("protocol: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("websocket: {0}")]
    WebSocket(String),
    #[error("tls: {0}")]
    Tls(String),
    #[error("handshake: {0}")]
    Handshake(String),
    #[error("sign: {0}")]
    Sign(String),
    #[error("request {0:?} denied by peer")]
    Denied(String),
    #[error("rendezvous key {0:?} already bound on this session")]
    KeyInUse(String),
    #[error("session closed")]
    Closed,
}

impl SessionError {
    pub(crate) fn auth_rejected() -> Self {
        SessionError::Handshake(NO_ACCEPTABLE_AUTH.to_string())
    }
}

/// A private key able to answer the peer's authentication challenge.
pub trait Signer: Send + Sync {
    fn algorithm(&self) -> &'static str;
    fn public_key(&self) -> Vec<u8>;
    fn sign(&self, data: &[u8]) -> Result<Vec<u8>, SessionError>;
}

/// How the peer's host key is checked during the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HostKeyPolicy {
    /// Accept whatever the peer presents. No pinning is performed.
    #[default]
    AcceptAny,
}

#[derive(Clone)]
pub struct ClientConfig {
    pub user: String,
    pub signers: Vec<Arc<dyn Signer>>,
    pub client_version: String,
    pub host_key_policy: HostKeyPolicy,
}

impl std::fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConfig")
            .field("user", &self.user)
            .field("signers", &self.signers.len())
            .field("client_version", &self.client_version)
            .field("host_key_policy", &self.host_key_policy)
            .finish()
    }
}

/// Produces authenticated sessions, either by dialing a raw socket itself or by
/// running the handshake over a byte stream someone else opened.
#[async_trait]
pub trait SecureTransport: Send + Sync {
    fn name(&self) -> &'static str;
    async fn dial(
        &self,
        addr: &str,
        cfg: &ClientConfig,
    ) -> Result<Arc<dyn SecureSession>, SessionError>;
    async fn handshake(
        &self,
        stream: BoxedStream,
        cfg: &ClientConfig,
    ) -> Result<Arc<dyn SecureSession>, SessionError>;
}

#[async_trait]
pub trait SecureSession: Send + Sync {
    /// Sends an out-of-band request. Returns the peer's acknowledgment and reply
    /// payload; `(true, [])` when no reply was wanted.
    async fn send_request(
        &self,
        name: &str,
        want_reply: bool,
        payload: &[u8],
    ) -> Result<(bool, Vec<u8>), SessionError>;

    /// Asks the peer to route channels addressed to `key` back to us.
    async fn listen(&self, key: &str) -> Result<Arc<dyn ReverseListener>, SessionError>;

    async fn close(&self);

    fn is_closed(&self) -> bool;
}

#[async_trait]
pub trait ReverseListener: Send + Sync {
    async fn accept(&self) -> Result<BoxedStream, SessionError>;
    fn key(&self) -> &str;
    async fn close(&self);
}

pub mod keys;
pub mod mux;
pub mod protocol;
#[cfg(test)]
pub mod testing;
pub mod tls;
