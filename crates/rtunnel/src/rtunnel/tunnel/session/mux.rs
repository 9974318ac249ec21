use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::STANDARD};
use futures_util::StreamExt;
use tokio::{
    io::AsyncWriteExt,
    net::TcpStream,
    sync::{Mutex, mpsc},
};

use crate::rtunnel::tunnel::session::{
    BoxedStream, ClientConfig, HostKeyPolicy, ReverseListener, SecureSession, SecureTransport,
    SessionError,
    protocol::{self, AuthAttempt, AuthResult, Challenge, GlobalRequest, Hello},
    tls,
};

pub const FORWARD_REQUEST: &str = "streamlocal-forward@openssh.com";
pub const CANCEL_FORWARD_REQUEST: &str = "cancel-streamlocal-forward@openssh.com";

const CHANNEL_HEADER_TIMEOUT: Duration = Duration::from_secs(10);
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);
const ACCEPT_BACKLOG: usize = 64;

type Routes = Arc<Mutex<HashMap<String, mpsc::Sender<BoxedStream>>>>;

/// Yamux-multiplexed session with a key-based handshake on the first stream.
/// Raw dials are wrapped in TLS before the handshake.
pub struct MuxTransport;

impl MuxTransport {
    pub fn new() -> Self {
        Self
    }
}

impl Default for MuxTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SecureTransport for MuxTransport {
    fn name(&self) -> &'static str {
        "mux"
    }

    async fn dial(
        &self,
        addr: &str,
        cfg: &ClientConfig,
    ) -> Result<Arc<dyn SecureSession>, SessionError> {
        let c = TcpStream::connect(addr).await?;
        c.set_nodelay(true)?;
        let st = tls::connect(c, addr).await?;
        self.handshake(Box::new(st), cfg).await
    }

    async fn handshake(
        &self,
        stream: BoxedStream,
        cfg: &ClientConfig,
    ) -> Result<Arc<dyn SecureSession>, SessionError> {
        let session = tokio_yamux::Session::new_client(stream, tokio_yamux::Config::default());
        let sess = MuxSession::start(session);
        if let Err(err) = sess.shared.authenticate(cfg).await {
            sess.close().await;
            return Err(err);
        }
        Ok(Arc::new(sess))
    }
}

struct Shared {
    control: Mutex<tokio_yamux::Control>,
    routes: Routes,
    closed: Arc<AtomicBool>,
}

impl Shared {
    async fn open_stream(&self) -> Result<tokio_yamux::StreamHandle, SessionError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SessionError::Closed);
        }
        let mut ctrl = self.control.lock().await;
        ctrl.open_stream()
            .await
            .map_err(|e| SessionError::Io(std::io::Error::other(e.to_string())))
    }

    async fn authenticate(&self, cfg: &ClientConfig) -> Result<(), SessionError> {
        let mut st = self.open_stream().await?;

        let hello = Hello {
            user: cfg.user.clone(),
            client_version: cfg.client_version.clone(),
        };
        protocol::write_json_frame(&mut st, protocol::MAGIC_HELLO, &hello).await?;

        let challenge: Challenge = protocol::read_json_frame(&mut st, protocol::MAGIC_CHALLENGE).await?;
        match cfg.host_key_policy {
            HostKeyPolicy::AcceptAny => {
                tracing::debug!(host_key = %challenge.host_key, "session: accepting peer host key unchecked");
            }
        }
        let nonce = STANDARD
            .decode(challenge.nonce.as_bytes())
            .map_err(|e| SessionError::Handshake(format!("bad nonce: {e}")))?;
        let msg = protocol::auth_message(&nonce, &cfg.user);

        for signer in &cfg.signers {
            let attempt = AuthAttempt {
                algorithm: signer.algorithm().to_string(),
                public_key: STANDARD.encode(signer.public_key()),
                signature: STANDARD.encode(signer.sign(&msg)?),
            };
            protocol::write_json_frame(&mut st, protocol::MAGIC_AUTH, &attempt).await?;
            let res: AuthResult =
                protocol::read_json_frame(&mut st, protocol::MAGIC_AUTH_RESULT).await?;
            if res.accepted {
                let _ = st.shutdown().await;
                return Ok(());
            }
            tracing::debug!(algorithm = %attempt.algorithm, "session: key rejected");
        }

        let _ = st.shutdown().await;
        Err(SessionError::auth_rejected())
    }

    async fn send_request(
        &self,
        name: &str,
        want_reply: bool,
        payload: &[u8],
    ) -> Result<(bool, Vec<u8>), SessionError> {
        let mut st = self.open_stream().await?;
        let req = GlobalRequest {
            name: name.to_string(),
            want_reply,
            payload: payload.to_vec(),
        };
        protocol::write_global_request(&mut st, &req).await?;
        if !want_reply {
            let _ = st.shutdown().await;
            return Ok((true, Vec::new()));
        }
        let reply = protocol::read_global_reply(&mut st).await?;
        let _ = st.shutdown().await;
        Ok(reply)
    }
}

struct MuxSession {
    shared: Arc<Shared>,
    task: tokio::task::JoinHandle<()>,
}

impl MuxSession {
    fn start(mut session: tokio_yamux::Session<BoxedStream>) -> Self {
        let control = session.control();
        let routes: Routes = Arc::new(Mutex::new(HashMap::new()));
        let closed = Arc::new(AtomicBool::new(false));

        let task = {
            let routes = routes.clone();
            let closed = closed.clone();
            tokio::spawn(async move {
                while let Some(next) = session.next().await {
                    match next {
                        Ok(st) => {
                            tokio::spawn(route_channel(routes.clone(), st));
                        }
                        Err(err) => {
                            tracing::debug!(err = %err, "session: mux ended");
                            break;
                        }
                    }
                }
                closed.store(true, Ordering::SeqCst);
                // Dropping the senders wakes every pending accept.
                routes.lock().await.clear();
            })
        };

        Self {
            shared: Arc::new(Shared {
                control: Mutex::new(control),
                routes,
                closed,
            }),
            task,
        }
    }
}

async fn route_channel(routes: Routes, mut st: tokio_yamux::StreamHandle) {
    let key =
        match tokio::time::timeout(CHANNEL_HEADER_TIMEOUT, protocol::read_channel_header(&mut st))
            .await
        {
            Ok(Ok(key)) => key,
            Ok(Err(err)) => {
                tracing::debug!(err = %err, "session: dropping channel with bad header");
                return;
            }
            Err(_) => {
                tracing::debug!("session: channel header timed out");
                return;
            }
        };

    let tx = routes.lock().await.get(&key).cloned();
    let Some(tx) = tx else {
        tracing::debug!(key = %key, "session: channel for unbound key");
        return;
    };
    if tx.send(Box::new(st)).await.is_err() {
        tracing::debug!(key = %key, "session: listener gone");
    }
}

#[async_trait]
impl SecureSession for MuxSession {
    async fn send_request(
        &self,
        name: &str,
        want_reply: bool,
        payload: &[u8],
    ) -> Result<(bool, Vec<u8>), SessionError> {
        self.shared.send_request(name, want_reply, payload).await
    }

    async fn listen(&self, key: &str) -> Result<Arc<dyn ReverseListener>, SessionError> {
        if key.is_empty() {
            return Err(protocol::ProtocolError::EmptyKey.into());
        }

        let (tx, rx) = mpsc::channel(ACCEPT_BACKLOG);
        {
            // Route before asking so a channel opened right after the ack is not lost.
            let mut routes = self.shared.routes.lock().await;
            if routes.contains_key(key) {
                return Err(SessionError::KeyInUse(key.to_string()));
            }
            routes.insert(key.to_string(), tx);
        }

        let res = self
            .shared
            .send_request(FORWARD_REQUEST, true, key.as_bytes())
            .await;
        let err = match res {
            Ok((true, _)) => None,
            Ok((false, _)) => Some(SessionError::Denied(FORWARD_REQUEST.to_string())),
            Err(err) => Some(err),
        };
        if let Some(err) = err {
            self.shared.routes.lock().await.remove(key);
            return Err(err);
        }

        Ok(Arc::new(MuxListener {
            key: key.to_string(),
            incoming: Mutex::new(rx),
            shared: self.shared.clone(),
            closed: AtomicBool::new(false),
        }))
    }

    async fn close(&self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        {
            let mut ctrl = self.shared.control.lock().await;
            let _ = tokio::time::timeout(CLOSE_TIMEOUT, ctrl.close()).await;
        }
        self.task.abort();
        self.shared.routes.lock().await.clear();
    }

    fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }
}

impl Drop for MuxSession {
    fn drop(&mut self) {
        self.task.abort();
    }
}

struct MuxListener {
    key: String,
    incoming: Mutex<mpsc::Receiver<BoxedStream>>,
    shared: Arc<Shared>,
    closed: AtomicBool,
}

#[async_trait]
impl ReverseListener for MuxListener {
    async fn accept(&self) -> Result<BoxedStream, SessionError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SessionError::Closed);
        }
        let mut rx = self.incoming.lock().await;
        rx.recv().await.ok_or(SessionError::Closed)
    }

    fn key(&self) -> &str {
        &self.key
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shared.routes.lock().await.remove(&self.key);
        if self.shared.closed.load(Ordering::SeqCst) {
            return;
        }
        if let Err(err) = self
            .shared
            .send_request(CANCEL_FORWARD_REQUEST, false, self.key.as_bytes())
            .await
        {
            tracing::debug!(key = %self.key, err = %err, "session: cancel forward failed");
        }
    }
}
