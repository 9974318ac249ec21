//! In-process relay peer speaking the mux session protocol, for tests.

use std::{
    collections::{HashMap, HashSet},
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
};

use async_trait::async_trait;

use base64::{Engine as _, engine::general_purpose::STANDARD};
use futures_util::StreamExt;
use ring::{
    rand::{SecureRandom, SystemRandom},
    signature::{ED25519, UnparsedPublicKey},
};
use tokio::{
    io::AsyncWriteExt,
    net::{TcpListener, TcpStream},
    sync::{Mutex, mpsc},
};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};

use crate::rtunnel::tunnel::{
    KEEPALIVE_REQUEST, SERVER_INFO_REQUEST,
    session::{
        BoxedStream, ReverseListener, SecureSession, SessionError,
        mux::{CANCEL_FORWARD_REQUEST, FORWARD_REQUEST},
        protocol::{self, AuthAttempt, AuthResult, Challenge, Hello},
        tls,
    },
    transport::ws::WsByteStream,
};

#[derive(Debug, Clone)]
pub enum ServerInfoReply {
    Json(serde_json::Value),
    Raw(Vec<u8>),
    Deny,
}

#[derive(Debug, Clone)]
pub struct RelayOptions {
    pub authorized_keys: Vec<Vec<u8>>,
    pub server_info: ServerInfoReply,
    /// Keys another host already holds on this relay.
    pub bound_keys: Vec<String>,
    /// Never answer the handshake; used to exercise cancellation.
    pub stall_handshake: bool,
}

impl RelayOptions {
    pub fn authorizing(keys: Vec<Vec<u8>>) -> Self {
        Self {
            authorized_keys: keys,
            server_info: ServerInfoReply::Json(serde_json::json!({
                "host": "relay.test:22",
                "version": "test"
            })),
            bound_keys: Vec::new(),
            stall_handshake: false,
        }
    }
}

struct RelayState {
    opts: RelayOptions,
    keepalives: AtomicUsize,
    users: Mutex<Vec<String>>,
    ws_auth: std::sync::Mutex<Vec<String>>,
    bound: Mutex<HashSet<String>>,
    controls: Mutex<Vec<tokio_yamux::Control>>,
}

#[derive(Clone)]
pub struct TestRelay {
    state: Arc<RelayState>,
}

impl TestRelay {
    pub fn new(opts: RelayOptions) -> Self {
        let bound = opts.bound_keys.iter().cloned().collect();
        Self {
            state: Arc::new(RelayState {
                opts,
                keepalives: AtomicUsize::new(0),
                users: Mutex::new(Vec::new()),
                ws_auth: std::sync::Mutex::new(Vec::new()),
                bound: Mutex::new(bound),
                controls: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Raw listener; each connection is TLS with a self-signed certificate.
    pub async fn serve_tcp(&self) -> SocketAddr {
        let ln = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = ln.local_addr().expect("local_addr");
        let state = self.state.clone();
        let acceptor = tls::test_acceptor();
        tokio::spawn(async move {
            while let Ok((c, _)) = ln.accept().await {
                let state = state.clone();
                let acceptor = acceptor.clone();
                tokio::spawn(async move {
                    if let Ok(st) = acceptor.accept(c).await {
                        serve_session(state, Box::new(st)).await;
                    }
                });
            }
        });
        addr
    }

    /// Raw listener without TLS, for checking that clients refuse it.
    pub async fn serve_plain_tcp(&self) -> SocketAddr {
        let ln = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = ln.local_addr().expect("local_addr");
        let state = self.state.clone();
        tokio::spawn(async move {
            while let Ok((c, _)) = ln.accept().await {
                tokio::spawn(serve_session(state.clone(), Box::new(c)));
            }
        });
        addr
    }

    pub async fn serve_ws(&self) -> SocketAddr {
        let ln = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = ln.local_addr().expect("local_addr");
        let state = self.state.clone();
        tokio::spawn(async move {
            while let Ok((c, _)) = ln.accept().await {
                let state = state.clone();
                tokio::spawn(async move {
                    if let Some(st) = upgrade(state.clone(), c).await {
                        serve_session(state, st).await;
                    }
                });
            }
        });
        addr
    }

    /// Keepalive requests received across all sessions.
    pub fn keepalives(&self) -> usize {
        self.state.keepalives.load(Ordering::SeqCst)
    }

    pub async fn users(&self) -> Vec<String> {
        self.state.users.lock().await.clone()
    }

    pub fn ws_authorization(&self) -> Vec<String> {
        self.state
            .ws_auth
            .lock()
            .map(|v| v.clone())
            .unwrap_or_default()
    }

    pub async fn is_bound(&self, key: &str) -> bool {
        self.state.bound.lock().await.contains(key)
    }

    /// Opens a forwarded channel for `key` on the most recent session.
    pub async fn open_channel(&self, key: &str) -> tokio_yamux::StreamHandle {
        let mut controls = self.state.controls.lock().await;
        let ctrl = controls.last_mut().expect("no session");
        let mut st = ctrl.open_stream().await.expect("open_stream");
        protocol::write_channel_header(&mut st, key)
            .await
            .expect("channel header");
        st
    }
}

async fn upgrade(state: Arc<RelayState>, c: TcpStream) -> Option<BoxedStream> {
    let callback = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
        if let Some(v) = req
            .headers()
            .get("authorization")
            .and_then(|v| v.to_str().ok())
        {
            if let Ok(mut seen) = state.ws_auth.lock() {
                seen.push(v.to_string());
            }
        }
        Ok(resp)
    };
    let ws = tokio_tungstenite::accept_hdr_async(c, callback).await.ok()?;
    Some(Box::new(WsByteStream::new(ws)))
}

async fn serve_session(state: Arc<RelayState>, stream: BoxedStream) {
    let mut session = tokio_yamux::Session::new_server(stream, tokio_yamux::Config::default());
    let control = session.control();

    let (tx, mut rx) = mpsc::channel::<tokio_yamux::StreamHandle>(16);
    tokio::spawn(async move {
        while let Some(Ok(st)) = session.next().await {
            if tx.send(st).await.is_err() {
                break;
            }
        }
    });

    let Some(mut auth) = rx.recv().await else {
        return;
    };
    if !authenticate(&state, &mut auth).await {
        return;
    }
    state.controls.lock().await.push(control);

    while let Some(st) = rx.recv().await {
        tokio::spawn(handle_request(state.clone(), st));
    }
}

async fn authenticate(state: &RelayState, st: &mut tokio_yamux::StreamHandle) -> bool {
    let Ok(hello) = protocol::read_json_frame::<_, Hello>(st, protocol::MAGIC_HELLO).await else {
        return false;
    };
    if state.opts.stall_handshake {
        std::future::pending::<()>().await;
    }

    let mut nonce = [0u8; 32];
    if SystemRandom::new().fill(&mut nonce).is_err() {
        return false;
    }
    let challenge = Challenge {
        nonce: STANDARD.encode(nonce),
        host_key: "relay-test-host-key".into(),
    };
    if protocol::write_json_frame(st, protocol::MAGIC_CHALLENGE, &challenge)
        .await
        .is_err()
    {
        return false;
    }

    let msg = protocol::auth_message(&nonce, &hello.user);
    loop {
        let Ok(attempt) = protocol::read_json_frame::<_, AuthAttempt>(st, protocol::MAGIC_AUTH).await
        else {
            return false;
        };
        let accepted = verify(state, &attempt, &msg);
        let res = AuthResult { accepted };
        if protocol::write_json_frame(st, protocol::MAGIC_AUTH_RESULT, &res)
            .await
            .is_err()
        {
            return false;
        }
        if accepted {
            state.users.lock().await.push(hello.user.clone());
            return true;
        }
    }
}

fn verify(state: &RelayState, attempt: &AuthAttempt, msg: &[u8]) -> bool {
    let (Ok(pk), Ok(sig)) = (
        STANDARD.decode(&attempt.public_key),
        STANDARD.decode(&attempt.signature),
    ) else {
        return false;
    };
    if !state.opts.authorized_keys.iter().any(|k| k == &pk) {
        return false;
    }
    UnparsedPublicKey::new(&ED25519, &pk).verify(msg, &sig).is_ok()
}

async fn handle_request(state: Arc<RelayState>, mut st: tokio_yamux::StreamHandle) {
    let Ok(req) = protocol::read_global_request(&mut st).await else {
        return;
    };

    let (ok, body): (bool, Vec<u8>) = match req.name.as_str() {
        KEEPALIVE_REQUEST => {
            state.keepalives.fetch_add(1, Ordering::SeqCst);
            (true, Vec::new())
        }
        SERVER_INFO_REQUEST => match &state.opts.server_info {
            ServerInfoReply::Json(v) => (true, serde_json::to_vec(v).unwrap_or_default()),
            ServerInfoReply::Raw(b) => (true, b.clone()),
            ServerInfoReply::Deny => (false, Vec::new()),
        },
        FORWARD_REQUEST => {
            let key = String::from_utf8_lossy(&req.payload).into_owned();
            (state.bound.lock().await.insert(key), Vec::new())
        }
        CANCEL_FORWARD_REQUEST => {
            let key = String::from_utf8_lossy(&req.payload).into_owned();
            (state.bound.lock().await.remove(&key), Vec::new())
        }
        _ => (false, Vec::new()),
    };

    if req.want_reply {
        let _ = protocol::write_global_reply(&mut st, ok, &body).await;
    }
    let _ = st.shutdown().await;
}

/// Scripted session for unit tests that don't need a relay.
///
/// Requests without a scripted reply are acknowledged with an empty payload.
#[derive(Default)]
pub struct MockSession {
    replies: std::sync::Mutex<HashMap<String, Result<(bool, Vec<u8>), String>>>,
    calls: std::sync::Mutex<Vec<String>>,
    closed: AtomicBool,
}

impl MockSession {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn reply(&self, name: &str, reply: Result<(bool, Vec<u8>), String>) {
        if let Ok(mut r) = self.replies.lock() {
            r.insert(name.to_string(), reply);
        }
    }

    pub fn calls(&self, name: &str) -> usize {
        self.calls
            .lock()
            .map(|c| c.iter().filter(|n| *n == name).count())
            .unwrap_or_default()
    }
}

#[async_trait]
impl SecureSession for MockSession {
    async fn send_request(
        &self,
        name: &str,
        _want_reply: bool,
        _payload: &[u8],
    ) -> Result<(bool, Vec<u8>), SessionError> {
        if let Ok(mut c) = self.calls.lock() {
            c.push(name.to_string());
        }
        if self.is_closed() {
            return Err(SessionError::Closed);
        }
        let reply = self
            .replies
            .lock()
            .ok()
            .and_then(|r| r.get(name).cloned());
        match reply {
            Some(Ok(r)) => Ok(r),
            Some(Err(msg)) => Err(SessionError::Io(std::io::Error::other(msg))),
            None => Ok((true, Vec::new())),
        }
    }

    async fn listen(&self, key: &str) -> Result<Arc<dyn ReverseListener>, SessionError> {
        Err(SessionError::Denied(key.to_string()))
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}
