use std::{sync::Arc, time::Duration};

use tokio::sync::watch;
use tracing::Instrument;
use url::Url;

use crate::rtunnel::tunnel::{
    CLIENT_VERSION, cancelled,
    classify::ErrorClassifier,
    error::TunnelError,
    identifier::{self, Identifier},
    identity::{IdentitySource, OsIdentity},
    keepalive::{self, Keepalive},
    listener,
    server_info::{self, ServerInfo},
    session::{
        ClientConfig, HostKeyPolicy, ReverseListener, SecureSession, SecureTransport, Signer,
        mux::MuxTransport,
    },
    transport,
};

pub const DEFAULT_KEEPALIVE: Duration = Duration::from_secs(30);

#[derive(Clone)]
pub struct TunnelConfig {
    /// Relay address. `ws`/`wss` run the session over a web-socket; any other
    /// scheme dials the host directly.
    pub endpoint: Url,
    /// Name the relay routes reverse channels by.
    pub rendezvous_key: String,
    pub signers: Vec<Arc<dyn Signer>>,
    pub keepalive_interval: Duration,
    /// Parent span for everything the tunnel logs.
    pub span: tracing::Span,
}

impl std::fmt::Debug for TunnelConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelConfig")
            .field("endpoint", &transport::redacted(&self.endpoint))
            .field("rendezvous_key", &self.rendezvous_key)
            .field("signers", &self.signers.len())
            .field("keepalive_interval", &self.keepalive_interval)
            .finish()
    }
}

impl TunnelConfig {
    pub fn new(endpoint: Url, rendezvous_key: impl Into<String>, signers: Vec<Arc<dyn Signer>>) -> Self {
        Self {
            endpoint,
            rendezvous_key: rendezvous_key.into(),
            signers,
            keepalive_interval: DEFAULT_KEEPALIVE,
            span: tracing::Span::current(),
        }
    }
}

/// A host-side reverse tunnel: one authenticated session to a relay plus a
/// listener the relay routes client channels into.
///
/// Lifecycle is `establish` once, then `close`. `close` is safe at any point,
/// including before `establish` or after a failed one, and may be repeated.
pub struct ReverseTunnel {
    cfg: TunnelConfig,
    transport: Arc<dyn SecureTransport>,
    identity: Arc<dyn IdentitySource>,
    classifier: ErrorClassifier,

    session: Option<Arc<dyn SecureSession>>,
    listener: Option<Arc<dyn ReverseListener>>,
    keepalive: Option<Keepalive>,
    closed: bool,
}

impl ReverseTunnel {
    pub fn new(cfg: TunnelConfig) -> Self {
        Self {
            cfg,
            transport: Arc::new(MuxTransport::new()),
            identity: Arc::new(OsIdentity),
            classifier: ErrorClassifier::default(),
            session: None,
            listener: None,
            keepalive: None,
            closed: false,
        }
    }

    pub fn with_transport(mut self, transport: Arc<dyn SecureTransport>) -> Self {
        self.transport = transport;
        self
    }

    pub fn with_identity(mut self, identity: Arc<dyn IdentitySource>) -> Self {
        self.identity = identity;
        self
    }

    pub fn with_classifier(mut self, classifier: ErrorClassifier) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn config(&self) -> &TunnelConfig {
        &self.cfg
    }

    /// The reverse listener, once `establish` got that far.
    pub fn listener(&self) -> Option<Arc<dyn ReverseListener>> {
        self.listener.clone()
    }

    pub fn session_open(&self) -> bool {
        self.session.as_ref().is_some_and(|s| !s.is_closed())
    }

    /// Opens the session, requests the reverse listener, starts the keepalive
    /// and returns what the relay says about itself.
    ///
    /// `ctx` governs the whole call and the keepalive that outlives it. When it
    /// flips to `true` mid-call the call returns [`TunnelError::Cancelled`].
    /// Partial state from a failed call is kept for `close` to release.
    pub async fn establish(
        &mut self,
        ctx: watch::Receiver<bool>,
    ) -> Result<ServerInfo, TunnelError> {
        if self.closed {
            return Err(TunnelError::Closed);
        }
        if self.session.is_some() {
            return Err(TunnelError::AlreadyEstablished);
        }

        let endpoint = transport::redacted(&self.cfg.endpoint);
        let span = self.cfg.span.clone();
        let stop = cancelled(ctx.clone());

        let res = tokio::select! {
            biased;
            _ = stop => Err(TunnelError::Cancelled { endpoint: endpoint.clone() }),
            res = self.establish_inner(ctx).instrument(span) => res,
        };
        if let Err(err) = &res {
            tracing::warn!(parent: &self.cfg.span, endpoint = %endpoint, err = %err, "tunnel: establish failed");
        }
        res
    }

    async fn establish_inner(
        &mut self,
        ctx: watch::Receiver<bool>,
    ) -> Result<ServerInfo, TunnelError> {
        if self.cfg.signers.is_empty() {
            return Err(TunnelError::NoSigners);
        }
        if self.cfg.keepalive_interval.is_zero() {
            return Err(TunnelError::InvalidKeepalive);
        }
        let endpoint = transport::redacted(&self.cfg.endpoint);

        let user = self.identity.username()?;
        let credential = identifier::encode(&Identifier::host(user.clone()))?;
        let client_cfg = ClientConfig {
            user: credential,
            signers: self.cfg.signers.clone(),
            client_version: CLIENT_VERSION.to_string(),
            host_key_policy: HostKeyPolicy::AcceptAny,
        };

        let session = transport::open_session(self.transport.as_ref(), &self.cfg.endpoint, &client_cfg)
            .await
            .map_err(|err| self.classifier.classify(&endpoint, err))?;
        self.session = Some(session.clone());
        tracing::info!(
            endpoint = %endpoint,
            user = %user,
            transport = ?transport::transport_kind(&self.cfg.endpoint),
            "tunnel: session established"
        );

        let ln = listener::request_listener(session.as_ref(), &endpoint, &self.cfg.rendezvous_key).await?;
        self.listener = Some(ln);

        self.keepalive = Some(keepalive::spawn(
            session.clone(),
            self.cfg.keepalive_interval,
            ctx,
            self.cfg.span.clone(),
        ));

        let info = server_info::fetch_server_info(session.as_ref(), &endpoint).await?;
        tracing::info!(endpoint = %endpoint, server_info = %info, "tunnel: ready");
        Ok(info)
    }

    /// Stops the keepalive, then closes the listener before the session.
    /// Later calls do nothing.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        if let Some(ka) = self.keepalive.take() {
            ka.shutdown().await;
        }
        listener::teardown(self.listener.take(), self.session.take())
            .instrument(self.cfg.span.clone())
            .await;
    }
}
