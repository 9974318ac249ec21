use thiserror::Error;

use crate::rtunnel::tunnel::{
    identifier::EncodingError, identity::IdentityError, session::SessionError,
};

/// The peer rejected every offered key.
#[derive(Debug, Error)]
#[error("{endpoint}: Permission denied (publickey).")]
pub struct PermissionDeniedError {
    pub endpoint: String,
    #[source]
    pub source: SessionError,
}

#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("tunnel: at least one signer is required")]
    NoSigners,

    #[error("tunnel: keepalive interval must be positive")]
    InvalidKeepalive,

    #[error("tunnel: already established")]
    AlreadyEstablished,

    #[error("tunnel: closed")]
    Closed,

    #[error(transparent)]
    Identity(#[from] IdentityError),

    #[error(transparent)]
    Encoding(#[from] EncodingError),

    #[error(transparent)]
    PermissionDenied(#[from] PermissionDeniedError),

    #[error("{endpoint}: dial error: {source}")]
    Dial {
        endpoint: String,
        #[source]
        source: SessionError,
    },

    #[error("{endpoint}: unable to create reverse tunnel for {key:?}: {source}")]
    Listener {
        endpoint: String,
        key: String,
        #[source]
        source: SessionError,
    },

    #[error("{endpoint}: error fetching server info: {reason}")]
    Protocol {
        endpoint: String,
        reason: String,
        #[source]
        source: Option<SessionError>,
    },

    #[error("{endpoint}: error decoding server info: {source}")]
    Decode {
        endpoint: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("{endpoint}: establish cancelled")]
    Cancelled { endpoint: String },
}

impl TunnelError {
    pub fn is_permission_denied(&self) -> bool {
        matches!(self, TunnelError::PermissionDenied(_))
    }
}
