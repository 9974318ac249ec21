use std::sync::Arc;

use crate::rtunnel::tunnel::{
    error::{PermissionDeniedError, TunnelError},
    session::{NO_ACCEPTABLE_AUTH, SessionError},
};

pub type AuthRejectedRule = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// Sorts dial failures into permission-denied and everything else.
///
/// The decision is made on the error text only; the default rule looks for
/// [`NO_ACCEPTABLE_AUTH`].
#[derive(Clone)]
pub struct ErrorClassifier {
    rule: AuthRejectedRule,
}

impl std::fmt::Debug for ErrorClassifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ErrorClassifier").finish_non_exhaustive()
    }
}

impl Default for ErrorClassifier {
    fn default() -> Self {
        Self::with_rule(|msg| msg.contains(NO_ACCEPTABLE_AUTH))
    }
}

impl ErrorClassifier {
    pub fn with_rule(rule: impl Fn(&str) -> bool + Send + Sync + 'static) -> Self {
        Self {
            rule: Arc::new(rule),
        }
    }

    pub fn is_auth_rejected(&self, msg: &str) -> bool {
        (self.rule)(msg)
    }

    pub fn classify(&self, endpoint: &str, err: SessionError) -> TunnelError {
        if self.is_auth_rejected(&err.to_string()) {
            return PermissionDeniedError {
                endpoint: endpoint.to_string(),
                source: err,
            }
            .into();
        }
        TunnelError::Dial {
            endpoint: endpoint.to_string(),
            source: err,
        }
    }
}
