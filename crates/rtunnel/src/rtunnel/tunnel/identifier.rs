use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdentifierKind {
    Host,
    Client,
}

/// Identity presented to the relay as the authentication user name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identifier {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: IdentifierKind,
}

impl Identifier {
    pub fn host(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: IdentifierKind::Host,
        }
    }
}

#[derive(Debug, Error)]
pub enum EncodingError {
    #[error("identifier: empty id")]
    EmptyId,
    #[error("identifier: id {0:?} contains control characters")]
    InvalidId(String),
    #[error("identifier: credential is not base64: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("identifier: credential is not an identifier: {0}")]
    Json(#[from] serde_json::Error),
}

fn validate(id: &Identifier) -> Result<(), EncodingError> {
    if id.id.is_empty() {
        return Err(EncodingError::EmptyId);
    }
    // Display names such as "John Smith" are legal.
    if id.id.chars().any(char::is_control) {
        return Err(EncodingError::InvalidId(id.id.clone()));
    }
    Ok(())
}

/// Encodes an identifier into a URL-safe credential. Equal identifiers always
/// yield equal credentials.
pub fn encode(id: &Identifier) -> Result<String, EncodingError> {
    validate(id)?;
    let b = serde_json::to_vec(id)?;
    Ok(URL_SAFE_NO_PAD.encode(b))
}

pub fn decode(credential: &str) -> Result<Identifier, EncodingError> {
    let b = URL_SAFE_NO_PAD.decode(credential.as_bytes())?;
    let id: Identifier = serde_json::from_slice(&b)?;
    validate(&id)?;
    Ok(id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encoding_is_deterministic_and_url_safe() {
        let id = Identifier::host("alice");
        let a = encode(&id).unwrap();
        let b = encode(&id.clone()).unwrap();
        assert_eq!(a, b);
        assert!(
            a.chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'),
            "credential {a:?} must be URL-safe"
        );
        assert_eq!(decode(&a).unwrap(), id);
    }

    #[test]
    fn kind_is_part_of_the_credential() {
        let host = encode(&Identifier::host("alice")).unwrap();
        let client = encode(&Identifier {
            id: "alice".into(),
            kind: IdentifierKind::Client,
        })
        .unwrap();
        assert_ne!(host, client);
    }

    #[test]
    fn names_with_spaces_are_accepted() {
        let id = Identifier::host("John Smith");
        let cred = encode(&id).unwrap();
        assert!(!cred.contains(' '));
        assert_eq!(decode(&cred).unwrap(), id);
    }

    #[test]
    fn malformed_identifiers_are_rejected() {
        assert!(matches!(
            encode(&Identifier::host("")),
            Err(EncodingError::EmptyId)
        ));
        for bad in ["al\tice", "alice\n", "a\u{0}b"] {
            assert!(
                matches!(encode(&Identifier::host(bad)), Err(EncodingError::InvalidId(_))),
                "{bad:?}"
            );
        }
        assert!(matches!(decode("%%%"), Err(EncodingError::Base64(_))));
        assert!(matches!(
            decode(&URL_SAFE_NO_PAD.encode(b"[]")),
            Err(EncodingError::Json(_))
        ));
    }
}
