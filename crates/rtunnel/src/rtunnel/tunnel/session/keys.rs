use std::{fs, path::Path};

use anyhow::Context;
use base64::{Engine as _, engine::general_purpose::STANDARD};
use ring::{
    rand::SystemRandom,
    signature::{Ed25519KeyPair, KeyPair},
};

use crate::rtunnel::tunnel::session::{SessionError, Signer};

pub const ED25519: &str = "ed25519";

/// Ed25519 private key stored as PKCS#8 v2.
pub struct Ed25519Signer {
    pair: Ed25519KeyPair,
}

impl std::fmt::Debug for Ed25519Signer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ed25519Signer")
            .field("public_key", &STANDARD.encode(self.pair.public_key().as_ref()))
            .finish()
    }
}

impl Ed25519Signer {
    pub fn generate_pkcs8() -> Result<Vec<u8>, SessionError> {
        let rng = SystemRandom::new();
        let doc = Ed25519KeyPair::generate_pkcs8(&rng)
            .map_err(|_| SessionError::Sign("generate ed25519 key".into()))?;
        Ok(doc.as_ref().to_vec())
    }

    pub fn from_pkcs8(der: &[u8]) -> Result<Self, SessionError> {
        let pair = Ed25519KeyPair::from_pkcs8(der)
            .map_err(|e| SessionError::Sign(format!("parse pkcs8: {e}")))?;
        Ok(Self { pair })
    }

    pub fn generate() -> Result<Self, SessionError> {
        Self::from_pkcs8(&Self::generate_pkcs8()?)
    }

    /// Reads a key file holding base64 encoded PKCS#8.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
        let der = STANDARD
            .decode(text.trim())
            .with_context(|| format!("decode base64 {}", path.display()))?;
        Self::from_pkcs8(&der).with_context(|| format!("load key {}", path.display()))
    }
}

pub fn encode_pkcs8(der: &[u8]) -> String {
    STANDARD.encode(der)
}

impl Signer for Ed25519Signer {
    fn algorithm(&self) -> &'static str {
        ED25519
    }

    fn public_key(&self) -> Vec<u8> {
        self.pair.public_key().as_ref().to_vec()
    }

    fn sign(&self, data: &[u8]) -> Result<Vec<u8>, SessionError> {
        Ok(self.pair.sign(data).as_ref().to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ring::signature::{ED25519, UnparsedPublicKey};

    #[test]
    fn signature_verifies_against_public_key() {
        let signer = Ed25519Signer::generate().unwrap();
        let sig = signer.sign(b"nonce+user").unwrap();

        let pk = UnparsedPublicKey::new(&ED25519, signer.public_key());
        assert!(pk.verify(b"nonce+user", &sig).is_ok());
        assert!(pk.verify(b"other", &sig).is_err());
    }

    #[test]
    fn load_reads_base64_key_file() {
        let mut p = std::env::temp_dir();
        p.push(format!("rtunnel_key_test_{}", std::process::id()));
        let der = Ed25519Signer::generate_pkcs8().unwrap();
        std::fs::write(&p, format!("{}\n", encode_pkcs8(&der))).expect("write");

        let loaded = Ed25519Signer::load(&p).expect("load");
        let direct = Ed25519Signer::from_pkcs8(&der).unwrap();
        assert_eq!(loaded.public_key(), direct.public_key());

        let _ = std::fs::remove_file(&p);
    }

    #[test]
    fn rejects_garbage_der() {
        assert!(Ed25519Signer::from_pkcs8(b"not a key").is_err());
    }
}
