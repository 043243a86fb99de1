//! RSA-PSS/SHA-256 signatures over show-event `src` fields.
//!
//! The salt is the maximum the key allows (`modulus bytes - hash - 2`) on
//! both sides, so signatures interoperate with PSS "max length" signers.

use base64::{engine::general_purpose::STANDARD as B64, Engine as _};
use rsa::pkcs8::{DecodePublicKey, EncodePublicKey, LineEnding};
use rsa::pss::{Signature, SigningKey, VerifyingKey};
use rsa::signature::{RandomizedSigner, SignatureEncoding, Verifier as _};
use rsa::traits::PublicKeyParts;
use rsa::{RsaPrivateKey, RsaPublicKey};
use serde_json::{Map, Value};
use sha2::Sha256;

use crate::error::SyncError;
use crate::show::ShowEvent;

/// Key of the signature inside a signed message.
pub const SIGNATURE_FIELD: &str = "__signature__";

const SHA256_LEN: usize = 32;

fn max_salt_len(key: &impl PublicKeyParts) -> usize {
    key.size().saturating_sub(SHA256_LEN + 2)
}

/// The primary's private key. It is generated per process and never
/// serialised; only the public half is exported.
pub struct Signer {
    key: SigningKey<Sha256>,
    public_pem: String,
}

impl std::fmt::Debug for Signer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Signer").finish_non_exhaustive()
    }
}

impl Signer {
    /// Generate a fresh keypair off the async runtime.
    pub async fn generate(bits: usize) -> anyhow::Result<Self> {
        let key = tokio::task::spawn_blocking(move || {
            RsaPrivateKey::new(&mut rand::thread_rng(), bits)
        })
        .await??;
        Ok(Self::from_key(key)?)
    }

    pub fn from_key(key: RsaPrivateKey) -> Result<Self, SyncError> {
        let public_pem = key
            .to_public_key()
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| SyncError::Signing(e.to_string()))?;
        let salt = max_salt_len(&key);
        Ok(Self {
            key: SigningKey::new_with_salt_len(key, salt),
            public_pem,
        })
    }

    /// SubjectPublicKeyInfo PEM of the public half.
    pub fn public_key_pem(&self) -> &str {
        &self.public_pem
    }

    /// Base64 signature of `data`.
    pub fn sign(&self, data: &[u8]) -> Result<String, SyncError> {
        let sig = self
            .key
            .try_sign_with_rng(&mut rand::thread_rng(), data)
            .map_err(|e| SyncError::Signing(e.to_string()))?;
        Ok(B64.encode(sig.to_bytes()))
    }

    /// `{target, ...show, __signature__}` ready for the pairing channel.
    pub fn sign_show(&self, target: &str, show: &ShowEvent) -> Result<Value, SyncError> {
        let mut msg = Map::new();
        msg.insert("target".into(), Value::String(target.to_string()));
        if let Value::Object(fields) = show.payload() {
            msg.extend(fields);
        }
        msg.insert(
            SIGNATURE_FIELD.into(),
            Value::String(self.sign(show.src.as_bytes())?),
        );
        Ok(Value::Object(msg))
    }
}

/// A primary's public key as cached by a secondary.
#[derive(Debug, Clone)]
pub struct Verifier {
    key: VerifyingKey<Sha256>,
    pem: String,
}

impl Verifier {
    pub fn from_pem(pem: &str) -> Result<Self, SyncError> {
        let public =
            RsaPublicKey::from_public_key_pem(pem).map_err(|e| SyncError::BadKey(e.to_string()))?;
        let salt = max_salt_len(&public);
        Ok(Self {
            key: VerifyingKey::new_with_salt_len(public, salt),
            pem: pem.to_string(),
        })
    }

    pub fn pem(&self) -> &str {
        &self.pem
    }

    pub fn verify(&self, data: &[u8], signature_b64: &str) -> Result<(), SyncError> {
        let raw = B64
            .decode(signature_b64.trim())
            .map_err(|_| SyncError::BadSignature)?;
        let sig = Signature::try_from(raw.as_slice()).map_err(|_| SyncError::BadSignature)?;
        self.key
            .verify(data, &sig)
            .map_err(|_| SyncError::BadSignature)
    }

    /// Check a signed show message and strip it down to the event.
    pub fn verify_show(&self, msg: &Value) -> Result<ShowEvent, SyncError> {
        let signature = msg
            .get(SIGNATURE_FIELD)
            .and_then(Value::as_str)
            .ok_or(SyncError::MissingSignature)?;
        let show: ShowEvent = serde_json::from_value(msg.clone())
            .map_err(|e| SyncError::Transport(format!("malformed show-event: {e}")))?;
        self.verify(show.src.as_bytes(), signature)?;
        Ok(show)
    }
}
