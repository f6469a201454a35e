//! WireGuard key pairs.
//!
//! Keys are Curve25519 and travel base64 encoded (44 characters), the same
//! representation `wg genkey` / `wg pubkey` use.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use rand::rngs::OsRng;
use x25519_dalek::{PublicKey, StaticSecret};

/// A base64 encoded private/public key pair
#[derive(Clone, PartialEq, Eq)]
pub struct KeyPair {
    /// Private key, base64
    pub private_key: String,
    /// Public key, base64
    pub public_key: String,
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("private_key", &"<redacted>")
            .field("public_key", &self.public_key)
            .finish()
    }
}

impl KeyPair {
    /// Generate a fresh key pair from the OS random source
    #[must_use]
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self {
            private_key: STANDARD.encode(secret.to_bytes()),
            public_key: STANDARD.encode(public.as_bytes()),
        }
    }

    /// Rebuild a pair from a stored private key; `None` if it is not a
    /// base64 encoded 32 byte key
    #[must_use]
    pub fn from_private_key(private_key: &str) -> Option<Self> {
        let bytes: [u8; 32] = STANDARD.decode(private_key).ok()?.try_into().ok()?;
        let secret = StaticSecret::from(bytes);
        let public = PublicKey::from(&secret);
        Some(Self {
            private_key: private_key.to_string(),
            public_key: STANDARD.encode(public.as_bytes()),
        })
    }
}
