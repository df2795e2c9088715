//! Signing of broker requests with a shared secret.
//!
//! The signature is a keyed BLAKE3 hash of the payload. The key is derived
//! from the secret so secrets of any length can be used.

use secrecy::ExposeSecret;
use secrecy::SecretString;

/// The key derivation context.
const KEY_CONTEXT: &str = "slivka local queue 2024-05-01 request signing";

/// Signs and verifies broker requests.
#[derive(Clone)]
pub struct Signer {
    /// The derived signing key.
    key: [u8; blake3::KEY_LEN],
}

impl std::fmt::Debug for Signer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Signer").finish_non_exhaustive()
    }
}

impl Signer {
    /// Constructs a signer from a shared secret.
    pub fn new(secret: &SecretString) -> Self {
        Self {
            key: blake3::derive_key(KEY_CONTEXT, secret.expose_secret().as_bytes()),
        }
    }

    /// Signs a payload, returning the hex encoded signature.
    pub fn sign(&self, payload: &[u8]) -> String {
        hex::encode(blake3::keyed_hash(&self.key, payload).as_bytes())
    }

    /// Verifies the hex encoded signature of a payload.
    pub fn verify(&self, payload: &[u8], signature: &str) -> bool {
        let Ok(bytes) = hex::decode(signature) else {
            return false;
        };

        let Ok(bytes) = <[u8; blake3::OUT_LEN]>::try_from(bytes.as_slice()) else {
            return false;
        };

        // Comparing `Hash` values is constant time.
        blake3::keyed_hash(&self.key, payload) == blake3::Hash::from_bytes(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verifies_own_signatures() {
        let signer = Signer::new(&SecretString::from("hunter2"));
        let signature = signer.sign(b"payload");
        assert_eq!(signature.len(), 64);
        assert!(signer.verify(b"payload", &signature));
        assert!(!signer.verify(b"payload!", &signature));
        assert!(!signer.verify(b"payload", "zz"));
        assert!(!signer.verify(b"payload", &signature[..10]));
    }

    #[test]
    fn different_secrets_disagree() {
        let a = Signer::new(&SecretString::from("a"));
        let b = Signer::new(&SecretString::from("b"));
        assert!(!b.verify(b"payload", &a.sign(b"payload")));
    }
}
