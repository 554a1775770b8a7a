use hmac::{Hmac, Mac};
use sha2::Sha256;

/// Signs and validates the `inner` bytes of an [`crate::Envelope`].
///
/// Treated as an opaque capability supplied by the caller; kept as a trait
/// so a node can be wired up with either a real signer or a no-op one for
/// tests, favoring per-instance configuration over a process-wide signer.
pub trait Verifier: Send + Sync {
    fn sign(&self, data: &[u8]) -> Vec<u8>;

    fn verify(&self, data: &[u8], signature: &[u8]) -> bool;
}

/// Never fails verification; used when message-level signing is disabled.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopVerifier;

impl Verifier for NoopVerifier {
    fn sign(&self, _data: &[u8]) -> Vec<u8> {
        Vec::new()
    }

    fn verify(&self, _data: &[u8], _signature: &[u8]) -> bool {
        true
    }
}

type HmacSha256 = Hmac<Sha256>;

/// HMAC-SHA256 signer keyed by a shared secret.
#[derive(Clone)]
pub struct HmacVerifier {
    key: Vec<u8>,
}

impl HmacVerifier {
    pub fn new(key: impl Into<Vec<u8>>) -> Self {
        Self { key: key.into() }
    }

    fn mac(&self) -> HmacSha256 {
        HmacSha256::new_from_slice(&self.key).expect("HMAC accepts keys of any length")
    }
}

impl Verifier for HmacVerifier {
    fn sign(&self, data: &[u8]) -> Vec<u8> {
        let mut mac = self.mac();
        mac.update(data);
        mac.finalize().into_bytes().to_vec()
    }

    fn verify(&self, data: &[u8], signature: &[u8]) -> bool {
        let mut mac = self.mac();
        mac.update(data);
        mac.verify_slice(signature).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hmac_round_trips() {
        let v = HmacVerifier::new(b"secret".to_vec());
        let sig = v.sign(b"hello");
        assert!(v.verify(b"hello", &sig));
        assert!(!v.verify(b"goodbye", &sig));
    }

    #[test]
    fn noop_always_verifies() {
        let v = NoopVerifier;
        assert!(v.verify(b"anything", b"garbage"));
    }
}
