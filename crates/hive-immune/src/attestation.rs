//! Keyed-hash attestation of computed results.
//!
//! An [`Attestation`] is `BLAKE3-keyed(key, len(data) || data || ":" || signer_id)`.
//! Every bee in a cluster shares the key, so a valid attestation shows the
//! data was not altered in transit and names the bee that claims it.
//!
//! # Limitations
//!
//! This is an integrity check, not a signature. Anyone holding the cluster
//! key can attest on behalf of any id. Replacing it with per-bee asymmetric
//! keys is a hardening step that the callers do not need to change for.

use std::fmt;

use crate::error::{ImmuneError, Result};

/// Context string for the built-in cluster key.
const DEFAULT_KEY_CONTEXT: &str = "hive 2024 attestation default cluster key";

/// Attestation over a result, bound to a signer id.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Attestation(blake3::Hash);

impl Attestation {
    /// Lowercase hex, 64 characters.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0.as_bytes())
    }

    /// Parse the output of [`Attestation::to_hex`].
    pub fn from_hex(text: &str) -> Result<Self> {
        let bytes = hex::decode(text.trim())
            .map_err(|e| ImmuneError::MalformedAttestation(e.to_string()))?;
        let bytes: [u8; 32] = bytes.try_into().map_err(|v: Vec<u8>| {
            ImmuneError::MalformedAttestation(format!("expected 32 bytes, got {}", v.len()))
        })?;
        Ok(Self(blake3::Hash::from(bytes)))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        self.0.as_bytes()
    }
}

impl fmt::Debug for Attestation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Attestation({})", &self.to_hex()[..16])
    }
}

impl fmt::Display for Attestation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Signs and verifies results with a shared cluster key.
#[derive(Clone)]
pub struct Attestor {
    key: [u8; 32],
}

impl Default for Attestor {
    fn default() -> Self {
        Self::new(blake3::derive_key(DEFAULT_KEY_CONTEXT, b"hive"))
    }
}

impl Attestor {
    pub fn new(key: [u8; 32]) -> Self {
        Self { key }
    }

    /// Parse a 64-character hex key.
    pub fn from_hex_key(text: &str) -> Result<Self> {
        let key = Attestation::from_hex(text)?;
        Ok(Self::new(*key.as_bytes()))
    }

    /// Attest `data` as produced by `signer_id`.
    pub fn sign(&self, data: &[u8], signer_id: &str) -> Attestation {
        let mut hasher = blake3::Hasher::new_keyed(&self.key);
        // Length prefix keeps (data, id) pairs from colliding across the ':' boundary
        hasher.update(&(data.len() as u64).to_le_bytes());
        hasher.update(data);
        hasher.update(b":");
        hasher.update(signer_id.as_bytes());
        Attestation(hasher.finalize())
    }

    /// Whether `attestation` matches `data` from `claimed_signer`.
    ///
    /// Comparison is constant-time.
    pub fn verify(&self, data: &[u8], attestation: &Attestation, claimed_signer: &str) -> bool {
        self.sign(data, claimed_signer) == *attestation
    }

    /// [`Attestor::verify`] over hex text; malformed text does not verify.
    pub fn verify_hex(&self, data: &[u8], attestation: &str, claimed_signer: &str) -> bool {
        Attestation::from_hex(attestation)
            .map(|a| self.verify(data, &a, claimed_signer))
            .unwrap_or(false)
    }
}

impl fmt::Debug for Attestor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Attestor").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_then_verify() {
        let attestor = Attestor::default();
        let sig = attestor.sign(b"block result", "bee-1");
        assert!(attestor.verify(b"block result", &sig, "bee-1"));
    }

    #[test]
    fn wrong_signer_or_data_fails() {
        let attestor = Attestor::default();
        let sig = attestor.sign(b"block result", "bee-1");
        assert!(!attestor.verify(b"block result", &sig, "bee-2"));
        assert!(!attestor.verify(b"block resulT", &sig, "bee-1"));
    }

    #[test]
    fn boundary_shift_does_not_collide() {
        let attestor = Attestor::default();
        assert_ne!(attestor.sign(b"ab", "c"), attestor.sign(b"a", "bc"));
        assert_ne!(attestor.sign(b"a:", "b"), attestor.sign(b"a", ":b"));
    }

    #[test]
    fn different_keys_disagree() {
        let a = Attestor::new([1u8; 32]);
        let b = Attestor::new([2u8; 32]);
        let sig = a.sign(b"x", "bee-1");
        assert!(!b.verify(b"x", &sig, "bee-1"));
    }

    #[test]
    fn hex_round_trip_and_rejects() {
        let attestor = Attestor::default();
        let sig = attestor.sign(b"payload", "bee-9");
        let text = sig.to_hex();
        assert_eq!(text.len(), 64);
        assert!(attestor.verify_hex(b"payload", &text, "bee-9"));

        assert!(Attestation::from_hex("zz").is_err());
        assert!(Attestation::from_hex("abcd").is_err());
        assert!(!attestor.verify_hex(b"payload", "not hex", "bee-9"));
    }

    #[test]
    fn hex_key_parses() {
        let key = "11".repeat(32);
        let attestor = Attestor::from_hex_key(&key).unwrap();
        let direct = Attestor::new([0x11; 32]);
        assert_eq!(attestor.sign(b"x", "y"), direct.sign(b"x", "y"));
        assert!(Attestor::from_hex_key("11").is_err());
    }
}
