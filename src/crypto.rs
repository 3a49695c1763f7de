//! Key material and derivation helpers.
//!
//! Everything key-shaped in parcel is 32 bytes:
//! - X25519 scalars and public points,
//! - the per-connection control key (client ↔ daemon),
//! - the group session key (rotated on every membership change).
//!
//! Keys are wrapped in [`SecretKey`], which zeroes its memory on drop.

use rand::RngCore;
use sha2::{Digest, Sha256};
use thiserror::Error;
use x25519_dalek::{x25519, X25519_BASEPOINT_BYTES};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Length of every key, scalar, and curve point in the protocol.
pub const KEY_LEN: usize = 32;

/// Bytes of the fingerprint shown to the user.
pub const FINGERPRINT_DISPLAY_LEN: usize = 16;

/// A 32-byte symmetric key or X25519 scalar.
///
/// Memory is zeroed on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SecretKey(pub [u8; KEY_LEN]);

impl SecretKey {
    /// Borrow the raw key bytes.
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    /// Wrap existing key bytes.
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    /// Sample a fresh key from the OS entropy pool.
    pub fn random() -> Self {
        let mut bytes = [0u8; KEY_LEN];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }
}

impl std::fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Key material stays out of logs.
        f.write_str("SecretKey(..)")
    }
}

/// Scalar-multiplication failures.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// The peer supplied a low-order point; the shared output would be zero.
    #[error("low-order public point")]
    LowOrderPoint,
}

/// Public point for a scalar: `X25519(scalar, basepoint)`.
pub fn public_point(scalar: &SecretKey) -> [u8; KEY_LEN] {
    x25519(scalar.0, X25519_BASEPOINT_BYTES)
}

/// Mix a scalar into a curve point: `X25519(scalar, point)`.
///
/// Clamping is applied per scalar, so repeated mixing by different parties
/// commutes; the group rekey relies on that. An all-zero output means the
/// input point was low-order and contributes nothing, which is rejected.
pub fn mix(scalar: &SecretKey, point: &[u8; KEY_LEN]) -> Result<[u8; KEY_LEN], CryptoError> {
    let shared = x25519(scalar.0, *point);
    if shared == [0u8; KEY_LEN] {
        return Err(CryptoError::LowOrderPoint);
    }
    Ok(shared)
}

/// Derive a symmetric key from shared point material: `SHA-256(point)`.
pub fn derive_key(shared: &[u8; KEY_LEN]) -> SecretKey {
    let digest = Sha256::digest(shared);
    let mut key = [0u8; KEY_LEN];
    key.copy_from_slice(&digest);
    SecretKey(key)
}

/// Identity fingerprint: `SHA-256` of public key material.
pub fn fingerprint(public: &[u8; KEY_LEN]) -> [u8; KEY_LEN] {
    let digest = Sha256::digest(public);
    let mut out = [0u8; KEY_LEN];
    out.copy_from_slice(&digest);
    out
}

/// Truncated hex rendering of a fingerprint for out-of-band comparison.
pub fn fingerprint_display(fingerprint: &[u8; KEY_LEN]) -> String {
    hex::encode(&fingerprint[..FINGERPRINT_DISPLAY_LEN])
}
