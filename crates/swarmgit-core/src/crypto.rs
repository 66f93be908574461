//! Cryptographic primitives for Swarmgit.
//!
//! Provides two things:
//!   1. BLAKE3 hashing: chunk ids, packfile ids, discovery keys
//!   2. Signed requests: every privileged request carries a signature
//!      from which the server recovers the requester's address
//!
//! A signature on the wire is the signer's ed25519 verifying key followed
//! by the ed25519 signature over the BLAKE3 hash of the signed bytes. The
//! requester's [`Address`] is the first 20 bytes of the BLAKE3 hash of the
//! verifying key, so recovering an address needs nothing but the signature.

use std::fmt;
use std::path::Path;

use bytes::Bytes;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use thiserror::Error;
use zeroize::Zeroizing;

// ── BLAKE3 ────────────────────────────────────────────────────────────────────

/// Hash a byte slice, returning a 32-byte BLAKE3 digest.
pub fn hash(data: &[u8]) -> [u8; 32] {
    *blake3::hash(data).as_bytes()
}

/// Incremental BLAKE3 hasher for payloads that arrive in pieces.
///
/// # Example
/// ```
/// use swarmgit_core::crypto::Hasher;
/// let mut h = Hasher::new();
/// h.update(b"hello ");
/// h.update(b"world");
/// let digest = h.finalize();
/// assert_eq!(digest, swarmgit_core::crypto::hash(b"hello world"));
/// ```
pub struct Hasher(blake3::Hasher);

impl Hasher {
    pub fn new() -> Self {
        Self(blake3::Hasher::new())
    }

    pub fn update(&mut self, data: &[u8]) {
        self.0.update(data);
    }

    pub fn finalize(self) -> [u8; 32] {
        *self.0.finalize().as_bytes()
    }
}

impl Default for Hasher {
    fn default() -> Self {
        Self::new()
    }
}

// ── Addresses ─────────────────────────────────────────────────────────────────

/// Width of an encoded signature: verifying key followed by the signature.
pub const SIGNATURE_LEN: usize = 32 + 64;

/// Identity the access-control layer reasons about.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address(pub [u8; 20]);

impl Address {
    /// Derive the address owned by a verifying key.
    pub fn from_verifying_key(key: &[u8; 32]) -> Self {
        let digest = hash(key);
        let mut addr = [0u8; 20];
        addr.copy_from_slice(&digest[..20]);
        Address(addr)
    }

    /// Parse `0x`-prefixed or bare hex.
    pub fn from_hex(s: &str) -> Result<Self, CryptoError> {
        let trimmed = s.strip_prefix("0x").unwrap_or(s);
        let bytes = hex::decode(trimmed).map_err(|_| CryptoError::BadAddress(s.to_string()))?;
        let addr: [u8; 20] = bytes
            .try_into()
            .map_err(|_| CryptoError::BadAddress(s.to_string()))?;
        Ok(Address(addr))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({})", self)
    }
}

// ── Keypair ───────────────────────────────────────────────────────────────────

/// A node's long-term signing identity.
///
/// Generated once per node and stored persistently. The verifying key doubles
/// as the node's peer id on the network.
pub struct Keypair {
    signing: SigningKey,
}

impl Keypair {
    /// Generate a new random keypair.
    pub fn generate() -> Self {
        Self {
            signing: SigningKey::generate(&mut rand::rngs::OsRng),
        }
    }

    /// Reconstruct a keypair from stored secret bytes.
    pub fn from_secret(secret: [u8; 32]) -> Self {
        let secret = Zeroizing::new(secret);
        Self {
            signing: SigningKey::from_bytes(&secret),
        }
    }

    /// Serialize the secret key for persistent storage.
    pub fn secret_bytes(&self) -> Zeroizing<[u8; 32]> {
        Zeroizing::new(self.signing.to_bytes())
    }

    /// Verifying key bytes, the node's public identity.
    pub fn public(&self) -> [u8; 32] {
        self.signing.verifying_key().to_bytes()
    }

    pub fn address(&self) -> Address {
        Address::from_verifying_key(&self.public())
    }

    /// Sign the BLAKE3 hash of `data`.
    pub fn sign_hash(&self, data: &[u8]) -> Bytes {
        let signature = self.signing.sign(&hash(data));
        let mut out = Vec::with_capacity(SIGNATURE_LEN);
        out.extend_from_slice(&self.public());
        out.extend_from_slice(&signature.to_bytes());
        Bytes::from(out)
    }

    /// Load the keypair at `path`, generating and saving a new one if absent.
    pub fn load_or_generate(path: &Path) -> Result<Self, CryptoError> {
        match std::fs::read(path) {
            Ok(bytes) => {
                let secret: [u8; 32] = bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| CryptoError::BadKeyFile(path.display().to_string()))?;
                Ok(Self::from_secret(secret))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let keypair = Self::generate();
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::write(path, keypair.secret_bytes().as_slice())?;
                #[cfg(unix)]
                {
                    use std::os::unix::fs::PermissionsExt;
                    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
                }
                Ok(keypair)
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Recover the address that produced `signature` over the hash of `data`.
///
/// Fails if the signature is malformed or does not verify.
pub fn addr_from_signed_hash(data: &[u8], signature: &[u8]) -> Result<Address, CryptoError> {
    if signature.len() != SIGNATURE_LEN {
        return Err(CryptoError::BadSignatureLength(signature.len()));
    }
    let mut key = [0u8; 32];
    key.copy_from_slice(&signature[..32]);
    let mut sig = [0u8; 64];
    sig.copy_from_slice(&signature[32..]);

    let verifying = VerifyingKey::from_bytes(&key).map_err(|_| CryptoError::BadSignature)?;
    verifying
        .verify(&hash(data), &Signature::from_bytes(&sig))
        .map_err(|_| CryptoError::BadSignature)?;
    Ok(Address::from_verifying_key(&key))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("signature must be {} bytes, got {0}", SIGNATURE_LEN)]
    BadSignatureLength(usize),

    #[error("signature does not verify")]
    BadSignature,

    #[error("invalid address: {0}")]
    BadAddress(String),

    #[error("key file {0} is not a 32-byte secret")]
    BadKeyFile(String),

    #[error("key file i/o failed: {0}")]
    Io(#[from] std::io::Error),
}

// ── Tests ─────────────────────────────────────────────────────────────────────
