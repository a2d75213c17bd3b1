//! Cryptographic primitives for driftmesh
//!
//! Safe wrappers around the Noise Protocol handshake, the Ed25519 identity
//! key pair, and fingerprint derivation. The Noise XX pattern provides the
//! three-message key agreement used by the handshake manager; identity
//! keys sign nothing yet but back the `public_key` field carried in
//! announces.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand_core::{CryptoRng, RngCore};
use sha2::{Digest, Sha256};
use snow::{Builder, HandshakeState, TransportState};

use crate::errors::{HandshakeError, Result};
use crate::types::NodeHash;

// ----------------------------------------------------------------------------
// Constants
// ----------------------------------------------------------------------------

/// Noise Protocol configuration for driftmesh secure links
pub const NOISE_PATTERN: &str = "Noise_XX_25519_ChaChaPoly_SHA256";

// ----------------------------------------------------------------------------
// Identity Key Pair (Ed25519)
// ----------------------------------------------------------------------------

/// Long-term Ed25519 identity key pair
///
/// Persistence of the key material is an external concern; the core only
/// receives the bytes on startup.
#[derive(Debug, Clone)]
pub struct IdentityKeyPair {
    signing_key: SigningKey,
    verifying_key: VerifyingKey,
}

impl IdentityKeyPair {
    /// Generate a new random identity
    pub fn generate() -> Self {
        let mut rng = rand_core::OsRng;
        Self::generate_with_rng(&mut rng)
    }

    /// Generate with a caller-supplied RNG
    pub fn generate_with_rng<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        let mut secret = [0u8; 32];
        rng.fill_bytes(&mut secret);
        let signing_key = SigningKey::from_bytes(&secret);
        let verifying_key = signing_key.verifying_key();
        Self {
            signing_key,
            verifying_key,
        }
    }

    /// Restore from persisted private key bytes
    pub fn from_bytes(private_key: &[u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(private_key);
        let verifying_key = signing_key.verifying_key();
        Self {
            signing_key,
            verifying_key,
        }
    }

    /// Public key bytes
    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.verifying_key.to_bytes()
    }

    /// Private key bytes, for external persistence
    pub fn private_key_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    /// Sign arbitrary bytes
    pub fn sign<T: AsRef<[u8]>>(&self, data: T) -> [u8; 64] {
        self.signing_key.sign(data.as_ref()).to_bytes()
    }

    /// Verify a signature made by another identity
    pub fn verify<D: AsRef<[u8]>>(
        public_key: &[u8; 32],
        data: D,
        signature: &[u8; 64],
    ) -> bool {
        let Ok(verifying_key) = VerifyingKey::from_bytes(public_key) else {
            return false;
        };
        let signature = Signature::from_bytes(signature);
        verifying_key.verify(data.as_ref(), &signature).is_ok()
    }

    /// Mesh address derived from this identity
    pub fn node_hash(&self) -> NodeHash {
        node_hash_from_public_key(&self.public_key_bytes())
    }
}

// ----------------------------------------------------------------------------
// Hash Derivation
// ----------------------------------------------------------------------------

/// Derive a 16-byte mesh address from a public key
pub fn node_hash_from_public_key(public_key: &[u8; 32]) -> NodeHash {
    let digest = Sha256::digest(public_key);
    let mut hash = [0u8; 16];
    hash.copy_from_slice(&digest[..16]);
    NodeHash::new(hash)
}

/// Full SHA-256 fingerprint of a public key, for logs and pinning display
pub fn fingerprint<T: AsRef<[u8]>>(public_key: T) -> [u8; 32] {
    let digest = Sha256::digest(public_key.as_ref());
    let mut out = [0u8; 32];
    out.copy_from_slice(&digest);
    out
}

// ----------------------------------------------------------------------------
// Noise Key Pair (X25519)
// ----------------------------------------------------------------------------

/// X25519 static key pair for Noise sessions
pub struct NoiseKeyPair {
    private_key: [u8; 32],
    public_key: [u8; 32],
}

impl NoiseKeyPair {
    /// Generate a fresh static key pair
    pub fn generate() -> Result<Self> {
        let builder = Builder::new(
            NOISE_PATTERN
                .parse()
                .map_err(HandshakeError::Noise)?,
        );
        let keypair = builder.generate_keypair().map_err(HandshakeError::Noise)?;

        let mut private_key = [0u8; 32];
        let mut public_key = [0u8; 32];
        private_key.copy_from_slice(&keypair.private);
        public_key.copy_from_slice(&keypair.public);
        Ok(Self {
            private_key,
            public_key,
        })
    }

    /// Public key bytes
    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.public_key
    }

    pub(crate) fn private_key_bytes(&self) -> [u8; 32] {
        self.private_key
    }
}

impl core::fmt::Debug for NoiseKeyPair {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("NoiseKeyPair")
            .field("public_key", &hex::encode(self.public_key))
            .finish_non_exhaustive()
    }
}

// ----------------------------------------------------------------------------
// Noise Handshake
// ----------------------------------------------------------------------------

/// In-flight Noise XX handshake state
pub struct NoiseHandshake {
    state: HandshakeState,
}

impl core::fmt::Debug for NoiseHandshake {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("NoiseHandshake").finish_non_exhaustive()
    }
}

impl NoiseHandshake {
    /// Create the initiator side
    pub fn initiator(local_key: &NoiseKeyPair) -> Result<Self> {
        let builder = Builder::new(NOISE_PATTERN.parse().map_err(HandshakeError::Noise)?);
        let state = builder
            .local_private_key(&local_key.private_key_bytes())
            .build_initiator()
            .map_err(HandshakeError::Noise)?;
        Ok(Self { state })
    }

    /// Create the responder side
    pub fn responder(local_key: &NoiseKeyPair) -> Result<Self> {
        let builder = Builder::new(NOISE_PATTERN.parse().map_err(HandshakeError::Noise)?);
        let state = builder
            .local_private_key(&local_key.private_key_bytes())
            .build_responder()
            .map_err(HandshakeError::Noise)?;
        Ok(Self { state })
    }

    /// Produce the next outbound handshake message
    pub fn write_message(&mut self, payload: &[u8]) -> Result<Vec<u8>> {
        let mut output = vec![0u8; 1024];
        let len = self
            .state
            .write_message(payload, &mut output)
            .map_err(HandshakeError::Noise)?;
        output.truncate(len);
        Ok(output)
    }

    /// Consume an inbound handshake message
    pub fn read_message(&mut self, input: &[u8]) -> Result<Vec<u8>> {
        let mut output = vec![0u8; 1024];
        let len = self
            .state
            .read_message(input, &mut output)
            .map_err(HandshakeError::Noise)?;
        output.truncate(len);
        Ok(output)
    }

    /// Whether all three messages have been exchanged
    pub fn is_finished(&self) -> bool {
        self.state.is_handshake_finished()
    }

    /// Remote static key, once the handshake has revealed it
    pub fn remote_static(&self) -> Option<[u8; 32]> {
        self.state.get_remote_static().map(|key| {
            let mut bytes = [0u8; 32];
            bytes.copy_from_slice(key);
            bytes
        })
    }

    /// Split into the transport cipher states
    pub fn into_transport(self) -> Result<NoiseTransport> {
        let state = self
            .state
            .into_transport_mode()
            .map_err(HandshakeError::Noise)?;
        Ok(NoiseTransport { state })
    }
}

// ----------------------------------------------------------------------------
// Noise Transport
// ----------------------------------------------------------------------------

/// Established Noise cipher pair
///
/// The underlying state keeps one nonce counter per direction; callers
/// must serialise access per direction, which [`crate::handshake::SecureLink`]
/// does with a mutex.
pub struct NoiseTransport {
    state: TransportState,
}

impl core::fmt::Debug for NoiseTransport {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("NoiseTransport").finish_non_exhaustive()
    }
}

impl NoiseTransport {
    /// Encrypt a plaintext
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut output = vec![0u8; plaintext.len() + 16];
        let len = self
            .state
            .write_message(plaintext, &mut output)
            .map_err(HandshakeError::Noise)?;
        output.truncate(len);
        Ok(output)
    }

    /// Decrypt and authenticate a ciphertext
    pub fn decrypt(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        let mut output = vec![0u8; ciphertext.len()];
        let len = self
            .state
            .read_message(ciphertext, &mut output)
            .map_err(HandshakeError::Noise)?;
        output.truncate(len);
        Ok(output)
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
