//! RSA key pairs and block sealing.
//!
//! PKCS#1 v1.5 encryption can only take `modulus_bytes - 11` bytes of
//! plaintext at a time, so messages are cut into blocks of at most that
//! size and each block is encrypted on its own. The receiver decrypts the
//! blocks in order and concatenates them.

use std::fmt;

use rsa::pkcs1::{DecodeRsaPublicKey, EncodeRsaPublicKey};
use rsa::rand_core::OsRng;
use rsa::traits::PublicKeyParts;
use rsa::{Pkcs1v15Encrypt, RsaPrivateKey, RsaPublicKey};
use troupe_protocol::{EncryptionKey, SafeMessage};

/// PKCS#1 v1.5 padding overhead per block.
const PADDING_OVERHEAD: usize = 11;

/// Errors from the secure channel's cryptography.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    /// Generating a key pair failed (usually an unsupported size).
    #[error("key generation failed: {0}")]
    KeyGeneration(#[source] rsa::Error),

    /// Encrypting a block with the peer's key failed.
    #[error("encryption failed: {0}")]
    Encrypt(#[source] rsa::Error),

    /// Decrypting a block with our key failed.
    #[error("decryption failed: {0}")]
    Decrypt(#[source] rsa::Error),

    /// A received or generated public key can't be used.
    #[error("invalid key: {0}")]
    InvalidKey(String),
}

/// Our own key pair: decrypts what peers seal for us.
pub struct KeyPair {
    private: RsaPrivateKey,
    public: EncryptionKey,
}

impl KeyPair {
    /// Generates a fresh key pair with a `bits`-bit modulus.
    ///
    /// CPU-bound; takes noticeably long for large keys.
    pub fn generate(bits: usize) -> Result<Self, CryptoError> {
        let private = RsaPrivateKey::new(&mut OsRng, bits).map_err(CryptoError::KeyGeneration)?;
        let public_key = RsaPublicKey::from(&private);
        let block_size = public_key
            .size()
            .checked_sub(PADDING_OVERHEAD)
            .filter(|size| *size > 0)
            .ok_or_else(|| CryptoError::InvalidKey(format!("{bits}-bit key is too small")))?;
        let der = public_key
            .to_pkcs1_der()
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;

        Ok(Self {
            private,
            public: EncryptionKey {
                key: der.as_bytes().to_vec(),
                block_size,
            },
        })
    }

    /// The public half, as announced to peers.
    pub fn encryption_key(&self) -> &EncryptionKey {
        &self.public
    }

    /// Largest plaintext block a peer may seal for us.
    pub fn block_size(&self) -> usize {
        self.public.block_size
    }

    /// Decrypts every block and concatenates the results.
    pub fn open(&self, sealed: &SafeMessage) -> Result<Vec<u8>, CryptoError> {
        let mut plaintext = Vec::with_capacity(sealed.blocks.len() * self.block_size());
        for block in &sealed.blocks {
            let chunk = self
                .private
                .decrypt(Pkcs1v15Encrypt, block)
                .map_err(CryptoError::Decrypt)?;
            plaintext.extend_from_slice(&chunk);
        }
        Ok(plaintext)
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("block_size", &self.public.block_size)
            .finish_non_exhaustive()
    }
}

/// A peer's public key: seals what we send to that peer.
#[derive(Debug, Clone)]
pub struct PeerKey {
    key: RsaPublicKey,
    block_size: usize,
}

impl PeerKey {
    /// Largest plaintext block per encryption.
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Encrypts `plaintext` as `ceil(len / block_size)` blocks.
    ///
    /// Empty input yields a message with no blocks.
    pub fn seal(&self, plaintext: &[u8]) -> Result<SafeMessage, CryptoError> {
        let blocks = plaintext
            .chunks(self.block_size)
            .map(|chunk| {
                self.key
                    .encrypt(&mut OsRng, Pkcs1v15Encrypt, chunk)
                    .map_err(CryptoError::Encrypt)
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(SafeMessage { blocks })
    }
}

impl TryFrom<&EncryptionKey> for PeerKey {
    type Error = CryptoError;

    fn try_from(announced: &EncryptionKey) -> Result<Self, Self::Error> {
        let key = RsaPublicKey::from_pkcs1_der(&announced.key)
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        let max_block = key.size().saturating_sub(PADDING_OVERHEAD);
        if announced.block_size == 0 || announced.block_size > max_block {
            return Err(CryptoError::InvalidKey(format!(
                "block size {} outside 1..={max_block}",
                announced.block_size
            )));
        }
        Ok(Self {
            key,
            block_size: announced.block_size,
        })
    }
}
