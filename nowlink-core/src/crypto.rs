//! Radio-level frame encryption for secure peers: key derivation and ChaCha20-Poly1305 sealing.

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::ChaCha20Poly1305;
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::peer::{PeerKey, KEY_LEN};

const NONCE_LEN: usize = 12;

/// Master key used until the host sets one.
pub const DEFAULT_MASTER_KEY: [u8; KEY_LEN] = [0u8; KEY_LEN];

/// Derive the 32-byte frame key for a (master key, peer key) pair.
/// Both ends of a secure link must register each other with the same peer key.
pub fn derive_frame_key(master_key: &[u8; KEY_LEN], peer_key: &PeerKey) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(b"nowlink-frame-v1");
    hasher.update(master_key);
    hasher.update(peer_key);
    hasher.finalize().into()
}

/// Seal a payload. Output: 12-byte random nonce followed by ciphertext and tag.
pub fn seal(key: &[u8; 32], plaintext: &[u8]) -> Result<Vec<u8>, FrameCryptoError> {
    let cipher = ChaCha20Poly1305::new_from_slice(key).map_err(|_| FrameCryptoError::Key)?;
    let mut nonce_bytes = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce_bytes);
    let nonce = chacha20poly1305::aead::Nonce::<ChaCha20Poly1305>::from_slice(&nonce_bytes);
    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|_| FrameCryptoError::Encrypt)?;
    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Open a payload produced by [`seal`].
pub fn open(key: &[u8; 32], sealed: &[u8]) -> Result<Vec<u8>, FrameCryptoError> {
    if sealed.len() < NONCE_LEN {
        return Err(FrameCryptoError::Truncated);
    }
    let cipher = ChaCha20Poly1305::new_from_slice(key).map_err(|_| FrameCryptoError::Key)?;
    let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_LEN);
    let nonce = chacha20poly1305::aead::Nonce::<ChaCha20Poly1305>::from_slice(nonce_bytes);
    cipher
        .decrypt(nonce, ciphertext)
        .map_err(|_| FrameCryptoError::Decrypt)
}

#[derive(Debug, thiserror::Error)]
pub enum FrameCryptoError {
    #[error("invalid key")]
    Key,
    #[error("sealed frame truncated")]
    Truncated,
    #[error("encryption failed")]
    Encrypt,
    #[error("decryption failed")]
    Decrypt,
}
