//! Cryptographic primitives for the network layer
//!
//! Provides the shared secret, per-connection session key derivation and the
//! sealed-record codec used by the encrypted transport.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce,
};
use hkdf::Hkdf;
use rand::{rngs::OsRng, RngCore};
use sha2::Sha256;
use std::fmt;
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

/// Length of the shared secret in bytes
pub const SECRET_LEN: usize = 32;

/// Length of the per-connection salt each side contributes
pub const SALT_LEN: usize = 32;

/// Largest plaintext carried by one sealed record (16 KB)
pub const MAX_RECORD_PLAINTEXT: usize = 16 * 1024;

/// Poly1305 tag length
pub const TAG_LEN: usize = 16;

const RECORD_HEADER_LEN: usize = 4;
const MAX_RECORD_CIPHERTEXT: usize = MAX_RECORD_PLAINTEXT + TAG_LEN;

/// Cryptographic errors
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("invalid secret length: {0} bytes (expected {SECRET_LEN})")]
    InvalidKeyLength(usize),
    #[error("AEAD encryption failed")]
    EncryptionFailed,
    #[error("AEAD decryption failed: record failed authentication")]
    DecryptionFailed,
    #[error("key derivation failed")]
    KeyDerivationFailed,
    #[error("nonce space exhausted")]
    NonceExhausted,
    #[error("record too large: {0} bytes (max {1})")]
    RecordTooLarge(usize, usize),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<CryptoError> for std::io::Error {
    fn from(err: CryptoError) -> Self {
        match err {
            CryptoError::Io(e) => e,
            other => std::io::Error::new(std::io::ErrorKind::InvalidData, other),
        }
    }
}

/// The 32-byte secret every peer of a deployment shares
#[derive(Clone, PartialEq, Eq)]
pub struct SharedSecret([u8; SECRET_LEN]);

impl SharedSecret {
    /// Create a secret from raw bytes
    pub fn new(bytes: [u8; SECRET_LEN]) -> Self {
        Self(bytes)
    }

    /// Get as bytes
    pub fn as_bytes(&self) -> &[u8; SECRET_LEN] {
        &self.0
    }
}

impl TryFrom<&[u8]> for SharedSecret {
    type Error = CryptoError;

    fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
        let array: [u8; SECRET_LEN] = bytes
            .try_into()
            .map_err(|_| CryptoError::InvalidKeyLength(bytes.len()))?;
        Ok(Self(array))
    }
}

impl fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SharedSecret(..)")
    }
}

/// Which end of a connection we are
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    /// The dialing side
    Initiator,
    /// The accepting side
    Responder,
}

impl Role {
    /// Role of the side that dialed (`true`) or accepted (`false`)
    pub fn from_initiator(is_initiator: bool) -> Self {
        if is_initiator {
            Self::Initiator
        } else {
            Self::Responder
        }
    }
}

/// Generate this side's handshake salt
pub fn random_salt() -> [u8; SALT_LEN] {
    let mut salt = [0u8; SALT_LEN];
    OsRng.fill_bytes(&mut salt);
    salt
}

/// Per-connection, per-direction keys with their nonce counters
pub struct SessionKeys {
    encrypt: ChaCha20Poly1305,
    decrypt: ChaCha20Poly1305,
    send_counter: u64,
    recv_counter: u64,
}

impl SessionKeys {
    /// Derive session keys from the shared secret and both handshake salts.
    ///
    /// Both sides pass the salts in the same order (initiator first); the
    /// role picks which direction key seals and which opens.
    pub fn derive(
        secret: &SharedSecret,
        initiator_salt: &[u8; SALT_LEN],
        responder_salt: &[u8; SALT_LEN],
        role: Role,
    ) -> Result<Self, CryptoError> {
        let mut salt = [0u8; SALT_LEN * 2];
        salt[..SALT_LEN].copy_from_slice(initiator_salt);
        salt[SALT_LEN..].copy_from_slice(responder_salt);
        let hkdf = Hkdf::<Sha256>::new(Some(&salt), secret.as_bytes());

        let mut i2r = [0u8; 32];
        let mut r2i = [0u8; 32];
        hkdf.expand(b"meshlink initiator_to_responder", &mut i2r)
            .map_err(|_| CryptoError::KeyDerivationFailed)?;
        hkdf.expand(b"meshlink responder_to_initiator", &mut r2i)
            .map_err(|_| CryptoError::KeyDerivationFailed)?;

        let (encrypt_key, decrypt_key) = match role {
            Role::Initiator => (i2r, r2i),
            Role::Responder => (r2i, i2r),
        };

        Ok(Self {
            encrypt: ChaCha20Poly1305::new_from_slice(&encrypt_key)
                .map_err(|_| CryptoError::KeyDerivationFailed)?,
            decrypt: ChaCha20Poly1305::new_from_slice(&decrypt_key)
                .map_err(|_| CryptoError::KeyDerivationFailed)?,
            send_counter: 0,
            recv_counter: 0,
        })
    }

    /// Seal the next outgoing message
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let nonce = next_nonce(&mut self.send_counter)?;
        self.encrypt
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| CryptoError::EncryptionFailed)
    }

    /// Open the next incoming message
    pub fn decrypt(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let nonce = next_nonce(&mut self.recv_counter)?;
        self.decrypt
            .decrypt(Nonce::from_slice(&nonce), ciphertext)
            .map_err(|_| CryptoError::DecryptionFailed)
    }
}

/// Build the nonce for `counter` and advance it; a nonce is never reused
fn next_nonce(counter: &mut u64) -> Result<[u8; 12], CryptoError> {
    let mut nonce = [0u8; 12];
    nonce[4..12].copy_from_slice(&counter.to_le_bytes());
    *counter = counter.checked_add(1).ok_or(CryptoError::NonceExhausted)?;
    Ok(nonce)
}

/// Codec for sealed records
///
/// Wire format:
/// - 4 bytes: ciphertext length (big-endian)
/// - N bytes: ChaCha20-Poly1305 ciphertext including the tag
pub struct SealCodec {
    keys: SessionKeys,
}

impl SealCodec {
    pub fn new(keys: SessionKeys) -> Self {
        Self { keys }
    }
}

impl Decoder for SealCodec {
    type Item = Bytes;
    type Error = CryptoError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < RECORD_HEADER_LEN {
            return Ok(None);
        }

        let length = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if length > MAX_RECORD_CIPHERTEXT {
            return Err(CryptoError::RecordTooLarge(length, MAX_RECORD_CIPHERTEXT));
        }

        if src.len() < RECORD_HEADER_LEN + length {
            src.reserve(RECORD_HEADER_LEN + length - src.len());
            return Ok(None);
        }

        src.advance(RECORD_HEADER_LEN);
        let ciphertext = src.split_to(length);
        let plaintext = self.keys.decrypt(&ciphertext)?;
        Ok(Some(Bytes::from(plaintext)))
    }
}

impl<'a> Encoder<&'a [u8]> for SealCodec {
    type Error = CryptoError;

    fn encode(&mut self, plaintext: &'a [u8], dst: &mut BytesMut) -> Result<(), Self::Error> {
        if plaintext.len() > MAX_RECORD_PLAINTEXT {
            return Err(CryptoError::RecordTooLarge(
                plaintext.len(),
                MAX_RECORD_PLAINTEXT,
            ));
        }

        let ciphertext = self.keys.encrypt(plaintext)?;
        dst.reserve(RECORD_HEADER_LEN + ciphertext.len());
        dst.put_u32(ciphertext.len() as u32);
        dst.put_slice(&ciphertext);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_secret() -> SharedSecret {
        let mut bytes = [0u8; SECRET_LEN];
        bytes[..5].copy_from_slice(&[1, 2, 8, 7, 6]);
        SharedSecret::new(bytes)
    }

    fn codec_pair(secret: &SharedSecret) -> (SealCodec, SealCodec) {
        let si = random_salt();
        let sr = random_salt();
        let initiator = SessionKeys::derive(secret, &si, &sr, Role::Initiator).unwrap();
        let responder = SessionKeys::derive(secret, &si, &sr, Role::Responder).unwrap();
        (SealCodec::new(initiator), SealCodec::new(responder))
    }

    #[test]
    fn test_secret_length() {
        assert!(SharedSecret::try_from(&[0u8; 32][..]).is_ok());
        assert!(matches!(
            SharedSecret::try_from(&b"hello"[..]),
            Err(CryptoError::InvalidKeyLength(5))
        ));
        assert_eq!(format!("{:?}", test_secret()), "SharedSecret(..)");
    }

    #[test]
    fn test_session_encryption_both_directions() {
        let (mut initiator, mut responder) = codec_pair(&test_secret());

        let mut wire = BytesMut::new();
        initiator.encode(&b"secret message"[..], &mut wire).unwrap();
        initiator.encode(&b""[..], &mut wire).unwrap();
        assert_eq!(responder.decode(&mut wire).unwrap().unwrap(), "secret message");
        assert!(responder.decode(&mut wire).unwrap().unwrap().is_empty());

        responder.encode(&b"reply"[..], &mut wire).unwrap();
        assert_eq!(initiator.decode(&mut wire).unwrap().unwrap(), "reply");
    }

    #[test]
    fn test_nonce_never_repeats() {
        let (mut initiator, _) = codec_pair(&test_secret());
        let mut first = BytesMut::new();
        let mut second = BytesMut::new();
        initiator.encode(&b"same"[..], &mut first).unwrap();
        initiator.encode(&b"same"[..], &mut second).unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn test_tampered_record_fails_authentication() {
        let (mut initiator, mut responder) = codec_pair(&test_secret());
        let mut wire = BytesMut::new();
        initiator.encode(&b"hello"[..], &mut wire).unwrap();

        let last = wire.len() - 1;
        wire[last] ^= 0x01;
        assert!(matches!(
            responder.decode(&mut wire),
            Err(CryptoError::DecryptionFailed)
        ));
    }

    #[test]
    fn test_wrong_secret_fails_authentication() {
        let si = random_salt();
        let sr = random_salt();
        let other = SharedSecret::new([9u8; SECRET_LEN]);
        let initiator = SessionKeys::derive(&test_secret(), &si, &sr, Role::Initiator).unwrap();
        let responder = SessionKeys::derive(&other, &si, &sr, Role::Responder).unwrap();
        let (mut initiator, mut responder) = (SealCodec::new(initiator), SealCodec::new(responder));

        let mut wire = BytesMut::new();
        initiator.encode(&b"hello"[..], &mut wire).unwrap();
        assert!(matches!(
            responder.decode(&mut wire),
            Err(CryptoError::DecryptionFailed)
        ));
    }

    #[test]
    fn test_oversized_record_header_rejected() {
        let (_, mut responder) = codec_pair(&test_secret());
        let mut wire = BytesMut::new();
        wire.put_u32(u32::MAX);
        assert!(matches!(
            responder.decode(&mut wire),
            Err(CryptoError::RecordTooLarge(..))
        ));
    }

    #[test]
    fn test_error_maps_to_invalid_data() {
        let err: std::io::Error = CryptoError::DecryptionFailed.into();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
        assert!(err
            .get_ref()
            .and_then(|e| e.downcast_ref::<CryptoError>())
            .is_some());
    }
}
