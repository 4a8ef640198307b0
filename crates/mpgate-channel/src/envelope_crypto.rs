//! Handshake signatures and the AES-256-CBC envelope cipher.
//!
//! Signatures are the lowercase hex SHA1 of the lexicographically sorted concatenation
//! of their parts. Encrypted envelopes use a 32-byte key decoded from the 43-character
//! encoding key, IV = key[..16], and PKCS#7 padding to 32-byte blocks over
//! `random(16) | len(4, big-endian) | message | app_id`.

use aes::Aes256;
use base64::engine::{GeneralPurpose, GeneralPurposeConfig};
use base64::Engine as _;
use cbc::cipher::{block_padding::NoPadding, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use sha1::{Digest, Sha1};
use subtle::ConstantTimeEq;
use thiserror::Error;

const PADDING_BLOCK_SIZE: usize = 32;
const AES_BLOCK_SIZE: usize = 16;
const RANDOM_PREFIX_LEN: usize = 16;
const LENGTH_PREFIX_LEN: usize = 4;

/// Provider-issued keys are not canonical base64; their final symbol may carry stray bits.
const ENCODING_KEY_ENGINE: GeneralPurpose = GeneralPurpose::new(
    &base64::alphabet::STANDARD,
    GeneralPurposeConfig::new().with_decode_allow_trailing_bits(true),
);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EnvelopeCryptoError {
    #[error("encoding key must decode to 32 bytes")]
    InvalidKey,
    #[error("ciphertext is not valid base64")]
    InvalidBase64,
    #[error("ciphertext length is not a multiple of the block size")]
    InvalidCiphertextLength,
    #[error("invalid padding")]
    InvalidPadding,
    #[error("decrypted payload is truncated")]
    Truncated,
    #[error("decrypted message is not utf-8")]
    InvalidUtf8,
    #[error("app id mismatch")]
    AppIdMismatch,
}

/// Hex SHA1 over the sorted concatenation of `parts`.
pub fn compute_signature(parts: &[&str]) -> String {
    let mut sorted: Vec<&str> = parts.iter().map(|part| part.trim()).collect();
    sorted.sort_unstable();
    let mut sha = Sha1::new();
    sha.update(sorted.concat());
    hex::encode(sha.finalize())
}

/// Constant-time comparison of a provided signature against the recomputed one.
pub fn verify_signature(provided: &str, parts: &[&str]) -> bool {
    let expected = compute_signature(parts);
    let provided = provided.trim().to_ascii_lowercase();
    provided.len() == expected.len() && bool::from(provided.as_bytes().ct_eq(expected.as_bytes()))
}

/// Per-account symmetric cipher bound to the account's app id.
#[derive(Clone)]
pub struct EnvelopeCipher {
    key: [u8; 32],
    app_id: String,
}

impl std::fmt::Debug for EnvelopeCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnvelopeCipher")
            .field("key", &"<redacted>")
            .field("app_id", &self.app_id)
            .finish()
    }
}

impl EnvelopeCipher {
    pub fn new(encoding_key: &str, app_id: &str) -> Result<Self, EnvelopeCryptoError> {
        let padded = format!("{}=", encoding_key.trim());
        let raw = ENCODING_KEY_ENGINE
            .decode(padded)
            .map_err(|_| EnvelopeCryptoError::InvalidKey)?;
        let key: [u8; 32] = raw
            .as_slice()
            .try_into()
            .map_err(|_| EnvelopeCryptoError::InvalidKey)?;
        Ok(Self {
            key,
            app_id: app_id.trim().to_string(),
        })
    }

    /// Decrypts a base64 `Encrypt` field and checks the trailing app id.
    pub fn decrypt(&self, encrypted: &str) -> Result<String, EnvelopeCryptoError> {
        let mut buf = base64::engine::general_purpose::STANDARD
            .decode(encrypted.trim())
            .map_err(|_| EnvelopeCryptoError::InvalidBase64)?;
        if buf.is_empty() || buf.len() % AES_BLOCK_SIZE != 0 {
            return Err(EnvelopeCryptoError::InvalidCiphertextLength);
        }
        let iv = &self.key[..AES_BLOCK_SIZE];
        let plaintext = cbc::Decryptor::<Aes256>::new((&self.key).into(), iv.into())
            .decrypt_padded_mut::<NoPadding>(&mut buf)
            .map_err(|_| EnvelopeCryptoError::InvalidPadding)?;
        let unpadded = strip_padding(plaintext)?;

        let header_len = RANDOM_PREFIX_LEN + LENGTH_PREFIX_LEN;
        if unpadded.len() < header_len {
            return Err(EnvelopeCryptoError::Truncated);
        }
        let length_bytes: [u8; 4] = unpadded[RANDOM_PREFIX_LEN..header_len]
            .try_into()
            .map_err(|_| EnvelopeCryptoError::Truncated)?;
        let msg_len = u32::from_be_bytes(length_bytes) as usize;
        let msg_end = header_len.saturating_add(msg_len);
        if msg_end > unpadded.len() {
            return Err(EnvelopeCryptoError::Truncated);
        }
        let message = std::str::from_utf8(&unpadded[header_len..msg_end])
            .map_err(|_| EnvelopeCryptoError::InvalidUtf8)?;
        let trailing_app_id = &unpadded[msg_end..];
        if !bool::from(trailing_app_id.ct_eq(self.app_id.as_bytes())) {
            return Err(EnvelopeCryptoError::AppIdMismatch);
        }
        Ok(message.to_string())
    }

    /// Encrypts `message` with a caller-supplied random prefix; the inverse of `decrypt`.
    pub fn encrypt_with_prefix(&self, message: &str, random_prefix: [u8; 16]) -> String {
        let mut plain = Vec::with_capacity(
            RANDOM_PREFIX_LEN + LENGTH_PREFIX_LEN + message.len() + self.app_id.len() + 32,
        );
        plain.extend_from_slice(&random_prefix);
        plain.extend_from_slice(&(message.len() as u32).to_be_bytes());
        plain.extend_from_slice(message.as_bytes());
        plain.extend_from_slice(self.app_id.as_bytes());
        let pad = PADDING_BLOCK_SIZE - (plain.len() % PADDING_BLOCK_SIZE);
        plain.extend(std::iter::repeat(pad as u8).take(pad));

        let len = plain.len();
        let iv = &self.key[..AES_BLOCK_SIZE];
        let ciphertext = match cbc::Encryptor::<Aes256>::new((&self.key).into(), iv.into())
            .encrypt_padded_mut::<NoPadding>(&mut plain, len)
        {
            Ok(ciphertext) => ciphertext.to_vec(),
            // Length is always a multiple of 32 after padding.
            Err(_) => Vec::new(),
        };
        base64::engine::general_purpose::STANDARD.encode(ciphertext)
    }

    /// Encrypts `message` with a fresh random prefix.
    pub fn encrypt(&self, message: &str) -> String {
        self.encrypt_with_prefix(message, *uuid::Uuid::new_v4().as_bytes())
    }
}

fn strip_padding(input: &[u8]) -> Result<&[u8], EnvelopeCryptoError> {
    let Some(last) = input.last() else {
        return Err(EnvelopeCryptoError::InvalidPadding);
    };
    let pad_len = *last as usize;
    if pad_len == 0 || pad_len > PADDING_BLOCK_SIZE || pad_len > input.len() {
        return Err(EnvelopeCryptoError::InvalidPadding);
    }
    Ok(&input[..input.len() - pad_len])
}
