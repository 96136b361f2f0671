//! Symmetric envelope used by encrypted callbacks.
//!
//! Frame layout before padding:
//!
//! ```text
//! random[16] | be32 payload length | payload | origin id
//! ```
//!
//! The frame is padded PKCS7-style to a 32-byte boundary (the remote
//! platform's own framing, not AES's 16-byte block), encrypted with
//! AES-256-CBC using the first 16 key bytes as IV, then base64-encoded.

use std::fmt;

use aes::Aes256;
use base64::{
    alphabet,
    engine::{general_purpose, GeneralPurpose, GeneralPurposeConfig},
    Engine,
};
use cbc::cipher::{block_padding::NoPadding, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use rand::RngCore;

use crate::error::CryptoError;

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

pub const KEY_LEN: usize = 32;
/// Padding block of the envelope framing.
pub const PAD_BLOCK: usize = 32;
/// Length of a key in its configured text form.
pub const ENCODED_KEY_LEN: usize = 43;

const AES_BLOCK: usize = 16;
const PREFIX_LEN: usize = 16;
const LEN_FIELD: usize = 4;

// Configured keys are random text, so the last symbol may carry stray bits.
const KEY_ENGINE: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new().with_decode_allow_trailing_bits(true),
);

/// 32-byte AES key. The IV is its first 16 bytes.
#[derive(Clone, PartialEq, Eq)]
pub struct AesKey([u8; KEY_LEN]);

impl AesKey {
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    /// Parses the 43-character form: base64 of the key with the trailing `=` dropped.
    pub fn from_encoded(encoded: &str) -> Result<Self, CryptoError> {
        let encoded = encoded.trim();
        if encoded.len() != ENCODED_KEY_LEN {
            return Err(CryptoError::InvalidKey(format!(
                "expected {ENCODED_KEY_LEN} characters, got {}",
                encoded.len()
            )));
        }
        let bytes = KEY_ENGINE
            .decode(format!("{encoded}="))
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        let key: [u8; KEY_LEN] = bytes
            .try_into()
            .map_err(|_| CryptoError::InvalidKey("decoded key is not 32 bytes".into()))?;
        Ok(Self(key))
    }

    /// Inverse of [`AesKey::from_encoded`].
    pub fn encoded(&self) -> String {
        general_purpose::STANDARD
            .encode(self.0)
            .trim_end_matches('=')
            .to_string()
    }

    pub fn generate() -> Self {
        let mut key = [0u8; KEY_LEN];
        rand::thread_rng().fill_bytes(&mut key);
        Self(key)
    }

    fn iv(&self) -> &[u8] {
        &self.0[..AES_BLOCK]
    }
}

impl fmt::Debug for AesKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AesKey(<redacted>)")
    }
}

/// Payload and trailing origin id recovered from an envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decrypted {
    pub payload: Vec<u8>,
    pub origin_id: String,
}

/// Encrypts `plaintext` for `origin_id` under `key`.
pub fn encrypt(plaintext: &[u8], origin_id: &str, key: &AesKey) -> Result<String, CryptoError> {
    let mut prefix = [0u8; PREFIX_LEN];
    rand::thread_rng().fill_bytes(&mut prefix);
    encrypt_with_prefix(prefix, plaintext, origin_id, key)
}

fn encrypt_with_prefix(
    prefix: [u8; PREFIX_LEN],
    plaintext: &[u8],
    origin_id: &str,
    key: &AesKey,
) -> Result<String, CryptoError> {
    let declared = u32::try_from(plaintext.len()).map_err(|_| CryptoError::LengthOverrun {
        declared: plaintext.len(),
        available: u32::MAX as usize,
    })?;

    let mut frame =
        Vec::with_capacity(PREFIX_LEN + LEN_FIELD + plaintext.len() + origin_id.len() + PAD_BLOCK);
    frame.extend_from_slice(&prefix);
    frame.extend_from_slice(&declared.to_be_bytes());
    frame.extend_from_slice(plaintext);
    frame.extend_from_slice(origin_id.as_bytes());
    pad(&mut frame);

    let cipher = Aes256CbcEnc::new_from_slices(&key.0, key.iv())
        .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
    let ciphertext = cipher.encrypt_padded_vec_mut::<NoPadding>(&frame);
    Ok(general_purpose::STANDARD.encode(ciphertext))
}

/// Decrypts an envelope without checking who it was addressed to.
pub fn decrypt(envelope: &str, key: &AesKey) -> Result<Decrypted, CryptoError> {
    let ciphertext = general_purpose::STANDARD
        .decode(envelope.trim())
        .map_err(|_| CryptoError::InvalidBase64)?;
    if ciphertext.is_empty() || ciphertext.len() % AES_BLOCK != 0 {
        return Err(CryptoError::InvalidCiphertext(ciphertext.len()));
    }

    let cipher = Aes256CbcDec::new_from_slices(&key.0, key.iv())
        .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
    let frame = cipher
        .decrypt_padded_vec_mut::<NoPadding>(&ciphertext)
        .map_err(|_| CryptoError::InvalidCiphertext(ciphertext.len()))?;

    parse_frame(unpad(&frame)?)
}

/// Decrypts and requires the trailing origin id to equal `expected_origin`.
pub fn decrypt_for(envelope: &str, key: &AesKey, expected_origin: &str) -> Result<Vec<u8>, CryptoError> {
    let decrypted = decrypt(envelope, key)?;
    if decrypted.origin_id != expected_origin {
        return Err(CryptoError::OriginMismatch {
            expected: expected_origin.to_string(),
            found: decrypted.origin_id,
        });
    }
    Ok(decrypted.payload)
}

fn pad(frame: &mut Vec<u8>) {
    let amount = PAD_BLOCK - frame.len() % PAD_BLOCK;
    frame.resize(frame.len() + amount, amount as u8);
}

fn unpad(frame: &[u8]) -> Result<&[u8], CryptoError> {
    let pad = *frame.last().ok_or(CryptoError::Truncated(0))?;
    let amount = pad as usize;
    if amount == 0 || amount > PAD_BLOCK || amount > frame.len() {
        return Err(CryptoError::InvalidPadding(pad));
    }
    Ok(&frame[..frame.len() - amount])
}

fn parse_frame(frame: &[u8]) -> Result<Decrypted, CryptoError> {
    if frame.len() < PREFIX_LEN + LEN_FIELD {
        return Err(CryptoError::Truncated(frame.len()));
    }

    let mut len_bytes = [0u8; LEN_FIELD];
    len_bytes.copy_from_slice(&frame[PREFIX_LEN..PREFIX_LEN + LEN_FIELD]);
    let declared = u32::from_be_bytes(len_bytes) as usize;

    let body = &frame[PREFIX_LEN + LEN_FIELD..];
    if declared > body.len() {
        return Err(CryptoError::LengthOverrun {
            declared,
            available: body.len(),
        });
    }

    let (payload, origin) = body.split_at(declared);
    Ok(Decrypted {
        payload: payload.to_vec(),
        origin_id: String::from_utf8_lossy(origin).into_owned(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const ORIGIN: &str = "wx-platform-0001";

    fn key() -> AesKey {
        AesKey::from_encoded("abcdefghijklmnopqrstuvwxyz0123456789ABCDEFA").unwrap()
    }

    // Encrypts an arbitrary, already block-aligned frame to forge bad envelopes.
    fn seal_raw(frame: &[u8], key: &AesKey) -> String {
        let cipher = Aes256CbcEnc::new_from_slices(&key.0, key.iv()).unwrap();
        general_purpose::STANDARD.encode(cipher.encrypt_padded_vec_mut::<NoPadding>(frame))
    }

    #[test]
    fn encoded_key_roundtrip() {
        let k = key();
        assert_eq!(k.encoded(), "abcdefghijklmnopqrstuvwxyz0123456789ABCDEFA");
        assert_eq!(AesKey::from_encoded(&k.encoded()).unwrap(), k);
    }

    #[test]
    fn accepts_stray_trailing_bits() {
        let lenient = AesKey::from_encoded("abcdefghijklmnopqrstuvwxyz0123456789ABCDEFG").unwrap();
        assert_eq!(lenient.encoded().len(), ENCODED_KEY_LEN);
    }

    #[test]
    fn rejects_wrong_key_length() {
        assert!(matches!(
            AesKey::from_encoded("short"),
            Err(CryptoError::InvalidKey(_))
        ));
    }

    #[test]
    fn roundtrip_across_lengths() {
        let k = key();
        let lengths = (0..=64).chain((65..10_000).step_by(97)).chain([10_000]);
        for len in lengths {
            let plaintext: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
            let envelope = encrypt(&plaintext, ORIGIN, &k).unwrap();
            let opened = decrypt(&envelope, &k).unwrap();
            assert_eq!(opened.payload, plaintext, "length {len}");
            assert_eq!(opened.origin_id, ORIGIN);
        }
    }

    #[test]
    fn ciphertext_is_whole_pad_blocks() {
        let envelope = encrypt(b"<xml></xml>", ORIGIN, &key()).unwrap();
        let raw = general_purpose::STANDARD.decode(envelope).unwrap();
        assert_eq!(raw.len() % PAD_BLOCK, 0);
    }

    #[test]
    fn full_block_frame_gets_a_full_pad_block() {
        // 16 + 4 + 12 = 32 bytes of frame before padding
        let prefix = [7u8; PREFIX_LEN];
        let envelope = encrypt_with_prefix(prefix, b"twelve bytes", "", &key()).unwrap();
        let raw = general_purpose::STANDARD.decode(&envelope).unwrap();
        assert_eq!(raw.len(), 64);
        assert_eq!(decrypt(&envelope, &key()).unwrap().payload, b"twelve bytes");
    }

    #[test]
    fn random_prefix_makes_envelopes_differ() {
        let k = key();
        assert_ne!(encrypt(b"same", ORIGIN, &k).unwrap(), encrypt(b"same", ORIGIN, &k).unwrap());
    }

    #[test]
    fn rejects_bad_base64() {
        assert_eq!(decrypt("%%%not base64%%%", &key()), Err(CryptoError::InvalidBase64));
    }

    #[test]
    fn rejects_partial_block() {
        let envelope = general_purpose::STANDARD.encode([0u8; 20]);
        assert_eq!(decrypt(&envelope, &key()), Err(CryptoError::InvalidCiphertext(20)));
    }

    #[test]
    fn rejects_zero_pad_byte() {
        let mut frame = vec![1u8; 32];
        frame[31] = 0;
        assert_eq!(decrypt(&seal_raw(&frame, &key()), &key()), Err(CryptoError::InvalidPadding(0)));
    }

    #[test]
    fn rejects_pad_byte_above_block() {
        let mut frame = vec![1u8; 64];
        frame[63] = 33;
        assert_eq!(decrypt(&seal_raw(&frame, &key()), &key()), Err(CryptoError::InvalidPadding(33)));
    }

    #[test]
    fn rejects_short_frame() {
        // 32 bytes, 16 of them padding: 16 bytes of frame left
        let mut frame = vec![0u8; 32];
        frame[16..].fill(16);
        assert_eq!(decrypt(&seal_raw(&frame, &key()), &key()), Err(CryptoError::Truncated(16)));
    }

    #[test]
    fn rejects_length_overrun() {
        let mut frame = vec![0u8; 32];
        frame[16..20].copy_from_slice(&1000u32.to_be_bytes());
        frame[20..].fill(12);
        assert_eq!(
            decrypt(&seal_raw(&frame, &key()), &key()),
            Err(CryptoError::LengthOverrun {
                declared: 1000,
                available: 0
            })
        );
    }

    #[test]
    fn decrypt_for_enforces_origin() {
        let k = key();
        let envelope = encrypt(b"payload", "someone-else", &k).unwrap();
        assert_eq!(
            decrypt_for(&envelope, &k, ORIGIN),
            Err(CryptoError::OriginMismatch {
                expected: ORIGIN.into(),
                found: "someone-else".into()
            })
        );
    }

    #[test]
    fn wrong_key_does_not_open_envelope() {
        let envelope = encrypt(b"secret payload", ORIGIN, &key()).unwrap();
        assert!(decrypt_for(&envelope, &AesKey::generate(), ORIGIN).is_err());
    }

    #[test]
    fn debug_hides_key_bytes() {
        assert_eq!(format!("{:?}", key()), "AesKey(<redacted>)");
    }
}
