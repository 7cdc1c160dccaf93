#![forbid(unsafe_code)]

//! At-rest encryption of message bodies.
//!
//! Blob layout: `[12-byte nonce][ciphertext + 16-byte tag]`, AES-256-GCM with a
//! server-held key so any authorized member can reload history.

use std::fmt;

use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::Aes256Gcm;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use thiserror::Error;

pub const KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
	#[error("message key must be {KEY_LEN} bytes, got {0}")]
	InvalidKey(usize),
	#[error("message key is not valid base64")]
	KeyEncoding,
	#[error("encryption failed")]
	Encrypt,
	#[error("decryption failed")]
	Decrypt,
	#[error("ciphertext too short ({len} bytes)")]
	Truncated { len: usize },
	#[error("decrypted payload is not valid utf-8")]
	Utf8,
}

#[derive(Clone)]
pub struct MessageCodec {
	cipher: Aes256Gcm,
}

impl fmt::Debug for MessageCodec {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("MessageCodec(<key redacted>)")
	}
}

impl MessageCodec {
	pub fn new(key: &[u8]) -> Result<Self, CodecError> {
		if key.len() != KEY_LEN {
			return Err(CodecError::InvalidKey(key.len()));
		}
		let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| CodecError::InvalidKey(key.len()))?;
		Ok(Self { cipher })
	}

	pub fn from_base64(key_b64: &str) -> Result<Self, CodecError> {
		let key = STANDARD.decode(key_b64.trim()).map_err(|_| CodecError::KeyEncoding)?;
		Self::new(&key)
	}

	/// Fresh random key, base64 encoded (the `crypto.message_key` format).
	pub fn generate_key() -> String {
		STANDARD.encode(Aes256Gcm::generate_key(&mut OsRng))
	}

	pub fn encrypt(&self, plaintext: &str) -> Result<Vec<u8>, CodecError> {
		let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
		let ciphertext = self
			.cipher
			.encrypt(&nonce, plaintext.as_bytes())
			.map_err(|_| CodecError::Encrypt)?;

		let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
		blob.extend_from_slice(&nonce);
		blob.extend_from_slice(&ciphertext);
		Ok(blob)
	}

	pub fn decrypt(&self, blob: &[u8]) -> Result<String, CodecError> {
		if blob.len() < NONCE_LEN + TAG_LEN {
			return Err(CodecError::Truncated { len: blob.len() });
		}
		let (nonce_bytes, ciphertext) = blob.split_at(NONCE_LEN);
		let nonce = GenericArray::from_slice(nonce_bytes);
		let plaintext = self.cipher.decrypt(nonce, ciphertext).map_err(|_| CodecError::Decrypt)?;
		String::from_utf8(plaintext).map_err(|_| CodecError::Utf8)
	}
}

#[cfg(test)]
mod tests {
	use proptest::prelude::*;

	use super::*;

	fn codec() -> MessageCodec {
		MessageCodec::from_base64(&MessageCodec::generate_key()).expect("codec")
	}

	#[test]
	fn ciphertext_hides_plaintext_and_uses_fresh_nonces() {
		let c = codec();
		let a = c.encrypt("quadratic formula").expect("encrypt");
		let b = c.encrypt("quadratic formula").expect("encrypt");
		assert_ne!(a, b);
		assert!(!a.windows(9).any(|w| w == b"quadratic"));
		assert_eq!(c.decrypt(&a).expect("decrypt"), "quadratic formula");
	}

	#[test]
	fn wrong_key_and_tampering_fail_cleanly() {
		let c1 = codec();
		let c2 = codec();
		let mut blob = c1.encrypt("secret").expect("encrypt");
		assert_eq!(c2.decrypt(&blob), Err(CodecError::Decrypt));

		let last = blob.len() - 1;
		blob[last] ^= 0x01;
		assert_eq!(c1.decrypt(&blob), Err(CodecError::Decrypt));
		assert_eq!(c1.decrypt(&[0u8; 5]), Err(CodecError::Truncated { len: 5 }));
	}

	#[test]
	fn rejects_bad_keys() {
		assert_eq!(MessageCodec::new(&[0u8; 16]).err(), Some(CodecError::InvalidKey(16)));
		assert_eq!(MessageCodec::from_base64("***").err(), Some(CodecError::KeyEncoding));
	}

	#[test]
	fn debug_redacts_key() {
		assert_eq!(format!("{:?}", codec()), "MessageCodec(<key redacted>)");
	}

	proptest! {
		#[test]
		fn decrypt_inverts_encrypt(msg in "\\PC{0,2000}") {
			let c = codec();
			let blob = c.encrypt(&msg).expect("encrypt");
			prop_assert_eq!(c.decrypt(&blob).expect("decrypt"), msg);
		}
	}
}
