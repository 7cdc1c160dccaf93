#![forbid(unsafe_code)]

use std::sync::Arc;

use aes_gcm::aead::OsRng;
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use thiserror::Error;

#[derive(Debug, Error)]
#[error("password hash failed: {0}")]
pub struct PasswordHashError(String);

/// Argon2id PHC string with a random salt.
pub fn hash_password(password: &str) -> Result<String, PasswordHashError> {
	let salt = SaltString::generate(&mut OsRng);
	Argon2::default()
		.hash_password(password.as_bytes(), &salt)
		.map(|h| h.to_string())
		.map_err(|e| PasswordHashError(e.to_string()))
}

pub fn verify_password(stored_hash: &str, supplied_password: &str) -> bool {
	let Ok(parsed) = PasswordHash::new(stored_hash) else {
		return false;
	};
	Argon2::default()
		.verify_password(supplied_password.as_bytes(), &parsed)
		.is_ok()
}

/// Runs hashing off the async runtime. Verification against a room that does
/// not exist still burns one Argon2 verify so the response time matches a
/// wrong password.
#[derive(Debug, Clone)]
pub struct PasswordGate {
	dummy_hash: Arc<String>,
}

impl PasswordGate {
	pub fn new() -> Result<Self, PasswordHashError> {
		Ok(Self {
			dummy_hash: Arc::new(hash_password("classchat-dummy-password")?),
		})
	}

	pub async fn hash(&self, password: String) -> Result<String, PasswordHashError> {
		tokio::task::spawn_blocking(move || hash_password(&password))
			.await
			.map_err(|e| PasswordHashError(e.to_string()))?
	}

	pub async fn verify(&self, stored_hash: Option<String>, supplied: String) -> bool {
		let (hash, real) = match stored_hash {
			Some(h) => (h, true),
			None => (self.dummy_hash.as_str().to_owned(), false),
		};
		let ok = tokio::task::spawn_blocking(move || verify_password(&hash, &supplied))
			.await
			.unwrap_or(false);
		real && ok
	}

	/// Burn a verify without a target room.
	pub async fn verify_dummy(&self, supplied: String) {
		let _ = self.verify(None, supplied).await;
	}
}
