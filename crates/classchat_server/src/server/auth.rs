#![forbid(unsafe_code)]

//! Signed bearer credentials.
//!
//! Format: `<prefix>.<base64url(JSON claims)>.<base64url(HMAC-SHA256(payload_b64))>`.
//! Session credentials use prefix `v1`; room-access tokens reuse the same
//! envelope with their own prefix and secret.

use std::sync::Arc;
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use classchat_domain::{Identity, Role, SubjectId};
use hmac::{Hmac, Mac};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tracing::debug;

use crate::config::SecretString;
use crate::server::error::TokenError;
use crate::server::revocation::RevocationSet;
use crate::util::time::unix_secs_now;

pub const SESSION_TOKEN_PREFIX: &str = "v1";

/// Claims common to every signed token this server issues.
pub trait ExpiringClaims {
	fn expires_at(&self) -> u64;
}

pub fn sign_token<T: Serialize>(prefix: &str, claims: &T, secret: &SecretString) -> Result<String, TokenError> {
	let payload = serde_json::to_vec(claims).map_err(|_| TokenError::Signing)?;
	let payload_b64 = URL_SAFE_NO_PAD.encode(payload);
	let sig = sign(payload_b64.as_bytes(), secret.expose().as_bytes())?;
	Ok(format!("{prefix}.{payload_b64}.{}", URL_SAFE_NO_PAD.encode(sig)))
}

/// Verify signature and expiry; returns the decoded claims.
pub fn open_token<T>(prefix: &str, token: &str, secret: &SecretString, now: u64) -> Result<T, TokenError>
where
	T: DeserializeOwned + ExpiringClaims,
{
	let mut parts = token.split('.');
	let (Some(p), Some(payload_b64), Some(sig_b64), None) = (parts.next(), parts.next(), parts.next(), parts.next())
	else {
		return Err(TokenError::Malformed);
	};
	if p != prefix {
		return Err(TokenError::Malformed);
	}

	let provided_sig = URL_SAFE_NO_PAD.decode(sig_b64).map_err(|_| TokenError::Malformed)?;
	mac_for(payload_b64.as_bytes(), secret.expose().as_bytes())?
		.verify_slice(&provided_sig)
		.map_err(|_| TokenError::BadSignature)?;

	let payload = URL_SAFE_NO_PAD.decode(payload_b64).map_err(|_| TokenError::Malformed)?;
	let claims: T = serde_json::from_slice(&payload).map_err(|_| TokenError::Malformed)?;
	if claims.expires_at() <= now {
		return Err(TokenError::Expired);
	}

	Ok(claims)
}

fn mac_for(payload_b64: &[u8], secret: &[u8]) -> Result<Hmac<Sha256>, TokenError> {
	let mut mac = Hmac::<Sha256>::new_from_slice(secret).map_err(|_| TokenError::Signing)?;
	mac.update(payload_b64);
	Ok(mac)
}

fn sign(payload_b64: &[u8], secret: &[u8]) -> Result<Vec<u8>, TokenError> {
	Ok(mac_for(payload_b64, secret)?.finalize().into_bytes().to_vec())
}

pub fn new_token_id() -> String {
	uuid::Uuid::new_v4().simple().to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionClaims {
	pub sub: String,
	pub name: String,
	pub role: Role,
	pub jti: String,
	pub exp: u64,
}

impl ExpiringClaims for SessionClaims {
	fn expires_at(&self) -> u64 {
		self.exp
	}
}

/// A validated session credential.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
	pub identity: Identity,
	pub token_id: String,
	pub expires_at: u64,
}

/// Mint a session credential. Account flows own this in production; the
/// server uses it for `--issue-token` and tests.
pub fn issue_session_token(identity: &Identity, ttl: Duration, secret: &SecretString) -> Result<String, TokenError> {
	let claims = SessionClaims {
		sub: identity.subject_id.to_string(),
		name: identity.display_name.clone(),
		role: identity.role,
		jti: new_token_id(),
		exp: unix_secs_now().saturating_add(ttl.as_secs().max(1)),
	};
	sign_token(SESSION_TOKEN_PREFIX, &claims, secret)
}

#[derive(Debug, Clone)]
pub struct SessionValidator {
	secret: SecretString,
	revocations: Arc<RevocationSet>,
}

impl SessionValidator {
	pub fn new(secret: SecretString, revocations: Arc<RevocationSet>) -> Self {
		Self { secret, revocations }
	}

	pub fn issue(&self, identity: &Identity, ttl: Duration) -> Result<String, TokenError> {
		issue_session_token(identity, ttl, &self.secret)
	}

	/// Signature, expiry, then revocation. Callers run role checks only on
	/// the returned session.
	pub fn validate(&self, token: &str) -> Result<Session, TokenError> {
		let now = unix_secs_now();
		let claims: SessionClaims = open_token(SESSION_TOKEN_PREFIX, token.trim(), &self.secret, now)?;
		if self.revocations.is_revoked_at(&claims.jti, now) {
			debug!(subject = %claims.sub, "rejected revoked session token");
			metrics::counter!("classchat_auth_rejected_total", "reason" => "revoked").increment(1);
			return Err(TokenError::Revoked);
		}
		let subject_id = SubjectId::new(claims.sub).map_err(|_| TokenError::Malformed)?;
		Ok(Session {
			identity: Identity::new(subject_id, claims.name, claims.role),
			token_id: claims.jti,
			expires_at: claims.exp,
		})
	}

	/// Re-check an already-validated session before each operation.
	pub fn check_live(&self, session: &Session) -> Result<(), TokenError> {
		let now = unix_secs_now();
		if session.expires_at <= now {
			return Err(TokenError::Expired);
		}
		if self.revocations.is_revoked_at(&session.token_id, now) {
			return Err(TokenError::Revoked);
		}
		Ok(())
	}

	pub fn revoke(&self, session: &Session) {
		self.revocations.revoke(&session.token_id, session.expires_at);
	}

	pub fn revocations(&self) -> &Arc<RevocationSet> {
		&self.revocations
	}
}
