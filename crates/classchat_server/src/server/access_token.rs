#![forbid(unsafe_code)]

use std::time::Duration;

use classchat_domain::{RoomId, SubjectId};
use serde::{Deserialize, Serialize};

use crate::config::SecretString;
use crate::server::auth::{ExpiringClaims, new_token_id, open_token, sign_token};
use crate::server::error::TokenError;
use crate::util::time::unix_secs_now;

pub const ROOM_TOKEN_PREFIX: &str = "ra1";

/// Capability to enter one room as one subject, valid for one room generation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomAccessClaims {
	pub sub: String,
	pub room: RoomId,
	#[serde(rename = "gen")]
	pub generation: u64,
	pub iat: u64,
	pub exp: u64,
	pub moderator: bool,
	pub jti: String,
}

impl ExpiringClaims for RoomAccessClaims {
	fn expires_at(&self) -> u64 {
		self.exp
	}
}

#[derive(Debug, Clone)]
pub struct RoomTokenIssuer {
	secret: SecretString,
	ttl: Duration,
}

impl RoomTokenIssuer {
	pub fn new(secret: SecretString, ttl: Duration) -> Self {
		Self { secret, ttl }
	}

	pub fn ttl(&self) -> Duration {
		self.ttl
	}

	pub fn issue(
		&self,
		subject: &SubjectId,
		room: RoomId,
		generation: u64,
		moderator: bool,
	) -> Result<(String, RoomAccessClaims), TokenError> {
		let iat = unix_secs_now();
		let claims = RoomAccessClaims {
			sub: subject.to_string(),
			room,
			generation,
			iat,
			exp: iat.saturating_add(self.ttl.as_secs().max(1)),
			moderator,
			jti: new_token_id(),
		};
		let token = sign_token(ROOM_TOKEN_PREFIX, &claims, &self.secret)?;
		Ok((token, claims))
	}

	/// Signature and expiry only. Subject, room and generation are checked by
	/// the hub against live state.
	pub fn verify(&self, token: &str) -> Result<RoomAccessClaims, TokenError> {
		self.verify_at(token, unix_secs_now())
	}

	pub fn verify_at(&self, token: &str, now: u64) -> Result<RoomAccessClaims, TokenError> {
		open_token(ROOM_TOKEN_PREFIX, token.trim(), &self.secret, now)
	}
}
