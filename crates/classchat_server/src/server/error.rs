#![forbid(unsafe_code)]

use classchat_protocol::pb;
use hyper::StatusCode;
use thiserror::Error;

/// Credential verification failures. Never carries the raw token.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TokenError {
	#[error("malformed token")]
	Malformed,
	#[error("invalid token signature")]
	BadSignature,
	#[error("token expired")]
	Expired,
	#[error("token revoked")]
	Revoked,
	#[error("token signing failed")]
	Signing,
}

#[derive(Debug, Error)]
pub enum StoreError {
	#[error("database error: {0}")]
	Sqlx(#[from] sqlx::Error),

	#[error("migration error: {0}")]
	Migrate(#[from] sqlx::migrate::MigrateError),

	#[error("corrupt record: {0}")]
	Corrupt(String),

	#[error("store unavailable: {0}")]
	Unavailable(String),
}

/// Failures of the room-access (REST) operations.
#[derive(Debug, Error)]
pub enum AccessError {
	#[error("authentication required")]
	Unauthenticated,

	#[error("forbidden")]
	Forbidden,

	#[error("invalid {field}: {reason}")]
	Validation { field: &'static str, reason: String },

	/// Wrong password, unknown room and inactive room all collapse here so a
	/// caller cannot probe which rooms exist. Keep it that way.
	#[error("join failed")]
	JoinFailed,

	/// Only reported once the password has been accepted.
	#[error("room is full")]
	CapacityExceeded,

	#[error("room not found")]
	NotFound,

	#[error("rate limited; retry after {retry_after_secs}s")]
	RateLimited { retry_after_secs: u64 },

	#[error("persistence failure: {0}")]
	Persistence(#[from] StoreError),

	#[error("internal error: {0}")]
	Internal(String),
}

impl AccessError {
	pub fn validation(field: &'static str, reason: impl Into<String>) -> Self {
		AccessError::Validation {
			field,
			reason: reason.into(),
		}
	}

	pub fn status(&self) -> StatusCode {
		match self {
			AccessError::Unauthenticated => StatusCode::UNAUTHORIZED,
			AccessError::Forbidden | AccessError::JoinFailed => StatusCode::FORBIDDEN,
			AccessError::Validation { .. } => StatusCode::BAD_REQUEST,
			AccessError::CapacityExceeded => StatusCode::CONFLICT,
			AccessError::NotFound => StatusCode::NOT_FOUND,
			AccessError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
			AccessError::Persistence(_) => StatusCode::SERVICE_UNAVAILABLE,
			AccessError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
		}
	}

	/// Stable machine-readable code for response bodies.
	pub fn code(&self) -> &'static str {
		match self {
			AccessError::Unauthenticated => "unauthenticated",
			AccessError::Forbidden => "forbidden",
			AccessError::Validation { .. } => "validation_failed",
			AccessError::JoinFailed => "join_failed",
			AccessError::CapacityExceeded => "capacity_exceeded",
			AccessError::NotFound => "not_found",
			AccessError::RateLimited { .. } => "rate_limited",
			AccessError::Persistence(_) => "persistence_failure",
			AccessError::Internal(_) => "internal",
		}
	}
}

impl From<TokenError> for AccessError {
	fn from(_: TokenError) -> Self {
		AccessError::Unauthenticated
	}
}

/// Rejections on the real-time channel. None of these close the connection.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HubError {
	#[error("authentication failed")]
	Authentication,

	#[error("forbidden")]
	Forbidden,

	#[error("invalid {field}: {reason}")]
	Validation { field: &'static str, reason: String },

	#[error("room is full")]
	CapacityExceeded,

	#[error("rate limited; retry after {retry_after_secs}s")]
	RateLimited { retry_after_secs: u64 },

	/// The message was not persisted and nobody else received it.
	#[error("message not delivered")]
	NotDelivered,

	#[error("persistence failure")]
	Persistence,

	#[error("not in room")]
	NotInRoom,

	#[error("connection closed")]
	Disconnected,
}

impl HubError {
	pub fn validation(field: &'static str, reason: impl Into<String>) -> Self {
		HubError::Validation {
			field,
			reason: reason.into(),
		}
	}

	pub fn code(&self) -> pb::ErrorCode {
		match self {
			HubError::Authentication => pb::ErrorCode::AuthenticationFailed,
			HubError::Forbidden => pb::ErrorCode::Forbidden,
			HubError::Validation { .. } => pb::ErrorCode::Validation,
			HubError::CapacityExceeded => pb::ErrorCode::CapacityExceeded,
			HubError::RateLimited { .. } => pb::ErrorCode::RateLimited,
			HubError::NotDelivered => pb::ErrorCode::NotDelivered,
			HubError::Persistence | HubError::Disconnected => pb::ErrorCode::Internal,
			HubError::NotInRoom => pb::ErrorCode::NotInRoom,
		}
	}

	/// Short label for metrics.
	pub fn kind(&self) -> &'static str {
		match self {
			HubError::Authentication => "authentication",
			HubError::Forbidden => "forbidden",
			HubError::Validation { .. } => "validation",
			HubError::CapacityExceeded => "capacity",
			HubError::RateLimited { .. } => "rate_limited",
			HubError::NotDelivered => "not_delivered",
			HubError::Persistence => "persistence",
			HubError::NotInRoom => "not_in_room",
			HubError::Disconnected => "disconnected",
		}
	}

	pub fn to_pb(&self) -> pb::Error {
		let (field, retry_after_secs) = match self {
			HubError::Validation { field, .. } => ((*field).to_string(), 0),
			HubError::RateLimited { retry_after_secs } => (String::new(), (*retry_after_secs).min(u32::MAX as u64) as u32),
			_ => (String::new(), 0),
		};
		pb::Error {
			code: self.code() as i32,
			detail: self.to_string(),
			field,
			retry_after_secs,
		}
	}
}

impl From<TokenError> for HubError {
	fn from(_: TokenError) -> Self {
		HubError::Authentication
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn join_failed_does_not_reveal_cause() {
		let e = AccessError::JoinFailed;
		assert_eq!(e.status(), StatusCode::FORBIDDEN);
		assert_eq!(e.to_string(), "join failed");
	}

	#[test]
	fn hub_errors_map_to_wire_codes() {
		let e = HubError::RateLimited { retry_after_secs: 7 }.to_pb();
		assert_eq!(e.code, pb::ErrorCode::RateLimited as i32);
		assert_eq!(e.retry_after_secs, 7);

		let e = HubError::validation("content", "too long").to_pb();
		assert_eq!(e.code, pb::ErrorCode::Validation as i32);
		assert_eq!(e.field, "content");
	}

	#[test]
	fn token_errors_collapse_to_authentication() {
		assert_eq!(HubError::from(TokenError::Revoked), HubError::Authentication);
		assert!(matches!(AccessError::from(TokenError::Expired), AccessError::Unauthenticated));
	}
}
