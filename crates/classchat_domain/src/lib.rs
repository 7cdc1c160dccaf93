#![forbid(unsafe_code)]

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Maximum room display name length (characters).
pub const ROOM_NAME_MAX_CHARS: usize = 100;

/// Maximum room description length (characters).
pub const ROOM_DESCRIPTION_MAX_CHARS: usize = 500;

/// Default room capacity.
pub const DEFAULT_MAX_PARTICIPANTS: u32 = 50;

/// Errors for parsing identifiers and enums from strings.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseIdError {
	#[error("empty value")]
	Empty,
	#[error("invalid format: {0}")]
	InvalidFormat(String),
	#[error("unknown privacy level: {0}")]
	UnknownPrivacyLevel(String),
	#[error("unknown role: {0}")]
	UnknownRole(String),
}

/// Who may discover and enter a room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PrivacyLevel {
	Public,
	Private,
	Restricted,
}

impl PrivacyLevel {
	/// Stable string identifier.
	pub const fn as_str(self) -> &'static str {
		match self {
			PrivacyLevel::Public => "public",
			PrivacyLevel::Private => "private",
			PrivacyLevel::Restricted => "restricted",
		}
	}

	/// `Private` and `Restricted` rooms are password gated.
	pub const fn requires_password(self) -> bool {
		!matches!(self, PrivacyLevel::Public)
	}
}

impl fmt::Display for PrivacyLevel {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for PrivacyLevel {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let s = s.trim();
		if s.is_empty() {
			return Err(ParseIdError::Empty);
		}

		match s.to_ascii_lowercase().as_str() {
			"public" => Ok(PrivacyLevel::Public),
			"private" => Ok(PrivacyLevel::Private),
			"restricted" => Ok(PrivacyLevel::Restricted),
			other => Err(ParseIdError::UnknownPrivacyLevel(other.to_string())),
		}
	}
}

/// Account role carried by the session credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
	Admin,
	Teacher,
	Student,
}

impl Role {
	pub const fn as_str(self) -> &'static str {
		match self {
			Role::Admin => "admin",
			Role::Teacher => "teacher",
			Role::Student => "student",
		}
	}

	pub const fn is_admin(self) -> bool {
		matches!(self, Role::Admin)
	}
}

impl fmt::Display for Role {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for Role {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let s = s.trim();
		if s.is_empty() {
			return Err(ParseIdError::Empty);
		}

		match s.to_ascii_lowercase().as_str() {
			"admin" | "administrator" => Ok(Role::Admin),
			"teacher" => Ok(Role::Teacher),
			"student" => Ok(Role::Student),
			other => Err(ParseIdError::UnknownRole(other.to_string())),
		}
	}
}

/// Standing of a subject inside one room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemberRole {
	Owner,
	Moderator,
	Member,
}

impl MemberRole {
	pub const fn as_str(self) -> &'static str {
		match self {
			MemberRole::Owner => "owner",
			MemberRole::Moderator => "moderator",
			MemberRole::Member => "member",
		}
	}

	pub const fn can_moderate(self) -> bool {
		matches!(self, MemberRole::Owner | MemberRole::Moderator)
	}
}

impl FromStr for MemberRole {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s.trim().to_ascii_lowercase().as_str() {
			"" => Err(ParseIdError::Empty),
			"owner" => Ok(MemberRole::Owner),
			"moderator" => Ok(MemberRole::Moderator),
			"member" => Ok(MemberRole::Member),
			other => Err(ParseIdError::UnknownRole(other.to_string())),
		}
	}
}

/// Server-assigned room identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(pub uuid::Uuid);

impl RoomId {
	/// Create a new random room id.
	pub fn new_v4() -> Self {
		Self(uuid::Uuid::new_v4())
	}

	pub fn parse(s: &str) -> Result<Self, ParseIdError> {
		let s = s.trim();
		if s.is_empty() {
			return Err(ParseIdError::Empty);
		}
		uuid::Uuid::parse_str(s)
			.map(Self)
			.map_err(|_| ParseIdError::InvalidFormat("expected a uuid room id".into()))
	}
}

impl fmt::Display for RoomId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

impl FromStr for RoomId {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		RoomId::parse(s)
	}
}

/// Account identifier issued by the identity provider.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubjectId(String);

impl SubjectId {
	/// Create a non-empty `SubjectId`.
	pub fn new(id: impl Into<String>) -> Result<Self, ParseIdError> {
		let id = id.into();
		if id.trim().is_empty() {
			return Err(ParseIdError::Empty);
		}
		Ok(Self(id))
	}
	pub fn as_str(&self) -> &str {
		&self.0
	}
	pub fn into_string(self) -> String {
		self.0
	}
}

impl fmt::Display for SubjectId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl FromStr for SubjectId {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		SubjectId::new(s.to_string())
	}
}

/// Process-local identifier of one physical real-time connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "conn-{}", self.0)
	}
}

/// Server-assigned message identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub uuid::Uuid);

impl MessageId {
	/// Create a new random message id.
	pub fn new_v4() -> Self {
		Self(uuid::Uuid::new_v4())
	}
}

impl fmt::Display for MessageId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

/// Authenticated caller, as resolved from a session credential.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
	pub subject_id: SubjectId,
	pub display_name: String,
	pub role: Role,
}

impl Identity {
	pub fn new(subject_id: SubjectId, display_name: impl Into<String>, role: Role) -> Self {
		Self {
			subject_id,
			display_name: display_name.into(),
			role,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn privacy_level_parse_and_display() {
		assert_eq!("public".parse::<PrivacyLevel>().unwrap(), PrivacyLevel::Public);
		assert_eq!("Restricted".parse::<PrivacyLevel>().unwrap(), PrivacyLevel::Restricted);
		assert_eq!(PrivacyLevel::Private.to_string(), "private");
		assert!("secret".parse::<PrivacyLevel>().is_err());
	}

	#[test]
	fn only_public_rooms_skip_passwords() {
		assert!(!PrivacyLevel::Public.requires_password());
		assert!(PrivacyLevel::Private.requires_password());
		assert!(PrivacyLevel::Restricted.requires_password());
	}

	#[test]
	fn room_id_parse_roundtrip() {
		let id = RoomId::new_v4();
		assert_eq!(RoomId::parse(&id.to_string()).unwrap(), id);
		assert!(RoomId::parse("not-a-room").is_err());
	}

	#[test]
	fn role_parse_accepts_aliases() {
		assert_eq!("administrator".parse::<Role>().unwrap(), Role::Admin);
		assert_eq!("TEACHER".parse::<Role>().unwrap(), Role::Teacher);
		assert!("janitor".parse::<Role>().is_err());
	}

	#[test]
	fn rejects_empty_ids() {
		assert!(SubjectId::new("").is_err());
		assert!(SubjectId::new("   ").is_err());
		assert!("".parse::<RoomId>().is_err());
	}
}
