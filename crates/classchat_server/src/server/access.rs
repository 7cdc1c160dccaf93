#![forbid(unsafe_code)]

//! Room lifecycle and password-gated entry.
//!
//! Contract: joining an unknown room, an inactive room, or a gated room with
//! the wrong password all fail with the same `AccessError::JoinFailed`, and an
//! Argon2 verify runs in every one of those cases. That sameness is what stops
//! room ids from being enumerated; keep it that way when changing error
//! reporting here. Capacity is only reported once the password was accepted.

use std::fmt;
use std::sync::Arc;

use classchat_domain::{
	DEFAULT_MAX_PARTICIPANTS, Identity, MemberRole, PrivacyLevel, ROOM_DESCRIPTION_MAX_CHARS, ROOM_NAME_MAX_CHARS,
	Role, RoomId, SubjectId,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::server::access_token::RoomTokenIssuer;
use crate::server::audit::{AuditService, ModerationAction};
use crate::server::error::AccessError;
use crate::server::hub::Hub;
use crate::server::password::PasswordGate;
use crate::server::store::{MessageStore, Room, RoomMember, RoomStore, with_retry};
use crate::util::time::unix_ms_now;

/// Live presence as seen by the access layer.
#[async_trait::async_trait]
pub trait RoomOccupancy: Send + Sync {
	async fn occupancy(&self, room: RoomId) -> usize;

	/// Disconnect everyone present; returns how many were evicted.
	async fn close_room(&self, room: RoomId, generation: u64) -> usize;

	fn invalidate_tokens(&self, room: RoomId, generation: u64);
}

#[async_trait::async_trait]
impl RoomOccupancy for Hub {
	async fn occupancy(&self, room: RoomId) -> usize {
		Hub::occupancy(self, room).await
	}

	async fn close_room(&self, room: RoomId, generation: u64) -> usize {
		Hub::close_room(self, room, generation).await
	}

	fn invalidate_tokens(&self, room: RoomId, generation: u64) {
		Hub::invalidate_tokens(self, room, generation);
	}
}

#[derive(Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRoomRequest {
	pub name: String,
	#[serde(default)]
	pub description: Option<String>,
	pub privacy_level: PrivacyLevel,
	#[serde(default)]
	pub password: Option<String>,
	#[serde(default)]
	pub max_participants: Option<u32>,
	#[serde(default)]
	pub recording_allowed: Option<bool>,
	#[serde(default)]
	pub encryption_enabled: Option<bool>,
}

impl fmt::Debug for CreateRoomRequest {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("CreateRoomRequest")
			.field("name", &self.name)
			.field("privacy_level", &self.privacy_level)
			.field("password", &self.password.as_ref().map(|_| "<redacted>"))
			.field("max_participants", &self.max_participants)
			.finish_non_exhaustive()
	}
}

#[derive(Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinRoomRequest {
	pub room_id: String,
	#[serde(default)]
	pub password: Option<String>,
}

impl fmt::Debug for JoinRoomRequest {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("JoinRoomRequest")
			.field("room_id", &self.room_id)
			.field("password", &self.password.as_ref().map(|_| "<redacted>"))
			.finish()
	}
}

/// Fields left `None` are unchanged. An empty description clears it.
#[derive(Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateRoomRequest {
	#[serde(default)]
	pub name: Option<String>,
	#[serde(default)]
	pub description: Option<String>,
	#[serde(default)]
	pub privacy_level: Option<PrivacyLevel>,
	#[serde(default)]
	pub password: Option<String>,
	#[serde(default)]
	pub max_participants: Option<u32>,
	#[serde(default)]
	pub recording_allowed: Option<bool>,
	#[serde(default)]
	pub encryption_enabled: Option<bool>,
}

impl fmt::Debug for UpdateRoomRequest {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("UpdateRoomRequest")
			.field("name", &self.name)
			.field("privacy_level", &self.privacy_level)
			.field("password", &self.password.as_ref().map(|_| "<redacted>"))
			.finish_non_exhaustive()
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomDetails {
	pub id: RoomId,
	pub name: String,
	pub description: Option<String>,
	pub privacy_level: PrivacyLevel,
	pub max_participants: u32,
	pub current_participants: usize,
	pub created_by: SubjectId,
	pub created_at: i64,
	pub last_activity_at: i64,
	pub recording_allowed: bool,
	pub encryption_enabled: bool,
}

impl RoomDetails {
	fn new(room: &Room, current_participants: usize) -> Self {
		Self {
			id: room.id,
			name: room.name.clone(),
			description: room.description.clone(),
			privacy_level: room.privacy,
			max_participants: room.max_participants,
			current_participants,
			created_by: room.created_by.clone(),
			created_at: room.created_at_ms,
			last_activity_at: room.last_activity_ms,
			recording_allowed: room.recording_allowed,
			encryption_enabled: room.encryption_enabled,
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberDetails {
	pub subject_id: SubjectId,
	pub display_name: String,
	pub role: MemberRole,
	pub joined_at: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinGrant {
	pub room_access_token: String,
	pub expires_at: u64,
	pub moderator: bool,
	pub room_details: RoomDetails,
}

pub struct RoomAccessService {
	rooms: Arc<dyn RoomStore>,
	messages: Arc<dyn MessageStore>,
	passwords: PasswordGate,
	tokens: RoomTokenIssuer,
	occupancy: Arc<dyn RoomOccupancy>,
	audit: AuditService,
	allow_student_room_creation: bool,
}

fn validate_name(name: &str) -> Result<String, AccessError> {
	let name = name.trim();
	if name.is_empty() {
		return Err(AccessError::validation("name", "required"));
	}
	if name.chars().count() > ROOM_NAME_MAX_CHARS {
		return Err(AccessError::validation(
			"name",
			format!("at most {ROOM_NAME_MAX_CHARS} characters"),
		));
	}
	Ok(name.to_string())
}

fn validate_description(description: Option<&str>) -> Result<Option<String>, AccessError> {
	let Some(d) = description.map(str::trim).filter(|d| !d.is_empty()) else {
		return Ok(None);
	};
	if d.chars().count() > ROOM_DESCRIPTION_MAX_CHARS {
		return Err(AccessError::validation(
			"description",
			format!("at most {ROOM_DESCRIPTION_MAX_CHARS} characters"),
		));
	}
	Ok(Some(d.to_string()))
}

fn validate_capacity(max: u32) -> Result<u32, AccessError> {
	if max == 0 {
		return Err(AccessError::validation("maxParticipants", "must be at least 1"));
	}
	Ok(max)
}

fn parse_room_id(raw: &str) -> Result<RoomId, AccessError> {
	RoomId::parse(raw).map_err(|e| AccessError::validation("roomId", e.to_string()))
}

/// Empty strings count as "no password".
fn normalize_password(password: Option<String>) -> Option<String> {
	password.filter(|p| !p.is_empty())
}

impl RoomAccessService {
	pub fn new(
		rooms: Arc<dyn RoomStore>,
		messages: Arc<dyn MessageStore>,
		passwords: PasswordGate,
		tokens: RoomTokenIssuer,
		occupancy: Arc<dyn RoomOccupancy>,
		audit: AuditService,
	) -> Self {
		Self {
			rooms,
			messages,
			passwords,
			tokens,
			occupancy,
			audit,
			allow_student_room_creation: false,
		}
	}

	pub fn allow_student_room_creation(mut self, allow: bool) -> Self {
		self.allow_student_room_creation = allow;
		self
	}

	async fn load_room(&self, id: RoomId) -> Result<Option<Room>, AccessError> {
		let rooms = &self.rooms;
		Ok(with_retry("get_room", || rooms.get_room(id)).await?)
	}

	async fn active_room(&self, id: RoomId) -> Result<Room, AccessError> {
		match self.load_room(id).await? {
			Some(room) if room.active => Ok(room),
			_ => Err(AccessError::NotFound),
		}
	}

	async fn member_role(&self, room: RoomId, subject: &SubjectId) -> Result<Option<MemberRole>, AccessError> {
		let rooms = &self.rooms;
		Ok(with_retry("get_member", || rooms.get_member(room, subject))
			.await?
			.map(|m| m.role))
	}

	async fn can_moderate(&self, caller: &Identity, room: &Room) -> Result<bool, AccessError> {
		if room.created_by == caller.subject_id || caller.role.is_admin() {
			return Ok(true);
		}
		Ok(self
			.member_role(room.id, &caller.subject_id)
			.await?
			.is_some_and(MemberRole::can_moderate))
	}

	fn may_create(&self, role: Role) -> bool {
		match role {
			Role::Admin | Role::Teacher => true,
			Role::Student => self.allow_student_room_creation,
		}
	}

	pub async fn create_room(&self, caller: &Identity, req: CreateRoomRequest) -> Result<RoomDetails, AccessError> {
		if !self.may_create(caller.role) {
			return Err(AccessError::Forbidden);
		}

		let name = validate_name(&req.name)?;
		let description = validate_description(req.description.as_deref())?;
		let max_participants = validate_capacity(req.max_participants.unwrap_or(DEFAULT_MAX_PARTICIPANTS))?;

		let password_hash = match (req.privacy_level.requires_password(), normalize_password(req.password)) {
			(true, Some(password)) => Some(
				self.passwords
					.hash(password)
					.await
					.map_err(|e| AccessError::Internal(e.to_string()))?,
			),
			(true, None) => {
				return Err(AccessError::validation(
					"password",
					"required for private and restricted rooms",
				));
			}
			(false, Some(_)) => return Err(AccessError::validation("password", "public rooms cannot have a password")),
			(false, None) => None,
		};

		let now = unix_ms_now();
		let room = Room {
			id: RoomId::new_v4(),
			name,
			description,
			privacy: req.privacy_level,
			password_hash,
			created_by: caller.subject_id.clone(),
			max_participants,
			created_at_ms: now,
			last_activity_ms: now,
			active: true,
			recording_allowed: req.recording_allowed.unwrap_or(false),
			encryption_enabled: req.encryption_enabled.unwrap_or(true),
			generation: 0,
		};

		self.rooms.insert_room(&room).await?;
		self.rooms
			.upsert_member(&RoomMember {
				room_id: room.id,
				subject_id: caller.subject_id.clone(),
				display_name: caller.display_name.clone(),
				role: MemberRole::Owner,
				joined_at_ms: now,
			})
			.await?;

		info!(room_id = %room.id, creator = %caller.subject_id, privacy = %room.privacy, max_participants, "room created");
		metrics::counter!("classchat_rooms_created_total").increment(1);
		Ok(RoomDetails::new(&room, 0))
	}

	pub async fn join_room(&self, caller: &Identity, req: JoinRoomRequest) -> Result<JoinGrant, AccessError> {
		let room_id = parse_room_id(&req.room_id)?;
		let supplied = req.password.unwrap_or_default();

		let room = match self.load_room(room_id).await? {
			Some(room) if room.active => room,
			_ => {
				self.passwords.verify_dummy(supplied).await;
				debug!(%room_id, subject = %caller.subject_id, "join failed");
				metrics::counter!("classchat_join_failed_total").increment(1);
				return Err(AccessError::JoinFailed);
			}
		};

		if room.privacy.requires_password() && !self.passwords.verify(room.password_hash.clone(), supplied).await {
			debug!(%room_id, subject = %caller.subject_id, "join failed");
			metrics::counter!("classchat_join_failed_total").increment(1);
			return Err(AccessError::JoinFailed);
		}

		let present = self.occupancy.occupancy(room.id).await;
		if present >= room.max_participants as usize {
			debug!(%room_id, present, max = room.max_participants, "join refused: room full");
			return Err(AccessError::CapacityExceeded);
		}

		let is_creator = room.created_by == caller.subject_id;
		let member = self
			.rooms
			.upsert_member(&RoomMember {
				room_id: room.id,
				subject_id: caller.subject_id.clone(),
				display_name: caller.display_name.clone(),
				role: if is_creator { MemberRole::Owner } else { MemberRole::Member },
				joined_at_ms: unix_ms_now(),
			})
			.await?;
		let moderator = is_creator || caller.role.is_admin() || member.role.can_moderate();

		let (token, claims) = self
			.tokens
			.issue(&caller.subject_id, room.id, room.generation, moderator)
			.map_err(|e| AccessError::Internal(e.to_string()))?;

		if let Err(err) = self.rooms.touch_room(room.id, unix_ms_now()).await {
			warn!(%room_id, error = %err, "failed to record room activity");
		}

		info!(%room_id, subject = %caller.subject_id, moderator, "room access granted");
		metrics::counter!("classchat_room_tokens_issued_total").increment(1);
		Ok(JoinGrant {
			room_access_token: token,
			expires_at: claims.exp,
			moderator,
			room_details: RoomDetails::new(&room, present),
		})
	}

	/// Soft delete: the record stays, inactive, with a bumped generation.
	pub async fn delete_room(&self, caller: &Identity, room_id: &str) -> Result<(), AccessError> {
		let room_id = parse_room_id(room_id)?;
		let room = self.active_room(room_id).await?;
		if !self.can_moderate(caller, &room).await? {
			return Err(AccessError::Forbidden);
		}

		let Some(generation) = self.rooms.deactivate_room(room_id).await? else {
			return Err(AccessError::NotFound);
		};
		let evicted = self.occupancy.close_room(room_id, generation).await;

		let messages = &self.messages;
		match with_retry("purge_room", || messages.purge_room(room_id)).await {
			Ok(purged) => debug!(%room_id, purged, "room history purged"),
			Err(err) => warn!(%room_id, error = %err, "failed to purge history of deleted room"),
		}

		self.audit
			.record_moderation(&caller.subject_id, room_id, ModerationAction::DeleteRoom, None, None)
			.await;
		info!(%room_id, by = %caller.subject_id, evicted, generation, "room deleted");
		metrics::counter!("classchat_rooms_deleted_total").increment(1);
		Ok(())
	}

	pub async fn update_room(
		&self,
		caller: &Identity,
		room_id: &str,
		req: UpdateRoomRequest,
	) -> Result<RoomDetails, AccessError> {
		let room_id = parse_room_id(room_id)?;
		let current = self.active_room(room_id).await?;
		if current.created_by != caller.subject_id && !caller.role.is_admin() {
			return Err(AccessError::Forbidden);
		}

		let mut next = current.clone();
		if let Some(name) = &req.name {
			next.name = validate_name(name)?;
		}
		if let Some(description) = &req.description {
			next.description = validate_description(Some(description))?;
		}
		if let Some(max) = req.max_participants {
			next.max_participants = validate_capacity(max)?;
		}
		if let Some(recording) = req.recording_allowed {
			next.recording_allowed = recording;
		}
		if let Some(encryption) = req.encryption_enabled {
			next.encryption_enabled = encryption;
		}

		let privacy = req.privacy_level.unwrap_or(current.privacy);
		let new_password = normalize_password(req.password);
		next.privacy = privacy;
		next.password_hash = match (privacy.requires_password(), new_password) {
			(true, Some(password)) => Some(
				self.passwords
					.hash(password)
					.await
					.map_err(|e| AccessError::Internal(e.to_string()))?,
			),
			(true, None) => match &current.password_hash {
				Some(existing) if current.privacy.requires_password() => Some(existing.clone()),
				_ => {
					return Err(AccessError::validation(
						"password",
						"required for private and restricted rooms",
					));
				}
			},
			(false, Some(_)) => return Err(AccessError::validation("password", "public rooms cannot have a password")),
			(false, None) => None,
		};

		let credentials_changed = next.privacy != current.privacy || next.password_hash != current.password_hash;
		if credentials_changed {
			next.generation = current.generation.saturating_add(1);
		}
		next.last_activity_ms = unix_ms_now();

		if !self.rooms.update_room(&next, current.generation).await? {
			return Err(AccessError::NotFound);
		}
		if credentials_changed {
			self.occupancy.invalidate_tokens(room_id, next.generation);
		}

		self.audit
			.record_moderation(
				&caller.subject_id,
				room_id,
				ModerationAction::UpdateRoom,
				None,
				credentials_changed.then_some("credentials changed"),
			)
			.await;
		info!(%room_id, by = %caller.subject_id, credentials_changed, "room updated");

		let present = self.occupancy.occupancy(room_id).await;
		Ok(RoomDetails::new(&next, present))
	}

	/// Takes effect the next time the subject obtains an access token.
	pub async fn grant_moderator(&self, caller: &Identity, room_id: &str, subject: &str) -> Result<(), AccessError> {
		let room_id = parse_room_id(room_id)?;
		let subject = SubjectId::new(subject).map_err(|e| AccessError::validation("subjectId", e.to_string()))?;
		let room = self.active_room(room_id).await?;
		if room.created_by != caller.subject_id && !caller.role.is_admin() {
			return Err(AccessError::Forbidden);
		}

		self.rooms.set_member_role(room_id, &subject, MemberRole::Moderator).await?;
		self.audit
			.record_moderation(
				&caller.subject_id,
				room_id,
				ModerationAction::GrantModerator,
				Some(&subject),
				None,
			)
			.await;
		info!(%room_id, by = %caller.subject_id, subject = %subject, "moderator granted");
		Ok(())
	}

	pub async fn list_rooms(&self) -> Result<Vec<RoomDetails>, AccessError> {
		let rooms = &self.rooms;
		let listed = with_retry("list_rooms", || rooms.list_active_public_rooms()).await?;
		let mut out = Vec::with_capacity(listed.len());
		for room in &listed {
			out.push(RoomDetails::new(room, self.occupancy.occupancy(room.id).await));
		}
		Ok(out)
	}

	/// Recorded memberships of a room. Creator, moderators and admins only.
	pub async fn list_members(&self, caller: &Identity, room_id: &str) -> Result<Vec<MemberDetails>, AccessError> {
		let room_id = parse_room_id(room_id)?;
		let room = self.active_room(room_id).await?;
		if !self.can_moderate(caller, &room).await? {
			return Err(AccessError::Forbidden);
		}
		let rooms = &self.rooms;
		let members = with_retry("list_members", || rooms.list_members(room_id)).await?;
		Ok(members
			.into_iter()
			.map(|m| MemberDetails {
				subject_id: m.subject_id,
				display_name: m.display_name,
				role: m.role,
				joined_at: m.joined_at_ms,
			})
			.collect())
	}

	/// Gated rooms are only visible to their creator, admins and recorded members.
	pub async fn get_room(&self, caller: &Identity, room_id: &str) -> Result<RoomDetails, AccessError> {
		let room_id = parse_room_id(room_id)?;
		let room = self.active_room(room_id).await?;
		if room.privacy.requires_password()
			&& room.created_by != caller.subject_id
			&& !caller.role.is_admin()
			&& self.member_role(room_id, &caller.subject_id).await?.is_none()
		{
			return Err(AccessError::NotFound);
		}
		let present = self.occupancy.occupancy(room_id).await;
		Ok(RoomDetails::new(&room, present))
	}
}
