#![forbid(unsafe_code)]

//! Durable room registry, membership records and message history.

pub mod sqlite;

use std::collections::{HashMap, VecDeque};
use std::future::Future;

use classchat_domain::{MemberRole, MessageId, PrivacyLevel, RoomId, SubjectId};
use dashmap::DashMap;
use tokio::sync::RwLock;
use tracing::warn;

use crate::server::error::StoreError;

pub use sqlite::SqliteStore;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Room {
	pub id: RoomId,
	pub name: String,
	pub description: Option<String>,
	pub privacy: PrivacyLevel,
	/// Present iff `privacy` is not `Public`.
	pub password_hash: Option<String>,
	pub created_by: SubjectId,
	pub max_participants: u32,
	pub created_at_ms: i64,
	pub last_activity_ms: i64,
	pub active: bool,
	pub recording_allowed: bool,
	pub encryption_enabled: bool,
	/// Bumped on delete and on credential change; access tokens carry it.
	pub generation: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomMember {
	pub room_id: RoomId,
	pub subject_id: SubjectId,
	pub display_name: String,
	pub role: MemberRole,
	pub joined_at_ms: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
	pub id: MessageId,
	pub room_id: RoomId,
	pub sender_id: SubjectId,
	pub sender_name: String,
	/// Ciphertext when `encrypted`, UTF-8 otherwise.
	pub body: Vec<u8>,
	pub encrypted: bool,
	pub sent_at_ms: i64,
	pub edited: bool,
}

#[async_trait::async_trait]
pub trait RoomStore: Send + Sync {
	async fn insert_room(&self, room: &Room) -> Result<(), StoreError>;

	async fn get_room(&self, id: RoomId) -> Result<Option<Room>, StoreError>;

	/// Overwrite mutable fields if the room is active and still at
	/// `expected_generation`. Returns whether a row changed.
	async fn update_room(&self, room: &Room, expected_generation: u64) -> Result<bool, StoreError>;

	/// Mark inactive and bump the generation. `None` if missing or already inactive.
	async fn deactivate_room(&self, id: RoomId) -> Result<Option<u64>, StoreError>;

	async fn touch_room(&self, id: RoomId, at_ms: i64) -> Result<(), StoreError>;

	async fn list_active_public_rooms(&self) -> Result<Vec<Room>, StoreError>;

	/// Insert the member or refresh its display name. An existing role is kept.
	async fn upsert_member(&self, member: &RoomMember) -> Result<RoomMember, StoreError>;

	async fn get_member(&self, room: RoomId, subject: &SubjectId) -> Result<Option<RoomMember>, StoreError>;

	async fn list_members(&self, room: RoomId) -> Result<Vec<RoomMember>, StoreError>;

	/// Set the role, creating the membership record when needed.
	async fn set_member_role(&self, room: RoomId, subject: &SubjectId, role: MemberRole) -> Result<(), StoreError>;
}

#[async_trait::async_trait]
pub trait MessageStore: Send + Sync {
	async fn append(&self, message: &StoredMessage) -> Result<(), StoreError>;

	/// Newest `count` messages, oldest first.
	async fn recent(&self, room: RoomId, count: usize) -> Result<Vec<StoredMessage>, StoreError>;

	async fn purge_room(&self, room: RoomId) -> Result<u64, StoreError>;
}

/// Run `op` and, if it fails, once more.
pub async fn with_retry<T, F, Fut>(op: &'static str, mut f: F) -> Result<T, StoreError>
where
	F: FnMut() -> Fut,
	Fut: Future<Output = Result<T, StoreError>>,
{
	match f().await {
		Ok(v) => Ok(v),
		Err(e) => {
			warn!(op, error = %e, "store operation failed; retrying once");
			metrics::counter!("classchat_store_retries_total", "op" => op).increment(1);
			f().await
		}
	}
}

#[derive(Debug, Default)]
pub struct InMemoryRoomStore {
	rooms: RwLock<HashMap<RoomId, Room>>,
	members: RwLock<HashMap<RoomId, Vec<RoomMember>>>,
}

impl InMemoryRoomStore {
	pub fn new() -> Self {
		Self::default()
	}
}

#[async_trait::async_trait]
impl RoomStore for InMemoryRoomStore {
	async fn insert_room(&self, room: &Room) -> Result<(), StoreError> {
		let mut rooms = self.rooms.write().await;
		if rooms.contains_key(&room.id) {
			return Err(StoreError::Corrupt(format!("duplicate room id {}", room.id)));
		}
		rooms.insert(room.id, room.clone());
		Ok(())
	}

	async fn get_room(&self, id: RoomId) -> Result<Option<Room>, StoreError> {
		Ok(self.rooms.read().await.get(&id).cloned())
	}

	async fn update_room(&self, room: &Room, expected_generation: u64) -> Result<bool, StoreError> {
		let mut rooms = self.rooms.write().await;
		let Some(existing) = rooms.get_mut(&room.id) else {
			return Ok(false);
		};
		if !existing.active || existing.generation != expected_generation {
			return Ok(false);
		}
		existing.name = room.name.clone();
		existing.description = room.description.clone();
		existing.privacy = room.privacy;
		existing.password_hash = room.password_hash.clone();
		existing.max_participants = room.max_participants;
		existing.recording_allowed = room.recording_allowed;
		existing.encryption_enabled = room.encryption_enabled;
		existing.generation = room.generation;
		existing.last_activity_ms = room.last_activity_ms;
		Ok(true)
	}

	async fn deactivate_room(&self, id: RoomId) -> Result<Option<u64>, StoreError> {
		let mut rooms = self.rooms.write().await;
		match rooms.get_mut(&id) {
			Some(room) if room.active => {
				room.active = false;
				room.generation = room.generation.saturating_add(1);
				Ok(Some(room.generation))
			}
			_ => Ok(None),
		}
	}

	async fn touch_room(&self, id: RoomId, at_ms: i64) -> Result<(), StoreError> {
		if let Some(room) = self.rooms.write().await.get_mut(&id) {
			room.last_activity_ms = room.last_activity_ms.max(at_ms);
		}
		Ok(())
	}

	async fn list_active_public_rooms(&self) -> Result<Vec<Room>, StoreError> {
		let mut rooms: Vec<Room> = self
			.rooms
			.read()
			.await
			.values()
			.filter(|r| r.active && r.privacy == PrivacyLevel::Public)
			.cloned()
			.collect();
		rooms.sort_by(|a, b| a.created_at_ms.cmp(&b.created_at_ms).then_with(|| a.id.cmp(&b.id)));
		Ok(rooms)
	}

	async fn upsert_member(&self, member: &RoomMember) -> Result<RoomMember, StoreError> {
		let mut members = self.members.write().await;
		let list = members.entry(member.room_id).or_default();
		if let Some(existing) = list.iter_mut().find(|m| m.subject_id == member.subject_id) {
			existing.display_name = member.display_name.clone();
			return Ok(existing.clone());
		}
		list.push(member.clone());
		Ok(member.clone())
	}

	async fn get_member(&self, room: RoomId, subject: &SubjectId) -> Result<Option<RoomMember>, StoreError> {
		Ok(self
			.members
			.read()
			.await
			.get(&room)
			.and_then(|list| list.iter().find(|m| &m.subject_id == subject).cloned()))
	}

	async fn list_members(&self, room: RoomId) -> Result<Vec<RoomMember>, StoreError> {
		Ok(self.members.read().await.get(&room).cloned().unwrap_or_default())
	}

	async fn set_member_role(&self, room: RoomId, subject: &SubjectId, role: MemberRole) -> Result<(), StoreError> {
		let mut members = self.members.write().await;
		let list = members.entry(room).or_default();
		match list.iter_mut().find(|m| &m.subject_id == subject) {
			Some(existing) => existing.role = role,
			None => list.push(RoomMember {
				room_id: room,
				subject_id: subject.clone(),
				display_name: subject.to_string(),
				role,
				joined_at_ms: crate::util::time::unix_ms_now(),
			}),
		}
		Ok(())
	}
}

/// Bounded per-room history.
#[derive(Debug)]
pub struct InMemoryMessageStore {
	capacity: usize,
	rooms: DashMap<RoomId, VecDeque<StoredMessage>>,
}

impl InMemoryMessageStore {
	pub fn new(capacity: usize) -> Self {
		Self {
			capacity: capacity.max(1),
			rooms: DashMap::new(),
		}
	}
}

#[async_trait::async_trait]
impl MessageStore for InMemoryMessageStore {
	async fn append(&self, message: &StoredMessage) -> Result<(), StoreError> {
		let mut buf = self.rooms.entry(message.room_id).or_default();
		buf.push_back(message.clone());
		while buf.len() > self.capacity {
			buf.pop_front();
		}
		Ok(())
	}

	async fn recent(&self, room: RoomId, count: usize) -> Result<Vec<StoredMessage>, StoreError> {
		let Some(buf) = self.rooms.get(&room) else {
			return Ok(Vec::new());
		};
		let skip = buf.len().saturating_sub(count);
		Ok(buf.iter().skip(skip).cloned().collect())
	}

	async fn purge_room(&self, room: RoomId) -> Result<u64, StoreError> {
		Ok(self.rooms.remove(&room).map(|(_, buf)| buf.len() as u64).unwrap_or(0))
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::util::time::unix_ms_now;

	fn sample_room(privacy: PrivacyLevel) -> Room {
		let now = unix_ms_now();
		Room {
			id: RoomId::new_v4(),
			name: "Algebra".into(),
			description: None,
			privacy,
			password_hash: None,
			created_by: SubjectId::new("teacher").expect("subject"),
			max_participants: 50,
			created_at_ms: now,
			last_activity_ms: now,
			active: true,
			recording_allowed: false,
			encryption_enabled: true,
			generation: 0,
		}
	}

	fn message(room: RoomId, n: usize) -> StoredMessage {
		StoredMessage {
			id: MessageId::new_v4(),
			room_id: room,
			sender_id: SubjectId::new("alice").expect("subject"),
			sender_name: "Alice".into(),
			body: format!("m{n}").into_bytes(),
			encrypted: false,
			sent_at_ms: n as i64,
			edited: false,
		}
	}

	#[tokio::test]
	async fn deactivate_bumps_generation_once() {
		let store = InMemoryRoomStore::new();
		let room = sample_room(PrivacyLevel::Public);
		store.insert_room(&room).await.expect("insert");

		assert_eq!(store.deactivate_room(room.id).await.expect("deactivate"), Some(1));
		assert_eq!(store.deactivate_room(room.id).await.expect("deactivate"), None);

		let loaded = store.get_room(room.id).await.expect("get").expect("room");
		assert!(!loaded.active);
		assert_eq!(loaded.generation, 1);
		assert!(store.list_active_public_rooms().await.expect("list").is_empty());
	}

	#[tokio::test]
	async fn update_requires_matching_generation() {
		let store = InMemoryRoomStore::new();
		let mut room = sample_room(PrivacyLevel::Public);
		store.insert_room(&room).await.expect("insert");

		room.name = "Geometry".into();
		room.generation = 1;
		assert!(store.update_room(&room, 0).await.expect("update"));
		assert!(!store.update_room(&room, 0).await.expect("stale update"));
		assert_eq!(store.get_room(room.id).await.expect("get").expect("room").name, "Geometry");
	}

	#[tokio::test]
	async fn upsert_keeps_granted_role() {
		let store = InMemoryRoomStore::new();
		let room = RoomId::new_v4();
		let bob = SubjectId::new("bob").expect("subject");
		store.set_member_role(room, &bob, MemberRole::Moderator).await.expect("grant");

		let stored = store
			.upsert_member(&RoomMember {
				room_id: room,
				subject_id: bob.clone(),
				display_name: "Bob".into(),
				role: MemberRole::Member,
				joined_at_ms: 0,
			})
			.await
			.expect("upsert");
		assert_eq!(stored.role, MemberRole::Moderator);
		assert_eq!(stored.display_name, "Bob");
		assert_eq!(store.list_members(room).await.expect("list").len(), 1);
	}

	#[tokio::test]
	async fn history_is_bounded_and_chronological() {
		let store = InMemoryMessageStore::new(5);
		let room = RoomId::new_v4();
		for n in 0..8 {
			store.append(&message(room, n)).await.expect("append");
		}

		let recent = store.recent(room, 3).await.expect("recent");
		let bodies: Vec<_> = recent.iter().map(|m| String::from_utf8_lossy(&m.body).into_owned()).collect();
		assert_eq!(bodies, ["m5", "m6", "m7"]);
		assert_eq!(store.recent(room, 50).await.expect("recent").len(), 5);

		assert_eq!(store.purge_room(room).await.expect("purge"), 5);
		assert!(store.recent(room, 50).await.expect("recent").is_empty());
	}

	#[tokio::test]
	async fn retry_runs_once_more_after_failure() {
		let mut calls = 0;
		let out = with_retry("test", || {
			calls += 1;
			let attempt = calls;
			async move {
				if attempt == 1 {
					Err(StoreError::Unavailable("flaky".into()))
				} else {
					Ok(attempt)
				}
			}
		})
		.await
		.expect("second attempt succeeds");
		assert_eq!(out, 2);
	}
}
