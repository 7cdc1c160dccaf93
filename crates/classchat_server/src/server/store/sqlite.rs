#![forbid(unsafe_code)]

use std::str::FromStr;

use classchat_domain::{MemberRole, MessageId, PrivacyLevel, RoomId, SubjectId};
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use tracing::{info, warn};

use super::{MessageStore, Room, RoomMember, RoomStore, StoredMessage};
use crate::server::error::StoreError;

/// Rooms, memberships, history and the moderation audit table in one SQLite database.
#[derive(Clone)]
pub struct SqliteStore {
	pool: SqlitePool,
	history_capacity: usize,
}

impl SqliteStore {
	pub async fn connect(database_url: &str, history_capacity: usize) -> Result<Self, StoreError> {
		if !database_url.starts_with("sqlite:") {
			return Err(StoreError::Unavailable("unsupported database_url (use sqlite:)".into()));
		}
		let in_memory = database_url.contains(":memory:") || database_url.contains("mode=memory");
		let opts = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);

		// Every connection to `:memory:` is a separate database; pin to one.
		let pool = if in_memory {
			SqlitePoolOptions::new()
				.max_connections(1)
				.idle_timeout(None)
				.max_lifetime(None)
				.connect_with(opts)
				.await?
		} else {
			SqlitePoolOptions::new().max_connections(8).connect_with(opts).await?
		};

		sqlx::migrate!("migrations/sqlite").run(&pool).await?;
		info!(in_memory, "sqlite store ready");

		Ok(Self {
			pool,
			history_capacity: history_capacity.max(1),
		})
	}

	pub fn pool(&self) -> &SqlitePool {
		&self.pool
	}
}

#[derive(sqlx::FromRow)]
struct RoomRow {
	id: String,
	name: String,
	description: Option<String>,
	privacy: String,
	password_hash: Option<String>,
	created_by: String,
	max_participants: i64,
	created_at_ms: i64,
	last_activity_ms: i64,
	active: bool,
	recording_allowed: bool,
	encryption_enabled: bool,
	generation: i64,
}

impl TryFrom<RoomRow> for Room {
	type Error = StoreError;

	fn try_from(row: RoomRow) -> Result<Self, Self::Error> {
		Ok(Room {
			id: RoomId::parse(&row.id).map_err(|e| StoreError::Corrupt(format!("room id: {e}")))?,
			name: row.name,
			description: row.description,
			privacy: PrivacyLevel::from_str(&row.privacy).map_err(|e| StoreError::Corrupt(format!("privacy: {e}")))?,
			password_hash: row.password_hash,
			created_by: SubjectId::new(row.created_by).map_err(|e| StoreError::Corrupt(format!("created_by: {e}")))?,
			max_participants: u32::try_from(row.max_participants)
				.map_err(|_| StoreError::Corrupt("max_participants out of range".into()))?,
			created_at_ms: row.created_at_ms,
			last_activity_ms: row.last_activity_ms,
			active: row.active,
			recording_allowed: row.recording_allowed,
			encryption_enabled: row.encryption_enabled,
			generation: row.generation.max(0) as u64,
		})
	}
}

#[derive(sqlx::FromRow)]
struct MemberRow {
	room_id: String,
	subject_id: String,
	display_name: String,
	role: String,
	joined_at_ms: i64,
}

impl TryFrom<MemberRow> for RoomMember {
	type Error = StoreError;

	fn try_from(row: MemberRow) -> Result<Self, Self::Error> {
		Ok(RoomMember {
			room_id: RoomId::parse(&row.room_id).map_err(|e| StoreError::Corrupt(format!("room id: {e}")))?,
			subject_id: SubjectId::new(row.subject_id).map_err(|e| StoreError::Corrupt(format!("subject: {e}")))?,
			display_name: row.display_name,
			role: MemberRole::from_str(&row.role).map_err(|e| StoreError::Corrupt(format!("role: {e}")))?,
			joined_at_ms: row.joined_at_ms,
		})
	}
}

#[derive(sqlx::FromRow)]
struct MessageRow {
	id: String,
	room_id: String,
	sender_id: String,
	sender_name: String,
	body: Vec<u8>,
	encrypted: bool,
	sent_at_ms: i64,
	edited: bool,
}

impl TryFrom<MessageRow> for StoredMessage {
	type Error = StoreError;

	fn try_from(row: MessageRow) -> Result<Self, Self::Error> {
		Ok(StoredMessage {
			id: uuid::Uuid::parse_str(&row.id)
				.map(MessageId)
				.map_err(|e| StoreError::Corrupt(format!("message id: {e}")))?,
			room_id: RoomId::parse(&row.room_id).map_err(|e| StoreError::Corrupt(format!("room id: {e}")))?,
			sender_id: SubjectId::new(row.sender_id).map_err(|e| StoreError::Corrupt(format!("sender: {e}")))?,
			sender_name: row.sender_name,
			body: row.body,
			encrypted: row.encrypted,
			sent_at_ms: row.sent_at_ms,
			edited: row.edited,
		})
	}
}

const ROOM_COLUMNS: &str = "id, name, description, privacy, password_hash, created_by, max_participants, \
	created_at_ms, last_activity_ms, active, recording_allowed, encryption_enabled, generation";

#[async_trait::async_trait]
impl RoomStore for SqliteStore {
	async fn insert_room(&self, room: &Room) -> Result<(), StoreError> {
		sqlx::query(
			"INSERT INTO rooms (id, name, description, privacy, password_hash, created_by, max_participants, \
			created_at_ms, last_activity_ms, active, recording_allowed, encryption_enabled, generation) \
			VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
		)
		.bind(room.id.to_string())
		.bind(&room.name)
		.bind(&room.description)
		.bind(room.privacy.as_str())
		.bind(&room.password_hash)
		.bind(room.created_by.as_str())
		.bind(i64::from(room.max_participants))
		.bind(room.created_at_ms)
		.bind(room.last_activity_ms)
		.bind(room.active)
		.bind(room.recording_allowed)
		.bind(room.encryption_enabled)
		.bind(room.generation as i64)
		.execute(&self.pool)
		.await?;
		Ok(())
	}

	async fn get_room(&self, id: RoomId) -> Result<Option<Room>, StoreError> {
		let row: Option<RoomRow> = sqlx::query_as(&format!("SELECT {ROOM_COLUMNS} FROM rooms WHERE id = ?"))
			.bind(id.to_string())
			.fetch_optional(&self.pool)
			.await?;
		row.map(Room::try_from).transpose()
	}

	async fn update_room(&self, room: &Room, expected_generation: u64) -> Result<bool, StoreError> {
		let res = sqlx::query(
			"UPDATE rooms SET name = ?, description = ?, privacy = ?, password_hash = ?, max_participants = ?, \
			recording_allowed = ?, encryption_enabled = ?, generation = ?, last_activity_ms = ? \
			WHERE id = ? AND active = 1 AND generation = ?",
		)
		.bind(&room.name)
		.bind(&room.description)
		.bind(room.privacy.as_str())
		.bind(&room.password_hash)
		.bind(i64::from(room.max_participants))
		.bind(room.recording_allowed)
		.bind(room.encryption_enabled)
		.bind(room.generation as i64)
		.bind(room.last_activity_ms)
		.bind(room.id.to_string())
		.bind(expected_generation as i64)
		.execute(&self.pool)
		.await?;
		Ok(res.rows_affected() == 1)
	}

	async fn deactivate_room(&self, id: RoomId) -> Result<Option<u64>, StoreError> {
		let row: Option<(i64,)> = sqlx::query_as(
			"UPDATE rooms SET active = 0, generation = generation + 1 WHERE id = ? AND active = 1 RETURNING generation",
		)
		.bind(id.to_string())
		.fetch_optional(&self.pool)
		.await?;
		Ok(row.map(|(g,)| g.max(0) as u64))
	}

	async fn touch_room(&self, id: RoomId, at_ms: i64) -> Result<(), StoreError> {
		sqlx::query("UPDATE rooms SET last_activity_ms = MAX(last_activity_ms, ?) WHERE id = ?")
			.bind(at_ms)
			.bind(id.to_string())
			.execute(&self.pool)
			.await?;
		Ok(())
	}

	async fn list_active_public_rooms(&self) -> Result<Vec<Room>, StoreError> {
		let rows: Vec<RoomRow> = sqlx::query_as(&format!(
			"SELECT {ROOM_COLUMNS} FROM rooms WHERE active = 1 AND privacy = ? ORDER BY created_at_ms, id"
		))
		.bind(PrivacyLevel::Public.as_str())
		.fetch_all(&self.pool)
		.await?;
		rows.into_iter().map(Room::try_from).collect()
	}

	async fn upsert_member(&self, member: &RoomMember) -> Result<RoomMember, StoreError> {
		sqlx::query(
			"INSERT INTO room_members (room_id, subject_id, display_name, role, joined_at_ms) VALUES (?, ?, ?, ?, ?) \
			ON CONFLICT(room_id, subject_id) DO UPDATE SET display_name = excluded.display_name",
		)
		.bind(member.room_id.to_string())
		.bind(member.subject_id.as_str())
		.bind(&member.display_name)
		.bind(member.role.as_str())
		.bind(member.joined_at_ms)
		.execute(&self.pool)
		.await?;

		self.get_member(member.room_id, &member.subject_id)
			.await?
			.ok_or_else(|| StoreError::Corrupt("member vanished after upsert".into()))
	}

	async fn get_member(&self, room: RoomId, subject: &SubjectId) -> Result<Option<RoomMember>, StoreError> {
		let row: Option<MemberRow> = sqlx::query_as(
			"SELECT room_id, subject_id, display_name, role, joined_at_ms FROM room_members \
			WHERE room_id = ? AND subject_id = ?",
		)
		.bind(room.to_string())
		.bind(subject.as_str())
		.fetch_optional(&self.pool)
		.await?;
		row.map(RoomMember::try_from).transpose()
	}

	async fn list_members(&self, room: RoomId) -> Result<Vec<RoomMember>, StoreError> {
		let rows: Vec<MemberRow> = sqlx::query_as(
			"SELECT room_id, subject_id, display_name, role, joined_at_ms FROM room_members \
			WHERE room_id = ? ORDER BY joined_at_ms, subject_id",
		)
		.bind(room.to_string())
		.fetch_all(&self.pool)
		.await?;
		rows.into_iter().map(RoomMember::try_from).collect()
	}

	async fn set_member_role(&self, room: RoomId, subject: &SubjectId, role: MemberRole) -> Result<(), StoreError> {
		sqlx::query(
			"INSERT INTO room_members (room_id, subject_id, display_name, role, joined_at_ms) VALUES (?, ?, ?, ?, ?) \
			ON CONFLICT(room_id, subject_id) DO UPDATE SET role = excluded.role",
		)
		.bind(room.to_string())
		.bind(subject.as_str())
		.bind(subject.as_str())
		.bind(role.as_str())
		.bind(crate::util::time::unix_ms_now())
		.execute(&self.pool)
		.await?;
		Ok(())
	}
}

#[async_trait::async_trait]
impl MessageStore for SqliteStore {
	async fn append(&self, message: &StoredMessage) -> Result<(), StoreError> {
		let mut tx = self.pool.begin().await?;
		sqlx::query(
			"INSERT INTO messages (id, room_id, sender_id, sender_name, body, encrypted, sent_at_ms, edited) \
			VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
		)
		.bind(message.id.to_string())
		.bind(message.room_id.to_string())
		.bind(message.sender_id.as_str())
		.bind(&message.sender_name)
		.bind(&message.body)
		.bind(message.encrypted)
		.bind(message.sent_at_ms)
		.bind(message.edited)
		.execute(&mut *tx)
		.await?;

		sqlx::query(
			"DELETE FROM messages WHERE room_id = ? AND seq <= \
			(SELECT seq FROM messages WHERE room_id = ? ORDER BY seq DESC LIMIT 1 OFFSET ?)",
		)
		.bind(message.room_id.to_string())
		.bind(message.room_id.to_string())
		.bind(self.history_capacity as i64)
		.execute(&mut *tx)
		.await?;

		tx.commit().await?;
		Ok(())
	}

	async fn recent(&self, room: RoomId, count: usize) -> Result<Vec<StoredMessage>, StoreError> {
		let rows: Vec<MessageRow> = sqlx::query_as(
			"SELECT id, room_id, sender_id, sender_name, body, encrypted, sent_at_ms, edited FROM \
			(SELECT seq, id, room_id, sender_id, sender_name, body, encrypted, sent_at_ms, edited FROM messages \
			WHERE room_id = ? ORDER BY seq DESC LIMIT ?) ORDER BY seq ASC",
		)
		.bind(room.to_string())
		.bind(count as i64)
		.fetch_all(&self.pool)
		.await?;
		// An unparsable row is dropped from the page; the rest of the history still loads.
		Ok(rows
			.into_iter()
			.filter_map(|row| {
				let row_id = row.id.clone();
				StoredMessage::try_from(row)
					.inspect_err(|err| {
						warn!(%room, %row_id, error = %err, "skipping corrupt history row");
						metrics::counter!("classchat_store_corrupt_rows_total", "table" => "messages").increment(1);
					})
					.ok()
			})
			.collect())
	}

	async fn purge_room(&self, room: RoomId) -> Result<u64, StoreError> {
		let res = sqlx::query("DELETE FROM messages WHERE room_id = ?")
			.bind(room.to_string())
			.execute(&self.pool)
			.await?;
		Ok(res.rows_affected())
	}
}
