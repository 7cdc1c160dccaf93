#![forbid(unsafe_code)]

use std::sync::{Arc, Mutex};

use anyhow::Context;
use classchat_domain::{RoomId, SubjectId};
use tracing::warn;

use crate::util::time::unix_secs_now;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModerationAction {
	Kick,
	DeleteRoom,
	GrantModerator,
	UpdateRoom,
}

impl ModerationAction {
	pub const fn as_str(self) -> &'static str {
		match self {
			ModerationAction::Kick => "kick",
			ModerationAction::DeleteRoom => "delete_room",
			ModerationAction::GrantModerator => "grant_moderator",
			ModerationAction::UpdateRoom => "update_room",
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditRecord {
	pub actor_id: String,
	pub room_id: String,
	pub action: &'static str,
	pub target_subject_id: Option<String>,
	pub detail: Option<String>,
	pub created_at: u64,
}

#[derive(Clone)]
pub struct AuditService {
	backend: Option<AuditBackend>,
}

#[derive(Clone)]
enum AuditBackend {
	Sqlite(sqlx::SqlitePool),
	Memory(Arc<Mutex<Vec<AuditRecord>>>),
}

impl AuditService {
	/// Shares the store's pool; the `moderation_audit` table comes from its migrations.
	pub fn sqlite(pool: sqlx::SqlitePool) -> Self {
		Self {
			backend: Some(AuditBackend::Sqlite(pool)),
		}
	}

	pub fn memory() -> Self {
		Self {
			backend: Some(AuditBackend::Memory(Arc::new(Mutex::new(Vec::new())))),
		}
	}

	pub fn disabled() -> Self {
		Self { backend: None }
	}

	/// Never fails the calling operation.
	pub async fn record_moderation(
		&self,
		actor: &SubjectId,
		room: RoomId,
		action: ModerationAction,
		target: Option<&SubjectId>,
		detail: Option<&str>,
	) {
		if let Err(err) = self.try_record(actor, room, action, target, detail).await {
			warn!(error = ?err, action = action.as_str(), %room, "failed to write moderation audit");
			metrics::counter!("classchat_audit_failures_total").increment(1);
		}
	}

	async fn try_record(
		&self,
		actor: &SubjectId,
		room: RoomId,
		action: ModerationAction,
		target: Option<&SubjectId>,
		detail: Option<&str>,
	) -> anyhow::Result<()> {
		let Some(backend) = &self.backend else {
			return Ok(());
		};

		let record = AuditRecord {
			actor_id: actor.to_string(),
			room_id: room.to_string(),
			action: action.as_str(),
			target_subject_id: target.map(ToString::to_string),
			detail: detail.map(str::to_owned),
			created_at: unix_secs_now(),
		};

		match backend {
			AuditBackend::Sqlite(pool) => {
				sqlx::query(
					"INSERT INTO moderation_audit (actor_id, room_id, action, target_subject_id, detail, created_at) \
					VALUES (?, ?, ?, ?, ?, ?)",
				)
				.bind(&record.actor_id)
				.bind(&record.room_id)
				.bind(record.action)
				.bind(&record.target_subject_id)
				.bind(&record.detail)
				.bind(record.created_at as i64)
				.execute(pool)
				.await
				.context("insert moderation_audit (sqlite)")?;
			}
			AuditBackend::Memory(records) => {
				records
					.lock()
					.unwrap_or_else(|poisoned| poisoned.into_inner())
					.push(record);
			}
		}

		metrics::counter!("classchat_moderation_actions_total", "action" => action.as_str()).increment(1);
		Ok(())
	}

	/// Records held by the in-memory backend.
	pub fn recorded(&self) -> Vec<AuditRecord> {
		match &self.backend {
			Some(AuditBackend::Memory(records)) => records.lock().unwrap_or_else(|p| p.into_inner()).clone(),
			_ => Vec::new(),
		}
	}
}
