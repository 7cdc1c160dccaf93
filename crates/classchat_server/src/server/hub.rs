#![forbid(unsafe_code)]

//! Real-time room operations for authenticated connections.
//!
//! Connection lifecycle: `connect` (authenticated, no room) -> `join_room`
//! (in one room) -> `disconnect` (terminal). Every operation re-checks the
//! session against the revocation set before anything else.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use classchat_domain::{ConnectionId, MessageId, RoomId};
use classchat_protocol::pb;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::ServerSettings;
use crate::server::access_token::RoomTokenIssuer;
use crate::server::audit::{AuditService, ModerationAction};
use crate::server::auth::{Session, SessionValidator};
use crate::server::codec::{CodecError, MessageCodec};
use crate::server::error::HubError;
use crate::server::presence::{
	HubItem, JoinRejection, JoinRequest, KickRejection, PresenceEntry, PresenceHandle, PresenceManager, PresenceStats,
};
use crate::server::rate_limiter::RateLimiter;
use crate::server::store::{MessageStore, Room, RoomStore, StoredMessage, with_retry};
use crate::util::time::unix_ms_now;

#[derive(Debug, Clone)]
pub struct HubConfig {
	pub max_message_chars: usize,
	pub history_max: usize,
	pub outbound_queue_capacity: usize,
}

impl HubConfig {
	pub fn from_settings(settings: &ServerSettings) -> Self {
		Self {
			max_message_chars: settings.max_message_chars,
			history_max: settings.history_max,
			outbound_queue_capacity: settings.outbound_queue_capacity,
		}
	}
}

impl Default for HubConfig {
	fn default() -> Self {
		Self::from_settings(&ServerSettings::default())
	}
}

/// Collaborators the hub is wired to.
pub struct HubDeps {
	pub sessions: SessionValidator,
	pub room_tokens: RoomTokenIssuer,
	pub rooms: Arc<dyn RoomStore>,
	pub messages: Arc<dyn MessageStore>,
	pub codec: MessageCodec,
	pub limiter: Arc<RateLimiter>,
	pub audit: AuditService,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct RoomGrant {
	room_id: RoomId,
	generation: u64,
	moderator: bool,
	/// Id and expiry of the room-access token the join was admitted with.
	token_id: String,
	token_expires_at: u64,
	/// Set when the room is closed underneath the connection.
	revoked: bool,
}

#[derive(Debug)]
struct ConnectionState {
	session: Session,
	outbound: mpsc::Sender<HubItem>,
	grant: Option<RoomGrant>,
}

#[derive(Debug, Clone)]
pub struct JoinedRoom {
	pub room: Room,
	pub members: Vec<PresenceEntry>,
	pub moderator: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageAck {
	pub message_id: MessageId,
	pub sent_at_ms: i64,
}

/// One history record; a record that cannot be decrypted carries its error
/// instead of failing the whole load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryItem {
	pub message_id: MessageId,
	pub sender_id: String,
	pub sender_name: String,
	pub sent_at_ms: i64,
	pub edited: bool,
	pub content: Result<String, CodecError>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize)]
pub struct HubStats {
	pub connections: usize,
	pub rooms_with_presence: usize,
	pub present: usize,
}

struct HubInner {
	cfg: HubConfig,
	sessions: SessionValidator,
	room_tokens: RoomTokenIssuer,
	rooms: Arc<dyn RoomStore>,
	messages: Arc<dyn MessageStore>,
	codec: MessageCodec,
	limiter: Arc<RateLimiter>,
	audit: AuditService,
	presence: PresenceManager,
	connections: DashMap<ConnectionId, ConnectionState>,
	next_conn_id: AtomicU64,
}

#[derive(Clone)]
pub struct Hub {
	inner: Arc<HubInner>,
}

pub fn room_info(room: &Room) -> pb::RoomInfo {
	pb::RoomInfo {
		room_id: room.id.to_string(),
		name: room.name.clone(),
		description: room.description.clone().unwrap_or_default(),
		privacy_level: room.privacy.as_str().to_string(),
		max_participants: room.max_participants,
		recording_allowed: room.recording_allowed,
		encryption_enabled: room.encryption_enabled,
	}
}

fn parse_room(room: &str) -> Result<RoomId, HubError> {
	RoomId::parse(room).map_err(|e| HubError::validation("room_id", e.to_string()))
}

impl Hub {
	pub fn new(cfg: HubConfig, deps: HubDeps) -> Self {
		Self {
			inner: Arc::new(HubInner {
				cfg,
				sessions: deps.sessions,
				room_tokens: deps.room_tokens,
				rooms: deps.rooms,
				messages: deps.messages,
				codec: deps.codec,
				limiter: deps.limiter,
				audit: deps.audit,
				presence: PresenceManager::new(),
				connections: DashMap::new(),
				next_conn_id: AtomicU64::new(1),
			}),
		}
	}

	pub fn config(&self) -> &HubConfig {
		&self.inner.cfg
	}

	pub fn presence(&self) -> &PresenceManager {
		&self.inner.presence
	}

	/// Validate the session credential presented in `Hello`.
	pub fn authenticate(&self, token: &str) -> Result<Session, HubError> {
		self.inner.sessions.validate(token).map_err(|e| {
			debug!(reason = %e, "hub: session rejected");
			metrics::counter!("classchat_auth_failures_total", "stage" => "hello").increment(1);
			HubError::Authentication
		})
	}

	/// Register an authenticated connection. Room events arrive on the receiver.
	pub fn connect(&self, session: Session) -> (ConnectionId, mpsc::Receiver<HubItem>) {
		let id = ConnectionId(self.inner.next_conn_id.fetch_add(1, Ordering::Relaxed));
		let (tx, rx) = mpsc::channel(self.inner.cfg.outbound_queue_capacity.max(1));
		info!(conn_id = %id, subject = %session.identity.subject_id, "hub: connected");
		self.inner.connections.insert(
			id,
			ConnectionState {
				session,
				outbound: tx,
				grant: None,
			},
		);
		metrics::gauge!("classchat_hub_connections").set(self.inner.connections.len() as f64);
		(id, rx)
	}

	fn live_session(&self, conn: ConnectionId) -> Result<Session, HubError> {
		let session = self
			.inner
			.connections
			.get(&conn)
			.map(|s| s.session.clone())
			.ok_or(HubError::Disconnected)?;
		self.inner.sessions.check_live(&session).map_err(|e| {
			debug!(conn_id = %conn, reason = %e, "hub: session no longer valid");
			HubError::Authentication
		})?;
		Ok(session)
	}

	fn grant(&self, conn: ConnectionId) -> Option<RoomGrant> {
		self.inner.connections.get(&conn).and_then(|s| s.grant.clone())
	}

	fn set_grant(&self, conn: ConnectionId, grant: Option<RoomGrant>) -> bool {
		match self.inner.connections.get_mut(&conn) {
			Some(mut state) => {
				state.grant = grant;
				true
			}
			None => false,
		}
	}

	/// Resolve the caller's standing in `room_id` for an in-room operation.
	fn in_room(&self, conn: ConnectionId, room_id: RoomId) -> Result<(RoomGrant, PresenceHandle), HubError> {
		let grant = match self.grant(conn) {
			Some(g) if g.room_id == room_id => g,
			_ => return Err(HubError::NotInRoom),
		};
		if grant.revoked {
			return Err(HubError::Authentication);
		}
		match self.inner.presence.handle(conn) {
			Some(handle) if handle.room_id == room_id => Ok((grant, handle)),
			_ if self.inner.presence.floor(room_id) > grant.generation => Err(HubError::Authentication),
			_ => Err(HubError::NotInRoom),
		}
	}

	pub async fn join_room(&self, conn: ConnectionId, room: &str, access_token: &str) -> Result<JoinedRoom, HubError> {
		let session = self.live_session(conn)?;
		let room_id = parse_room(room)?;

		let claims = self.inner.room_tokens.verify(access_token).map_err(|e| {
			debug!(conn_id = %conn, %room_id, reason = %e, "hub: room token rejected");
			metrics::counter!("classchat_auth_failures_total", "stage" => "room_token").increment(1);
			HubError::Authentication
		})?;
		if claims.sub != session.identity.subject_id.as_str() || claims.room != room_id {
			metrics::counter!("classchat_auth_failures_total", "stage" => "room_token").increment(1);
			return Err(HubError::Authentication);
		}
		if self.inner.sessions.revocations().is_revoked(&claims.jti) {
			debug!(conn_id = %conn, %room_id, "hub: revoked room token presented");
			metrics::counter!("classchat_auth_failures_total", "stage" => "room_token_revoked").increment(1);
			return Err(HubError::Authentication);
		}

		let rooms = &self.inner.rooms;
		let record = with_retry("get_room", || rooms.get_room(room_id))
			.await
			.map_err(|_| HubError::Persistence)?;
		let record = match record {
			Some(r) if r.active && r.generation == claims.generation => r,
			_ => return Err(HubError::Authentication),
		};

		if let Some(previous) = self.grant(conn)
			&& previous.room_id != room_id
		{
			self.inner.presence.leave(conn, pb::LeaveReason::Left).await;
			self.set_grant(conn, None);
		}

		let outbound = self
			.inner
			.connections
			.get(&conn)
			.map(|s| s.outbound.clone())
			.ok_or(HubError::Disconnected)?;

		let outcome = self
			.inner
			.presence
			.join(JoinRequest {
				connection_id: conn,
				room_id,
				subject_id: session.identity.subject_id.clone(),
				display_name: session.identity.display_name.clone(),
				moderator: claims.moderator,
				generation: claims.generation,
				max_participants: record.max_participants,
				outbound,
			})
			.await
			.map_err(|rejection| match rejection {
				JoinRejection::Full => HubError::CapacityExceeded,
				JoinRejection::Stale => HubError::Authentication,
			})?;

		let grant = RoomGrant {
			room_id,
			generation: claims.generation,
			moderator: outcome.handle.moderator,
			token_id: claims.jti,
			token_expires_at: claims.exp,
			revoked: false,
		};
		if !self.set_grant(conn, Some(grant)) {
			// Connection closed while joining; undo.
			self.inner.presence.leave(conn, pb::LeaveReason::Disconnected).await;
			return Err(HubError::Disconnected);
		}

		if let Err(err) = self.inner.rooms.touch_room(room_id, unix_ms_now()).await {
			warn!(%room_id, error = %err, "hub: failed to record room activity");
		}

		info!(conn_id = %conn, %room_id, subject = %session.identity.subject_id, moderator = outcome.handle.moderator, "hub: joined room");
		metrics::counter!("classchat_room_joins_total").increment(1);

		Ok(JoinedRoom {
			room: record,
			members: outcome.members,
			moderator: outcome.handle.moderator,
		})
	}

	pub async fn send_message(&self, conn: ConnectionId, room: &str, content: &str) -> Result<MessageAck, HubError> {
		let session = self.live_session(conn)?;
		let room_id = parse_room(room)?;
		self.in_room(conn, room_id)?;

		if content.trim().is_empty() {
			return Err(HubError::validation("content", "must not be empty"));
		}
		let chars = content.chars().count();
		if chars > self.inner.cfg.max_message_chars {
			return Err(HubError::validation(
				"content",
				format!("{chars} characters exceeds limit of {}", self.inner.cfg.max_message_chars),
			));
		}

		let key = format!("{}:{}:message.send", session.identity.subject_id, room_id);
		let admission = self.inner.limiter.try_admit(&key);
		if !admission.allowed {
			debug!(conn_id = %conn, %room_id, retry_after = admission.retry_after_secs, "hub: send rate limited");
			return Err(HubError::RateLimited {
				retry_after_secs: admission.retry_after_secs,
			});
		}

		let rooms = &self.inner.rooms;
		let record = with_retry("get_room", || rooms.get_room(room_id))
			.await
			.map_err(|_| HubError::NotDelivered)?;
		let record = match record {
			Some(r) if r.active => r,
			_ => return Err(HubError::Authentication),
		};

		let body = if record.encryption_enabled {
			match self.inner.codec.encrypt(content) {
				Ok(b) => b,
				Err(first) => {
					warn!(%room_id, error = %first, "hub: encryption failed; retrying once");
					self.inner.codec.encrypt(content).map_err(|_| HubError::NotDelivered)?
				}
			}
		} else {
			content.as_bytes().to_vec()
		};

		let message = StoredMessage {
			id: MessageId::new_v4(),
			room_id,
			sender_id: session.identity.subject_id.clone(),
			sender_name: session.identity.display_name.clone(),
			body,
			encrypted: record.encryption_enabled,
			sent_at_ms: unix_ms_now(),
			edited: false,
		};

		let messages = &self.inner.messages;
		if let Err(err) = with_retry("append_message", || messages.append(&message)).await {
			warn!(conn_id = %conn, %room_id, error = %err, "hub: message not persisted");
			metrics::counter!("classchat_messages_not_delivered_total").increment(1);
			return Err(HubError::NotDelivered);
		}

		let delivered = self
			.inner
			.presence
			.broadcast(
				room_id,
				pb::event_envelope::Event::ReceiveMessage(pb::ReceiveMessage {
					message_id: message.id.to_string(),
					sender_id: message.sender_id.to_string(),
					sender_name: message.sender_name.clone(),
					content: content.to_string(),
					sent_at_unix_ms: message.sent_at_ms,
				}),
				None,
			)
			.await;

		if let Err(err) = self.inner.rooms.touch_room(room_id, message.sent_at_ms).await {
			warn!(%room_id, error = %err, "hub: failed to record room activity");
		}

		debug!(conn_id = %conn, %room_id, message_id = %message.id, delivered, "hub: message sent");
		metrics::counter!("classchat_messages_sent_total").increment(1);

		Ok(MessageAck {
			message_id: message.id,
			sent_at_ms: message.sent_at_ms,
		})
	}

	pub async fn send_typing(&self, conn: ConnectionId, room: &str) -> Result<(), HubError> {
		let session = self.live_session(conn)?;
		let room_id = parse_room(room)?;
		self.in_room(conn, room_id)?;

		let key = format!("{}:{}:typing", session.identity.subject_id, room_id);
		let admission = self.inner.limiter.try_admit(&key);
		if !admission.allowed {
			return Err(HubError::RateLimited {
				retry_after_secs: admission.retry_after_secs,
			});
		}

		let Some(entry) = self.inner.presence.mark_typing(conn).await else {
			return Err(HubError::NotInRoom);
		};
		self.inner
			.presence
			.broadcast(
				room_id,
				pb::event_envelope::Event::ReceiveTyping(pb::ReceiveTyping {
					connection_id: conn.0,
					subject_id: entry.subject_id.to_string(),
					display_name: entry.display_name,
				}),
				Some(conn),
			)
			.await;
		Ok(())
	}

	pub async fn load_history(&self, conn: ConnectionId, room: &str, count: u32) -> Result<Vec<HistoryItem>, HubError> {
		self.live_session(conn)?;
		let room_id = parse_room(room)?;
		self.in_room(conn, room_id)?;

		if count == 0 {
			return Err(HubError::validation("count", "must be at least 1"));
		}
		let count = (count as usize).min(self.inner.cfg.history_max);

		let messages = &self.inner.messages;
		let stored = with_retry("recent_messages", || messages.recent(room_id, count))
			.await
			.map_err(|err| {
				warn!(%room_id, error = %err, "hub: history load failed");
				HubError::Persistence
			})?;

		let items = stored
			.into_iter()
			.map(|m| {
				let content = if m.encrypted {
					self.inner.codec.decrypt(&m.body)
				} else {
					String::from_utf8(m.body).map_err(|_| CodecError::Utf8)
				};
				if let Err(err) = &content {
					warn!(%room_id, message_id = %m.id, error = %err, "hub: unreadable history record");
					metrics::counter!("classchat_history_decrypt_failures_total").increment(1);
				}
				HistoryItem {
					message_id: m.id,
					sender_id: m.sender_id.into_string(),
					sender_name: m.sender_name,
					sent_at_ms: m.sent_at_ms,
					edited: m.edited,
					content,
				}
			})
			.collect();
		Ok(items)
	}

	/// Leave `room`. Returns whether presence was actually removed; leaving a
	/// room the connection is not in is not an error.
	pub async fn leave_room(&self, conn: ConnectionId, room: &str) -> Result<bool, HubError> {
		self.live_session(conn)?;
		let room_id = parse_room(room)?;

		match self.grant(conn) {
			Some(g) if g.room_id == room_id => {
				self.set_grant(conn, None);
			}
			_ => return Ok(false),
		}
		let left = self.inner.presence.leave(conn, pb::LeaveReason::Left).await.is_some();
		if left {
			debug!(conn_id = %conn, %room_id, "hub: left room");
		}
		Ok(left)
	}

	pub async fn kick(&self, conn: ConnectionId, room: &str, target: ConnectionId) -> Result<PresenceEntry, HubError> {
		let session = self.live_session(conn)?;
		let room_id = parse_room(room)?;
		let (grant, handle) = self.in_room(conn, room_id)?;
		if !grant.moderator || !handle.moderator {
			metrics::counter!("classchat_forbidden_total", "op" => "kick").increment(1);
			return Err(HubError::Forbidden);
		}

		let removed = self.inner.presence.kick(&handle, target).await.map_err(|r| match r {
			KickRejection::NotModerator => HubError::Forbidden,
			KickRejection::TargetNotFound => HubError::validation("target_connection_id", "not in this room"),
			KickRejection::SelfKick => HubError::validation("target_connection_id", "cannot kick yourself"),
		})?;

		// The target's access token dies with the kick; getting back in takes a fresh grant.
		if let Some(mut state) = self.inner.connections.get_mut(&target)
			&& let Some(grant) = state.grant.take_if(|g| g.room_id == room_id)
		{
			self.inner.sessions.revocations().revoke(&grant.token_id, grant.token_expires_at);
		}

		info!(conn_id = %conn, %room_id, target = %target, target_subject = %removed.subject_id, "hub: participant kicked");
		self.inner
			.audit
			.record_moderation(
				&session.identity.subject_id,
				room_id,
				ModerationAction::Kick,
				Some(&removed.subject_id),
				None,
			)
			.await;
		Ok(removed)
	}

	/// Terminal cleanup for a connection. Safe to call more than once.
	pub async fn disconnect(&self, conn: ConnectionId) {
		let removed = self.inner.connections.remove(&conn).is_some();
		self.inner.presence.leave(conn, pb::LeaveReason::Disconnected).await;
		if removed {
			info!(conn_id = %conn, "hub: disconnected");
			metrics::gauge!("classchat_hub_connections").set(self.inner.connections.len() as f64);
		}
	}

	/// Evict everyone from a deleted room. Members keep their connection but
	/// any further use of the room fails authentication.
	pub async fn close_room(&self, room_id: RoomId, generation: u64) -> usize {
		let evicted = self.inner.presence.close_room(room_id, generation).await;
		for entry in &evicted {
			if let Some(mut state) = self.inner.connections.get_mut(&entry.connection_id)
				&& let Some(grant) = state.grant.as_mut()
				&& grant.room_id == room_id
			{
				grant.revoked = true;
			}
		}
		info!(%room_id, evicted = evicted.len(), "hub: room closed");
		evicted.len()
	}

	/// Outstanding access tokens below `generation` stop working; present
	/// members stay.
	pub fn invalidate_tokens(&self, room_id: RoomId, generation: u64) {
		self.inner.presence.raise_floor(room_id, generation);
	}

	pub async fn occupancy(&self, room_id: RoomId) -> usize {
		self.inner.presence.count(room_id).await
	}

	pub fn stats(&self) -> HubStats {
		let PresenceStats { rooms, connections } = self.inner.presence.stats();
		HubStats {
			connections: self.inner.connections.len(),
			rooms_with_presence: rooms,
			present: connections,
		}
	}
}
