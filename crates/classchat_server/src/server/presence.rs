#![forbid(unsafe_code)]

//! Who is online in which room, and fan-out to them.
//!
//! Each room has its own lock; nothing here serializes across rooms. Events
//! are delivered with `try_send` into each connection's bounded queue. A full
//! queue drops the event and owes the subscriber a `Lagged` marker, which is
//! delivered ahead of the next event that fits.

use std::collections::BTreeMap;
use std::sync::Arc;

use classchat_domain::{ConnectionId, RoomId, SubjectId};
use classchat_protocol::pb;
use dashmap::DashMap;
use tokio::sync::{Mutex, mpsc};
use tracing::debug;

use crate::util::time::unix_ms_now;

/// Items on a connection's outbound event queue.
#[derive(Debug, Clone)]
pub enum HubItem {
	Event(Box<pb::EventEnvelope>),

	/// The subscriber's queue overflowed and `dropped` events were lost.
	Lagged { dropped: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceEntry {
	pub connection_id: ConnectionId,
	pub room_id: RoomId,
	pub subject_id: SubjectId,
	pub display_name: String,
	pub moderator: bool,
	pub last_typing_ms: Option<i64>,
	pub joined_at_ms: i64,
}

impl PresenceEntry {
	pub fn to_member(&self) -> pb::Member {
		pb::Member {
			connection_id: self.connection_id.0,
			subject_id: self.subject_id.to_string(),
			display_name: self.display_name.clone(),
			moderator: self.moderator,
			joined_at_unix_ms: self.joined_at_ms,
		}
	}
}

/// Capability resolved once at join: which room this connection is in and
/// whether it may moderate there.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceHandle {
	pub connection_id: ConnectionId,
	pub room_id: RoomId,
	pub subject_id: SubjectId,
	pub moderator: bool,
	pub generation: u64,
}

#[derive(Debug)]
pub struct JoinRequest {
	pub connection_id: ConnectionId,
	pub room_id: RoomId,
	pub subject_id: SubjectId,
	pub display_name: String,
	pub moderator: bool,
	pub generation: u64,
	pub max_participants: u32,
	pub outbound: mpsc::Sender<HubItem>,
}

#[derive(Debug, Clone)]
pub struct JoinOutcome {
	pub handle: PresenceHandle,
	pub members: Vec<PresenceEntry>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinRejection {
	Full,
	/// The room was closed or re-keyed after the token's generation.
	Stale,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KickRejection {
	NotModerator,
	TargetNotFound,
	SelfKick,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PresenceStats {
	pub rooms: usize,
	pub connections: usize,
}

#[derive(Debug)]
struct Slot {
	entry: PresenceEntry,
	outbound: mpsc::Sender<HubItem>,
	pending_lag: u64,
}

#[derive(Debug, Default)]
struct RoomPresence {
	/// Set when the room's map entry was removed; holders of this Arc must re-fetch.
	retired: bool,
	members: BTreeMap<ConnectionId, Slot>,
}

type RoomCell = Arc<Mutex<RoomPresence>>;

#[derive(Debug, Default)]
pub struct PresenceManager {
	rooms: DashMap<RoomId, RoomCell>,
	/// Lowest room generation still admitted.
	floors: DashMap<RoomId, u64>,
	by_conn: DashMap<ConnectionId, PresenceHandle>,
}

fn deliver(slot: &mut Slot, item: HubItem) -> bool {
	if slot.pending_lag > 0 {
		match slot.outbound.try_send(HubItem::Lagged {
			dropped: slot.pending_lag,
		}) {
			Ok(()) => slot.pending_lag = 0,
			Err(mpsc::error::TrySendError::Full(_)) => {
				slot.pending_lag = slot.pending_lag.saturating_add(1);
				metrics::counter!("classchat_events_dropped_total").increment(1);
				return false;
			}
			Err(mpsc::error::TrySendError::Closed(_)) => return false,
		}
	}

	match slot.outbound.try_send(item) {
		Ok(()) => true,
		Err(mpsc::error::TrySendError::Full(_)) => {
			slot.pending_lag = slot.pending_lag.saturating_add(1);
			metrics::counter!("classchat_events_dropped_total").increment(1);
			false
		}
		Err(mpsc::error::TrySendError::Closed(_)) => false,
	}
}

fn event(room: RoomId, ev: pb::event_envelope::Event) -> pb::EventEnvelope {
	pb::EventEnvelope {
		room_id: room.to_string(),
		server_time_unix_ms: unix_ms_now(),
		event: Some(ev),
	}
}

fn member_list(room: &RoomPresence) -> Vec<pb::Member> {
	room.members.values().map(|s| s.entry.to_member()).collect()
}

fn fan_out(room: &mut RoomPresence, ev: &pb::EventEnvelope, exclude: Option<ConnectionId>) -> usize {
	let mut delivered = 0;
	for (conn, slot) in room.members.iter_mut() {
		if Some(*conn) == exclude {
			continue;
		}
		if deliver(slot, HubItem::Event(Box::new(ev.clone()))) {
			delivered += 1;
		}
	}
	delivered
}

fn announce_departure(room_id: RoomId, room: &mut RoomPresence, gone: &PresenceEntry, reason: pb::LeaveReason) {
	let left = event(
		room_id,
		pb::event_envelope::Event::UserLeft(pb::UserLeft {
			member: Some(gone.to_member()),
			reason: reason as i32,
		}),
	);
	fan_out(room, &left, None);
	let list = event(
		room_id,
		pb::event_envelope::Event::UserListUpdated(pb::UserListUpdated {
			members: member_list(room),
		}),
	);
	fan_out(room, &list, None);
}

impl PresenceManager {
	pub fn new() -> Self {
		Self::default()
	}

	fn cell(&self, room: RoomId) -> Option<RoomCell> {
		self.rooms.get(&room).map(|c| Arc::clone(c.value()))
	}

	fn cell_or_create(&self, room: RoomId) -> RoomCell {
		if let Some(cell) = self.cell(room) {
			return cell;
		}
		Arc::clone(self.rooms.entry(room).or_default().value())
	}

	/// Called with the room lock held.
	fn retire_if_empty(&self, room_id: RoomId, cell: &RoomCell, room: &mut RoomPresence) {
		if room.members.is_empty() {
			room.retired = true;
			self.rooms.remove_if(&room_id, |_, current| Arc::ptr_eq(current, cell));
		}
	}

	pub fn floor(&self, room: RoomId) -> u64 {
		self.floors.get(&room).map(|f| *f.value()).unwrap_or(0)
	}

	/// Refuse joins carrying a generation below `generation` from now on.
	pub fn raise_floor(&self, room: RoomId, generation: u64) {
		self.floors
			.entry(room)
			.and_modify(|f| *f = (*f).max(generation))
			.or_insert(generation);
	}

	pub async fn join(&self, req: JoinRequest) -> Result<JoinOutcome, JoinRejection> {
		loop {
			let cell = self.cell_or_create(req.room_id);
			let mut room = cell.lock().await;
			if room.retired {
				continue;
			}

			if req.generation < self.floor(req.room_id) {
				self.retire_if_empty(req.room_id, &cell, &mut room);
				return Err(JoinRejection::Stale);
			}

			if let Some(existing) = room.members.get(&req.connection_id) {
				let handle = PresenceHandle {
					connection_id: req.connection_id,
					room_id: req.room_id,
					subject_id: existing.entry.subject_id.clone(),
					moderator: existing.entry.moderator,
					generation: req.generation,
				};
				let members = room.members.values().map(|s| s.entry.clone()).collect();
				return Ok(JoinOutcome { handle, members });
			}

			if room.members.len() >= req.max_participants as usize {
				self.retire_if_empty(req.room_id, &cell, &mut room);
				return Err(JoinRejection::Full);
			}

			let entry = PresenceEntry {
				connection_id: req.connection_id,
				room_id: req.room_id,
				subject_id: req.subject_id.clone(),
				display_name: req.display_name.clone(),
				moderator: req.moderator,
				last_typing_ms: None,
				joined_at_ms: unix_ms_now(),
			};
			let handle = PresenceHandle {
				connection_id: req.connection_id,
				room_id: req.room_id,
				subject_id: req.subject_id.clone(),
				moderator: req.moderator,
				generation: req.generation,
			};

			let joined = event(
				req.room_id,
				pb::event_envelope::Event::UserJoined(pb::UserJoined {
					member: Some(entry.to_member()),
				}),
			);
			fan_out(&mut room, &joined, None);

			room.members.insert(
				req.connection_id,
				Slot {
					entry,
					outbound: req.outbound,
					pending_lag: 0,
				},
			);
			self.by_conn.insert(req.connection_id, handle.clone());

			let list = event(
				req.room_id,
				pb::event_envelope::Event::UserListUpdated(pb::UserListUpdated {
					members: member_list(&room),
				}),
			);
			fan_out(&mut room, &list, None);

			debug!(conn_id = %req.connection_id, room_id = %req.room_id, members = room.members.len(), "presence: joined");
			metrics::gauge!("classchat_presence_entries").increment(1.0);

			let members = room.members.values().map(|s| s.entry.clone()).collect();
			return Ok(JoinOutcome { handle, members });
		}
	}

	/// Remove the connection from whatever room it is in. Idempotent.
	pub async fn leave(&self, conn: ConnectionId, reason: pb::LeaveReason) -> Option<PresenceEntry> {
		let room_id = self.by_conn.get(&conn).map(|h| h.room_id)?;
		let cell = self.cell(room_id)?;
		let mut room = cell.lock().await;

		let slot = room.members.remove(&conn)?;
		self.by_conn.remove_if(&conn, |_, h| h.room_id == room_id);
		metrics::gauge!("classchat_presence_entries").decrement(1.0);

		announce_departure(room_id, &mut room, &slot.entry, reason);
		self.retire_if_empty(room_id, &cell, &mut room);

		debug!(conn_id = %conn, %room_id, ?reason, "presence: left");
		Some(slot.entry)
	}

	/// Remove `target` from the actor's room. The actor's moderator flag is
	/// read from its live entry, not from the handle.
	pub async fn kick(&self, actor: &PresenceHandle, target: ConnectionId) -> Result<PresenceEntry, KickRejection> {
		if actor.connection_id == target {
			return Err(KickRejection::SelfKick);
		}
		let cell = self.cell(actor.room_id).ok_or(KickRejection::NotModerator)?;
		let mut room = cell.lock().await;

		let is_moderator = room
			.members
			.get(&actor.connection_id)
			.is_some_and(|s| s.entry.moderator);
		if !is_moderator {
			return Err(KickRejection::NotModerator);
		}

		let mut slot = room.members.remove(&target).ok_or(KickRejection::TargetNotFound)?;
		self.by_conn.remove_if(&target, |_, h| h.room_id == actor.room_id);
		metrics::gauge!("classchat_presence_entries").decrement(1.0);

		let kicked = event(
			actor.room_id,
			pb::event_envelope::Event::Kicked(pb::Kicked {
				reason: pb::LeaveReason::Kicked as i32,
				by_subject_id: actor.subject_id.to_string(),
			}),
		);
		deliver(&mut slot, HubItem::Event(Box::new(kicked)));

		announce_departure(actor.room_id, &mut room, &slot.entry, pb::LeaveReason::Kicked);
		self.retire_if_empty(actor.room_id, &cell, &mut room);

		Ok(slot.entry)
	}

	/// Raise the floor to `generation` and evict everyone with a `Kicked { RoomClosed }`.
	pub async fn close_room(&self, room_id: RoomId, generation: u64) -> Vec<PresenceEntry> {
		self.raise_floor(room_id, generation);
		let Some(cell) = self.cell(room_id) else {
			return Vec::new();
		};
		let mut room = cell.lock().await;

		let closed = event(
			room_id,
			pb::event_envelope::Event::Kicked(pb::Kicked {
				reason: pb::LeaveReason::RoomClosed as i32,
				by_subject_id: String::new(),
			}),
		);

		let members = std::mem::take(&mut room.members);
		let mut evicted = Vec::with_capacity(members.len());
		for (conn, mut slot) in members {
			deliver(&mut slot, HubItem::Event(Box::new(closed.clone())));
			self.by_conn.remove_if(&conn, |_, h| h.room_id == room_id);
			evicted.push(slot.entry);
		}
		metrics::gauge!("classchat_presence_entries").decrement(evicted.len() as f64);

		self.retire_if_empty(room_id, &cell, &mut room);
		evicted
	}

	/// Deliver to every member except `exclude`. Returns how many queues accepted it.
	pub async fn broadcast(&self, room_id: RoomId, ev: pb::event_envelope::Event, exclude: Option<ConnectionId>) -> usize {
		let Some(cell) = self.cell(room_id) else {
			return 0;
		};
		let mut room = cell.lock().await;
		if room.retired {
			return 0;
		}
		fan_out(&mut room, &event(room_id, ev), exclude)
	}

	pub async fn mark_typing(&self, conn: ConnectionId) -> Option<PresenceEntry> {
		let room_id = self.by_conn.get(&conn).map(|h| h.room_id)?;
		let cell = self.cell(room_id)?;
		let mut room = cell.lock().await;
		let slot = room.members.get_mut(&conn)?;
		slot.entry.last_typing_ms = Some(unix_ms_now());
		Some(slot.entry.clone())
	}

	pub async fn members(&self, room_id: RoomId) -> Vec<PresenceEntry> {
		let Some(cell) = self.cell(room_id) else {
			return Vec::new();
		};
		let room = cell.lock().await;
		room.members.values().map(|s| s.entry.clone()).collect()
	}

	pub async fn count(&self, room_id: RoomId) -> usize {
		match self.cell(room_id) {
			Some(cell) => cell.lock().await.members.len(),
			None => 0,
		}
	}

	pub fn handle(&self, conn: ConnectionId) -> Option<PresenceHandle> {
		self.by_conn.get(&conn).map(|h| h.value().clone())
	}

	pub fn stats(&self) -> PresenceStats {
		PresenceStats {
			rooms: self.rooms.len(),
			connections: self.by_conn.len(),
		}
	}
}
