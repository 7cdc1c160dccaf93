#![forbid(unsafe_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use classchat_domain::{ConnectionId, Identity, PrivacyLevel, Role, RoomId, SubjectId};
use classchat_protocol::pb;
use tokio::sync::mpsc;
use tokio::time::timeout;

use crate::config::SecretString;
use crate::server::access::{CreateRoomRequest, JoinGrant, JoinRoomRequest, RoomAccessService, RoomDetails};
use crate::server::access_token::RoomTokenIssuer;
use crate::server::audit::AuditService;
use crate::server::auth::{Session, SessionValidator};
use crate::server::codec::MessageCodec;
use crate::server::error::{AccessError, StoreError};
use crate::server::hub::{Hub, HubConfig, HubDeps};
use crate::server::password::PasswordGate;
use crate::server::presence::HubItem;
use crate::server::rate_limiter::{RateLimitPolicy, RateLimiter};
use crate::server::revocation::RevocationSet;
use crate::server::store::{InMemoryMessageStore, InMemoryRoomStore, MessageStore, StoredMessage};

pub(crate) const TOKEN_TTL: Duration = Duration::from_secs(300);

/// Message store that fails the first `failures` calls of every operation.
pub(crate) struct FlakyMessageStore {
	inner: InMemoryMessageStore,
	failures: AtomicUsize,
}

impl FlakyMessageStore {
	pub(crate) fn new(failures: usize) -> Self {
		Self {
			inner: InMemoryMessageStore::new(100),
			failures: AtomicUsize::new(failures),
		}
	}

	fn trip(&self) -> Result<(), StoreError> {
		let left = self.failures.load(Ordering::SeqCst);
		if left > 0 {
			self.failures.store(left - 1, Ordering::SeqCst);
			return Err(StoreError::Unavailable("injected failure".to_string()));
		}
		Ok(())
	}
}

#[async_trait::async_trait]
impl MessageStore for FlakyMessageStore {
	async fn append(&self, message: &StoredMessage) -> Result<(), StoreError> {
		self.trip()?;
		self.inner.append(message).await
	}

	async fn recent(&self, room: RoomId, count: usize) -> Result<Vec<StoredMessage>, StoreError> {
		self.trip()?;
		self.inner.recent(room, count).await
	}

	async fn purge_room(&self, room: RoomId) -> Result<u64, StoreError> {
		self.inner.purge_room(room).await
	}
}

/// Hub and access service wired over in-memory stores.
pub(crate) struct TestStack {
	pub hub: Hub,
	pub access: Arc<RoomAccessService>,
	pub sessions: SessionValidator,
	pub audit: AuditService,
	pub rooms: Arc<InMemoryRoomStore>,
	pub messages: Arc<dyn MessageStore>,
	pub codec: MessageCodec,
}

impl TestStack {
	pub(crate) fn new() -> Self {
		Self::build(RateLimitPolicy::defaults(), Arc::new(InMemoryMessageStore::new(1000)))
	}

	pub(crate) fn with_policy(policy: RateLimitPolicy) -> Self {
		Self::build(policy, Arc::new(InMemoryMessageStore::new(1000)))
	}

	pub(crate) fn with_messages(messages: Arc<dyn MessageStore>) -> Self {
		Self::build(RateLimitPolicy::defaults(), messages)
	}

	fn build(policy: RateLimitPolicy, messages: Arc<dyn MessageStore>) -> Self {
		let sessions = SessionValidator::new(SecretString::new("test-session-secret"), Arc::new(RevocationSet::new()));
		let room_tokens = RoomTokenIssuer::new(SecretString::new("test-room-secret"), TOKEN_TTL);
		let rooms = Arc::new(InMemoryRoomStore::new());
		let codec = MessageCodec::from_base64(&MessageCodec::generate_key()).expect("codec key");
		let audit = AuditService::memory();

		let hub = Hub::new(
			HubConfig {
				outbound_queue_capacity: 64,
				..HubConfig::default()
			},
			HubDeps {
				sessions: sessions.clone(),
				room_tokens: room_tokens.clone(),
				rooms: rooms.clone(),
				messages: messages.clone(),
				codec: codec.clone(),
				limiter: Arc::new(RateLimiter::new(policy)),
				audit: audit.clone(),
			},
		);

		let access = RoomAccessService::new(
			rooms.clone(),
			messages.clone(),
			PasswordGate::new().expect("password gate"),
			room_tokens,
			Arc::new(hub.clone()),
			audit.clone(),
		);

		Self {
			hub,
			access: Arc::new(access),
			sessions,
			audit,
			rooms,
			messages,
			codec,
		}
	}

	pub(crate) fn identity(subject: &str, role: Role) -> Identity {
		Identity::new(SubjectId::new(subject).expect("subject"), subject.to_uppercase(), role)
	}

	pub(crate) fn session_token(&self, who: &Identity) -> String {
		self.sessions.issue(who, Duration::from_secs(3600)).expect("issue session")
	}

	pub(crate) fn session(&self, who: &Identity) -> Session {
		self.sessions.validate(&self.session_token(who)).expect("validate session")
	}

	pub(crate) async fn create_room(
		&self,
		owner: &Identity,
		privacy: PrivacyLevel,
		password: Option<&str>,
		max_participants: u32,
	) -> RoomDetails {
		self.access
			.create_room(
				owner,
				CreateRoomRequest {
					name: "Algebra".to_string(),
					description: None,
					privacy_level: privacy,
					password: password.map(str::to_owned),
					max_participants: Some(max_participants),
					recording_allowed: None,
					encryption_enabled: None,
				},
			)
			.await
			.expect("create room")
	}

	pub(crate) async fn grant(&self, who: &Identity, room: RoomId, password: Option<&str>) -> Result<JoinGrant, AccessError> {
		self.access
			.join_room(
				who,
				JoinRoomRequest {
					room_id: room.to_string(),
					password: password.map(str::to_owned),
				},
			)
			.await
	}

	/// Connect `who` and join `room` through the hub.
	pub(crate) async fn enter(
		&self,
		who: &Identity,
		room: RoomId,
		password: Option<&str>,
	) -> (ConnectionId, mpsc::Receiver<HubItem>) {
		let grant = self.grant(who, room, password).await.expect("join grant");
		let (conn, rx) = self.hub.connect(self.session(who));
		self.hub
			.join_room(conn, &room.to_string(), &grant.room_access_token)
			.await
			.expect("hub join");
		(conn, rx)
	}
}

pub(crate) async fn next_event(rx: &mut mpsc::Receiver<HubItem>) -> pb::event_envelope::Event {
	let item = timeout(Duration::from_secs(2), rx.recv())
		.await
		.expect("timed out waiting for event")
		.expect("channel closed");
	match item {
		HubItem::Event(ev) => ev.event.expect("event payload"),
		HubItem::Lagged { dropped } => panic!("unexpected lag marker ({dropped} dropped)"),
	}
}

/// Skip presence bookkeeping events until a message arrives.
pub(crate) async fn next_message(rx: &mut mpsc::Receiver<HubItem>) -> pb::ReceiveMessage {
	loop {
		if let pb::event_envelope::Event::ReceiveMessage(m) = next_event(rx).await {
			return m;
		}
	}
}

pub(crate) fn drain(rx: &mut mpsc::Receiver<HubItem>) -> Vec<HubItem> {
	let mut out = Vec::new();
	while let Ok(item) = rx.try_recv() {
		out.push(item);
	}
	out
}
