//! Wire schema of the real-time room channel (`classchat.v1`).
//!
//! Every frame carries one [`Envelope`]. Client requests set a non-empty
//! `request_id`; the matching reply echoes it. Server-pushed room events use
//! an empty `request_id`.

/// Top-level frame payload.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Envelope {
	#[prost(uint32, tag = "1")]
	pub version: u32,
	#[prost(string, tag = "2")]
	pub request_id: ::prost::alloc::string::String,
	#[prost(
		oneof = "envelope::Msg",
		tags = "10, 11, 12, 13, 14, 15, 16, 17, 18, 19, 20, 21, 22, 23, 24, 25"
	)]
	pub msg: ::core::option::Option<envelope::Msg>,
}

pub mod envelope {
	#[derive(Clone, PartialEq, ::prost::Oneof)]
	pub enum Msg {
		#[prost(message, tag = "10")]
		Hello(super::Hello),
		#[prost(message, tag = "11")]
		Welcome(super::Welcome),
		#[prost(message, tag = "12")]
		Error(super::Error),
		#[prost(message, tag = "13")]
		JoinRoom(super::JoinRoom),
		#[prost(message, tag = "14")]
		SendMessage(super::SendMessage),
		#[prost(message, tag = "15")]
		SendTyping(super::SendTyping),
		#[prost(message, tag = "16")]
		LoadHistory(super::LoadHistory),
		#[prost(message, tag = "17")]
		LeaveRoom(super::LeaveRoom),
		#[prost(message, tag = "18")]
		KickParticipant(super::KickParticipant),
		#[prost(message, tag = "19")]
		Ping(super::Ping),
		#[prost(message, tag = "20")]
		Pong(super::Pong),
		#[prost(message, tag = "21")]
		Joined(super::Joined),
		#[prost(message, tag = "22")]
		MessageAck(super::MessageAck),
		#[prost(message, tag = "23")]
		History(super::History),
		#[prost(message, tag = "24")]
		Done(super::Done),
		#[prost(message, tag = "25")]
		Event(super::EventEnvelope),
	}
}

/// First frame sent by the client.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Hello {
	#[prost(string, tag = "1")]
	pub client_name: ::prost::alloc::string::String,
	/// General session credential (not the room password, not a room-access token).
	#[prost(string, tag = "2")]
	pub session_token: ::prost::alloc::string::String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Welcome {
	#[prost(string, tag = "1")]
	pub server_name: ::prost::alloc::string::String,
	#[prost(uint64, tag = "2")]
	pub connection_id: u64,
	#[prost(string, tag = "3")]
	pub subject_id: ::prost::alloc::string::String,
	#[prost(int64, tag = "4")]
	pub server_time_unix_ms: i64,
	#[prost(uint32, tag = "5")]
	pub max_frame_bytes: u32,
}

/// Stable rejection codes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum ErrorCode {
	Unspecified = 0,
	AuthenticationFailed = 1,
	Forbidden = 2,
	Validation = 3,
	CapacityExceeded = 4,
	RateLimited = 5,
	NotDelivered = 6,
	NotInRoom = 7,
	Internal = 8,
	Protocol = 9,
}

impl ErrorCode {
	pub fn as_str_name(&self) -> &'static str {
		match self {
			ErrorCode::Unspecified => "UNSPECIFIED",
			ErrorCode::AuthenticationFailed => "AUTHENTICATION_FAILED",
			ErrorCode::Forbidden => "FORBIDDEN",
			ErrorCode::Validation => "VALIDATION",
			ErrorCode::CapacityExceeded => "CAPACITY_EXCEEDED",
			ErrorCode::RateLimited => "RATE_LIMITED",
			ErrorCode::NotDelivered => "NOT_DELIVERED",
			ErrorCode::NotInRoom => "NOT_IN_ROOM",
			ErrorCode::Internal => "INTERNAL",
			ErrorCode::Protocol => "PROTOCOL",
		}
	}
}

/// Typed rejection of a request.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Error {
	#[prost(enumeration = "ErrorCode", tag = "1")]
	pub code: i32,
	#[prost(string, tag = "2")]
	pub detail: ::prost::alloc::string::String,
	/// Offending input field for validation failures.
	#[prost(string, tag = "3")]
	pub field: ::prost::alloc::string::String,
	#[prost(uint32, tag = "4")]
	pub retry_after_secs: u32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct JoinRoom {
	#[prost(string, tag = "1")]
	pub room_id: ::prost::alloc::string::String,
	#[prost(string, tag = "2")]
	pub access_token: ::prost::alloc::string::String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SendMessage {
	#[prost(string, tag = "1")]
	pub room_id: ::prost::alloc::string::String,
	#[prost(string, tag = "2")]
	pub content: ::prost::alloc::string::String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SendTyping {
	#[prost(string, tag = "1")]
	pub room_id: ::prost::alloc::string::String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct LoadHistory {
	#[prost(string, tag = "1")]
	pub room_id: ::prost::alloc::string::String,
	#[prost(uint32, tag = "2")]
	pub count: u32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct LeaveRoom {
	#[prost(string, tag = "1")]
	pub room_id: ::prost::alloc::string::String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct KickParticipant {
	#[prost(string, tag = "1")]
	pub room_id: ::prost::alloc::string::String,
	#[prost(uint64, tag = "2")]
	pub target_connection_id: u64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Ping {
	#[prost(int64, tag = "1")]
	pub client_time_unix_ms: i64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Pong {
	#[prost(int64, tag = "1")]
	pub client_time_unix_ms: i64,
	#[prost(int64, tag = "2")]
	pub server_time_unix_ms: i64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RoomInfo {
	#[prost(string, tag = "1")]
	pub room_id: ::prost::alloc::string::String,
	#[prost(string, tag = "2")]
	pub name: ::prost::alloc::string::String,
	#[prost(string, tag = "3")]
	pub description: ::prost::alloc::string::String,
	#[prost(string, tag = "4")]
	pub privacy_level: ::prost::alloc::string::String,
	#[prost(uint32, tag = "5")]
	pub max_participants: u32,
	#[prost(bool, tag = "6")]
	pub recording_allowed: bool,
	#[prost(bool, tag = "7")]
	pub encryption_enabled: bool,
}

/// One present participant.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Member {
	#[prost(uint64, tag = "1")]
	pub connection_id: u64,
	#[prost(string, tag = "2")]
	pub subject_id: ::prost::alloc::string::String,
	#[prost(string, tag = "3")]
	pub display_name: ::prost::alloc::string::String,
	#[prost(bool, tag = "4")]
	pub moderator: bool,
	#[prost(int64, tag = "5")]
	pub joined_at_unix_ms: i64,
}

/// Reply to `JoinRoom`.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Joined {
	#[prost(message, optional, tag = "1")]
	pub room: ::core::option::Option<RoomInfo>,
	#[prost(message, repeated, tag = "2")]
	pub members: ::prost::alloc::vec::Vec<Member>,
	#[prost(bool, tag = "3")]
	pub moderator: bool,
}

/// Reply to `SendMessage`: the message was persisted and broadcast.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct MessageAck {
	#[prost(string, tag = "1")]
	pub message_id: ::prost::alloc::string::String,
	#[prost(int64, tag = "2")]
	pub sent_at_unix_ms: i64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct HistoryEntry {
	#[prost(string, tag = "1")]
	pub message_id: ::prost::alloc::string::String,
	#[prost(string, tag = "2")]
	pub sender_id: ::prost::alloc::string::String,
	#[prost(int64, tag = "3")]
	pub sent_at_unix_ms: i64,
	#[prost(string, tag = "4")]
	pub content: ::prost::alloc::string::String,
	#[prost(bool, tag = "5")]
	pub edited: bool,
	/// The stored record could not be decrypted; `content` is empty.
	#[prost(bool, tag = "6")]
	pub unreadable: bool,
}

/// Reply to `LoadHistory`, oldest first.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct History {
	#[prost(string, tag = "1")]
	pub room_id: ::prost::alloc::string::String,
	#[prost(message, repeated, tag = "2")]
	pub entries: ::prost::alloc::vec::Vec<HistoryEntry>,
}

/// Generic success reply for requests without a payload.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Done {}

/// Server-pushed room event.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct EventEnvelope {
	#[prost(string, tag = "1")]
	pub room_id: ::prost::alloc::string::String,
	#[prost(int64, tag = "2")]
	pub server_time_unix_ms: i64,
	#[prost(oneof = "event_envelope::Event", tags = "10, 11, 12, 13, 14, 15, 16")]
	pub event: ::core::option::Option<event_envelope::Event>,
}

pub mod event_envelope {
	#[derive(Clone, PartialEq, ::prost::Oneof)]
	pub enum Event {
		#[prost(message, tag = "10")]
		UserJoined(super::UserJoined),
		#[prost(message, tag = "11")]
		UserLeft(super::UserLeft),
		#[prost(message, tag = "12")]
		UserListUpdated(super::UserListUpdated),
		#[prost(message, tag = "13")]
		ReceiveMessage(super::ReceiveMessage),
		#[prost(message, tag = "14")]
		ReceiveTyping(super::ReceiveTyping),
		#[prost(message, tag = "15")]
		Kicked(super::Kicked),
		#[prost(message, tag = "16")]
		Lagged(super::Lagged),
	}
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct UserJoined {
	#[prost(message, optional, tag = "1")]
	pub member: ::core::option::Option<Member>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum LeaveReason {
	Left = 0,
	Disconnected = 1,
	Kicked = 2,
	RoomClosed = 3,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct UserLeft {
	#[prost(message, optional, tag = "1")]
	pub member: ::core::option::Option<Member>,
	#[prost(enumeration = "LeaveReason", tag = "2")]
	pub reason: i32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct UserListUpdated {
	#[prost(message, repeated, tag = "1")]
	pub members: ::prost::alloc::vec::Vec<Member>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ReceiveMessage {
	#[prost(string, tag = "1")]
	pub message_id: ::prost::alloc::string::String,
	#[prost(string, tag = "2")]
	pub sender_id: ::prost::alloc::string::String,
	#[prost(string, tag = "3")]
	pub sender_name: ::prost::alloc::string::String,
	#[prost(string, tag = "4")]
	pub content: ::prost::alloc::string::String,
	#[prost(int64, tag = "5")]
	pub sent_at_unix_ms: i64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ReceiveTyping {
	#[prost(uint64, tag = "1")]
	pub connection_id: u64,
	#[prost(string, tag = "2")]
	pub subject_id: ::prost::alloc::string::String,
	#[prost(string, tag = "3")]
	pub display_name: ::prost::alloc::string::String,
}

/// The receiver's presence in the room was forcibly removed.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Kicked {
	#[prost(enumeration = "LeaveReason", tag = "1")]
	pub reason: i32,
	#[prost(string, tag = "2")]
	pub by_subject_id: ::prost::alloc::string::String,
}

/// Events were dropped because the connection's outbound queue was full.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Lagged {
	#[prost(uint64, tag = "1")]
	pub dropped: u64,
}
