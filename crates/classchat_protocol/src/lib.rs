#![forbid(unsafe_code)]

pub mod framing;
pub mod pb;

pub use framing::{
	DEFAULT_MAX_FRAME_SIZE, FRAME_HEADER_LEN, FrameDecoder, FramingError, decode_frame, encode_frame,
	encode_frame_default, try_decode_frame_from_buffer,
};

/// Protocol version constants.
pub mod version {
	/// Current protocol major version (v1).
	pub const PROTOCOL_MAJOR: u32 = 1;
	/// Current protocol minor version.
	pub const PROTOCOL_MINOR: u32 = 0;

	/// Value written into `pb::Envelope.version`.
	pub const PROTOCOL_VERSION: u32 = PROTOCOL_MAJOR;

	/// ALPN identifier negotiated on the QUIC handshake.
	pub const ALPN: &[u8] = b"classchat-v1";
}

/// Build an envelope for a reply or push.
pub fn envelope(request_id: impl Into<String>, msg: pb::envelope::Msg) -> pb::Envelope {
	pb::Envelope {
		version: version::PROTOCOL_VERSION,
		request_id: request_id.into(),
		msg: Some(msg),
	}
}

/// Short name of an envelope payload, for logs and metrics labels.
pub fn msg_kind(msg: &pb::envelope::Msg) -> &'static str {
	use pb::envelope::Msg;

	match msg {
		Msg::Hello(_) => "hello",
		Msg::Welcome(_) => "welcome",
		Msg::Error(_) => "error",
		Msg::JoinRoom(_) => "join_room",
		Msg::SendMessage(_) => "send_message",
		Msg::SendTyping(_) => "send_typing",
		Msg::LoadHistory(_) => "load_history",
		Msg::LeaveRoom(_) => "leave_room",
		Msg::KickParticipant(_) => "kick_participant",
		Msg::Ping(_) => "ping",
		Msg::Pong(_) => "pong",
		Msg::Joined(_) => "joined",
		Msg::MessageAck(_) => "message_ack",
		Msg::History(_) => "history",
		Msg::Done(_) => "done",
		Msg::Event(_) => "event",
	}
}

/// Short name of a pushed room event.
pub fn event_kind(ev: &pb::EventEnvelope) -> &'static str {
	use pb::event_envelope::Event;

	match ev.event.as_ref() {
		Some(Event::UserJoined(_)) => "user_joined",
		Some(Event::UserLeft(_)) => "user_left",
		Some(Event::UserListUpdated(_)) => "user_list_updated",
		Some(Event::ReceiveMessage(_)) => "receive_message",
		Some(Event::ReceiveTyping(_)) => "receive_typing",
		Some(Event::Kicked(_)) => "kicked",
		Some(Event::Lagged(_)) => "lagged",
		None => "empty",
	}
}
