#![forbid(unsafe_code)]

use std::time::Duration;

use anyhow::{Context as _, anyhow};
use classchat_domain::ConnectionId;
use classchat_protocol::framing::{DEFAULT_MAX_FRAME_SIZE, FrameDecoder, encode_frame};
use classchat_protocol::{envelope, msg_kind, pb};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::server::error::HubError;
use crate::server::hub::{Hub, room_info};
use crate::server::presence::HubItem;
use crate::util::time::unix_ms_now;

/// Per-connection server settings.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
	pub server_name: String,
	pub max_frame_bytes: usize,
	/// How long a new connection may take to send `Hello`.
	pub hello_timeout: Duration,
}

impl Default for ConnectionSettings {
	fn default() -> Self {
		Self {
			server_name: "classchat_server".to_string(),
			max_frame_bytes: DEFAULT_MAX_FRAME_SIZE,
			hello_timeout: Duration::from_secs(10),
		}
	}
}

/// Accept connections until the endpoint closes.
pub async fn run_accept_loop(endpoint: quinn::Endpoint, hub: Hub, settings: ConnectionSettings) {
	while let Some(incoming) = endpoint.accept().await {
		metrics::counter!("classchat_server_connections_total").increment(1);
		let hub = hub.clone();
		let settings = settings.clone();
		tokio::spawn(async move {
			match incoming.await {
				Ok(connection) => {
					let remote = connection.remote_address();
					debug!(%remote, "accepted connection");
					if let Err(e) = handle_connection(connection, hub, settings).await {
						warn!(%remote, error = %e, "connection handler exited with error");
					}
				}
				Err(e) => warn!(error = %e, "failed to establish QUIC connection"),
			}
		});
	}
}

pub async fn handle_connection(connection: quinn::Connection, hub: Hub, settings: ConnectionSettings) -> anyhow::Result<()> {
	struct ConnectionGaugeGuard;
	impl Drop for ConnectionGaugeGuard {
		fn drop(&mut self) {
			metrics::gauge!("classchat_server_active_connections").decrement(1.0);
		}
	}

	metrics::gauge!("classchat_server_active_connections").increment(1.0);
	let _conn_guard = ConnectionGaugeGuard;

	let (mut send, mut recv) = connection.accept_bi().await.context("accept bidirectional stream")?;

	let (ctrl_tx, mut ctrl_rx) = mpsc::unbounded_channel::<pb::Envelope>();
	let max_frame = settings.max_frame_bytes;
	let reader_task = tokio::spawn(async move {
		let mut decoder = FrameDecoder::new(max_frame);
		let mut tmp = [0u8; 8192];

		loop {
			let n = match recv.read(&mut tmp).await {
				Ok(Some(n)) => n,
				Ok(None) => return Ok::<(), anyhow::Error>(()),
				Err(e) => return Err(anyhow!(e).context("stream read failed")),
			};
			metrics::counter!("classchat_server_bytes_in_total").increment(n as u64);
			decoder.push(&tmp[..n]);

			loop {
				match decoder.next_frame::<pb::Envelope>() {
					Ok(Some(env)) => {
						metrics::counter!("classchat_server_envelopes_in_total").increment(1);
						if ctrl_tx.send(env).is_err() {
							return Ok(());
						}
					}
					Ok(None) => break,
					Err(e) => {
						metrics::counter!("classchat_server_decode_errors_total").increment(1);
						return Err(anyhow!(e).context("failed to decode frame"));
					}
				}
			}
		}
	});

	let (hello_request_id, hello) = match tokio::time::timeout(settings.hello_timeout, wait_for_hello(&mut ctrl_rx)).await {
		Ok(Ok(hello)) => hello,
		Ok(Err(e)) => {
			reader_task.abort();
			return Err(e);
		}
		Err(_) => {
			reader_task.abort();
			return Err(anyhow!("timed out waiting for Hello"));
		}
	};
	metrics::counter!("classchat_server_hello_total").increment(1);

	let session = match hub.authenticate(&hello.session_token) {
		Ok(session) => session,
		Err(err) => {
			warn!(client_name = %hello.client_name, remote = %connection.remote_address(), "hello rejected: invalid session");
			send_envelope(
				&mut send,
				envelope(hello_request_id, pb::envelope::Msg::Error(err.to_pb())),
				settings.max_frame_bytes,
			)
			.await
			.ok();
			let _ = send.finish();
			reader_task.abort();
			return Ok(());
		}
	};

	let subject = session.identity.subject_id.clone();
	let (conn_id, mut events) = hub.connect(session);
	info!(%conn_id, %subject, client_name = %hello.client_name, "received Hello");

	let loop_result = async {
		send_envelope(
			&mut send,
			envelope(
				hello_request_id,
				pb::envelope::Msg::Welcome(pb::Welcome {
					server_name: settings.server_name.clone(),
					connection_id: conn_id.0,
					subject_id: subject.to_string(),
					server_time_unix_ms: unix_ms_now(),
					max_frame_bytes: u32::try_from(settings.max_frame_bytes).unwrap_or(u32::MAX),
				}),
			),
			settings.max_frame_bytes,
		)
		.await?;

		loop {
			tokio::select! {
				env = ctrl_rx.recv() => {
					let Some(env) = env else {
						debug!(%conn_id, "stream closed by peer");
						break;
					};
					let Some(msg) = env.msg else {
						continue;
					};
					if let Some(reply) = dispatch(&hub, conn_id, msg).await {
						send_envelope(&mut send, envelope(env.request_id, reply), settings.max_frame_bytes).await?;
					}
				}
				item = events.recv() => {
					let Some(item) = item else {
						break;
					};
					let ev = match item {
						HubItem::Event(ev) => *ev,
						HubItem::Lagged { dropped } => pb::EventEnvelope {
							room_id: String::new(),
							server_time_unix_ms: unix_ms_now(),
							event: Some(pb::event_envelope::Event::Lagged(pb::Lagged { dropped })),
						},
					};
					send_envelope(&mut send, envelope(String::new(), pb::envelope::Msg::Event(ev)), settings.max_frame_bytes).await?;
				}
			}
		}
		Ok::<(), anyhow::Error>(())
	}
	.await;

	hub.disconnect(conn_id).await;
	reader_task.abort();
	let _ = reader_task.await;

	loop_result
}

async fn wait_for_hello(ctrl_rx: &mut mpsc::UnboundedReceiver<pb::Envelope>) -> anyhow::Result<(String, pb::Hello)> {
	while let Some(env) = ctrl_rx.recv().await {
		let Some(msg) = env.msg else { continue };
		if let pb::envelope::Msg::Hello(h) = msg {
			return Ok((env.request_id, h));
		}
	}
	Err(anyhow!("connection closed before Hello"))
}

fn rejection(conn_id: ConnectionId, kind: &'static str, err: HubError) -> pb::envelope::Msg {
	debug!(%conn_id, op = kind, error = %err, "request rejected");
	metrics::counter!("classchat_hub_rejections_total", "op" => kind, "kind" => err.kind()).increment(1);
	pb::envelope::Msg::Error(err.to_pb())
}

/// Run one client request against the hub and build the reply payload.
pub async fn dispatch(hub: &Hub, conn_id: ConnectionId, msg: pb::envelope::Msg) -> Option<pb::envelope::Msg> {
	use pb::envelope::Msg;

	let kind = msg_kind(&msg);
	metrics::counter!("classchat_server_requests_total", "op" => kind).increment(1);

	let reply = match msg {
		Msg::JoinRoom(req) => match hub.join_room(conn_id, &req.room_id, &req.access_token).await {
			Ok(joined) => Msg::Joined(pb::Joined {
				room: Some(room_info(&joined.room)),
				members: joined.members.iter().map(|m| m.to_member()).collect(),
				moderator: joined.moderator,
			}),
			Err(e) => rejection(conn_id, kind, e),
		},
		Msg::SendMessage(req) => match hub.send_message(conn_id, &req.room_id, &req.content).await {
			Ok(ack) => Msg::MessageAck(pb::MessageAck {
				message_id: ack.message_id.to_string(),
				sent_at_unix_ms: ack.sent_at_ms,
			}),
			Err(e) => rejection(conn_id, kind, e),
		},
		Msg::SendTyping(req) => match hub.send_typing(conn_id, &req.room_id).await {
			Ok(()) => Msg::Done(pb::Done {}),
			Err(e) => rejection(conn_id, kind, e),
		},
		Msg::LoadHistory(req) => match hub.load_history(conn_id, &req.room_id, req.count).await {
			Ok(items) => Msg::History(pb::History {
				room_id: req.room_id,
				entries: items
					.into_iter()
					.map(|item| {
						let (content, unreadable) = match item.content {
							Ok(text) => (text, false),
							Err(_) => (String::new(), true),
						};
						pb::HistoryEntry {
							message_id: item.message_id.to_string(),
							sender_id: item.sender_id,
							sent_at_unix_ms: item.sent_at_ms,
							content,
							edited: item.edited,
							unreadable,
						}
					})
					.collect(),
			}),
			Err(e) => rejection(conn_id, kind, e),
		},
		Msg::LeaveRoom(req) => match hub.leave_room(conn_id, &req.room_id).await {
			Ok(_) => Msg::Done(pb::Done {}),
			Err(e) => rejection(conn_id, kind, e),
		},
		Msg::KickParticipant(req) => match hub
			.kick(conn_id, &req.room_id, ConnectionId(req.target_connection_id))
			.await
		{
			Ok(_) => Msg::Done(pb::Done {}),
			Err(e) => rejection(conn_id, kind, e),
		},
		Msg::Ping(ping) => Msg::Pong(pb::Pong {
			client_time_unix_ms: ping.client_time_unix_ms,
			server_time_unix_ms: unix_ms_now(),
		}),
		Msg::Hello(_) => {
			debug!(%conn_id, "ignoring duplicate Hello");
			return None;
		}
		other => {
			warn!(%conn_id, kind = msg_kind(&other), "unexpected message from client");
			Msg::Error(pb::Error {
				code: pb::ErrorCode::Protocol as i32,
				detail: format!("unexpected message: {}", msg_kind(&other)),
				field: String::new(),
				retry_after_secs: 0,
			})
		}
	};
	Some(reply)
}

async fn send_envelope(send: &mut quinn::SendStream, env: pb::Envelope, max_frame_bytes: usize) -> anyhow::Result<()> {
	let frame = encode_frame(&env, max_frame_bytes).map_err(|e| anyhow!(e))?;
	metrics::counter!("classchat_server_envelopes_out_total").increment(1);
	metrics::counter!("classchat_server_bytes_out_total").increment(frame.len() as u64);

	send.write_all(&frame).await.context("stream write")?;
	Ok(())
}
