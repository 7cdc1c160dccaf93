#![forbid(unsafe_code)]

use std::net::SocketAddr;

use classchat_client::{ClientConfig, Session};
use classchat_protocol::pb;
use classchat_protocol::pb::event_envelope::Event;
use tracing::{info, warn};

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: classchat_client [--connect quic://host:port] [--addr ip:port] --token <session> --room <id> --room-token <token> [--say text]\n\
\n\
Options:\n\
	--connect     Server endpoint (default: quic://localhost:18203)\n\
	--addr        Server SocketAddr (skips DNS for --connect)\n\
	--token       Session token (or CLASSCHAT_SESSION_TOKEN)\n\
	--room        Room id to join\n\
	--room-token  Room-access token from POST /rooms/join\n\
	--say         Send one message after joining (repeatable)\n\
	--history     Print the last N messages after joining\n\
	--help        Show this help\n"
	);
	std::process::exit(2)
}

fn init_tracing() {
	let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,classchat_client=debug".to_string());
	tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}

struct Args {
	cfg: ClientConfig,
	room: String,
	room_token: String,
	say: Vec<String>,
	history: u32,
}

fn parse_args() -> Args {
	let mut endpoint = "quic://localhost:18203".to_string();
	let mut addr: Option<SocketAddr> = None;
	let mut token = std::env::var("CLASSCHAT_SESSION_TOKEN").ok().filter(|v| !v.trim().is_empty());
	let mut room = None;
	let mut room_token = None;
	let mut say = Vec::new();
	let mut history = 0;

	let mut it = std::env::args().skip(1);
	while let Some(arg) = it.next() {
		let mut value = || it.next().filter(|v| !v.trim().is_empty()).unwrap_or_else(|| usage_and_exit());
		match arg.as_str() {
			"--help" | "-h" => usage_and_exit(),
			"--connect" | "--endpoint" => endpoint = value(),
			"--addr" => {
				let v = value();
				addr = Some(v.parse().unwrap_or_else(|_| {
					eprintln!("Invalid --addr value: {v}");
					usage_and_exit()
				}));
			}
			"--token" => token = Some(value()),
			"--room" => room = Some(value()),
			"--room-token" => room_token = Some(value()),
			"--say" => say.push(value()),
			"--history" => history = value().parse().unwrap_or_else(|_| usage_and_exit()),
			other => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit();
			}
		}
	}

	let (Some(token), Some(room), Some(room_token)) = (token, room, room_token) else {
		eprintln!("--token, --room and --room-token are required");
		usage_and_exit();
	};

	let mut cfg = ClientConfig::from_endpoint(&endpoint, token).unwrap_or_else(|e| {
		eprintln!("{e}");
		usage_and_exit();
	});
	cfg.server_addr = addr;
	cfg.client_name = format!("classchat-cli/{}", env!("CARGO_PKG_VERSION"));

	Args {
		cfg,
		room,
		room_token,
		say,
		history,
	}
}

fn print_event(ev: &pb::EventEnvelope) {
	match ev.event.as_ref() {
		Some(Event::ReceiveMessage(m)) => println!("[{}] {}: {}", ev.room_id, m.sender_name, m.content),
		Some(Event::UserJoined(j)) => {
			if let Some(member) = &j.member {
				println!("[{}] * {} joined", ev.room_id, member.display_name);
			}
		}
		Some(Event::UserLeft(l)) => {
			if let Some(member) = &l.member {
				println!("[{}] * {} left", ev.room_id, member.display_name);
			}
		}
		Some(Event::ReceiveTyping(t)) => println!("[{}] * {} is typing", ev.room_id, t.display_name),
		Some(Event::Kicked(k)) => println!("[{}] * removed from room by {}", ev.room_id, k.by_subject_id),
		Some(Event::Lagged(l)) => warn!(dropped = l.dropped, "fell behind; some events were dropped"),
		Some(Event::UserListUpdated(_)) | None => {}
	}
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	init_tracing();
	let args = parse_args();

	info!(server = %args.cfg.server_host, port = args.cfg.server_port, "connecting");
	let (session, mut events) = Session::connect(args.cfg).await?;
	info!(connection_id = session.connection_id(), subject = %session.welcome().subject_id, "connected");

	let joined = session.join_room(&args.room, &args.room_token).await?;
	info!(
		room = joined.room.as_ref().map(|r| r.name.as_str()).unwrap_or(""),
		members = joined.members.len(),
		moderator = joined.moderator,
		"joined"
	);

	if args.history > 0 {
		let history = session.load_history(&args.room, args.history).await?;
		for entry in history.entries {
			if entry.unreadable {
				println!("(unreadable message from {})", entry.sender_id);
			} else {
				println!("{}: {}", entry.sender_id, entry.content);
			}
		}
	}

	for text in &args.say {
		let ack = session.send_message(&args.room, text).await?;
		info!(message_id = %ack.message_id, "sent");
	}

	loop {
		tokio::select! {
			ev = events.recv() => {
				let Some(ev) = ev else {
					info!("connection closed");
					break;
				};
				print_event(&ev);
			}
			_ = tokio::signal::ctrl_c() => {
				session.leave_room(&args.room).await.ok();
				session.close(0, "bye");
				break;
			}
		}
	}

	Ok(())
}
